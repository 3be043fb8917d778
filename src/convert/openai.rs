//! OpenAI-shaped passthrough converter
//!
//! Moonshot, Minimax, Doubao and DeepSeek speak the OpenAI chat protocol;
//! only the base URL and credentials differ. The converter rewrites the
//! routing id to the configured upstream model name and forwards everything
//! else untouched.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ModelBinding;
use crate::error::GatewayError;
use crate::wire::{ChatRequest, ChatResponse, StreamChunk};

use super::{Converter, PreparedRequest, RequestBody};

pub struct OpenAiShapedConverter {
    binding: ModelBinding,
}

impl OpenAiShapedConverter {
    pub fn new(binding: &ModelBinding) -> Self {
        Self {
            binding: binding.clone(),
        }
    }
}

#[async_trait]
impl Converter for OpenAiShapedConverter {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn convert_request(&self, req: &ChatRequest) -> Result<PreparedRequest, GatewayError> {
        let mut body = serde_json::to_value(req)
            .map_err(|e| GatewayError::Internal(format!("request serialization: {e}")))?;
        body["model"] = json!(self.binding.upstream_model());

        let mut headers = Vec::new();
        if let Some(key) = self.binding.api_key() {
            headers.push(("Authorization".to_string(), format!("Bearer {key}")));
        }

        Ok(PreparedRequest {
            url: self.binding.url("/chat/completions")?,
            body: RequestBody::Json(body),
            headers,
        })
    }

    fn convert_response(&self, body: &Value) -> Result<ChatResponse, GatewayError> {
        if let Some(error) = body.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            let error_type = error
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(GatewayError::UpstreamProtocol(format!(
                "upstream error ({error_type}): {message}"
            )));
        }

        serde_json::from_value(body.clone())
            .map_err(|e| GatewayError::UpstreamProtocol(format!("malformed chat response: {e}")))
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn convert_stream_chunk(&self, frame: &Value) -> Result<Option<StreamChunk>, GatewayError> {
        if let Some(error) = frame.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return Err(GatewayError::UpstreamProtocol(format!(
                "upstream stream error: {message}"
            )));
        }

        // Frames the chunk shape cannot absorb are keepalives; skip them.
        Ok(serde_json::from_value(frame.clone()).ok())
    }
}
