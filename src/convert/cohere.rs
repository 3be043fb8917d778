//! Cohere chat converter
//!
//! Cohere separates the current turn (`message`) from `chat_history`, whose
//! roles are spelled USER / CHATBOT / SYSTEM. A `-internet` model suffix maps
//! to the vendor's web-search connector.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ModelBinding;
use crate::error::GatewayError;
use crate::wire::{normalize_finish_reason, now_unix, ChatRequest, ChatResponse, StreamChunk, Usage};

use super::{Converter, PreparedRequest, RequestBody};

pub struct CohereConverter {
    binding: ModelBinding,
}

impl CohereConverter {
    pub fn new(binding: &ModelBinding) -> Self {
        Self {
            binding: binding.clone(),
        }
    }
}

fn cohere_role(role: &str) -> &'static str {
    match role {
        "assistant" => "CHATBOT",
        "system" => "SYSTEM",
        _ => "USER",
    }
}

#[async_trait]
impl Converter for CohereConverter {
    fn name(&self) -> &'static str {
        "cohere"
    }

    async fn convert_request(&self, req: &ChatRequest) -> Result<PreparedRequest, GatewayError> {
        let last_user = req
            .messages
            .iter()
            .rposition(|m| m.role == "user")
            .unwrap_or(usize::MAX);

        let mut message = String::new();
        let mut chat_history = Vec::new();
        for (i, msg) in req.messages.iter().enumerate() {
            if i == last_user {
                message = msg.text_content();
            } else {
                chat_history.push(json!({
                    "role": cohere_role(&msg.role),
                    "message": msg.text_content(),
                }));
            }
        }

        let mut model = self.binding.upstream_model().to_string();
        let mut body = json!({
            "message": message,
            "chat_history": chat_history,
            "stream": req.stream,
        });
        if let Some(stripped) = model.strip_suffix("-internet") {
            model = stripped.to_string();
            body["connectors"] = json!([{"id": "web-search"}]);
        }
        body["model"] = json!(model);

        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if let Some(p) = req.top_p {
            body["p"] = json!(p);
        }
        if let Some(f) = req.frequency_penalty {
            body["frequency_penalty"] = json!(f);
        }
        if let Some(p) = req.presence_penalty {
            body["presence_penalty"] = json!(p);
        }

        Ok(PreparedRequest {
            url: self.binding.url("/v1/chat")?,
            body: RequestBody::Json(body),
            headers: vec![(
                "Authorization".to_string(),
                format!("Bearer {}", self.binding.api_key().unwrap_or_default()),
            )],
        })
    }

    fn convert_response(&self, body: &Value) -> Result<ChatResponse, GatewayError> {
        // Cohere errors are a bare {message} without a response_id
        if body.get("response_id").is_none() {
            if let Some(message) = body.get("message").and_then(Value::as_str) {
                return Err(GatewayError::UpstreamProtocol(format!(
                    "Cohere API error: {message}"
                )));
            }
        }

        let text = body.get("text").and_then(Value::as_str).unwrap_or_default();
        let finish_reason = body
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(normalize_finish_reason)
            .unwrap_or_else(|| "stop".to_string());

        let usage = body
            .get("meta")
            .and_then(|m| m.get("tokens"))
            .map(|tokens| {
                Usage::new(
                    tokens
                        .get("input_tokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as u32,
                    tokens
                        .get("output_tokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as u32,
                )
            });

        Ok(ChatResponse::assistant(
            format!(
                "chatcmpl-{}",
                body.get("response_id")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
            ),
            self.binding.upstream_model(),
            text,
            finish_reason,
            usage,
        ))
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    /// Cohere stream events: `text-generation` carries a text delta,
    /// `stream-end` the finish reason; the rest is bookkeeping.
    fn convert_stream_chunk(&self, frame: &Value) -> Result<Option<StreamChunk>, GatewayError> {
        let id = format!("chatcmpl-{}", now_unix());
        let model = self.binding.upstream_model();

        match frame.get("event_type").and_then(Value::as_str) {
            Some("text-generation") => {
                let text = frame.get("text").and_then(Value::as_str).unwrap_or_default();
                if text.is_empty() {
                    return Ok(None);
                }
                Ok(Some(StreamChunk::delta_text(id, model, text)))
            }
            Some("stream-end") => {
                let reason = frame
                    .get("finish_reason")
                    .and_then(Value::as_str)
                    .map(normalize_finish_reason)
                    .unwrap_or_else(|| "stop".to_string());
                Ok(Some(StreamChunk::terminal(id, model, reason, None)))
            }
            _ => Ok(None),
        }
    }
}
