//! Custom HTTP adapter
//!
//! The same transport as the OpenAI-compatible adapter, but the body, headers
//! and URL come from a protocol converter picked by the binding's
//! `request_format`. Vendors without an incremental mode satisfy
//! `chat_stream` by replaying the unary response as chunks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ModelBinding;
use crate::convert::{self, Converter, PreparedRequest, RequestBody};
use crate::error::GatewayError;
use crate::wire::{ChatRequest, ChatResponse};

use super::sse::pump_sse;
use super::{chunk_channel, effective_timeout, replay_as_stream, ChatAdapter, ChunkStream};

/// Formats whose converters build the request URL without `base_url`
/// (Tencent pins its API host; Xunfei carries its own default).
const SELF_HOSTED_URL_FORMATS: &[&str] = &["tencent", "xunfei"];

pub struct CustomHttpAdapter {
    binding: ModelBinding,
    client: reqwest::Client,
    converter: Arc<dyn Converter>,
}

impl std::fmt::Debug for CustomHttpAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomHttpAdapter")
            .field("binding", &self.binding)
            .field("converter", &self.converter.name())
            .finish()
    }
}

impl CustomHttpAdapter {
    pub fn new(binding: ModelBinding, client: reqwest::Client) -> Result<Self, GatewayError> {
        let format = binding
            .request_format
            .clone()
            .unwrap_or_else(|| "openai".to_string());
        let converter = convert::for_format(&format, &binding).ok_or_else(|| {
            GatewayError::Config(format!("converter not found for request_format '{format}'"))
        })?;
        Ok(Self {
            binding,
            client,
            converter,
        })
    }

    async fn exchange(
        &self,
        prepared: &PreparedRequest,
        timeout: Duration,
    ) -> Result<reqwest::Response, GatewayError> {
        let mut builder = self.client.post(&prepared.url).timeout(timeout);
        for (name, value) in &prepared.headers {
            builder = builder.header(name, value);
        }
        builder = match &prepared.body {
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Form(fields) => builder.form(fields),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(e, timeout))?;

        Ok(response)
    }

    async fn parse_body(response: reqwest::Response) -> Result<Value, GatewayError> {
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::UpstreamTransient(format!("body read failed: {e}")))?;

        match serde_json::from_str::<Value>(&text) {
            Ok(body) => Ok(body),
            Err(_) if status >= 400 => Err(GatewayError::from_status(status, text)),
            Err(e) => Err(GatewayError::UpstreamProtocol(format!(
                "response not JSON: {e}"
            ))),
        }
    }
}

#[async_trait]
impl ChatAdapter for CustomHttpAdapter {
    fn family(&self) -> &'static str {
        "custom_http"
    }

    fn binding(&self) -> &ModelBinding {
        &self.binding
    }

    fn is_available(&self) -> Result<(), GatewayError> {
        if self.binding.api_key().is_none() {
            return Err(GatewayError::Config("missing api_key".to_string()));
        }
        let format = self.converter.name();
        if self.binding.base_url.is_none() && !SELF_HOSTED_URL_FORMATS.contains(&format) {
            return Err(GatewayError::Config("missing base_url".to_string()));
        }
        Ok(())
    }

    async fn chat(
        &self,
        req: &ChatRequest,
        timeout: Option<Duration>,
    ) -> Result<ChatResponse, GatewayError> {
        let timeout = effective_timeout(&self.binding, timeout);

        let mut unary = req.clone();
        unary.stream = false;
        let prepared = self.converter.convert_request(&unary).await?;

        let response = self.exchange(&prepared, timeout).await?;
        let status = response.status().as_u16();
        let body = Self::parse_body(response).await?;

        // The converter surfaces vendor error envelopes; fall back to the
        // HTTP status for upstreams that signal errors out of band.
        let converted = self.converter.convert_response(&body);
        if converted.is_err() || status < 400 {
            return converted;
        }
        Err(GatewayError::from_status(status, body.to_string()))
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        timeout: Option<Duration>,
    ) -> Result<ChunkStream, GatewayError> {
        if !self.converter.supports_streaming() {
            let resp = self.chat(req, timeout).await?;
            return Ok(replay_as_stream(resp));
        }

        let timeout = effective_timeout(&self.binding, timeout);

        let mut streaming = req.clone();
        streaming.stream = true;
        let prepared = self.converter.convert_request(&streaming).await?;

        let response = self.exchange(&prepared, timeout).await?;
        let status = response.status();
        if !status.is_success() {
            let body = Self::parse_body(response).await?;
            // Give the converter first shot at the vendor envelope
            return match self.converter.convert_response(&body) {
                Err(e) => Err(e),
                Ok(_) => Err(GatewayError::from_status(status.as_u16(), body.to_string())),
            };
        }

        let converter = Arc::clone(&self.converter);
        let (tx, stream) = chunk_channel();
        tokio::spawn(async move {
            pump_sse(response, tx, move |frame| converter.convert_stream_chunk(frame)).await;
        });

        Ok(stream)
    }
}
