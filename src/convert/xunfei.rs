//! Xunfei Spark (讯飞星火) converter
//!
//! Spark is a WebSocket protocol. The connection URL itself carries the
//! authentication: an HMAC-SHA256 signature over `host`, `date` and the
//! request line, base64-wrapped twice into an `authorization` query
//! parameter. Frames stream deltas under `payload.choices.text[0].content`
//! and terminate when `payload.choices.status == 2`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::config::ModelBinding;
use crate::error::GatewayError;
use crate::wire::{now_unix, ChatRequest, ChatResponse, StreamChunk, Usage};

use super::{Converter, PreparedRequest, RequestBody};

const DEFAULT_WS_URL: &str = "wss://spark-api.xf-yun.com";
const DEFAULT_API_VERSION: &str = "v3.5";
const DEFAULT_TEMPERATURE: f64 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 2048;

pub struct XunfeiConverter {
    binding: ModelBinding,
}

impl XunfeiConverter {
    pub fn new(binding: &ModelBinding) -> Self {
        Self {
            binding: binding.clone(),
        }
    }

    fn api_version(&self) -> String {
        self.binding
            .config
            .api_version
            .clone()
            .unwrap_or_else(|| DEFAULT_API_VERSION.to_string())
    }

    /// Spark's chat domain, configurable or derived from the API version.
    fn domain(&self) -> String {
        if let Some(domain) = &self.binding.config.domain {
            if !domain.is_empty() {
                return domain.clone();
            }
        }
        match self.api_version().as_str() {
            "v1.1" => "general",
            "v2.1" => "generalv2",
            "v3.1" => "generalv3",
            "v4.0" => "4.0Ultra",
            _ => "generalv3.5",
        }
        .to_string()
    }

    fn ws_base(&self) -> String {
        let base = self
            .binding
            .base_url
            .clone()
            .filter(|b| !b.is_empty() && b != "ws://" && b != "wss://")
            .unwrap_or_else(|| DEFAULT_WS_URL.to_string());
        base.replace("https://", "wss://")
            .replace("http://", "ws://")
            .trim_end_matches('/')
            .to_string()
    }

    fn path(&self) -> String {
        if let Some(endpoint) = &self.binding.endpoint {
            if !endpoint.is_empty() {
                return endpoint.clone();
            }
        }
        format!("/{}/chat", self.api_version())
    }

    /// Build the signed connection URL for the given moment.
    pub fn auth_url(&self, now: DateTime<Utc>) -> Result<String, GatewayError> {
        let api_key = self
            .binding
            .api_key()
            .ok_or_else(|| GatewayError::Auth("missing Xunfei api_key".to_string()))?;
        let api_secret = self
            .binding
            .config
            .api_secret()
            .ok_or_else(|| GatewayError::Auth("missing Xunfei api_secret".to_string()))?;

        let base = self.ws_base();
        let host = base
            .trim_start_matches("wss://")
            .trim_start_matches("ws://")
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let path = self.path();

        let date = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let sign_string = format!("host: {host}\ndate: {date}\nGET {path} HTTP/1.1");

        let mut mac = Hmac::<Sha256>::new_from_slice(api_secret.as_bytes())
            .map_err(|e| GatewayError::Auth(format!("Xunfei signature: {e}")))?;
        mac.update(sign_string.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        let auth_origin = format!(
            "hmac username=\"{api_key}\", algorithm=\"hmac-sha256\", \
             headers=\"host date request-line\", signature=\"{signature}\""
        );
        let authorization = BASE64.encode(auth_origin);

        Ok(format!(
            "{base}{path}?authorization={}&date={}&host={}",
            urlencoding::encode(&authorization),
            urlencoding::encode(&date),
            urlencoding::encode(&host)
        ))
    }

    /// The frame sent once after connecting.
    pub fn ws_request(&self, req: &ChatRequest) -> Result<Value, GatewayError> {
        let app_id = self
            .binding
            .config
            .app_id
            .as_deref()
            .filter(|a| !a.is_empty() && *a != "not-needed")
            .ok_or_else(|| GatewayError::Auth("missing Xunfei app_id".to_string()))?;

        let text: Vec<Value> = req
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.text_content()}))
            .collect();

        Ok(json!({
            "header": {"app_id": app_id},
            "parameter": {"chat": {
                "domain": self.domain(),
                "temperature": req.temperature.unwrap_or(DEFAULT_TEMPERATURE),
                "max_tokens": req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            }},
            "payload": {"message": {"text": text}},
        }))
    }
}

#[async_trait]
impl Converter for XunfeiConverter {
    fn name(&self) -> &'static str {
        "xunfei"
    }

    async fn convert_request(&self, req: &ChatRequest) -> Result<PreparedRequest, GatewayError> {
        Ok(PreparedRequest {
            url: self.auth_url(Utc::now())?,
            body: RequestBody::Json(self.ws_request(req)?),
            headers: Vec::new(),
        })
    }

    fn convert_response(&self, body: &Value) -> Result<ChatResponse, GatewayError> {
        // Spark has no unary HTTP form; a single frame is treated as the
        // complete reply.
        match self.convert_stream_chunk(body)? {
            Some(chunk) => {
                let content = chunk.choices[0].delta.content.clone().unwrap_or_default();
                Ok(ChatResponse::assistant(
                    chunk.id,
                    "SparkDesk",
                    content,
                    chunk.choices[0]
                        .finish_reason
                        .clone()
                        .unwrap_or_else(|| "stop".to_string()),
                    chunk.usage,
                ))
            }
            None => Err(GatewayError::UpstreamProtocol(
                "empty Spark response frame".to_string(),
            )),
        }
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn convert_stream_chunk(&self, frame: &Value) -> Result<Option<StreamChunk>, GatewayError> {
        if let Some(header) = frame.get("header") {
            let code = header.get("code").and_then(Value::as_i64).unwrap_or(0);
            if code != 0 {
                let message = header
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error");
                return Err(GatewayError::UpstreamProtocol(format!(
                    "讯飞星火 API 错误 ({code}): {message}"
                )));
            }
        }

        let payload = frame.get("payload").cloned().unwrap_or_else(|| json!({}));
        let choices = payload.get("choices").cloned().unwrap_or_else(|| json!({}));
        let status = choices.get("status").and_then(Value::as_i64).unwrap_or(0);
        let content = choices
            .get("text")
            .and_then(Value::as_array)
            .and_then(|t| t.first())
            .and_then(|t| t.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        let usage = payload
            .get("usage")
            .and_then(|u| u.get("text"))
            .map(|u| Usage {
                prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
                completion_tokens: u
                    .get("completion_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32,
                total_tokens: u.get("total_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            });

        let id = format!("chatcmpl-{}", now_unix());

        // Status 2 is the vendor's end-of-stream marker
        if status == 2 {
            let mut chunk = StreamChunk::terminal(id, "SparkDesk", "stop", usage);
            if !content.is_empty() {
                chunk.choices[0].delta.content = Some(content.to_string());
            }
            Ok(Some(chunk))
        } else if content.is_empty() {
            Ok(None)
        } else {
            let mut chunk = StreamChunk::delta_text(id, "SparkDesk", content);
            chunk.usage = usage;
            Ok(Some(chunk))
        }
    }
}
