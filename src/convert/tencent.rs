//! Tencent Hunyuan converter
//!
//! Hunyuan takes PascalCase bodies and authenticates every call with the
//! TC3-HMAC-SHA256 signature chain:
//!
//! 1. `payload_hash = sha256_hex(body)`
//! 2. canonical request over POST `/` with the signed header set
//!    `content-type;host;x-tc-action`
//! 3. string-to-sign binds the timestamp and the daily credential scope
//!    `<date>/hunyuan/tc3_request`
//! 4. signing key = HMAC("tc3_request", HMAC("hunyuan", HMAC(date, "TC3"+secret_key)))
//! 5. `Authorization: TC3-HMAC-SHA256 Credential=..., SignedHeaders=..., Signature=...`

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::config::{resolve_env, ModelBinding};
use crate::error::GatewayError;
use crate::wire::{now_unix, ChatRequest, ChatResponse, Choice, ResponseMessage, StreamChunk, Usage};

use super::{Converter, PreparedRequest, RequestBody};

const HOST: &str = "hunyuan.tencentcloudapi.com";
const ACTION: &str = "ChatCompletions";
const VERSION: &str = "2023-09-01";
const SERVICE: &str = "hunyuan";
const ALGORITHM: &str = "TC3-HMAC-SHA256";
const SIGNED_HEADERS: &str = "content-type;host;x-tc-action";
const DEFAULT_REGION: &str = "ap-beijing";

pub struct TencentConverter {
    binding: ModelBinding,
}

#[derive(Debug)]
struct Credentials {
    secret_id: String,
    secret_key: String,
}

impl TencentConverter {
    pub fn new(binding: &ModelBinding) -> Self {
        Self {
            binding: binding.clone(),
        }
    }

    /// api_key packs `app_id|secret_id|secret_key`; the nested config object
    /// is the fallback for split credentials.
    fn credentials(&self) -> Result<Credentials, GatewayError> {
        if let Some(api_key) = self.binding.api_key() {
            if api_key.contains('|') {
                let parts: Vec<&str> = api_key.split('|').collect();
                if parts.len() != 3 {
                    return Err(GatewayError::Auth(
                        "Invalid Tencent API key format (should be app_id|secret_id|secret_key)"
                            .to_string(),
                    ));
                }
                // parts[0] is the app_id; the HTTP API only needs the secrets
                return Ok(Credentials {
                    secret_id: parts[1].to_string(),
                    secret_key: parts[2].to_string(),
                });
            }
        }

        let cfg = &self.binding.config;
        Ok(Credentials {
            secret_id: cfg
                .secret_id
                .as_deref()
                .map(resolve_env)
                .filter(|s| !s.is_empty())
                .or_else(|| self.binding.api_key())
                .unwrap_or_default(),
            secret_key: cfg
                .secret_key
                .as_deref()
                .map(resolve_env)
                .filter(|s| !s.is_empty())
                .unwrap_or_default(),
        })
    }

    fn region(&self) -> String {
        self.binding
            .config
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string())
    }
}

fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

fn hmac_sha256(key: &[u8], data: &str) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// The full TC3 authorization header for one payload, pure over
/// `(secret_id, secret_key, timestamp, payload)` so it tests with frozen time.
fn tc3_authorization(secret_id: &str, secret_key: &str, timestamp: i64, payload: &str) -> String {
    let date = Utc
        .timestamp_opt(timestamp, 0)
        .single()
        .unwrap_or_else(Utc::now)
        .format("%Y-%m-%d")
        .to_string();

    let canonical_headers =
        format!("content-type:application/json\nhost:{HOST}\nx-tc-action:{}\n", ACTION.to_lowercase());
    let canonical_request = format!(
        "POST\n/\n\n{canonical_headers}\n{SIGNED_HEADERS}\n{}",
        sha256_hex(payload)
    );

    let credential_scope = format!("{date}/{SERVICE}/tc3_request");
    let string_to_sign = format!(
        "{ALGORITHM}\n{timestamp}\n{credential_scope}\n{}",
        sha256_hex(&canonical_request)
    );

    let secret_date = hmac_sha256(format!("TC3{secret_key}").as_bytes(), &date);
    let secret_service = hmac_sha256(&secret_date, SERVICE);
    let secret_signing = hmac_sha256(&secret_service, "tc3_request");
    let signature = hex::encode(hmac_sha256(&secret_signing, &string_to_sign));

    format!(
        "{ALGORITHM} Credential={secret_id}/{credential_scope}, \
         SignedHeaders={SIGNED_HEADERS}, Signature={signature}"
    )
}

/// Hunyuan requires capitalised role names.
fn pascal_role(role: &str) -> String {
    let mut chars = role.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Frames may or may not carry the unary `Response` wrapper.
fn unwrap_envelope(body: &Value) -> &Value {
    body.get("Response").unwrap_or(body)
}

#[async_trait]
impl Converter for TencentConverter {
    fn name(&self) -> &'static str {
        "tencent"
    }

    async fn convert_request(&self, req: &ChatRequest) -> Result<PreparedRequest, GatewayError> {
        let creds = self.credentials()?;
        if creds.secret_id.is_empty() || creds.secret_key.is_empty() {
            return Err(GatewayError::Auth(
                "missing Tencent secret_id/secret_key".to_string(),
            ));
        }

        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| json!({"Role": pascal_role(&m.role), "Content": m.text_content()}))
            .collect();

        let mut body = json!({
            "Model": self.binding.upstream_model(),
            "Messages": messages,
            "Stream": req.stream,
        });
        if let Some(t) = req.temperature {
            body["Temperature"] = json!(t);
        }
        if let Some(p) = req.top_p {
            body["TopP"] = json!(p);
        }

        // The signature covers the exact serialized payload the transport
        // sends; both sides serialize the same Value.
        let payload = body.to_string();
        let timestamp = now_unix();
        let authorization = tc3_authorization(
            &creds.secret_id,
            &creds.secret_key,
            timestamp,
            &payload,
        );

        Ok(PreparedRequest {
            url: format!("https://{HOST}/"),
            body: RequestBody::Json(body),
            headers: vec![
                ("Authorization".to_string(), authorization),
                ("Host".to_string(), HOST.to_string()),
                ("X-TC-Action".to_string(), ACTION.to_string()),
                ("X-TC-Version".to_string(), VERSION.to_string()),
                ("X-TC-Timestamp".to_string(), timestamp.to_string()),
                ("X-TC-Region".to_string(), self.region()),
            ],
        })
    }

    fn convert_response(&self, body: &Value) -> Result<ChatResponse, GatewayError> {
        let response = unwrap_envelope(body);

        if let Some(error) = response.get("Error") {
            if let Some(code) = error.get("Code").and_then(Value::as_str) {
                let message = error
                    .get("Message")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error");
                return Err(GatewayError::UpstreamProtocol(format!(
                    "Tencent API error ({code}): {message}"
                )));
            }
        }

        let raw_choices = response
            .get("Choices")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let choices = raw_choices
            .iter()
            .enumerate()
            .map(|(i, choice)| {
                // Message carries the full reply; Delta is the streaming form.
                let message = choice
                    .get("Message")
                    .filter(|m| !m.is_null())
                    .or_else(|| choice.get("Delta"))
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                Choice {
                    index: i as u32,
                    message: ResponseMessage {
                        role: message
                            .get("Role")
                            .and_then(Value::as_str)
                            .unwrap_or("assistant")
                            .to_lowercase(),
                        content: Some(
                            message
                                .get("Content")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                        ),
                        tool_calls: None,
                    },
                    finish_reason: Some(
                        choice
                            .get("FinishReason")
                            .and_then(Value::as_str)
                            .filter(|r| !r.is_empty())
                            .unwrap_or("stop")
                            .to_string(),
                    ),
                }
            })
            .collect();

        let usage = response.get("Usage").map(|u| Usage {
            prompt_tokens: u.get("PromptTokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            completion_tokens: u
                .get("CompletionTokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            total_tokens: u.get("TotalTokens").and_then(Value::as_u64).unwrap_or(0) as u32,
        });

        Ok(ChatResponse {
            id: response
                .get("ReqID")
                .or_else(|| response.get("Id"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            object: "chat.completion".to_string(),
            created: response
                .get("Created")
                .and_then(Value::as_i64)
                .unwrap_or_else(now_unix),
            model: "hunyuan".to_string(),
            choices,
            usage,
        })
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn convert_stream_chunk(&self, frame: &Value) -> Result<Option<StreamChunk>, GatewayError> {
        let response = unwrap_envelope(frame);

        if let Some(error) = response.get("Error") {
            if let Some(code) = error.get("Code").and_then(Value::as_str) {
                let message = error
                    .get("Message")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error");
                return Err(GatewayError::UpstreamProtocol(format!(
                    "Tencent stream error ({code}): {message}"
                )));
            }
        }

        let Some(choice) = response
            .get("Choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        else {
            return Ok(None);
        };

        let content = choice
            .get("Delta")
            .and_then(|d| d.get("Content"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let finish = choice
            .get("FinishReason")
            .and_then(Value::as_str)
            .filter(|r| !r.is_empty());

        let id = response
            .get("Id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("chatcmpl-{}", now_unix()));

        if let Some(reason) = finish {
            let usage = response.get("Usage").map(|u| Usage {
                prompt_tokens: u.get("PromptTokens").and_then(Value::as_u64).unwrap_or(0) as u32,
                completion_tokens: u
                    .get("CompletionTokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32,
                total_tokens: u.get("TotalTokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            });
            let mut chunk = StreamChunk::terminal(id, "hunyuan", reason, usage);
            if !content.is_empty() {
                chunk.choices[0].delta.content = Some(content.to_string());
            }
            Ok(Some(chunk))
        } else if content.is_empty() {
            Ok(None)
        } else {
            Ok(Some(StreamChunk::delta_text(id, "hunyuan", content)))
        }
    }
}
