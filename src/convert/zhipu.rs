//! Zhipu AI (ChatGLM) converter
//!
//! Zhipu authenticates with a self-minted HS256 JWT whose header carries the
//! vendor's non-standard `sign_type: SIGN` field. The api_key parses as
//! `id.secret`; tokens live 24 h and are cached per key string, refreshed an
//! hour before expiry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::config::ModelBinding;
use crate::error::GatewayError;
use crate::wire::{ChatRequest, ChatResponse, Choice, ResponseMessage, Usage};

use super::{Converter, PreparedRequest, RequestBody};

const TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 3600);
const EXPIRY_MARGIN: Duration = Duration::from_secs(3600);

pub struct ZhipuConverter {
    binding: ModelBinding,
    token_cache: Mutex<HashMap<String, (String, Instant)>>,
}

impl ZhipuConverter {
    pub fn new(binding: &ModelBinding) -> Self {
        Self {
            binding: binding.clone(),
            token_cache: Mutex::new(HashMap::new()),
        }
    }

    fn token(&self) -> Result<String, GatewayError> {
        let api_key = self
            .binding
            .api_key()
            .ok_or_else(|| GatewayError::Auth("missing Zhipu api_key".to_string()))?;

        {
            let cache = self.token_cache.lock().unwrap();
            if let Some((token, expires_at)) = cache.get(&api_key) {
                if Instant::now() < *expires_at {
                    return Ok(token.clone());
                }
            }
        }

        let token = mint_token(&api_key, SystemTime::now())?;
        self.token_cache.lock().unwrap().insert(
            api_key,
            (token.clone(), Instant::now() + TOKEN_LIFETIME - EXPIRY_MARGIN),
        );
        Ok(token)
    }
}

/// Mint the Zhipu JWT: HS256 over `{api_key, exp, timestamp}` (both in
/// milliseconds) with header `{alg: HS256, sign_type: SIGN}`.
fn mint_token(api_key: &str, now: SystemTime) -> Result<String, GatewayError> {
    let (id, secret) = api_key.split_once('.').ok_or_else(|| {
        GatewayError::Auth("Invalid Zhipu API key format (should be id.secret)".to_string())
    })?;

    let now_ms = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let exp_ms = now_ms + TOKEN_LIFETIME.as_millis() as u64;

    let header = json!({"alg": "HS256", "sign_type": "SIGN"});
    let payload = json!({"api_key": id, "exp": exp_ms, "timestamp": now_ms});

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(payload.to_string())
    );

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::Auth(format!("Failed to generate Zhipu token: {e}")))?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature}"))
}

#[async_trait]
impl Converter for ZhipuConverter {
    fn name(&self) -> &'static str {
        "zhipu"
    }

    async fn convert_request(&self, req: &ChatRequest) -> Result<PreparedRequest, GatewayError> {
        let prompt: Vec<Value> = req
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.text_content()}))
            .collect();

        let mut body = json!({"prompt": prompt, "incremental": false});
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = req.top_p {
            body["top_p"] = json!(p);
        }

        Ok(PreparedRequest {
            url: self.binding.url("/chat/completions")?,
            body: RequestBody::Json(body),
            headers: vec![("Authorization".to_string(), self.token()?)],
        })
    }

    fn convert_response(&self, body: &Value) -> Result<ChatResponse, GatewayError> {
        if !body.get("success").and_then(Value::as_bool).unwrap_or(false) {
            let code = body
                .get("code")
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let msg = body
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return Err(GatewayError::UpstreamProtocol(format!(
                "Zhipu API error ({code}): {msg}"
            )));
        }

        let data = body.get("data").cloned().unwrap_or_else(|| json!({}));
        let raw_choices = data
            .get("choices")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let count = raw_choices.len();
        let choices = raw_choices
            .iter()
            .enumerate()
            .map(|(i, choice)| {
                let content = choice
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim_matches('"')
                    .to_string();
                Choice {
                    index: i as u32,
                    message: ResponseMessage {
                        role: choice
                            .get("role")
                            .and_then(Value::as_str)
                            .unwrap_or("assistant")
                            .to_string(),
                        content: Some(content),
                        tool_calls: None,
                    },
                    finish_reason: (i + 1 == count).then(|| "stop".to_string()),
                }
            })
            .collect();

        let usage = data.get("usage").map(|u| Usage {
            prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            completion_tokens: u
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            total_tokens: u.get("total_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
        });

        Ok(ChatResponse {
            id: data
                .get("task_id")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            object: "chat.completion".to_string(),
            created: 0,
            model: "chatglm".to_string(),
            choices,
            usage,
        })
    }
}
