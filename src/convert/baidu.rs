//! Baidu ERNIE (文心一言) converter
//!
//! Baidu's api_key packs `client_id|client_secret`; requests authenticate via
//! an OAuth `access_token` appended to the URL query. Tokens are cached per
//! credential string with a TTL of the advertised `expires_in` minus an hour
//! (the vendor default is 30 days).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ModelBinding;
use crate::error::GatewayError;
use crate::wire::{ChatRequest, ChatResponse, Usage};

use super::{Converter, PreparedRequest, RequestBody};

const OAUTH_URL: &str = "https://aip.baidubce.com/oauth/2.0/token";
const DEFAULT_EXPIRES_IN: u64 = 2_592_000; // 30 days
const EXPIRY_MARGIN: Duration = Duration::from_secs(3600);

pub struct BaiduConverter {
    binding: ModelBinding,
    client: reqwest::Client,
    token_cache: Mutex<HashMap<String, (String, Instant)>>,
}

impl BaiduConverter {
    pub fn new(binding: &ModelBinding) -> Self {
        Self {
            binding: binding.clone(),
            client: reqwest::Client::new(),
            token_cache: Mutex::new(HashMap::new()),
        }
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        let api_key = self
            .binding
            .api_key()
            .ok_or_else(|| GatewayError::Auth("missing Baidu api_key".to_string()))?;

        {
            let cache = self.token_cache.lock().unwrap();
            if let Some((token, expires_at)) = cache.get(&api_key) {
                if Instant::now() < *expires_at {
                    return Ok(token.clone());
                }
            }
        }

        let (client_id, client_secret) = api_key.split_once('|').ok_or_else(|| {
            GatewayError::Auth(
                "Invalid Baidu API key format (should be client_id|client_secret)".to_string(),
            )
        })?;

        let url = format!(
            "{OAUTH_URL}?grant_type=client_credentials&client_id={}&client_secret={}",
            urlencoding::encode(client_id),
            urlencoding::encode(client_secret)
        );

        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(e, Duration::from_secs(30)))?;

        let status = response.status().as_u16();
        let token_data: Value = response.json().await.map_err(|e| {
            GatewayError::UpstreamProtocol(format!("Baidu token response not JSON: {e}"))
        })?;

        if let Some(error) = token_data.get("error").and_then(Value::as_str) {
            let description = token_data
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or("");
            return Err(GatewayError::Auth(format!(
                "Baidu token error: {error}: {description}"
            )));
        }
        if status != 200 {
            return Err(GatewayError::from_status(
                status,
                "Failed to get Baidu access token".to_string(),
            ));
        }

        let token = token_data
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::Auth("Empty access token from Baidu".to_string()))?
            .to_string();

        let expires_in = token_data
            .get("expires_in")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_EXPIRES_IN);
        let ttl = Duration::from_secs(expires_in).saturating_sub(EXPIRY_MARGIN);

        self.token_cache
            .lock()
            .unwrap()
            .insert(api_key.to_string(), (token.clone(), Instant::now() + ttl));

        Ok(token)
    }
}

#[async_trait]
impl Converter for BaiduConverter {
    fn name(&self) -> &'static str {
        "baidu"
    }

    async fn convert_request(&self, req: &ChatRequest) -> Result<PreparedRequest, GatewayError> {
        let mut system_prompt = String::new();
        let mut messages = Vec::new();

        for msg in &req.messages {
            if msg.role == "system" {
                system_prompt = msg.text_content();
                continue;
            }
            messages.push(json!({"role": msg.role, "content": msg.text_content()}));
        }

        let mut body = json!({"messages": messages, "stream": req.stream});
        if !system_prompt.is_empty() {
            body["system"] = json!(system_prompt);
        }
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = req.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(penalty) = req.frequency_penalty {
            body["penalty_score"] = json!(penalty);
        }
        if let Some(max) = req.max_tokens {
            body["max_output_tokens"] = json!(max);
        }
        if let Some(user) = &req.user {
            body["user_id"] = json!(user);
        }

        let url = self.binding.url("/chat/completions")?;
        let separator = if url.contains('?') { '&' } else { '?' };
        let url = format!("{url}{separator}access_token={}", self.access_token().await?);

        Ok(PreparedRequest {
            url,
            body: RequestBody::Json(body),
            headers: Vec::new(),
        })
    }

    fn convert_response(&self, body: &Value) -> Result<ChatResponse, GatewayError> {
        if body.get("error_code").is_some() || body.get("error_msg").is_some() {
            let code = body
                .get("error_code")
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let msg = body
                .get("error_msg")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return Err(GatewayError::UpstreamProtocol(format!(
                "Baidu API error ({code}): {msg}"
            )));
        }

        let result = body
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let usage = body.get("usage").map(|u| Usage {
            prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            completion_tokens: u
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            total_tokens: u.get("total_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
        });

        let mut resp = ChatResponse::assistant(
            body.get("id")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            "ernie-bot",
            result,
            "stop",
            usage,
        );
        resp.created = body.get("created").and_then(Value::as_i64).unwrap_or(0);
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converter() -> BaiduConverter {
        let binding: ModelBinding = serde_json::from_value(json!({
            "id": "ernie", "adapter": "custom_http", "request_format": "baidu",
            "base_url": "https://aip.baidubce.com/rpc/2.0/ai_custom/v1/wenxinworkshop",
            "endpoint": "/chat/completions_pro",
            "api_key": "cid|csecret"
        }))
        .unwrap();
        BaiduConverter::new(&binding)
    }

    #[test]
    fn test_body_parameter_mapping() {
        let c = converter();
        let req: ChatRequest = serde_json::from_value(json!({
            "model": "ernie",
            "messages": [
                {"role": "system", "content": "be nice"},
                {"role": "user", "content": "hi"}
            ],
            "frequency_penalty": 1.2,
            "max_tokens": 100,
            "user": "u-1"
        }))
        .unwrap();

        // Build the body without going through the token fetch
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        // The token fetch would hit the network; seed the cache instead.
        c.token_cache.lock().unwrap().insert(
            "cid|csecret".to_string(),
            ("tok-1".to_string(), Instant::now() + Duration::from_secs(60)),
        );
        let prepared = rt.block_on(c.convert_request(&req)).unwrap();

        let RequestBody::Json(body) = prepared.body else {
            panic!()
        };
        assert_eq!(body["system"], "be nice");
        assert_eq!(body["penalty_score"], 1.2);
        assert_eq!(body["max_output_tokens"], 100);
        assert_eq!(body["user_id"], "u-1");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert!(prepared.url.ends_with("?access_token=tok-1"));
    }

    #[test]
    fn test_access_token_appends_with_ampersand_when_query_present() {
        let binding: ModelBinding = serde_json::from_value(json!({
            "id": "ernie", "adapter": "custom_http", "request_format": "baidu",
            "base_url": "https://aip.baidubce.com",
            "endpoint": "/chat?version=2",
            "api_key": "cid|csecret"
        }))
        .unwrap();
        let c = BaiduConverter::new(&binding);
        c.token_cache.lock().unwrap().insert(
            "cid|csecret".to_string(),
            ("tok-2".to_string(), Instant::now() + Duration::from_secs(60)),
        );

        let req: ChatRequest = serde_json::from_value(json!({
            "model": "ernie", "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let prepared = rt.block_on(c.convert_request(&req)).unwrap();
        assert!(prepared.url.ends_with("&access_token=tok-2"));
    }

    #[test]
    fn test_response_result_field() {
        let resp = converter()
            .convert_response(&json!({
                "id": "as-1", "created": 7, "result": "你好",
                "usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3}
            }))
            .unwrap();
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("你好"));
        assert_eq!(resp.model, "ernie-bot");
        assert_eq!(resp.created, 7);
    }

    #[test]
    fn test_error_code_envelope() {
        let err = converter()
            .convert_response(&json!({"error_code": 110, "error_msg": "Access token invalid"}))
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamProtocol(_)));
    }
}
