//! Ali Tongyi Qianwen (DashScope) converter
//!
//! A model name ending in `-internet` strips the suffix and turns on the
//! vendor's web-search parameter. Streaming uses DashScope's SSE variant,
//! opted into via the `X-DashScope-SSE: enable` header with
//! `incremental_output` in the body.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ModelBinding;
use crate::error::GatewayError;
use crate::wire::{now_unix, ChatRequest, ChatResponse, Choice, ResponseMessage, StreamChunk, Usage};

use super::{Converter, PreparedRequest, RequestBody};

const TOP_P_CEILING: f64 = 0.9999;

pub struct AliConverter {
    binding: ModelBinding,
}

impl AliConverter {
    pub fn new(binding: &ModelBinding) -> Self {
        Self {
            binding: binding.clone(),
        }
    }

    /// `(upstream model, enable_search)` after `-internet` handling.
    fn model_and_search(&self) -> (String, bool) {
        let model = self.binding.upstream_model();
        match model.strip_suffix("-internet") {
            Some(stripped) => (stripped.to_string(), true),
            None => (model.to_string(), false),
        }
    }

    fn usage_of(frame: &Value) -> Option<Usage> {
        frame.get("usage").map(|u| {
            Usage::new(
                u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
                u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            )
        })
    }
}

#[async_trait]
impl Converter for AliConverter {
    fn name(&self) -> &'static str {
        "ali"
    }

    async fn convert_request(&self, req: &ChatRequest) -> Result<PreparedRequest, GatewayError> {
        let (model, enable_search) = self.model_and_search();

        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| json!({"role": m.role.to_lowercase(), "content": m.text_content()}))
            .collect();

        let mut parameters = json!({
            "result_format": "message",
            "incremental_output": req.stream,
            "enable_search": enable_search,
        });
        if let Some(t) = req.temperature {
            parameters["temperature"] = json!(t);
        }
        if let Some(p) = req.top_p {
            parameters["top_p"] = json!(p.min(TOP_P_CEILING));
        }
        if let Some(k) = req.top_k {
            parameters["top_k"] = json!(k);
        }
        if let Some(max) = req.max_tokens {
            parameters["max_tokens"] = json!(max);
        }
        if let Some(seed) = req.seed {
            parameters["seed"] = json!(seed);
        }
        if let Some(tools) = &req.tools {
            parameters["tools"] = json!(tools);
        }

        let mut headers = vec![(
            "Authorization".to_string(),
            format!("Bearer {}", self.binding.api_key().unwrap_or_default()),
        )];
        if req.stream {
            headers.push(("Accept".to_string(), "text/event-stream".to_string()));
            headers.push(("X-DashScope-SSE".to_string(), "enable".to_string()));
        }
        if let Some(plugin) = &self.binding.config.plugin {
            headers.push(("X-DashScope-Plugin".to_string(), plugin.clone()));
        }

        Ok(PreparedRequest {
            url: self
                .binding
                .url("/services/aigc/text-generation/generation")?,
            body: RequestBody::Json(json!({
                "model": model,
                "input": {"messages": messages},
                "parameters": parameters,
            })),
            headers,
        })
    }

    fn convert_response(&self, body: &Value) -> Result<ChatResponse, GatewayError> {
        if let Some(code) = body.get("code").and_then(Value::as_str).filter(|c| !c.is_empty()) {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return Err(GatewayError::UpstreamProtocol(format!(
                "Ali API error ({code}): {message}"
            )));
        }

        let raw_choices = body
            .get("output")
            .and_then(|o| o.get("choices"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let choices = raw_choices
            .iter()
            .enumerate()
            .map(|(i, choice)| {
                let message = choice.get("message").cloned().unwrap_or_else(|| json!({}));
                Choice {
                    index: i as u32,
                    message: ResponseMessage {
                        role: message
                            .get("role")
                            .and_then(Value::as_str)
                            .unwrap_or("assistant")
                            .to_string(),
                        content: Some(
                            message
                                .get("content")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                        ),
                        tool_calls: None,
                    },
                    finish_reason: Some(
                        choice
                            .get("finish_reason")
                            .and_then(Value::as_str)
                            .unwrap_or("stop")
                            .to_string(),
                    ),
                }
            })
            .collect();

        Ok(ChatResponse {
            id: body
                .get("request_id")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            object: "chat.completion".to_string(),
            created: 0,
            model: "qwen".to_string(),
            choices,
            usage: Self::usage_of(body),
        })
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    /// Incremental frames share the unary shape; `finish_reason` stays the
    /// literal string `"null"` until the final frame.
    fn convert_stream_chunk(&self, frame: &Value) -> Result<Option<StreamChunk>, GatewayError> {
        if let Some(code) = frame.get("code").and_then(Value::as_str).filter(|c| !c.is_empty()) {
            let message = frame
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return Err(GatewayError::UpstreamProtocol(format!(
                "Ali stream error ({code}): {message}"
            )));
        }

        let Some(choice) = frame
            .get("output")
            .and_then(|o| o.get("choices"))
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        else {
            return Ok(None);
        };

        let content = choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let finish = choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .filter(|r| !r.is_empty() && *r != "null");

        let id = frame
            .get("request_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("chatcmpl-{}", now_unix()));

        if let Some(reason) = finish {
            let mut chunk = StreamChunk::terminal(id, "qwen", reason, Self::usage_of(frame));
            if !content.is_empty() {
                chunk.choices[0].delta.content = Some(content.to_string());
            }
            Ok(Some(chunk))
        } else if content.is_empty() {
            Ok(None)
        } else {
            Ok(Some(StreamChunk::delta_text(id, "qwen", content)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converter(model: &str) -> AliConverter {
        let binding: ModelBinding = serde_json::from_value(json!({
            "id": "qwen", "adapter": "custom_http", "request_format": "ali",
            "model": model,
            "base_url": "https://dashscope.aliyuncs.com/api/v1",
            "api_key": "sk-ali",
            "config": {"plugin": "calculator"}
        }))
        .unwrap();
        AliConverter::new(&binding)
    }

    fn request(stream: bool) -> ChatRequest {
        serde_json::from_value(json!({
            "model": "qwen",
            "messages": [{"role": "user", "content": "hi"}],
            "top_p": 1.0,
            "seed": 42,
            "stream": stream
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_internet_suffix_enables_search() {
        let prepared = converter("qwen-max-internet")
            .convert_request(&request(false))
            .await
            .unwrap();
        let RequestBody::Json(body) = prepared.body else {
            panic!()
        };
        assert_eq!(body["model"], "qwen-max");
        assert_eq!(body["parameters"]["enable_search"], true);
    }

    #[tokio::test]
    async fn test_top_p_is_capped_and_seed_passed() {
        let prepared = converter("qwen-max")
            .convert_request(&request(false))
            .await
            .unwrap();
        let RequestBody::Json(body) = prepared.body else {
            panic!()
        };
        assert_eq!(body["parameters"]["top_p"], 0.9999);
        assert_eq!(body["parameters"]["seed"], 42);
        assert_eq!(body["parameters"]["result_format"], "message");
        assert_eq!(body["parameters"]["incremental_output"], false);
        assert_eq!(body["input"]["messages"][0]["content"], "hi");
    }

    #[tokio::test]
    async fn test_stream_headers() {
        let prepared = converter("qwen-max")
            .convert_request(&request(true))
            .await
            .unwrap();
        assert!(prepared
            .headers
            .iter()
            .any(|(k, v)| k == "X-DashScope-SSE" && v == "enable"));
        assert!(prepared
            .headers
            .iter()
            .any(|(k, v)| k == "Accept" && v == "text/event-stream"));
        assert!(prepared
            .headers
            .iter()
            .any(|(k, v)| k == "X-DashScope-Plugin" && v == "calculator"));

        let unary = converter("qwen-max")
            .convert_request(&request(false))
            .await
            .unwrap();
        assert!(!unary.headers.iter().any(|(k, _)| k == "X-DashScope-SSE"));
    }

    #[test]
    fn test_response_usage_mapping() {
        let resp = converter("qwen-max")
            .convert_response(&json!({
                "request_id": "r-1",
                "output": {"choices": [{
                    "message": {"role": "assistant", "content": "你好"},
                    "finish_reason": "stop"
                }]},
                "usage": {"input_tokens": 4, "output_tokens": 6}
            }))
            .unwrap();
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("你好"));
        let usage = resp.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 4);
        assert_eq!(usage.completion_tokens, 6);
        assert_eq!(usage.total_tokens, 10);
    }

    #[test]
    fn test_error_code_envelope() {
        let err = converter("qwen-max")
            .convert_response(&json!({"code": "InvalidParameter", "message": "bad top_p"}))
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamProtocol(_)));
    }

    #[test]
    fn test_stream_chunk_null_finish_reason_is_delta() {
        let c = converter("qwen-max");
        let chunk = c
            .convert_stream_chunk(&json!({
                "request_id": "r-2",
                "output": {"choices": [{
                    "message": {"content": "he"}, "finish_reason": "null"
                }]}
            }))
            .unwrap()
            .unwrap();
        assert!(!chunk.is_terminal());

        let terminal = c
            .convert_stream_chunk(&json!({
                "request_id": "r-2",
                "output": {"choices": [{
                    "message": {"content": ""}, "finish_reason": "stop"
                }]},
                "usage": {"input_tokens": 1, "output_tokens": 2}
            }))
            .unwrap()
            .unwrap();
        assert!(terminal.is_terminal());
        assert!(terminal.usage.is_some());
    }
}
