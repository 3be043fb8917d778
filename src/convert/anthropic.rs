//! Anthropic Messages API converter
//!
//! # Key differences from the OpenAI shape
//!
//! | OpenAI                      | Anthropic                       |
//! |-----------------------------|---------------------------------|
//! | `messages[].role: "system"` | Top-level `system` string       |
//! | `max_tokens` (optional)     | `max_tokens` (required)         |
//! | `stop` (string/array)       | `stop_sequences` (array)        |
//! | `tools[].function`          | `{name, description, input_schema}` |
//! | `finish_reason`             | `stop_reason` (`end_turn`, ...) |

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ModelBinding;
use crate::error::GatewayError;
use crate::wire::{
    normalize_finish_reason, now_unix, ChatRequest, ChatResponse, Choice, ContentPart,
    MessageContent, ResponseMessage, StreamChunk, ToolCall, Usage,
};

use super::{Converter, PreparedRequest, RequestBody};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicConverter {
    binding: ModelBinding,
}

impl AnthropicConverter {
    pub fn new(binding: &ModelBinding) -> Self {
        Self {
            binding: binding.clone(),
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        let model = self.binding.upstream_model();
        let mut headers = vec![
            (
                "x-api-key".to_string(),
                self.binding.api_key().unwrap_or_default(),
            ),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
        ];
        if model.contains("claude-3-5-sonnet") {
            headers.push((
                "anthropic-beta".to_string(),
                "max-tokens-3-5-sonnet-2024-07-15".to_string(),
            ));
        }
        headers
    }
}

#[async_trait]
impl Converter for AnthropicConverter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn convert_request(&self, req: &ChatRequest) -> Result<PreparedRequest, GatewayError> {
        let mut system_parts: Vec<String> = Vec::new();
        let mut messages = Vec::new();

        for msg in &req.messages {
            if msg.role == "system" {
                system_parts.push(msg.text_content());
                continue;
            }

            let role = if msg.role == "assistant" {
                "assistant"
            } else {
                "user"
            };
            messages.push(json!({
                "role": role,
                "content": content_blocks(&msg.content),
            }));
        }

        let mut body = json!({
            "model": self.binding.upstream_model(),
            "max_tokens": req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": req.stream,
            "messages": messages,
        });

        if !system_parts.is_empty() {
            body["system"] = json!(system_parts.join("\n\n"));
        }
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = req.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(k) = req.top_k {
            body["top_k"] = json!(k);
        }
        if let Some(stops) = req.stop_sequences() {
            body["stop_sequences"] = json!(stops);
        }
        if let Some(tools) = &req.tools {
            let claude_tools: Vec<Value> = tools
                .iter()
                .filter_map(|tool| {
                    let func = tool.get("function")?;
                    Some(json!({
                        "name": func.get("name").and_then(Value::as_str).unwrap_or_default(),
                        "description": func.get("description").and_then(Value::as_str).unwrap_or_default(),
                        "input_schema": func.get("parameters")
                            .cloned()
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    }))
                })
                .collect();
            if !claude_tools.is_empty() {
                body["tools"] = json!(claude_tools);
                body["tool_choice"] = json!({"type": "auto"});
            }
        }

        Ok(PreparedRequest {
            url: self.binding.url("/v1/messages")?,
            body: RequestBody::Json(body),
            headers: self.headers(),
        })
    }

    fn convert_response(&self, body: &Value) -> Result<ChatResponse, GatewayError> {
        if let Some(error) = body.get("error") {
            let error_type = error
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return Err(GatewayError::UpstreamProtocol(format!(
                "Anthropic API error ({error_type}): {message}"
            )));
        }

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for item in body.get("content").and_then(Value::as_array).into_iter().flatten() {
            match item.get("type").and_then(Value::as_str) {
                Some("text") => {
                    text.push_str(item.get("text").and_then(Value::as_str).unwrap_or_default());
                }
                Some("tool_use") => {
                    let input = item.get("input").cloned().unwrap_or_else(|| json!({}));
                    tool_calls.push(ToolCall::function(
                        item.get("id").and_then(Value::as_str).unwrap_or_default(),
                        item.get("name").and_then(Value::as_str).unwrap_or_default(),
                        input.to_string(),
                    ));
                }
                _ => {}
            }
        }

        let finish_reason = body
            .get("stop_reason")
            .and_then(Value::as_str)
            .map(normalize_finish_reason);

        let usage = body.get("usage").map(|u| {
            Usage::new(
                u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
                u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            )
        });

        Ok(ChatResponse {
            id: format!(
                "chatcmpl-{}",
                body.get("id").and_then(Value::as_str).unwrap_or("unknown")
            ),
            object: "chat.completion".to_string(),
            created: 0,
            model: body
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(self.binding.upstream_model())
                .to_string(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: Some(text),
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(tool_calls)
                    },
                },
                finish_reason,
            }],
            usage,
        })
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    /// Anthropic SSE events: `content_block_delta` carries text increments,
    /// `message_delta` carries the stop reason and output-token usage;
    /// everything else (ping, message_start, block bookkeeping) is skipped.
    fn convert_stream_chunk(&self, frame: &Value) -> Result<Option<StreamChunk>, GatewayError> {
        if let Some(error) = frame.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return Err(GatewayError::UpstreamProtocol(format!(
                "Anthropic stream error: {message}"
            )));
        }

        let model = self.binding.upstream_model();
        match frame.get("type").and_then(Value::as_str) {
            Some("content_block_delta") => {
                let delta = frame.get("delta");
                let text = delta
                    .and_then(|d| d.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if text.is_empty() {
                    return Ok(None);
                }
                Ok(Some(StreamChunk::delta_text(
                    format!("chatcmpl-{}", now_unix()),
                    model,
                    text,
                )))
            }
            Some("message_delta") => {
                let stop_reason = frame
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)
                    .map(normalize_finish_reason)
                    .unwrap_or_else(|| "stop".to_string());
                let usage = frame.get("usage").map(|u| {
                    Usage::new(
                        u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
                        u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
                    )
                });
                Ok(Some(StreamChunk::terminal(
                    format!("chatcmpl-{}", now_unix()),
                    model,
                    stop_reason,
                    usage,
                )))
            }
            _ => Ok(None),
        }
    }
}

/// Message content as a list of typed Anthropic blocks. Data URLs become
/// base64 image sources; other image URLs are passed through as url sources.
fn content_blocks(content: &Option<MessageContent>) -> Vec<Value> {
    match content {
        Some(MessageContent::Text(text)) => vec![json!({"type": "text", "text": text})],
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(json!({"type": "text", "text": text})),
                ContentPart::ImageUrl { image_url } => Some(image_block(&image_url.url)),
            })
            .collect(),
        None => vec![json!({"type": "text", "text": ""})],
    }
}

fn image_block(url: &str) -> Value {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((header, data)) = rest.split_once(',') {
            let media_type = header.split(';').next().unwrap_or("image/png");
            return json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data},
            });
        }
    }
    json!({"type": "image", "source": {"type": "url", "url": url}})
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converter(model: &str) -> AnthropicConverter {
        let binding: ModelBinding = serde_json::from_value(json!({
            "id": "claude", "adapter": "custom_http", "request_format": "anthropic",
            "model": model, "base_url": "https://api.anthropic.com", "api_key": "sk-ant"
        }))
        .unwrap();
        AnthropicConverter::new(&binding)
    }

    #[tokio::test]
    async fn test_system_split_and_mandatory_max_tokens() {
        let req: ChatRequest = serde_json::from_value(json!({
            "model": "claude",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"}
            ],
            "max_tokens": 8
        }))
        .unwrap();

        let prepared = converter("claude-3-5-sonnet-latest")
            .convert_request(&req)
            .await
            .unwrap();
        let RequestBody::Json(body) = prepared.body else {
            panic!("expected JSON body");
        };

        assert_eq!(body["model"], "claude-3-5-sonnet-latest");
        assert_eq!(body["max_tokens"], 8);
        assert_eq!(body["stream"], false);
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["type"], "text");
        assert_eq!(body["messages"][0]["content"][0]["text"], "hi");
    }

    #[tokio::test]
    async fn test_beta_header_for_claude_35_sonnet() {
        let req: ChatRequest = serde_json::from_value(json!({
            "model": "claude", "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();

        let prepared = converter("claude-3-5-sonnet-latest")
            .convert_request(&req)
            .await
            .unwrap();
        assert!(prepared
            .headers
            .iter()
            .any(|(k, v)| k == "anthropic-beta" && v == "max-tokens-3-5-sonnet-2024-07-15"));
        assert!(prepared
            .headers
            .iter()
            .any(|(k, v)| k == "anthropic-version" && v == "2023-06-01"));

        let prepared = converter("claude-3-opus")
            .convert_request(&req)
            .await
            .unwrap();
        assert!(!prepared.headers.iter().any(|(k, _)| k == "anthropic-beta"));
    }

    #[tokio::test]
    async fn test_max_tokens_defaults_to_4096() {
        let req: ChatRequest = serde_json::from_value(json!({
            "model": "claude", "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        let prepared = converter("claude-3-opus").convert_request(&req).await.unwrap();
        let RequestBody::Json(body) = prepared.body else {
            panic!()
        };
        assert_eq!(body["max_tokens"], 4096);
    }

    #[tokio::test]
    async fn test_stop_becomes_stop_sequences() {
        let req: ChatRequest = serde_json::from_value(json!({
            "model": "claude",
            "messages": [{"role": "user", "content": "hi"}],
            "stop": "END"
        }))
        .unwrap();
        let prepared = converter("claude-3-opus").convert_request(&req).await.unwrap();
        let RequestBody::Json(body) = prepared.body else {
            panic!()
        };
        assert_eq!(body["stop_sequences"], json!(["END"]));
    }

    #[test]
    fn test_response_concatenates_text_and_collects_tools() {
        let upstream = json!({
            "id": "msg_01", "model": "claude-3-5-sonnet-latest",
            "content": [
                {"type": "text", "text": "Let me check. "},
                {"type": "tool_use", "id": "toolu_1", "name": "get_weather",
                 "input": {"city": "London"}},
                {"type": "text", "text": "Done."}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 20}
        });
        let resp = converter("claude-3-5-sonnet-latest")
            .convert_response(&upstream)
            .unwrap();

        let msg = &resp.choices[0].message;
        assert_eq!(msg.content.as_deref(), Some("Let me check. Done."));
        let tools = msg.tool_calls.as_ref().unwrap();
        assert_eq!(tools[0].id, "toolu_1");
        assert_eq!(tools[0].function.name, "get_weather");
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(resp.usage.unwrap().total_tokens, 30);
        assert_eq!(resp.id, "chatcmpl-msg_01");
    }

    #[test]
    fn test_error_envelope() {
        let err = converter("claude-3-opus")
            .convert_response(&json!({
                "error": {"type": "overloaded_error", "message": "Overloaded"}
            }))
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamProtocol(_)));
    }

    #[test]
    fn test_stream_frames() {
        let c = converter("claude-3-opus");

        assert!(c
            .convert_stream_chunk(&json!({"type": "ping"}))
            .unwrap()
            .is_none());
        assert!(c
            .convert_stream_chunk(&json!({"type": "message_start", "message": {}}))
            .unwrap()
            .is_none());

        let chunk = c
            .convert_stream_chunk(&json!({
                "type": "content_block_delta", "index": 0,
                "delta": {"type": "text_delta", "text": "he"}
            }))
            .unwrap()
            .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("he"));

        let terminal = c
            .convert_stream_chunk(&json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn"},
                "usage": {"output_tokens": 12}
            }))
            .unwrap()
            .unwrap();
        assert!(terminal.is_terminal());
        assert_eq!(terminal.finish_reason(), Some("stop"));
        assert_eq!(terminal.usage.unwrap().completion_tokens, 12);
    }
}
