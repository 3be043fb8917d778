//! Google Gemini converter
//!
//! Gemini's `contents` format renames `assistant` to `model` and has no
//! system role outside an allow-listed set of models; for everything else a
//! system message becomes a leading user turn plus a synthetic
//! `{role: "model", parts: [{text: "Okay"}]}` to preserve turn parity.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ModelBinding;
use crate::error::GatewayError;
use crate::wire::{
    now_unix, ChatRequest, ChatResponse, Choice, ContentPart, MessageContent, ResponseMessage,
    StreamChunk, ToolCall,
};

use super::{Converter, PreparedRequest, RequestBody};

pub struct GeminiConverter {
    binding: ModelBinding,
}

impl GeminiConverter {
    pub fn new(binding: &ModelBinding) -> Self {
        Self {
            binding: binding.clone(),
        }
    }

    /// Models that accept a native `system_instruction`.
    fn supports_system_instruction(&self) -> bool {
        self.binding
            .upstream_model()
            .starts_with("gemini-2.0-flash")
    }

    /// `v1beta` for the 2.0/1.5 generations, `v1` otherwise.
    fn api_version(&self) -> &'static str {
        let model = self.binding.upstream_model();
        if model.starts_with("gemini-2.0") || model.starts_with("gemini-1.5") {
            "v1beta"
        } else {
            "v1"
        }
    }

    fn url(&self, stream: bool) -> Result<String, GatewayError> {
        let method = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let default = format!("/{{version}}/models/{{model}}:{method}");
        let url = self.binding.url(&default)?;
        Ok(url.replace("{version}", self.api_version()))
    }
}

#[async_trait]
impl Converter for GeminiConverter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn convert_request(&self, req: &ChatRequest) -> Result<PreparedRequest, GatewayError> {
        let mut contents: Vec<Value> = Vec::new();
        let mut system_instruction: Option<String> = None;
        let mut needs_dummy_model_turn = false;

        for msg in &req.messages {
            let mut role = msg.role.as_str();

            if role == "system" {
                if self.supports_system_instruction() {
                    system_instruction = Some(msg.text_content());
                    continue;
                }
                needs_dummy_model_turn = true;
                role = "user";
            }
            if role == "assistant" {
                role = "model";
            }

            let parts = message_parts(&msg.content);
            if !parts.is_empty() {
                contents.push(json!({"role": role, "parts": parts}));
            }
        }

        if needs_dummy_model_turn && !contents.is_empty() {
            contents.push(json!({"role": "model", "parts": [{"text": "Okay"}]}));
        }

        let mut generation_config = json!({});
        if let Some(t) = req.temperature {
            generation_config["temperature"] = json!(t);
        }
        if let Some(p) = req.top_p {
            generation_config["topP"] = json!(p);
        }
        if let Some(max) = req.max_tokens {
            generation_config["maxOutputTokens"] = json!(max);
        }
        if let Some(stops) = req.stop_sequences() {
            generation_config["stopSequences"] = json!(stops);
        }

        let mut body = json!({
            "contents": contents,
            "safety_settings": [
                {"category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_NONE"},
                {"category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_NONE"},
                {"category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_NONE"},
                {"category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_NONE"},
                {"category": "HARM_CATEGORY_CIVIC_INTEGRITY", "threshold": "BLOCK_NONE"}
            ],
            "generation_config": generation_config,
        });

        if let Some(instruction) = system_instruction {
            body["system_instruction"] = json!({"parts": [{"text": instruction}]});
        }

        if let Some(tools) = &req.tools {
            let functions: Vec<Value> = tools
                .iter()
                .filter_map(|t| t.get("function").cloned())
                .collect();
            if !functions.is_empty() {
                body["tools"] = json!([{"function_declarations": functions}]);
            }
        }

        Ok(PreparedRequest {
            url: self.url(req.stream)?,
            body: RequestBody::Json(body),
            headers: vec![(
                "x-goog-api-key".to_string(),
                self.binding.api_key().unwrap_or_default(),
            )],
        })
    }

    fn convert_response(&self, body: &Value) -> Result<ChatResponse, GatewayError> {
        if let Some(error) = body.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return Err(GatewayError::UpstreamProtocol(format!(
                "Gemini API error: {message}"
            )));
        }

        let candidates = body
            .get("candidates")
            .and_then(Value::as_array)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                GatewayError::UpstreamProtocol("No candidates returned from Gemini API".to_string())
            })?;

        let mut choices = Vec::new();
        for (i, candidate) in candidates.iter().enumerate() {
            let (text, tool_calls) = candidate_parts(candidate, i);
            let has_tools = !tool_calls.is_empty();

            choices.push(Choice {
                index: i as u32,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: if has_tools { None } else { Some(text) },
                    tool_calls: if has_tools { Some(tool_calls) } else { None },
                },
                finish_reason: Some(
                    candidate
                        .get("finishReason")
                        .and_then(Value::as_str)
                        .unwrap_or("stop")
                        .to_lowercase(),
                ),
            });
        }

        Ok(ChatResponse {
            id: format!("chatcmpl-gemini-{}", now_unix()),
            object: "chat.completion".to_string(),
            created: 0,
            model: self.binding.upstream_model().to_string(),
            choices,
            usage: None,
        })
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    /// Streamed frames share the unary shape; a frame with `finishReason`
    /// closes the stream.
    fn convert_stream_chunk(&self, frame: &Value) -> Result<Option<StreamChunk>, GatewayError> {
        if let Some(error) = frame.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return Err(GatewayError::UpstreamProtocol(format!(
                "Gemini stream error: {message}"
            )));
        }

        let Some(candidate) = frame
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        else {
            return Ok(None);
        };

        let (text, _) = candidate_parts(candidate, 0);
        let finish = candidate.get("finishReason").and_then(Value::as_str);

        if text.is_empty() && finish.is_none() {
            return Ok(None);
        }

        let id = format!("chatcmpl-gemini-{}", now_unix());
        let model = self.binding.upstream_model();
        if let Some(reason) = finish {
            let mut chunk = StreamChunk::terminal(id, model, reason.to_lowercase(), None);
            if !text.is_empty() {
                chunk.choices[0].delta.content = Some(text);
            }
            Ok(Some(chunk))
        } else {
            Ok(Some(StreamChunk::delta_text(id, model, text)))
        }
    }
}

/// Request-side parts: text and inline data for data URLs.
fn message_parts(content: &Option<MessageContent>) -> Vec<Value> {
    match content {
        Some(MessageContent::Text(text)) => vec![json!({"text": text})],
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(json!({"text": text})),
                ContentPart::ImageUrl { image_url } => inline_data(&image_url.url),
            })
            .collect(),
        None => Vec::new(),
    }
}

fn inline_data(url: &str) -> Option<Value> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let mime_type = header.split(';').next().unwrap_or("image/jpeg");
    Some(json!({"inlineData": {"mimeType": mime_type, "data": data}}))
}

/// Response-side parts: concatenated text plus collected function calls.
fn candidate_parts(candidate: &Value, index: usize) -> (String, Vec<ToolCall>) {
    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();

    let parts = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array);
    for part in parts.into_iter().flatten() {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            text_parts.push(text.to_string());
        } else if let Some(call) = part.get("functionCall") {
            let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
            tool_calls.push(ToolCall::function(
                format!("call_{index}"),
                call.get("name").and_then(Value::as_str).unwrap_or_default(),
                args.to_string(),
            ));
        }
    }

    (text_parts.join("\n"), tool_calls)
}
