//! Coze bot converter
//!
//! A Coze "model" is a bot: the routing model string carries the bot id with
//! a `bot-` prefix. The last message is the query, everything before it the
//! chat history; the reply is the first `type: "answer"` entry of `messages[]`.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ModelBinding;
use crate::error::GatewayError;
use crate::wire::{ChatRequest, ChatResponse};

use super::{Converter, PreparedRequest, RequestBody};

pub struct CozeConverter {
    binding: ModelBinding,
}

impl CozeConverter {
    pub fn new(binding: &ModelBinding) -> Self {
        Self {
            binding: binding.clone(),
        }
    }

    fn bot_id(&self) -> &str {
        let model = self.binding.upstream_model();
        model.strip_prefix("bot-").unwrap_or(model)
    }
}

#[async_trait]
impl Converter for CozeConverter {
    fn name(&self) -> &'static str {
        "coze"
    }

    async fn convert_request(&self, req: &ChatRequest) -> Result<PreparedRequest, GatewayError> {
        let mut query = String::new();
        let mut chat_history = Vec::new();

        let count = req.messages.len();
        for (i, msg) in req.messages.iter().enumerate() {
            let text = msg.text_content();
            if i + 1 == count {
                query = text;
            } else {
                chat_history.push(json!({"role": msg.role, "content": text}));
            }
        }

        let mut body = json!({
            "bot_id": self.bot_id(),
            "query": query,
            "chat_history": chat_history,
            "stream": req.stream,
        });
        if let Some(user) = &req.user {
            body["user"] = json!(user);
        }

        Ok(PreparedRequest {
            url: self.binding.url("/open_api/v2/chat")?,
            body: RequestBody::Json(body),
            headers: vec![(
                "Authorization".to_string(),
                format!("Bearer {}", self.binding.api_key().unwrap_or_default()),
            )],
        })
    }

    fn convert_response(&self, body: &Value) -> Result<ChatResponse, GatewayError> {
        if let Some(code) = body.get("code").and_then(Value::as_i64).filter(|c| *c != 0) {
            let msg = body
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return Err(GatewayError::UpstreamProtocol(format!(
                "Coze API error ({code}): {msg}"
            )));
        }

        let messages = body
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let answer = messages
            .iter()
            .find(|m| m.get("type").and_then(Value::as_str) == Some("answer"));

        let content = answer
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        let finish_reason = match answer
            .and_then(|m| m.get("stop_reason"))
            .and_then(Value::as_str)
        {
            Some("max_tokens") => "length",
            _ => "stop",
        };

        Ok(ChatResponse::assistant(
            body.get("conversation_id")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            self.binding.upstream_model(),
            content,
            finish_reason,
            None,
        ))
    }
}
