//! DeepL converter
//!
//! DeepL repurposes the chat endpoint for translation: the model name pattern
//! `deepl-<LANG>` selects the target language, only the last user message is
//! sent, and the body is form-encoded rather than JSON.

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ModelBinding;
use crate::error::GatewayError;
use crate::wire::{ChatRequest, ChatResponse};

use super::{Converter, PreparedRequest, RequestBody};

pub struct DeeplConverter {
    binding: ModelBinding,
}

impl DeeplConverter {
    pub fn new(binding: &ModelBinding) -> Self {
        Self {
            binding: binding.clone(),
        }
    }

    fn target_lang(&self) -> String {
        parse_target_lang(self.binding.upstream_model())
    }
}

/// `deepl-en-US` -> `EN-US`; bare `EN` upgrades to `EN-US`.
fn parse_target_lang(model: &str) -> String {
    let lang = model.strip_prefix("deepl-").unwrap_or("EN-US");
    let lang = lang.to_uppercase();
    match lang.as_str() {
        "EN" => "EN-US".to_string(),
        _ => lang,
    }
}

#[async_trait]
impl Converter for DeeplConverter {
    fn name(&self) -> &'static str {
        "deepl"
    }

    async fn convert_request(&self, req: &ChatRequest) -> Result<PreparedRequest, GatewayError> {
        let text = req.last_user_text().unwrap_or_default();

        Ok(PreparedRequest {
            url: self.binding.url("/v2/translate")?,
            body: RequestBody::Form(vec![
                ("target_lang".to_string(), self.target_lang()),
                ("text".to_string(), text),
            ]),
            headers: vec![(
                "Authorization".to_string(),
                format!("DeepL-Auth-Key {}", self.binding.api_key().unwrap_or_default()),
            )],
        })
    }

    fn convert_response(&self, body: &Value) -> Result<ChatResponse, GatewayError> {
        let translations = body.get("translations").and_then(Value::as_array);

        if translations.is_none() {
            if let Some(message) = body.get("message").and_then(Value::as_str) {
                return Err(GatewayError::UpstreamProtocol(format!(
                    "DeepL API error: {message}"
                )));
            }
        }

        let content = translations
            .and_then(|t| t.first())
            .and_then(|t| t.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        Ok(ChatResponse::assistant(
            "deepl-translation",
            self.binding.upstream_model(),
            content,
            "stop",
            None,
        ))
    }
}
