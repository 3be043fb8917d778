//! Protocol converters - bidirectional translation between the canonical
//! OpenAI-shaped records and each vendor's wire format.
//!
//! A converter owns the whole vendor-facing exchange shape for one request
//! format: the outbound body, the auth headers (including any signing or
//! token-minting ritual), the URL, and the translation of unary responses
//! and streamed frames back to canonical types.
//!
//! # Adding a vendor
//!
//! 1. Create a submodule implementing [`Converter`]
//! 2. Register it in [`for_format`]
//! 3. Reference the format string from a `custom_http`/`websocket` binding

mod ali;
mod anthropic;
mod baidu;
mod cohere;
mod coze;
mod deepl;
mod gemini;
mod openai;
mod tencent;
mod xunfei;
mod zhipu;

pub use xunfei::XunfeiConverter;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ModelBinding;
use crate::error::GatewayError;
use crate::wire::{ChatRequest, ChatResponse, StreamChunk};

// ============================================================================
// Prepared request
// ============================================================================

/// Outbound body representation. DeepL is the one vendor that refuses JSON
/// and takes a form-encoded body instead.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(Value),
    Form(Vec<(String, String)>),
}

/// Everything the transport needs for one upstream exchange.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub url: String,
    pub body: RequestBody,
    /// Vendor-required headers, credentials included. `Content-Type` is set
    /// by the transport from the body kind.
    pub headers: Vec<(String, String)>,
}

// ============================================================================
// Converter trait
// ============================================================================

/// Vendor protocol translation. Conversion is stateless per request; the only
/// state a converter may hold is a credential-keyed token cache (Zhipu JWTs,
/// Baidu OAuth tokens) bounded by the upstream's advertised expiry.
#[async_trait]
pub trait Converter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build the outbound exchange for one canonical request. Async because
    /// some vendors need a network fetch (Baidu OAuth) or a cached token
    /// refresh before the headers and URL are known.
    async fn convert_request(&self, req: &ChatRequest) -> Result<PreparedRequest, GatewayError>;

    /// Translate a complete vendor response body. Must surface vendor error
    /// envelopes as typed errors.
    fn convert_response(&self, body: &Value) -> Result<ChatResponse, GatewayError>;

    /// Whether the vendor supports an incremental exchange. When false, the
    /// transport satisfies `chat_stream` by replaying a unary response.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Translate one streamed vendor frame. `None` skips the frame
    /// (keepalives, empty deltas); a chunk with a non-null finish reason
    /// signals end-of-stream to the transport.
    fn convert_stream_chunk(&self, _frame: &Value) -> Result<Option<StreamChunk>, GatewayError> {
        Err(GatewayError::UpstreamProtocol(format!(
            "{} does not support streaming",
            self.name()
        )))
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Resolve a `request_format` string to its converter.
pub fn for_format(
    format: &str,
    binding: &ModelBinding,
) -> Option<Arc<dyn Converter>> {
    match format.to_lowercase().as_str() {
        "anthropic" => Some(Arc::new(anthropic::AnthropicConverter::new(binding))),
        "gemini" => Some(Arc::new(gemini::GeminiConverter::new(binding))),
        "zhipu" => Some(Arc::new(zhipu::ZhipuConverter::new(binding))),
        "baidu" => Some(Arc::new(baidu::BaiduConverter::new(binding))),
        // Ali Bailian shares the DashScope wire format
        "ali" | "alibailian" => Some(Arc::new(ali::AliConverter::new(binding))),
        "tencent" => Some(Arc::new(tencent::TencentConverter::new(binding))),
        "cohere" => Some(Arc::new(cohere::CohereConverter::new(binding))),
        "coze" => Some(Arc::new(coze::CozeConverter::new(binding))),
        "deepl" => Some(Arc::new(deepl::DeeplConverter::new(binding))),
        "xunfei" => Some(Arc::new(xunfei::XunfeiConverter::new(binding))),
        // OpenAI-shaped vendors differ only in base URL and headers
        "openai" | "moonshot" | "minimax" | "doubao" | "deepseek" => {
            Some(Arc::new(openai::OpenAiShapedConverter::new(binding)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(format: &str) -> ModelBinding {
        serde_json::from_str(&format!(
            r#"{{"id": "t", "adapter": "custom_http", "request_format": "{format}",
                 "base_url": "https://example.com", "api_key": "k"}}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_known_formats_resolve() {
        for format in [
            "anthropic",
            "gemini",
            "zhipu",
            "baidu",
            "ali",
            "alibailian",
            "tencent",
            "cohere",
            "coze",
            "deepl",
            "xunfei",
            "moonshot",
            "minimax",
            "doubao",
            "deepseek",
        ] {
            assert!(
                for_format(format, &binding(format)).is_some(),
                "{format} should resolve"
            );
        }
    }

    #[test]
    fn test_unknown_format_is_none() {
        assert!(for_format("made-up", &binding("made-up")).is_none());
    }

    #[test]
    fn test_format_lookup_is_case_insensitive() {
        assert!(for_format("Anthropic", &binding("anthropic")).is_some());
    }
}
