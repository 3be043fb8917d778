//! OpenAI-compatible adapter
//!
//! Direct forwarding for backends that already speak the OpenAI chat
//! protocol: OpenAI, DeepSeek, Ollama, vLLM, LocalAI, LM Studio, Groq,
//! Together, Mistral. No converter; only the `model` field is rewritten from
//! the routing id to the configured upstream name.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ModelBinding;
use crate::error::GatewayError;
use crate::wire::{ChatRequest, ChatResponse, StreamChunk};

use super::sse::pump_sse;
use super::{chunk_channel, effective_timeout, ChatAdapter, ChunkStream};

pub struct OpenAiCompatAdapter {
    binding: ModelBinding,
    client: reqwest::Client,
}

impl OpenAiCompatAdapter {
    pub fn new(binding: ModelBinding, client: reqwest::Client) -> Self {
        Self { binding, client }
    }

    /// Local inference servers that run without credentials.
    fn is_local_backend(&self) -> bool {
        self.binding
            .base_url
            .as_deref()
            .map(|url| {
                let lower = url.to_lowercase();
                lower.contains("ollama") || lower.contains("lmstudio")
            })
            .unwrap_or(false)
    }

    fn request_body(&self, req: &ChatRequest, stream: bool) -> Result<Value, GatewayError> {
        let mut body = serde_json::to_value(req)
            .map_err(|e| GatewayError::Internal(format!("request serialization: {e}")))?;
        body["model"] = json!(self.binding.upstream_model());
        body["stream"] = json!(stream);
        Ok(body)
    }

    fn builder(&self, url: &str, timeout: Duration) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(url).timeout(timeout);
        if let Some(key) = self.binding.api_key() {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        builder
    }

    async fn send(
        &self,
        req: &ChatRequest,
        stream: bool,
        timeout: Duration,
    ) -> Result<reqwest::Response, GatewayError> {
        let url = self.binding.url("/chat/completions")?;
        let body = self.request_body(req, stream)?;

        let response = self
            .builder(&url, timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let message = upstream_error_message(response).await;
            return Err(GatewayError::from_status(status.as_u16(), message));
        }
        Ok(response)
    }
}

/// Pull the error message out of a failed response body, falling back to the
/// raw text.
async fn upstream_error_message(response: reqwest::Response) -> String {
    let status = response.status();
    match response.text().await {
        Ok(text) => match serde_json::from_str::<Value>(&text) {
            Ok(body) => body
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(text),
            Err(_) => text,
        },
        Err(_) => format!("HTTP {status}"),
    }
}

#[async_trait]
impl ChatAdapter for OpenAiCompatAdapter {
    fn family(&self) -> &'static str {
        "openai_compat"
    }

    fn binding(&self) -> &ModelBinding {
        &self.binding
    }

    fn is_available(&self) -> Result<(), GatewayError> {
        if self.binding.base_url.is_none() {
            return Err(GatewayError::Config("missing base_url".to_string()));
        }
        if self.binding.api_key().is_none() && !self.is_local_backend() {
            return Err(GatewayError::Config("missing api_key".to_string()));
        }
        Ok(())
    }

    async fn chat(
        &self,
        req: &ChatRequest,
        timeout: Option<Duration>,
    ) -> Result<ChatResponse, GatewayError> {
        let timeout = effective_timeout(&self.binding, timeout);
        let response = self.send(req, false, timeout).await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::UpstreamProtocol(format!("response not JSON: {e}")))?;

        if let Some(error) = body.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return Err(GatewayError::UpstreamProtocol(format!(
                "upstream error: {message}"
            )));
        }

        serde_json::from_value(body)
            .map_err(|e| GatewayError::UpstreamProtocol(format!("malformed chat response: {e}")))
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        timeout: Option<Duration>,
    ) -> Result<ChunkStream, GatewayError> {
        let timeout = effective_timeout(&self.binding, timeout);
        let response = self.send(req, true, timeout).await?;

        let (tx, stream) = chunk_channel();
        tokio::spawn(async move {
            pump_sse(response, tx, |frame| {
                if let Some(error) = frame.get("error") {
                    let message = error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("Unknown error");
                    return Err(GatewayError::UpstreamProtocol(format!(
                        "upstream stream error: {message}"
                    )));
                }
                Ok(serde_json::from_value::<StreamChunk>(frame.clone()).ok())
            })
            .await;
        });

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::Router;
    use futures::StreamExt;

    fn adapter(base_url: &str, api_key: Option<&str>) -> OpenAiCompatAdapter {
        let binding: ModelBinding = serde_json::from_value(json!({
            "id": "gpt", "adapter": "openai_compat", "model": "gpt-4o-mini",
            "base_url": base_url, "api_key": api_key
        }))
        .unwrap();
        OpenAiCompatAdapter::new(binding, reqwest::Client::new())
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn request() -> ChatRequest {
        serde_json::from_value(json!({
            "model": "gpt",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap()
    }

    #[test]
    fn test_availability_rules() {
        assert!(adapter("https://api.openai.com/v1", Some("sk")).is_available().is_ok());
        assert!(adapter("https://api.openai.com/v1", None).is_available().is_err());
        // Local backends are recognised by substring and need no key
        assert!(adapter("http://localhost:11434/ollama/v1", None)
            .is_available()
            .is_ok());
        assert!(adapter("http://lmstudio.local:1234/v1", None)
            .is_available()
            .is_ok());
    }

    #[tokio::test]
    async fn test_unary_roundtrip_rewrites_model() {
        let router = Router::new().route(
            "/chat/completions",
            post(|body: axum::Json<Value>| async move {
                assert_eq!(body.0["model"], "gpt-4o-mini");
                assert_eq!(body.0["stream"], false);
                axum::Json(json!({
                    "id": "chatcmpl-1", "object": "chat.completion", "created": 1,
                    "model": "gpt-4o-mini",
                    "choices": [{"index": 0,
                        "message": {"role": "assistant", "content": "hello"},
                        "finish_reason": "stop"}]
                }))
            }),
        );
        let base = serve(router).await;

        let resp = adapter(&base, Some("sk")).chat(&request(), None).await.unwrap();
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_upstream_401_is_auth_error() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async {
                (
                    axum::http::StatusCode::UNAUTHORIZED,
                    axum::Json(json!({"error": {"message": "bad credentials"}})),
                )
            }),
        );
        let base = serve(router).await;

        let err = adapter(&base, Some("sk")).chat(&request(), None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Auth(_)));
    }

    #[tokio::test]
    async fn test_stream_frames_in_order_with_held_terminal() {
        // The upstream frames of the wire contract: two deltas, a keepalive
        // with empty choices, a usage-only frame, then [DONE].
        let sse_body = concat!(
            "data: {\"id\":\"x\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"he\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"x\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[]}\n\n",
            "data: {\"id\":\"x\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"id\":\"x\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        );
        let router = Router::new().route(
            "/chat/completions",
            post(move || async move {
                ([("content-type", "text/event-stream")], sse_body).into_response()
            }),
        );
        let base = serve(router).await;

        let stream = adapter(&base, Some("sk"))
            .chat_stream(&request(), None)
            .await
            .unwrap();
        let chunks: Vec<_> = stream.collect().await;

        assert_eq!(chunks.len(), 2);
        let first = chunks[0].as_ref().unwrap();
        assert_eq!(first.choices[0].delta.content.as_deref(), Some("he"));

        let last = chunks[1].as_ref().unwrap();
        assert!(last.is_terminal());
        assert_eq!(last.choices[0].delta.content.as_deref(), Some("llo"));
        // Trailing usage frame was folded into the terminal chunk
        assert_eq!(last.usage.unwrap().total_tokens, 5);
    }

    #[tokio::test]
    async fn test_stream_without_terminal_ends_cleanly() {
        let sse_body = "data: {\"id\":\"x\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"},\"finish_reason\":null}]}\n\n";
        let router = Router::new().route(
            "/chat/completions",
            post(move || async move {
                ([("content-type", "text/event-stream")], sse_body).into_response()
            }),
        );
        let base = serve(router).await;

        let stream = adapter(&base, Some("sk"))
            .chat_stream(&request(), None)
            .await
            .unwrap();
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 1);
        assert!(!chunks[0].as_ref().unwrap().is_terminal());
    }
}
