//! Chat adapters - one transport per backend family
//!
//! An adapter pairs one transport (HTTP, child process, WebSocket) with at
//! most one protocol converter and satisfies the canonical chat contract:
//! `chat` for unary calls, `chat_stream` for a finite, cancellable sequence
//! of stream chunks. Adapters are constructed at registry (re)load and live
//! until the next reload replaces the table.

mod custom_http;
mod openai_compat;
mod process;
mod sse;
mod websocket;

pub use custom_http::CustomHttpAdapter;
pub use openai_compat::OpenAiCompatAdapter;
pub use process::ProcessAdapter;
pub use websocket::WebSocketAdapter;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::ModelBinding;
use crate::error::GatewayError;
use crate::wire::{ChatRequest, ChatResponse, StreamChunk};

/// A finite, non-restartable sequence of stream chunks. Dropping the stream
/// cancels the upstream exchange.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, GatewayError>> + Send>>;

#[async_trait]
pub trait ChatAdapter: Send + Sync {
    /// Adapter family string, reported as `owned_by` in `/v1/models`.
    fn family(&self) -> &'static str;

    fn binding(&self) -> &ModelBinding;

    /// Registration-time availability check: credentials present, transport
    /// prerequisites met. The error names the missing piece.
    fn is_available(&self) -> Result<(), GatewayError>;

    async fn chat(
        &self,
        req: &ChatRequest,
        timeout: Option<Duration>,
    ) -> Result<ChatResponse, GatewayError>;

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        timeout: Option<Duration>,
    ) -> Result<ChunkStream, GatewayError>;

    /// Entry for `/v1/models`.
    fn model_info(&self) -> Value {
        json!({
            "id": self.binding().id,
            "object": "model",
            "created": 0,
            "owned_by": self.family(),
        })
    }
}

/// Effective wall-clock budget for one upstream exchange.
pub(crate) fn effective_timeout(binding: &ModelBinding, timeout: Option<Duration>) -> Duration {
    timeout.unwrap_or_else(|| binding.timeout())
}

/// Channel-backed stream: the producing task owns the upstream connection and
/// stops as soon as the receiver is dropped.
pub(crate) fn chunk_channel() -> (
    mpsc::Sender<Result<StreamChunk, GatewayError>>,
    ChunkStream,
) {
    let (tx, rx) = mpsc::channel(32);
    (tx, Box::pin(ReceiverStream::new(rx)))
}

/// Replay a unary response as a two-chunk stream (one content delta, one
/// terminal frame). Used where the backend has no incremental mode.
pub(crate) fn replay_as_stream(resp: ChatResponse) -> ChunkStream {
    let mut chunks: Vec<Result<StreamChunk, GatewayError>> = Vec::new();

    let choice = resp.choices.first();
    let content = choice
        .and_then(|c| c.message.content.clone())
        .unwrap_or_default();
    let finish_reason = choice
        .and_then(|c| c.finish_reason.clone())
        .unwrap_or_else(|| "stop".to_string());

    if !content.is_empty() {
        let mut delta = StreamChunk::delta_text(resp.id.clone(), resp.model.clone(), content);
        delta.created = resp.created;
        chunks.push(Ok(delta));
    }
    let mut terminal =
        StreamChunk::terminal(resp.id.clone(), resp.model.clone(), finish_reason, resp.usage);
    terminal.created = resp.created;
    chunks.push(Ok(terminal));

    Box::pin(futures::stream::iter(chunks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Usage;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_replay_emits_delta_then_terminal() {
        let resp =
            ChatResponse::assistant("id-1", "m", "hello", "stop", Some(Usage::new(1, 2)));
        let chunks: Vec<_> = replay_as_stream(resp).collect().await;
        assert_eq!(chunks.len(), 2);

        let first = chunks[0].as_ref().unwrap();
        assert_eq!(first.choices[0].delta.content.as_deref(), Some("hello"));
        assert!(!first.is_terminal());

        let last = chunks[1].as_ref().unwrap();
        assert!(last.is_terminal());
        assert_eq!(last.usage.unwrap().total_tokens, 3);
    }

    #[tokio::test]
    async fn test_replay_of_empty_content_is_single_terminal() {
        let resp = ChatResponse::assistant("id-1", "m", "", "stop", None);
        let chunks: Vec<_> = replay_as_stream(resp).collect().await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].as_ref().unwrap().is_terminal());
    }
}
