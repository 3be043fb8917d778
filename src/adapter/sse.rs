//! Upstream SSE plumbing shared by the HTTP adapters
//!
//! Reads an `event-stream` body line by line, strips the `data: ` prefix,
//! stops at `[DONE]`, and feeds every JSON frame through a translation
//! closure. Terminal chunks are held back until the trailing `usage` frame
//! (when the vendor sends one) so the stream delivers at most one usage
//! record, attached to the terminal chunk.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::GatewayError;
use crate::wire::{StreamChunk, Usage};

/// Drain an upstream SSE response into `tx`. `translate` maps one parsed
/// frame to `Ok(None)` (skip), `Ok(Some(chunk))`, or a typed error.
pub(crate) async fn pump_sse<F>(
    response: reqwest::Response,
    tx: mpsc::Sender<Result<StreamChunk, GatewayError>>,
    mut translate: F,
) where
    F: FnMut(&Value) -> Result<Option<StreamChunk>, GatewayError>,
{
    use futures::StreamExt;

    let mut byte_stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut pending_terminal: Option<StreamChunk> = None;
    let mut captured_usage: Option<Usage> = None;

    'read: while let Some(piece) = byte_stream.next().await {
        let piece = match piece {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx
                    .send(Err(GatewayError::UpstreamTransient(format!(
                        "stream read failed: {e}"
                    ))))
                    .await;
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&piece));

        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim().to_string();
            buffer.drain(..=newline);

            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload.is_empty() {
                continue;
            }
            if payload == "[DONE]" {
                break 'read;
            }

            let Ok(frame) = serde_json::from_str::<Value>(payload) else {
                continue;
            };

            match translate(&frame) {
                Ok(None) => {}
                Ok(Some(chunk)) => {
                    // Usage-only frames (empty choices) are captured, not
                    // forwarded; Azure-style keepalives land here too.
                    if chunk.choices.is_empty() {
                        if chunk.usage.is_some() {
                            captured_usage = chunk.usage;
                        }
                        continue;
                    }
                    if chunk.is_terminal() {
                        if chunk.usage.is_some() {
                            captured_usage = chunk.usage;
                        }
                        pending_terminal = Some(chunk);
                        continue;
                    }
                    if tx.send(Ok(chunk)).await.is_err() {
                        // Receiver gone: the client disconnected
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    }

    if let Some(mut terminal) = pending_terminal {
        if terminal.usage.is_none() {
            terminal.usage = captured_usage;
        }
        let _ = tx.send(Ok(terminal)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // pump_sse needs a reqwest::Response; the line-splitting and
    // terminal/usage bookkeeping are covered end-to-end in the adapter tests
    // against a local axum server. Here we pin down the frame protocol helper
    // used by translate closures.

    #[test]
    fn test_data_prefix_handling() {
        assert_eq!("data: {\"a\":1}".strip_prefix("data:").map(str::trim), Some("{\"a\":1}"));
        assert_eq!("data:[DONE]".strip_prefix("data:").map(str::trim), Some("[DONE]"));
        assert!(": heartbeat".strip_prefix("data:").is_none());
    }
}
