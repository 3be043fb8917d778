//! WebSocket adapter (Xunfei Spark)
//!
//! One connection per request, never pooled. The converter builds the signed
//! connection URL and the single request frame; every inbound frame goes
//! through the converter's chunk translator until it reports terminal status.
//! Client-side pings stay disabled - the vendor drives keepalives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::config::ModelBinding;
use crate::convert::{Converter, XunfeiConverter};
use crate::error::GatewayError;
use crate::wire::{ChatRequest, ChatResponse, Usage};

use super::{chunk_channel, effective_timeout, ChatAdapter, ChunkStream};

pub struct WebSocketAdapter {
    binding: ModelBinding,
    converter: Arc<XunfeiConverter>,
}

impl WebSocketAdapter {
    pub fn new(binding: ModelBinding) -> Self {
        let converter = Arc::new(XunfeiConverter::new(&binding));
        Self { binding, converter }
    }
}

#[async_trait]
impl ChatAdapter for WebSocketAdapter {
    fn family(&self) -> &'static str {
        "websocket_xunfei"
    }

    fn binding(&self) -> &ModelBinding {
        &self.binding
    }

    fn is_available(&self) -> Result<(), GatewayError> {
        if self.binding.api_key().is_none() {
            return Err(GatewayError::Config("missing api_key".to_string()));
        }
        let cfg = &self.binding.config;
        if cfg.api_secret().is_none() {
            return Err(GatewayError::Config("missing api_secret".to_string()));
        }
        if cfg.app_id.as_deref().unwrap_or("") == "" || cfg.app_id.as_deref() == Some("not-needed")
        {
            return Err(GatewayError::Config("missing app_id".to_string()));
        }
        Ok(())
    }

    async fn chat(
        &self,
        req: &ChatRequest,
        timeout: Option<Duration>,
    ) -> Result<ChatResponse, GatewayError> {
        // Collect the stream into one reply
        let mut stream = self.chat_stream(req, timeout).await?;

        let mut content = String::new();
        let mut usage: Option<Usage> = None;
        let mut id = None;

        while let Some(item) = stream.next().await {
            let chunk = item?;
            if id.is_none() {
                id = Some(chunk.id.clone());
            }
            if let Some(delta) = chunk
                .choices
                .first()
                .and_then(|c| c.delta.content.as_deref())
            {
                content.push_str(delta);
            }
            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
            if chunk.is_terminal() {
                break;
            }
        }

        Ok(ChatResponse::assistant(
            id.unwrap_or_else(|| "chatcmpl-spark".to_string()),
            req.model.clone(),
            content,
            "stop",
            usage,
        ))
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        timeout: Option<Duration>,
    ) -> Result<ChunkStream, GatewayError> {
        let timeout = effective_timeout(&self.binding, timeout);
        let auth_url = self.converter.auth_url(Utc::now())?;
        let request_frame = self.converter.ws_request(req)?;

        let (mut socket, _) = tokio::time::timeout(timeout, connect_async(&auth_url))
            .await
            .map_err(|_| GatewayError::Timeout(timeout))?
            .map_err(|e| GatewayError::UpstreamTransient(format!("WebSocket connect failed: {e}")))?;

        socket
            .send(Message::Text(request_frame.to_string()))
            .await
            .map_err(|e| GatewayError::UpstreamTransient(format!("WebSocket send failed: {e}")))?;

        let converter = Arc::clone(&self.converter);
        let (tx, stream) = chunk_channel();

        tokio::spawn(async move {
            loop {
                let message = match tokio::time::timeout(timeout, socket.next()).await {
                    Err(_) => {
                        let _ = tx.send(Err(GatewayError::Timeout(timeout))).await;
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        let _ = tx
                            .send(Err(GatewayError::UpstreamTransient(format!(
                                "WebSocket read failed: {e}"
                            ))))
                            .await;
                        break;
                    }
                    Ok(Some(Ok(message))) => message,
                };

                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let Ok(frame) = serde_json::from_str(&text) else {
                    continue;
                };

                match converter.convert_stream_chunk(&frame) {
                    Ok(None) => {}
                    Ok(Some(chunk)) => {
                        let terminal = chunk.is_terminal();
                        if tx.send(Ok(chunk)).await.is_err() {
                            break;
                        }
                        if terminal {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }

            // Graceful close frame; the drop below hard-closes regardless
            let _ = socket.close(None).await;
        });

        Ok(stream)
    }
}
