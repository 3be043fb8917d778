//! HTTP frontend
//!
//! The OpenAI-compatible surface: `/v1/chat/completions` (unary + SSE),
//! `/v1/models`, `/health`, `/reload`, and CORS preflight. This is the single
//! translation point from [`GatewayError`] to HTTP statuses and the error
//! envelope, and the hard boundary for crash isolation: no request, however
//! malformed, and no adapter failure, however deep, may take the process
//! down.

use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router as AxumRouter;
use futures::{FutureExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::adapter::ChunkStream;
use crate::error::{sanitize_message, GatewayError};
use crate::registry::Registry;
use crate::router::Router;
use crate::wire::ChatRequest;

/// Hard ceiling on a unary router call, above any per-binding timeout.
const ROUTER_CEILING: Duration = Duration::from_secs(300);

/// Inter-frame timeout on a stream; recovered with an SSE heartbeat comment.
const FRAME_TIMEOUT: Duration = Duration::from_secs(30);

/// Runaway guard: a stream never loops more than this many times.
const MAX_STREAM_ITERATIONS: u32 = 10_000;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub router: Arc<Router>,
}

impl AppState {
    pub fn new(registry: Arc<Registry>) -> Self {
        let router = Arc::new(Router::new(registry.clone()));
        Self { registry, router }
    }
}

/// Build the axum application.
pub fn build_app(state: AppState) -> AxumRouter {
    AxumRouter::new()
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/reload", get(reload))
        .route("/v1/chat/completions", post(chat_completions))
        .fallback(fallback)
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Response {
    json_response(StatusCode::OK, json!({"status": "ok"}))
}

async fn list_models(State(state): State<AppState>) -> Response {
    isolated(async move { json_response(StatusCode::OK, state.registry.list_models()) }).await
}

async fn reload(State(state): State<AppState>) -> Response {
    isolated(async move {
        match state.registry.reload() {
            Ok(count) => json_response(
                StatusCode::OK,
                json!({"status": "ok", "message": format!("{count} model(s) loaded")}),
            ),
            Err(e) => json_response(
                StatusCode::OK,
                json!({"status": "error", "message": e.sanitized_message()}),
            ),
        }
    })
    .await
}

/// CORS preflight for any path; everything else is a 404 envelope.
async fn fallback(method: Method) -> Response {
    if method == Method::OPTIONS {
        return Response::builder()
            .status(StatusCode::OK)
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type, Authorization")
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::OK.into_response());
    }
    error_response(StatusCode::NOT_FOUND, "Not Found")
}

async fn chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    isolated(handle_chat(state, body)).await
}

async fn handle_chat(state: AppState, body: Bytes) -> Response {
    if body.is_empty() {
        return invalid_request("Request body is required");
    }

    let raw: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => return invalid_request("Invalid JSON body"),
    };
    if raw.get("model").and_then(Value::as_str).is_none() {
        return invalid_request("Missing 'model' field");
    }

    let req: ChatRequest = match serde_json::from_value(raw) {
        Ok(req) => req,
        Err(e) => return invalid_request(&format!("Invalid request: {e}")),
    };
    let model_id = req.model.clone();

    if req.stream {
        stream_chat(state, model_id, req).await
    } else {
        unary_chat(state, model_id, req).await
    }
}

async fn unary_chat(state: AppState, model_id: String, req: ChatRequest) -> Response {
    match tokio::time::timeout(ROUTER_CEILING, state.router.route(&model_id, &req)).await {
        Err(_) => error_response(StatusCode::GATEWAY_TIMEOUT, "Request timed out"),
        Ok(Err(e)) => gateway_error_response(&e),
        Ok(Ok(resp)) => match serde_json::to_value(&resp) {
            Ok(value) => json_response(StatusCode::OK, value),
            Err(e) => {
                tracing::error!("response serialization failed: {e}");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        },
    }
}

async fn stream_chat(state: AppState, model_id: String, req: ChatRequest) -> Response {
    let adapter = match state.router.adapter_for(&model_id) {
        Ok(adapter) => adapter,
        Err(e) => return gateway_error_response(&e),
    };

    let upstream = match adapter.chat_stream(&req, None).await {
        Ok(stream) => stream,
        Err(e) => return gateway_error_response(&e),
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::from_stream(sse_frames(upstream)))
        .unwrap_or_else(|e| {
            tracing::error!("failed to build stream response: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        })
}

// ============================================================================
// SSE bridging
// ============================================================================

/// Bridge an adapter chunk stream to SSE frames. Ordering is upstream
/// ordering; the terminal chunk is followed by exactly one `data: [DONE]`
/// and nothing after it. A write failure means the client went away: the
/// upstream stream is dropped, cancelling the exchange.
fn sse_frames(mut upstream: ChunkStream) -> impl futures::Stream<Item = Result<Bytes, Infallible>> {
    let (tx, rx) = mpsc::channel::<Bytes>(32);

    tokio::spawn(async move {
        let mut iterations = 0u32;

        loop {
            iterations += 1;
            if iterations > MAX_STREAM_ITERATIONS {
                tracing::warn!("stream exceeded {MAX_STREAM_ITERATIONS} iterations, terminating");
                break;
            }

            match tokio::time::timeout(FRAME_TIMEOUT, upstream.next()).await {
                // Quiet upstream: keep the connection alive with an SSE
                // comment the client is free to ignore
                Err(_) => {
                    if tx.send(Bytes::from_static(b": heartbeat\n\n")).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    tracing::error!("upstream stream error: {e}");
                    break;
                }
                Ok(Some(Ok(chunk))) => {
                    let terminal = chunk.is_terminal();
                    let frame = match serde_json::to_string(&chunk) {
                        Ok(json) => format!("data: {json}\n\n"),
                        Err(e) => {
                            tracing::error!("chunk serialization failed: {e}");
                            break;
                        }
                    };
                    if tx.send(Bytes::from(frame)).await.is_err() {
                        let gone = GatewayError::ClientGone("response sink closed".to_string());
                        tracing::debug!("abandoning stream: {gone}");
                        return;
                    }
                    if terminal {
                        break;
                    }
                }
            }
        }

        let _ = tx.send(Bytes::from_static(b"data: [DONE]\n\n")).await;
    });

    ReceiverStream::new(rx).map(Ok)
}

// ============================================================================
// Response helpers
// ============================================================================

/// Swallow panics from a handler future; the process must outlive any
/// request. The panic payload is logged, the client gets a sanitised 500.
async fn isolated<F>(fut: F) -> Response
where
    F: std::future::Future<Output = Response>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("request handler panicked: {detail}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

fn json_response(status: StatusCode, value: Value) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type, Authorization")
        .body(Body::from(value.to_string()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// The OpenAI error envelope with a sanitised message.
fn error_response(status: StatusCode, message: &str) -> Response {
    let error_type = if status.as_u16() < 500 {
        "invalid_request_error"
    } else {
        "server_error"
    };
    json_response(
        status,
        json!({"error": {
            "message": sanitize_message(message),
            "type": error_type,
            "code": status.as_u16().to_string(),
        }}),
    )
}

fn invalid_request(message: &str) -> Response {
    gateway_error_response(&GatewayError::InvalidRequest(message.to_string()))
}

fn gateway_error_response(e: &GatewayError) -> Response {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::error!("request failed: {e}");
    } else {
        tracing::debug!("request rejected: {e}");
    }
    error_response(status, &e.to_string())
}
