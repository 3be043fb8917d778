// omnigate - OpenAI-compatible gateway for heterogeneous LLM backends
//
// One HTTP surface (/v1/chat/completions, /v1/models) in front of any mix of
// cloud APIs, on-prem services and local CLIs, with per-vendor protocol
// translation, SSE streaming, retries and per-backend authentication.
//
// Architecture:
// - HTTP frontend (axum): parses OpenAI-shaped requests, owns crash isolation
// - Router + retry engine: model-id dispatch with exponential backoff
// - Registry: models.json -> adapter table, swapped atomically on /reload
// - Adapters: openai_compat / custom_http / process / websocket transports
// - Converters: per-vendor wire translation and auth rituals

mod adapter;
mod cli;
mod config;
mod convert;
mod error;
mod registry;
mod retry;
mod router;
mod server;
mod wire;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::Cli;
use registry::Registry;
use server::{build_app, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Precedence: RUST_LOG env var > --log-level flag
    let default_filter = format!("omnigate={},axum=info", cli.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // A bad config path is a startup failure; bad bindings inside it are not
    let registry = Arc::new(
        Registry::load(&cli.config)
            .with_context(|| format!("failed to load {}", cli.config.display()))?,
    );
    if registry.is_empty() {
        tracing::warn!("no models available, the gateway will reject every request");
    } else {
        tracing::info!("available models: {}", registry.model_ids().join(", "));
    }

    let app = build_app(AppState::new(registry));

    let bind_addr = format!("{}:{}", cli.host, cli.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    tracing::info!("omnigate listening on http://{bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("server error")?;

    tracing::info!("shutdown complete");
    Ok(())
}
