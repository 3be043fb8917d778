//! Request router
//!
//! Resolves the request's `model` field to its adapter and applies the
//! binding's retry policy around unary calls. Streaming bypasses the router:
//! the frontend iterates the adapter's stream directly so chunks are never
//! buffered through an extra layer.

use std::sync::Arc;

use crate::adapter::ChatAdapter;
use crate::error::GatewayError;
use crate::registry::Registry;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::wire::{ChatRequest, ChatResponse};

pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Adapter lookup, shared with the frontend's streaming path.
    pub fn adapter_for(&self, model_id: &str) -> Result<Arc<dyn ChatAdapter>, GatewayError> {
        self.registry
            .get(model_id)
            .ok_or_else(|| GatewayError::ModelNotFound(model_id.to_string()))
    }

    /// Unary dispatch with per-binding retry.
    pub async fn route(
        &self,
        model_id: &str,
        req: &ChatRequest,
    ) -> Result<ChatResponse, GatewayError> {
        let adapter = self.adapter_for(model_id)?;
        let binding = adapter.binding();
        let timeout = binding.timeout();

        if !binding.retry.enabled {
            return adapter.chat(req, Some(timeout)).await;
        }

        let policy = RetryPolicy::from(&binding.retry);
        retry_with_backoff(&policy, model_id, || adapter.chat(req, Some(timeout))).await
    }
}
