//! Model registry
//!
//! Single source of truth for the `routing id -> adapter` mapping. The table
//! is rebuilt from `models.json` on load and on `/reload`, and swapped in
//! atomically: concurrent requests observe either the old table or the new
//! one, never a mixture. One bad binding is logged and skipped; it never
//! blocks the rest.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::{json, Value};

use crate::adapter::{
    ChatAdapter, CustomHttpAdapter, OpenAiCompatAdapter, ProcessAdapter, WebSocketAdapter,
};
use crate::config::{GatewayConfig, ModelBinding};
use crate::error::GatewayError;

/// Adapter table plus the config-file ordering for `/v1/models`.
struct AdapterTable {
    order: Vec<String>,
    adapters: HashMap<String, Arc<dyn ChatAdapter>>,
}

pub struct Registry {
    config_path: PathBuf,
    client: reqwest::Client,
    table: ArcSwap<AdapterTable>,
}

impl Registry {
    /// Load the registry from a config file. Fails only when the document
    /// itself is unreadable; per-binding problems are diagnosed and skipped.
    pub fn load(config_path: &Path) -> Result<Self, GatewayError> {
        let config = GatewayConfig::from_path(config_path)?;

        // One client shared by every HTTP adapter. Per-call timeouts are set
        // on each request; the 5 minute client ceiling is the hard stop.
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .pool_max_idle_per_host(10)
            .http1_only()
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to create HTTP client: {e}")))?;

        let table = build_table(&config, &client);
        Ok(Self {
            config_path: config_path.to_path_buf(),
            client,
            table: ArcSwap::from_pointee(table),
        })
    }

    pub fn get(&self, model_id: &str) -> Option<Arc<dyn ChatAdapter>> {
        self.table.load().adapters.get(model_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.load().adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.table.load().order.clone()
    }

    /// `/v1/models` payload.
    pub fn list_models(&self) -> Value {
        let table = self.table.load();
        let data: Vec<Value> = table
            .order
            .iter()
            .filter_map(|id| table.adapters.get(id))
            .map(|adapter| adapter.model_info())
            .collect();
        json!({"object": "list", "data": data})
    }

    /// Rebuild the table from disk and swap it in. On a config read failure
    /// the previous table stays active.
    pub fn reload(&self) -> Result<usize, GatewayError> {
        let config = GatewayConfig::from_path(&self.config_path)?;
        let table = build_table(&config, &self.client);
        let count = table.adapters.len();
        self.table.store(Arc::new(table));
        tracing::info!("registry reloaded: {count} model(s) active");
        Ok(count)
    }
}

fn build_table(config: &GatewayConfig, client: &reqwest::Client) -> AdapterTable {
    let mut order = Vec::new();
    let mut adapters: HashMap<String, Arc<dyn ChatAdapter>> = HashMap::new();

    for entry in config.entries() {
        let binding: ModelBinding = match serde_json::from_value(entry.clone()) {
            Ok(binding) => binding,
            Err(e) => {
                tracing::warn!("skipping malformed model entry: {e}");
                continue;
            }
        };
        let id = binding.id.clone();

        if !binding.enabled {
            tracing::info!("model {id} disabled, skipping");
            continue;
        }
        if adapters.contains_key(&id) {
            tracing::warn!("model {id}: duplicate id, keeping the first entry");
            continue;
        }

        let family = binding.adapter.clone();
        let adapter: Arc<dyn ChatAdapter> = match build_adapter(binding, client) {
            Ok(adapter) => adapter,
            Err(e) => {
                tracing::warn!("model {id} ({family}) failed to initialize: {e}");
                continue;
            }
        };

        if let Err(reason) = adapter.is_available() {
            tracing::warn!("model {id} ({family}) unavailable, skipping: {reason}");
            continue;
        }

        tracing::info!("model {id} ({family}) loaded");
        if config.debug {
            tracing::debug!("model {id}: {entry}");
        }
        order.push(id.clone());
        adapters.insert(id, adapter);
    }

    AdapterTable { order, adapters }
}

fn build_adapter(
    binding: ModelBinding,
    client: &reqwest::Client,
) -> Result<Arc<dyn ChatAdapter>, GatewayError> {
    match binding.adapter.as_str() {
        "openai_compat" => Ok(Arc::new(OpenAiCompatAdapter::new(binding, client.clone()))),
        "custom_http" => Ok(Arc::new(CustomHttpAdapter::new(binding, client.clone())?)),
        "process" => Ok(Arc::new(ProcessAdapter::new(binding))),
        "websocket" | "websocket_xunfei" => Ok(Arc::new(WebSocketAdapter::new(binding))),
        other => Err(GatewayError::Config(format!("unknown adapter type: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Scoped temp config file, removed on drop.
    struct TempConfig(PathBuf);

    impl Drop for TempConfig {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn write_config(content: &str) -> TempConfig {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        let path = std::env::temp_dir().join(format!(
            "omnigate-registry-test-{}-{}.json",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&path, content).unwrap();
        TempConfig(path)
    }

    const MIXED_CONFIG: &str = r#"{
        "models": [
            {"_comment": "first entry is documentation"},
            {"id": "a", "adapter": "openai_compat",
             "base_url": "https://api.openai.com/v1", "api_key": "sk-a"},
            {"id": "b", "adapter": "custom_http", "request_format": "anthropic",
             "base_url": "https://api.anthropic.com", "api_key": "sk-b"},
            {"id": "c", "adapter": "websocket", "request_format": "xunfei",
             "api_key": "xf-key",
             "config": {"app_id": "app", "api_secret": "secret"}},
            {"id": "disabled", "adapter": "openai_compat", "enabled": false,
             "base_url": "https://x", "api_key": "k"},
            {"id": "broken", "adapter": "custom_http", "request_format": "nope",
             "base_url": "https://x", "api_key": "k"},
            {"id": "keyless", "adapter": "openai_compat",
             "base_url": "https://api.example.com"}
        ]
    }"#;

    #[test]
    fn test_load_isolates_bad_bindings() {
        let file = write_config(MIXED_CONFIG);
        let registry = Registry::load(&file.0).unwrap();

        // a, b, c registered; disabled/broken/keyless skipped
        assert_eq!(registry.len(), 3);
        assert!(registry.get("a").is_some());
        assert!(registry.get("b").is_some());
        assert!(registry.get("c").is_some());
        assert!(registry.get("disabled").is_none());
        assert!(registry.get("broken").is_none());
        assert!(registry.get("keyless").is_none());
    }

    #[test]
    fn test_list_models_order_and_families() {
        let file = write_config(MIXED_CONFIG);
        let registry = Registry::load(&file.0).unwrap();

        let listing = registry.list_models();
        assert_eq!(listing["object"], "list");
        let data = listing["data"].as_array().unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data[0]["id"], "a");
        assert_eq!(data[0]["owned_by"], "openai_compat");
        assert_eq!(data[0]["object"], "model");
        assert_eq!(data[0]["created"], 0);
        assert_eq!(data[1]["id"], "b");
        assert_eq!(data[1]["owned_by"], "custom_http");
        assert_eq!(data[2]["id"], "c");
        assert_eq!(data[2]["owned_by"], "websocket_xunfei");
    }

    #[test]
    fn test_unreadable_config_fails_load() {
        assert!(Registry::load(Path::new("/no/such/models.json")).is_err());
    }

    #[test]
    fn test_reload_swaps_table() {
        let file = write_config(MIXED_CONFIG);
        let registry = Registry::load(&file.0).unwrap();
        assert_eq!(registry.len(), 3);

        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&file.0)
            .unwrap();
        f.write_all(
            br#"{"models": [{"id": "only", "adapter": "openai_compat",
                "base_url": "https://api.openai.com/v1", "api_key": "sk"}]}"#,
        )
        .unwrap();
        drop(f);

        assert_eq!(registry.reload().unwrap(), 1);
        assert!(registry.get("a").is_none());
        assert!(registry.get("only").is_some());
    }

    #[test]
    fn test_reload_failure_keeps_old_table() {
        let file = write_config(MIXED_CONFIG);
        let registry = Registry::load(&file.0).unwrap();

        std::fs::write(&file.0, "{ not json").unwrap();
        assert!(registry.reload().is_err());
        // Previous table still serves
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let file = write_config(
            r#"{"models": [
                {"id": "dup", "adapter": "openai_compat",
                 "base_url": "https://first.example/v1", "api_key": "k1"},
                {"id": "dup", "adapter": "openai_compat",
                 "base_url": "https://second.example/v1", "api_key": "k2"}
            ]}"#,
        );
        let registry = Registry::load(&file.0).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("dup").unwrap().binding().base_url.as_deref(),
            Some("https://first.example/v1")
        );
    }
}
