//! Gateway configuration (`models.json`)
//!
//! The config document has the shape `{ "models": [binding, ...], "debug": false }`.
//! Each binding maps one routing id to an adapter family plus transport and
//! auth settings. Entries whose keys begin with `_` are comments; entries with
//! `enabled: false` are skipped at load time.
//!
//! Credential fields support the `ENV:VAR_NAME` placeholder: the value names
//! an environment variable holding the real secret, so plaintext credentials
//! can stay out of models.json.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::GatewayError;

/// Default per-request wall-clock timeout (seconds).
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Resolve an `ENV:VAR_NAME` placeholder through the process environment.
/// Non-placeholder values pass through; an unset variable resolves to empty.
pub(crate) fn resolve_env(value: &str) -> String {
    match value.strip_prefix("ENV:") {
        Some(var) => std::env::var(var).unwrap_or_default(),
        None => value.to_string(),
    }
}

/// A credential after placeholder resolution. Empty, unresolved, or
/// `"not-needed"` values count as absent.
fn configured_secret(value: Option<&str>) -> Option<String> {
    let resolved = resolve_env(value?);
    match resolved.as_str() {
        "" | "not-needed" => None,
        _ => Some(resolved),
    }
}

// ============================================================================
// Document
// ============================================================================

/// Raw configuration document. `models` stays untyped so one malformed entry
/// never poisons the rest; the registry deserializes each entry individually.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub models: Vec<Value>,
    #[serde(default)]
    pub debug: bool,
}

impl GatewayConfig {
    /// Load and parse the configuration file. An unreadable or unparseable
    /// document is a startup failure; per-binding problems are not.
    pub fn from_path(path: &Path) -> Result<Self, GatewayError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| GatewayError::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Iterate the binding entries, skipping comment entries (no `id` field).
    pub fn entries(&self) -> impl Iterator<Item = &Value> {
        self.models.iter().filter(|entry| {
            entry
                .as_object()
                .map(|obj| obj.get("id").and_then(Value::as_str).is_some())
                .unwrap_or(false)
        })
    }
}

// ============================================================================
// Model binding
// ============================================================================

/// One entry of `models[]`: the data that identifies a model the gateway
/// exposes and the backend serving it.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelBinding {
    /// The string clients put in the request's `model` field.
    pub id: String,

    /// Adapter family: `openai_compat`, `custom_http`, `process`, `websocket`.
    #[serde(default = "default_adapter")]
    pub adapter: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub endpoint: Option<String>,

    /// Upstream model name; the routing id is used when absent.
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-request wall-clock timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Picks the protocol converter for `custom_http` / `websocket` bindings.
    #[serde(default)]
    pub request_format: Option<String>,

    /// Nested vendor-specific fields.
    #[serde(default)]
    pub config: VendorConfig,

    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_adapter() -> String {
    "openai_compat".to_string()
}

fn default_enabled() -> bool {
    true
}

impl ModelBinding {
    /// The model name sent upstream.
    pub fn upstream_model(&self) -> &str {
        self.model.as_deref().unwrap_or(&self.id)
    }

    /// The effective api_key: `ENV:` placeholders resolve through the
    /// environment; empty, unresolved, or `"not-needed"` values are absent.
    pub fn api_key(&self) -> Option<String> {
        configured_secret(self.api_key.as_deref())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    /// Join `base_url` and `endpoint`, substituting the `{model}` placeholder.
    pub fn url(&self, default_endpoint: &str) -> Result<String, GatewayError> {
        let base = self
            .base_url
            .as_deref()
            .ok_or_else(|| GatewayError::Config(format!("{}: missing base_url", self.id)))?;
        let endpoint = self.endpoint.as_deref().unwrap_or(default_endpoint);
        let endpoint = endpoint.replace("{model}", self.upstream_model());

        let base = base.trim_end_matches('/');
        if endpoint.starts_with('/') {
            Ok(format!("{base}{endpoint}"))
        } else {
            Ok(format!("{base}/{endpoint}"))
        }
    }
}

// ============================================================================
// Vendor-specific settings
// ============================================================================

/// The `config` sub-object of a binding. Which fields matter depends on the
/// adapter family and request format; unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VendorConfig {
    // WebSocket (Xunfei) credentials
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,

    // Tencent credentials (alternative to the packed api_key form)
    #[serde(default)]
    pub secret_id: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub region: Option<String>,

    // Ali DashScope plugin header
    #[serde(default)]
    pub plugin: Option<String>,

    // Process adapter
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Input shaping: `json`, `prompt`, `openai`, or last-user-text otherwise.
    #[serde(default)]
    pub input_format: Option<String>,
    /// Output parsing: `json` or plain text.
    #[serde(default)]
    pub output_format: Option<String>,
}

impl VendorConfig {
    /// `api_secret` under the same placeholder and absent-value rules as the
    /// binding's api_key.
    pub fn api_secret(&self) -> Option<String> {
        configured_secret(self.api_secret.as_deref())
    }
}

// ============================================================================
// Retry settings
// ============================================================================

/// Per-binding retry policy. Defaults match the retry engine's documented
/// behavior: 3 retries, 1s initial delay, 60s cap, base 2, jitter on.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    #[serde(default = "default_enabled")]
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            exponential_base: default_exponential_base(),
            jitter: true,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    60.0
}

fn default_exponential_base() -> f64 {
    2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding_from(json: &str) -> ModelBinding {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_minimal_binding_defaults() {
        let b = binding_from(r#"{"id": "gpt"}"#);
        assert_eq!(b.adapter, "openai_compat");
        assert!(b.enabled);
        assert_eq!(b.upstream_model(), "gpt");
        assert_eq!(b.timeout(), Duration::from_secs(60));
        assert!(b.retry.enabled);
        assert_eq!(b.retry.max_retries, 3);
    }

    #[test]
    fn test_not_needed_api_key_is_absent() {
        let b = binding_from(r#"{"id": "local", "api_key": "not-needed"}"#);
        assert!(b.api_key().is_none());
        let b = binding_from(r#"{"id": "local", "api_key": ""}"#);
        assert!(b.api_key().is_none());
        let b = binding_from(r#"{"id": "cloud", "api_key": "sk-x"}"#);
        assert_eq!(b.api_key().as_deref(), Some("sk-x"));
    }

    #[test]
    fn test_env_placeholder_resolution() {
        std::env::set_var("OMNIGATE_TEST_API_KEY", "sk-from-env");
        let b = binding_from(r#"{"id": "e", "api_key": "ENV:OMNIGATE_TEST_API_KEY"}"#);
        assert_eq!(b.api_key().as_deref(), Some("sk-from-env"));

        // Unset variables resolve to absent, not to the literal placeholder
        let b = binding_from(r#"{"id": "e", "api_key": "ENV:OMNIGATE_TEST_UNSET_VAR"}"#);
        assert!(b.api_key().is_none());

        std::env::set_var("OMNIGATE_TEST_API_SECRET", "ws-secret");
        let b = binding_from(
            r#"{"id": "e", "config": {"api_secret": "ENV:OMNIGATE_TEST_API_SECRET"}}"#,
        );
        assert_eq!(b.config.api_secret().as_deref(), Some("ws-secret"));

        let b = binding_from(
            r#"{"id": "e", "config": {"api_secret": "ENV:OMNIGATE_TEST_UNSET_VAR"}}"#,
        );
        assert!(b.config.api_secret().is_none());
    }

    #[test]
    fn test_resolve_env_passthrough() {
        assert_eq!(resolve_env("plain-value"), "plain-value");
        assert_eq!(resolve_env("ENV:OMNIGATE_TEST_UNSET_VAR"), "");
    }

    #[test]
    fn test_url_joins_and_substitutes_model() {
        let b = binding_from(
            r#"{"id": "g", "model": "gemini-1.5-pro",
                "base_url": "https://generativelanguage.googleapis.com/",
                "endpoint": "/v1beta/models/{model}:generateContent"}"#,
        );
        assert_eq!(
            b.url("/chat/completions").unwrap(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-pro:generateContent"
        );
    }

    #[test]
    fn test_url_without_base_is_config_error() {
        let b = binding_from(r#"{"id": "x"}"#);
        assert!(b.url("/chat/completions").is_err());
    }

    #[test]
    fn test_comment_entries_are_skipped() {
        let cfg: GatewayConfig = serde_json::from_str(
            r#"{"models": [
                {"_comment": "this is a note"},
                {"id": "real", "adapter": "openai_compat"}
            ]}"#,
        )
        .unwrap();
        let entries: Vec<_> = cfg.entries().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["id"], "real");
    }

    #[test]
    fn test_retry_settings_from_json() {
        let b = binding_from(
            r#"{"id": "r", "retry": {"enabled": false, "max_retries": 7,
                "initial_delay": 0.5, "max_delay": 10.0,
                "exponential_base": 3.0, "jitter": false}}"#,
        );
        assert!(!b.retry.enabled);
        assert_eq!(b.retry.max_retries, 7);
        assert_eq!(b.retry.initial_delay, 0.5);
        assert_eq!(b.retry.exponential_base, 3.0);
        assert!(!b.retry.jitter);
    }
}
