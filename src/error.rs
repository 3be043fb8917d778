//! Gateway error taxonomy
//!
//! Every failure that can surface from a converter, adapter, the registry or
//! the router is folded into [`GatewayError`]. The HTTP frontend is the single
//! translation point from these variants to status codes and the OpenAI error
//! envelope; the retry engine consults [`GatewayError::is_retryable`].

use std::time::Duration;

use thiserror::Error;

/// Maximum length of an error message sent to a client.
const MAX_CLIENT_MESSAGE_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Unparseable config or a binding missing a required field. Logged and
    /// skipped during registry load; never fails startup on its own.
    #[error("configuration error: {0}")]
    Config(String),

    /// The routing id is not registered or the binding is disabled.
    #[error("模型 {0} 未找到或未启用")]
    ModelNotFound(String),

    /// Missing `model`, malformed JSON, or an otherwise invalid client request.
    #[error("{0}")]
    InvalidRequest(String),

    /// 401/403 from upstream or a credential that does not parse.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// 429 / "rate limit" from upstream.
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// 5xx, connection reset, DNS failure - worth retrying.
    #[error("upstream error: {0}")]
    UpstreamTransient(String),

    /// Per-call or inter-frame deadline elapsed.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A vendor error envelope surfaced by a converter.
    #[error("{0}")]
    UpstreamProtocol(String),

    /// Writing to the response sink failed; the client went away.
    #[error("client disconnected: {0}")]
    ClientGone(String),

    /// Anything unexpected inside the gateway itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status the frontend reports for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::ModelNotFound(_) => 404,
            GatewayError::InvalidRequest(_) => 400,
            GatewayError::Timeout(_) => 504,
            GatewayError::RateLimit(_) => 429,
            _ => 500,
        }
    }

    /// Whether the retry engine may schedule another attempt.
    ///
    /// Variants carry the primary classification; messages are scanned as a
    /// fallback so wrapped transport errors ("connection reset by peer" inside
    /// an `Internal`) still retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::RateLimit(_)
            | GatewayError::UpstreamTransient(_)
            | GatewayError::Timeout(_) => true,
            GatewayError::ModelNotFound(_)
            | GatewayError::InvalidRequest(_)
            | GatewayError::Auth(_)
            | GatewayError::Config(_)
            | GatewayError::ClientGone(_)
            | GatewayError::UpstreamProtocol(_) => false,
            GatewayError::Internal(msg) => message_looks_transient(msg),
        }
    }

    /// Message safe to return to a client: credentials redacted, length capped.
    pub fn sanitized_message(&self) -> String {
        sanitize_message(&self.to_string())
    }

    /// Classify a reqwest transport failure.
    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout(timeout)
        } else if err.is_connect() {
            GatewayError::UpstreamTransient(format!("connection failed: {err}"))
        } else {
            GatewayError::UpstreamTransient(format!("network request failed: {err}"))
        }
    }

    /// Classify an upstream HTTP status with the body's error message.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => GatewayError::Auth(message),
            429 => GatewayError::RateLimit(message),
            400 | 404 | 422 => GatewayError::UpstreamProtocol(format!("HTTP {status}: {message}")),
            s if s >= 500 => GatewayError::UpstreamTransient(format!("HTTP {status}: {message}")),
            s => GatewayError::UpstreamProtocol(format!("HTTP {s}: {message}")),
        }
    }
}

/// Keyword scan for transient failures, applied when the variant alone does
/// not decide. Mirrors the network/rate-limit/5xx buckets of the classifier.
fn message_looks_transient(message: &str) -> bool {
    let lower = message.to_lowercase();
    const NETWORK: &[&str] = &[
        "connection", "network", "timeout", "refused", "reset", "dns", "unreachable", "socket",
    ];
    const RATE_LIMIT: &[&str] = &["rate limit", "ratelimit", "too many requests", "429"];
    const TEMPORARY: &[&str] = &[
        "500",
        "502",
        "503",
        "504",
        "internal server error",
        "bad gateway",
        "service unavailable",
        "gateway timeout",
    ];

    NETWORK.iter().any(|kw| lower.contains(kw))
        || RATE_LIMIT.iter().any(|kw| lower.contains(kw))
        || TEMPORARY.iter().any(|kw| lower.contains(kw))
}

/// Redact credential-bearing messages and bound the length.
pub fn sanitize_message(message: &str) -> String {
    let lower = message.to_lowercase();
    if lower.contains("api_key") || lower.contains("key") {
        return "API configuration error".to_string();
    }

    if message.chars().count() > MAX_CLIENT_MESSAGE_LEN {
        let truncated: String = message.chars().take(MAX_CLIENT_MESSAGE_LEN).collect();
        format!("{truncated}...")
    } else {
        message.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_variants() {
        assert!(GatewayError::RateLimit("429".into()).is_retryable());
        assert!(GatewayError::UpstreamTransient("HTTP 502".into()).is_retryable());
        assert!(GatewayError::Timeout(Duration::from_secs(60)).is_retryable());

        assert!(!GatewayError::Auth("bad key format".into()).is_retryable());
        assert!(!GatewayError::InvalidRequest("missing model".into()).is_retryable());
        assert!(!GatewayError::ModelNotFound("x".into()).is_retryable());
        assert!(!GatewayError::UpstreamProtocol("vendor error".into()).is_retryable());
    }

    #[test]
    fn test_internal_with_network_message_is_retryable() {
        assert!(GatewayError::Internal("connection reset by peer".into()).is_retryable());
        assert!(GatewayError::Internal("dns lookup failed".into()).is_retryable());
        assert!(!GatewayError::Internal("logic bug".into()).is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(GatewayError::ModelNotFound("m".into()).status_code(), 404);
        assert_eq!(GatewayError::InvalidRequest("m".into()).status_code(), 400);
        assert_eq!(
            GatewayError::Timeout(Duration::from_secs(1)).status_code(),
            504
        );
        assert_eq!(GatewayError::Internal("m".into()).status_code(), 500);
    }

    #[test]
    fn test_sanitize_redacts_credentials() {
        assert_eq!(
            sanitize_message("invalid api_key: sk-123"),
            "API configuration error"
        );
        assert_eq!(
            sanitize_message("Invalid API Key provided"),
            "API configuration error"
        );
    }

    #[test]
    fn test_sanitize_truncates_long_messages() {
        let long = "x".repeat(300);
        let sanitized = sanitize_message(&long);
        assert_eq!(sanitized.chars().count(), 203);
        assert!(sanitized.ends_with("..."));
    }

    #[test]
    fn test_sanitize_passes_short_clean_messages() {
        assert_eq!(sanitize_message("模型 unknown 未找到或未启用"), "模型 unknown 未找到或未启用");
    }

    #[test]
    fn test_model_not_found_message() {
        let err = GatewayError::ModelNotFound("unknown".into());
        assert_eq!(err.to_string(), "模型 unknown 未找到或未启用");
    }

    #[test]
    fn test_from_status_classification() {
        assert!(matches!(
            GatewayError::from_status(401, "no".into()),
            GatewayError::Auth(_)
        ));
        assert!(matches!(
            GatewayError::from_status(429, "slow down".into()),
            GatewayError::RateLimit(_)
        ));
        assert!(matches!(
            GatewayError::from_status(503, "busy".into()),
            GatewayError::UpstreamTransient(_)
        ));
        assert!(matches!(
            GatewayError::from_status(422, "bad".into()),
            GatewayError::UpstreamProtocol(_)
        ));
    }
}
