//! Activity contract types shared by the engine and every node handler.
//!
//! A single shape covers all node kinds: the engine builds an
//! [`ActivityRequest`] from the interpolated node config and the read-only
//! context view, the handler answers with an [`ActivityResult`]. Failures are
//! classified by [`ActivityErrorKind`] so retry policy can be decided without
//! parsing error messages.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Identification passed alongside every activity invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityMeta {
    pub execution_id: String,
    pub node_id: String,
    pub node_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Input to `execute_activity`: one node, fully interpolated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRequest {
    /// Node kind string (`llm`, `http`, `database`, `file`, `transform`, ...).
    pub node_type: String,
    /// Node config after template interpolation. Free-form value tree.
    pub node_config: Value,
    /// Read-only view of the execution context (inputs, variables, outputs).
    pub context: Value,
    pub meta: ActivityMeta,
}

/// Classification of handler failures.
///
/// The engine maps these onto its retry policy: `rate_limit`, `server_error`,
/// `timeout` and `network` default to retryable, the rest surface immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityErrorKind {
    NotFound,
    Permission,
    Validation,
    RateLimit,
    ServerError,
    Timeout,
    Network,
    Other,
}

impl ActivityErrorKind {
    /// Whether failures of this kind are retryable unless the handler says
    /// otherwise.
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ActivityErrorKind::RateLimit
                | ActivityErrorKind::ServerError
                | ActivityErrorKind::Timeout
                | ActivityErrorKind::Network
        )
    }

    /// Stable wire name, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityErrorKind::NotFound => "not_found",
            ActivityErrorKind::Permission => "permission",
            ActivityErrorKind::Validation => "validation",
            ActivityErrorKind::RateLimit => "rate_limit",
            ActivityErrorKind::ServerError => "server_error",
            ActivityErrorKind::Timeout => "timeout",
            ActivityErrorKind::Network => "network",
            ActivityErrorKind::Other => "other",
        }
    }
}

/// Structured handler failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityError {
    #[serde(rename = "type")]
    pub kind: ActivityErrorKind,
    pub message: String,
    pub retryable: bool,
    /// Server-supplied retry hint in seconds (e.g. a `Retry-After` header).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

/// Handler-reported execution metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityMetrics {
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<u64>,
}

/// Output of `execute_activity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityResult {
    pub success: bool,
    /// Node output mapping; stored into the execution context on success.
    #[serde(default)]
    pub result: Value,
    /// Out-of-band signals (approval requests, emitted messages, tool calls).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signals: Option<Value>,
    #[serde(default)]
    pub metrics: ActivityMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ActivityError>,
}

impl ActivityResult {
    /// Successful result carrying the node output.
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result,
            signals: None,
            metrics: ActivityMetrics::default(),
            error: None,
        }
    }

    /// Failed result with the kind's default retryability.
    pub fn fail(kind: ActivityErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: json!({}),
            signals: None,
            metrics: ActivityMetrics::default(),
            error: Some(ActivityError {
                kind,
                message: message.into(),
                retryable: kind.default_retryable(),
                retry_after_secs: None,
            }),
        }
    }

    /// Rate-limit failure with an optional server retry hint.
    pub fn rate_limited(message: impl Into<String>, retry_after_secs: Option<u64>) -> Self {
        let mut result = Self::fail(ActivityErrorKind::RateLimit, message);
        if let Some(err) = result.error.as_mut() {
            err.retry_after_secs = retry_after_secs;
        }
        result
    }

    /// Attach handler metrics.
    pub fn with_metrics(mut self, metrics: ActivityMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Attach a signals mapping.
    pub fn with_signals(mut self, signals: Value) -> Self {
        self.signals = Some(signals);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_retryability() {
        assert!(ActivityErrorKind::RateLimit.default_retryable());
        assert!(ActivityErrorKind::Network.default_retryable());
        assert!(!ActivityErrorKind::Validation.default_retryable());
        assert!(!ActivityErrorKind::Permission.default_retryable());
    }

    #[test]
    fn test_error_kind_wire_names() {
        let err = ActivityError {
            kind: ActivityErrorKind::RateLimit,
            message: "slow down".to_string(),
            retryable: true,
            retry_after_secs: Some(7),
        };
        let wire = serde_json::to_value(&err).unwrap();
        assert_eq!(wire["type"], "rate_limit");
        assert_eq!(wire["retry_after_secs"], 7);
    }

    #[test]
    fn test_result_constructors() {
        let ok = ActivityResult::ok(json!({"x": 2}));
        assert!(ok.success);
        assert!(ok.error.is_none());

        let limited = ActivityResult::rate_limited("busy", Some(3));
        assert!(!limited.success);
        let err = limited.error.unwrap();
        assert!(err.retryable);
        assert_eq!(err.retry_after_secs, Some(3));
    }
}
