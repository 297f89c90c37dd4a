//! In-memory reference runtime.
//!
//! Executes registered handlers inline, records requested sleeps instead of
//! waiting (so retry backoff sequences are observable in tests), and resolves
//! signals from a pre-seeded map. This is the backend the engine's test-suite
//! runs against; it is also good enough for local, non-durable executions.

use crate::activity::{ActivityRequest, ActivityResult};
use crate::error::{Result, RuntimeError};
use crate::traits::{DurableRuntime, NodeHandler};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Handler built from a plain function, for tests and simple transforms.
struct FnHandler<F>(F);

#[async_trait]
impl<F> NodeHandler for FnHandler<F>
where
    F: Fn(ActivityRequest) -> ActivityResult + Send + Sync,
{
    async fn execute(&self, request: ActivityRequest) -> ActivityResult {
        (self.0)(request)
    }
}

/// In-memory [`DurableRuntime`] with a per-node-type handler registry.
///
/// Sleeps are virtual by default: the requested durations are recorded and the
/// call returns immediately. Call [`with_real_sleep`](Self::with_real_sleep)
/// to actually wait (useful when driving a live local run).
pub struct InMemoryRuntime {
    handlers: Mutex<HashMap<String, Arc<dyn NodeHandler>>>,
    slept: Mutex<Vec<Duration>>,
    signals: Mutex<HashMap<(String, String), Value>>,
    real_sleep: bool,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            slept: Mutex::new(Vec::new()),
            signals: Mutex::new(HashMap::new()),
            real_sleep: false,
        }
    }

    /// Make [`sleep`](DurableRuntime::sleep) actually wait.
    pub fn with_real_sleep(mut self) -> Self {
        self.real_sleep = true;
        self
    }

    /// Register a handler for a node type, replacing any previous one.
    pub fn register(&self, node_type: impl Into<String>, handler: Arc<dyn NodeHandler>) {
        self.handlers
            .lock()
            .expect("handler registry poisoned")
            .insert(node_type.into(), handler);
    }

    /// Register a plain function as the handler for a node type.
    pub fn register_fn<F>(&self, node_type: impl Into<String>, handler: F)
    where
        F: Fn(ActivityRequest) -> ActivityResult + Send + Sync + 'static,
    {
        self.register(node_type, Arc::new(FnHandler(handler)));
    }

    /// Seed a signal value so a later `await_signal` resolves immediately.
    pub fn seed_signal(
        &self,
        execution_id: impl Into<String>,
        name: impl Into<String>,
        value: Value,
    ) {
        self.signals
            .lock()
            .expect("signal map poisoned")
            .insert((execution_id.into(), name.into()), value);
    }

    /// Every duration passed to [`sleep`](DurableRuntime::sleep) so far.
    pub fn recorded_sleeps(&self) -> Vec<Duration> {
        self.slept.lock().expect("sleep log poisoned").clone()
    }
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableRuntime for InMemoryRuntime {
    async fn execute_activity(&self, request: ActivityRequest) -> Result<ActivityResult> {
        let handler = {
            let handlers = self.handlers.lock().expect("handler registry poisoned");
            handlers.get(&request.node_type).cloned()
        };
        let handler = handler.ok_or_else(|| RuntimeError::HandlerNotRegistered {
            node_type: request.node_type.clone(),
        })?;
        tracing::debug!(
            node_type = %request.node_type,
            node_id = %request.meta.node_id,
            "executing activity"
        );
        Ok(handler.execute(request).await)
    }

    async fn sleep(&self, duration: Duration) {
        self.slept.lock().expect("sleep log poisoned").push(duration);
        if self.real_sleep {
            tokio::time::sleep(duration).await;
        }
    }

    async fn await_signal(&self, execution_id: &str, name: &str) -> Result<Value> {
        let key = (execution_id.to_string(), name.to_string());
        let seeded = self
            .signals
            .lock()
            .expect("signal map poisoned")
            .remove(&key);
        seeded.ok_or_else(|| RuntimeError::SignalUnavailable {
            execution_id: execution_id.to_string(),
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityErrorKind, ActivityMeta};
    use serde_json::json;

    fn request(node_type: &str) -> ActivityRequest {
        ActivityRequest {
            node_type: node_type.to_string(),
            node_config: json!({}),
            context: json!({}),
            meta: ActivityMeta {
                execution_id: "exec-1".to_string(),
                node_id: "n1".to_string(),
                node_name: "n1".to_string(),
                user_id: None,
            },
        }
    }

    #[tokio::test]
    async fn test_registered_handler_runs() {
        let runtime = InMemoryRuntime::new();
        runtime.register_fn("transform", |req| {
            ActivityResult::ok(json!({ "ty": req.node_type }))
        });

        let result = runtime.execute_activity(request("transform")).await.unwrap();
        assert!(result.success);
        assert_eq!(result.result["ty"], "transform");
    }

    #[tokio::test]
    async fn test_missing_handler_is_runtime_error() {
        let runtime = InMemoryRuntime::new();
        let err = runtime.execute_activity(request("llm")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::HandlerNotRegistered { .. }));
    }

    #[tokio::test]
    async fn test_virtual_sleep_records_without_waiting() {
        let runtime = InMemoryRuntime::new();
        runtime.sleep(Duration::from_millis(100)).await;
        runtime.sleep(Duration::from_millis(200)).await;
        assert_eq!(
            runtime.recorded_sleeps(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn test_signal_roundtrip() {
        let runtime = InMemoryRuntime::new();
        runtime.seed_signal("exec-1", "approval", json!({"approved": true}));

        let value = runtime.await_signal("exec-1", "approval").await.unwrap();
        assert_eq!(value["approved"], true);

        let err = runtime.await_signal("exec-1", "approval").await.unwrap_err();
        assert!(matches!(err, RuntimeError::SignalUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_handler_failures_stay_inside_results() {
        let runtime = InMemoryRuntime::new();
        runtime.register_fn("http", |_| {
            ActivityResult::fail(ActivityErrorKind::Timeout, "upstream timed out")
        });

        let result = runtime.execute_activity(request("http")).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, ActivityErrorKind::Timeout);
    }
}
