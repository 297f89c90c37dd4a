//! The [`DurableRuntime`] trait - the engine's only window onto the outside world.
//!
//! The execution engine is deterministic between suspension points; everything
//! with a side effect or a clock goes through this trait. Implementors map the
//! three operations onto their workflow service:
//!
//! - **`execute_activity`** - run one node handler with at-least-once semantics
//! - **`sleep`** - durable timer (retry backoff, loop delays)
//! - **`await_signal`** - external event (human approval, webhook callback)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  flowgraph-core Orchestrator                 │
//! │  • dependency-driven scheduling              │
//! │  • deterministic state transitions           │
//! └───────────────┬──────────────────────────────┘
//!                 │ DurableRuntime trait
//!                 ↓
//! ┌──────────────────────────────────────────────┐
//! │  Runtime Backend (your implementation)       │
//! │  • Temporal-style workflow service           │
//! │  • InMemoryRuntime (tests, local runs)       │
//! └───────────────┬──────────────────────────────┘
//!                 │ NodeHandler registry
//!                 ↓
//! ┌──────────────────────────────────────────────┐
//! │  Handlers: llm / http / database / file ...  │
//! └──────────────────────────────────────────────┘
//! ```

use crate::activity::{ActivityRequest, ActivityResult};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Interface to the durable workflow runtime.
///
/// The engine holds an `Arc<dyn DurableRuntime>` and never blocks outside of
/// these three operations. Activity timeouts and infrastructure retries are
/// the runtime's responsibility; the engine sees either a completed
/// [`ActivityResult`] or a terminal [`RuntimeError`](crate::RuntimeError).
#[async_trait]
pub trait DurableRuntime: Send + Sync {
    /// Execute one node handler to completion.
    async fn execute_activity(&self, request: ActivityRequest) -> Result<ActivityResult>;

    /// Suspend for the given duration. Backends may virtualize or persist the
    /// timer; callers must not assume wall-clock accuracy.
    async fn sleep(&self, duration: Duration);

    /// Suspend until the named signal arrives for the given execution.
    async fn await_signal(&self, execution_id: &str, name: &str) -> Result<Value>;
}

/// A single node handler, invokable through the activity contract.
///
/// Handlers must not panic; failures are reported inside the returned
/// [`ActivityResult`] so the engine can classify and possibly retry them.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(&self, request: ActivityRequest) -> ActivityResult;
}
