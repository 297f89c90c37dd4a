//! # flowgraph-durable - Durable Runtime Interface for Workflow Execution
//!
//! **Trait-based abstractions over the durable workflow runtime** that executes
//! node handlers on behalf of the flowgraph engine. The engine never talks to an
//! LLM, an HTTP endpoint, or a database directly; it emits *activities* through
//! the [`DurableRuntime`] trait and consumes their results. Durability concerns
//! (at-least-once activity execution, timers, signals, replay) belong to the
//! runtime behind the trait, not to the engine.
//!
//! ## Core Concepts
//!
//! ### 1. The Activity Contract
//!
//! Every node handler, regardless of kind, is invoked through one function:
//!
//! ```text
//! execute_activity(ActivityRequest { node_type, node_config, context, meta })
//!     -> ActivityResult { success, result | error, signals?, metrics }
//! ```
//!
//! Handlers classify their failures with [`ActivityErrorKind`] so the engine's
//! retry policy can distinguish transient errors (rate limits, timeouts,
//! network) from terminal ones (validation, permission, not-found).
//!
//! ### 2. Timers and Signals
//!
//! Backoff delays and human-approval waits are suspension points. Both go
//! through the runtime ([`DurableRuntime::sleep`], [`DurableRuntime::await_signal`])
//! so a durable backend can persist them and a test runtime can virtualize them.
//!
//! ### 3. Reference Implementation
//!
//! [`InMemoryRuntime`] executes registered [`NodeHandler`]s inline and records
//! every requested sleep instead of waiting. It is the backend used by the
//! engine's own test-suite; production deployments implement [`DurableRuntime`]
//! against their workflow service.
//!
//! ### 4. Event Log
//!
//! The runtime persists the per-execution event stream as an append-only JSONL
//! log, one file per UTC day ([`JsonlEventLog`]). The analytics CLI aggregates
//! those files; the engine itself only ever appends.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowgraph_durable::{ActivityResult, InMemoryRuntime};
//! use serde_json::json;
//!
//! let runtime = InMemoryRuntime::new();
//! runtime.register_fn("transform", |req| {
//!     ActivityResult::ok(json!({ "echo": req.node_config }))
//! });
//! ```

pub mod activity;
pub mod error;
pub mod event_log;
pub mod memory;
pub mod traits;

pub use activity::{
    ActivityError, ActivityErrorKind, ActivityMeta, ActivityMetrics, ActivityRequest,
    ActivityResult,
};
pub use error::RuntimeError;
pub use event_log::JsonlEventLog;
pub use memory::InMemoryRuntime;
pub use traits::{DurableRuntime, NodeHandler};
