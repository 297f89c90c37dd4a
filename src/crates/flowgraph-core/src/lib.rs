//! # flowgraph-core - Durable Workflow Execution Engine
//!
//! **The core of a durable workflow automation platform**: users compose
//! directed graphs of typed nodes (LLM calls, HTTP requests, database
//! queries, file I/O, transforms, loops, conditionals, parallel fans, human
//! approvals) and this crate executes those graphs reliably on top of a
//! durable runtime ([`flowgraph-durable`](flowgraph_durable)).
//!
//! ## Architecture
//!
//! Five cooperating components, leaves first:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Orchestrator / Dispatcher (orchestrator)                   │
//! │  • capacity-bounded dispatch, retry policy, lifecycle events│
//! └──────┬──────────────┬───────────────┬───────────────────────┘
//!        │              │               │
//!        ▼              ▼               ▼
//! ┌────────────┐ ┌────────────┐ ┌──────────────┐
//! │ Builder    │ │ Queue      │ │ Context      │
//! │ (builder)  │ │ (queue)    │ │ (context +   │
//! │ definition │ │ ready set, │ │  interpolate)│
//! │ → plan     │ │ branch     │ │ snapshots,   │
//! │            │ │ pruning    │ │ templates    │
//! └────────────┘ └────────────┘ └──────┬───────┘
//!                                      │
//!                               ┌──────▼───────┐
//!                               │ Size Governor│
//!                               │ (governor)   │
//!                               └──────────────┘
//! ```
//!
//! - [`builder`] statically analyses a [`WorkflowDefinition`] into a
//!   [`BuiltWorkflow`]: reachability, longest-path depth levels, cycle
//!   detection, loop sentinel insertion, parallel branch expansion, typed
//!   edges, and the caches branch pruning and eviction safety rely on.
//! - [`context`] carries data between nodes as immutable-by-update
//!   snapshots with `{{...}}` template interpolation ([`interpolate`]).
//! - [`queue`] advances nodes through
//!   `pending → ready → executing → completed/failed/skipped` with
//!   branch-aware pruning.
//! - [`orchestrator`] pulls ready nodes, invokes handlers through the
//!   durable runtime's single activity contract, applies the retry policy
//!   ([`retry`]) and emits the ordered event stream ([`events`]).
//! - [`governor`] enforces per-node and total context byte budgets with
//!   oldest-first eviction.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowgraph_core::{ExecutionRequest, Orchestrator, WorkflowDefinition};
//! use flowgraph_durable::{ActivityResult, InMemoryRuntime};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = Arc::new(InMemoryRuntime::new());
//! runtime.register_fn("transform", |req| {
//!     ActivityResult::ok(json!({"echo": req.node_config}))
//! });
//!
//! let definition: WorkflowDefinition = serde_json::from_str(r#"{
//!     "name": "demo",
//!     "entryPoint": "in",
//!     "nodes": {
//!         "in":  {"type": "trigger",   "name": "In",  "config": {}, "position": [0, 0]},
//!         "t":   {"type": "transform", "name": "T",   "config": {"x": "{{inputs.x}}"}, "position": [1, 0]},
//!         "out": {"type": "output",    "name": "Out", "config": {}, "position": [2, 0]}
//!     },
//!     "edges": [
//!         {"id": "e1", "source": "in", "target": "t"},
//!         {"id": "e2", "source": "t",  "target": "out"}
//!     ]
//! }"#)?;
//!
//! let orchestrator = Orchestrator::new(runtime);
//! let outcome = orchestrator
//!     .submit(ExecutionRequest::new(definition, json!({"x": 2})))
//!     .await
//!     .expect("definition builds");
//! assert!(outcome.success);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod context;
pub mod definition;
pub mod error;
pub mod events;
pub mod governor;
pub mod interpolate;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod viz;

pub use builder::{
    build, BuildReport, BuiltWorkflow, ExecutableNode, HandleType, LoopContext, TypedEdge,
};
pub use context::{canonical_json, canonical_size, ContextSnapshot, LoopFrame, ParallelFrame};
pub use definition::{
    EdgeDefinition, LoopConfig, LoopKind, NodeDefinition, NodeId, NodeKind, ParallelConfig,
    WorkflowDefinition,
};
pub use error::{BuildCode, BuildIssue, EngineError, Result};
pub use events::{EventChannel, EventKind, EventSink, ExecutionEvent, JsonlSink};
pub use governor::{OverflowAction, SizeGovernor, SizeLimits};
pub use orchestrator::{
    CancelToken, CreditGate, ExecutionMetrics, ExecutionOptions, ExecutionOutcome,
    ExecutionRequest, Orchestrator,
};
pub use queue::{EdgeDecision, ExecutionQueue, NodeState};
pub use retry::RetryPolicy;
pub use viz::{visualize, VizFormat, VizOptions};
