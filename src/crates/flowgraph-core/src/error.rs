//! Error types for graph building and workflow execution
//!
//! Two families live here, matching the two phases a workflow goes through:
//!
//! - [`BuildIssue`] - structured, code-carrying findings from the graph
//!   builder. These surface synchronously from `build()` and never become
//!   execution errors; execution does not start on a failed build.
//! - [`EngineError`] - everything that can go wrong once execution is
//!   running: interpolation failures, size-cap violations, frame mismatches,
//!   loop bounds, timeouts, cancellation, and runtime-boundary errors.
//!
//! Every error exposes a stable string code (`EngineError::code`,
//! `BuildCode`'s serde name) so downstream consumers can match without
//! parsing messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience result type using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Stable codes attached to build findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildCode {
    /// Structurally invalid definition field (empty name, bad config shape,
    /// self-loop, duplicate edge id, malformed loop/parallel declaration).
    InvalidInput,
    /// The definition declares no nodes.
    NoNodes,
    /// The declared entry point is not a node.
    NoEntryPoint,
    /// A cycle survives loop-sentinel normalization.
    Cycle,
    /// An edge endpoint references a node that does not exist.
    DanglingEdge,
    /// A source handle that is not recognized, or not legal for the source
    /// node's kind.
    UnknownHandle,
    /// A config template references a node at an equal or greater depth, or
    /// is not parseable.
    InvalidVariableRef,
    /// Two edges of one switch declare the same case value.
    DuplicateCase,
    /// The node's `type` string is not a known kind.
    UnknownNodeType,
    /// Warning: node not reachable from the entry point and not declared as
    /// an additional start.
    UnreachableNode,
}

impl BuildCode {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildCode::InvalidInput => "INVALID_INPUT",
            BuildCode::NoNodes => "NO_NODES",
            BuildCode::NoEntryPoint => "NO_ENTRY_POINT",
            BuildCode::Cycle => "CYCLE",
            BuildCode::DanglingEdge => "DANGLING_EDGE",
            BuildCode::UnknownHandle => "UNKNOWN_HANDLE",
            BuildCode::InvalidVariableRef => "INVALID_VARIABLE_REF",
            BuildCode::DuplicateCase => "DUPLICATE_CASE",
            BuildCode::UnknownNodeType => "UNKNOWN_NODE_TYPE",
            BuildCode::UnreachableNode => "UNREACHABLE_NODE",
        }
    }
}

/// One build error or warning, tied to the node/edge it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildIssue {
    pub code: BuildCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    pub message: String,
}

impl BuildIssue {
    pub fn new(code: BuildCode, message: impl Into<String>) -> Self {
        Self {
            code,
            node_id: None,
            edge_id: None,
            message: message.into(),
        }
    }

    pub fn for_node(code: BuildCode, node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            node_id: Some(node_id.into()),
            edge_id: None,
            message: message.into(),
        }
    }

    pub fn for_edge(code: BuildCode, edge_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            node_id: None,
            edge_id: Some(edge_id.into()),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for BuildIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

/// Errors raised during workflow execution.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A `{{...}}` template could not be parsed or its path walked.
    #[error("interpolation failed for '{template}': {message}")]
    InterpolationFailed { template: String, message: String },

    /// A template referenced a variable (or path) with no value.
    #[error("variable '{name}' not found")]
    VariableNotFound { name: String },

    /// A template referenced a node whose output was evicted by the size
    /// governor.
    #[error("output of node '{node_id}' was pruned from the context")]
    OutputPruned { node_id: String },

    /// A node produced more bytes than the per-node cap allows.
    #[error("output of node '{node_id}' is {bytes} bytes, cap is {limit}")]
    OutputTooLarge {
        node_id: String,
        bytes: usize,
        limit: usize,
    },

    /// The context cannot be brought back under the total cap by eviction.
    #[error("context size {bytes} exceeds cap {limit} and nothing more can be evicted")]
    ContextOverflow { bytes: usize, limit: usize },

    /// Loop/parallel frame stack discipline was violated.
    #[error("frame mismatch: expected {expected}, found {found}")]
    FrameMismatch { expected: String, found: String },

    /// A loop exceeded the configured iteration bound.
    #[error("loop '{loop_id}' exceeded {limit} iterations")]
    LoopLimitExceeded { loop_id: String, limit: u64 },

    /// The umbrella execution timer fired.
    #[error("execution timed out after {timeout_ms}ms")]
    ExecutionTimeout { timeout_ms: u64 },

    /// The execution was cancelled by an external signal.
    #[error("execution cancelled")]
    Cancelled,

    /// Submission options failed validation.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The credit gate refused the submission.
    #[error("credit check failed: {0}")]
    CreditDenied(String),

    /// The scheduler can make no progress; indicates a plan or engine bug.
    #[error("internal scheduler error: {0}")]
    Internal(String),

    /// Durable-runtime boundary failure.
    #[error("runtime error: {0}")]
    Runtime(#[from] flowgraph_durable::RuntimeError),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Stable code for the event stream and execution outcomes.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InterpolationFailed { .. } => "INTERPOLATION_FAILED",
            EngineError::VariableNotFound { .. } => "VARIABLE_NOT_FOUND",
            EngineError::OutputPruned { .. } => "OUTPUT_PRUNED",
            EngineError::OutputTooLarge { .. } => "OUTPUT_TOO_LARGE",
            EngineError::ContextOverflow { .. } => "CONTEXT_OVERFLOW",
            EngineError::FrameMismatch { .. } => "FRAME_MISMATCH",
            EngineError::LoopLimitExceeded { .. } => "LOOP_LIMIT_EXCEEDED",
            EngineError::ExecutionTimeout { .. } => "EXECUTION_TIMEOUT",
            EngineError::Cancelled => "CANCELLED",
            EngineError::InvalidOptions(_) => "INVALID_INPUT",
            EngineError::CreditDenied(_) => "CREDIT_DENIED",
            EngineError::Internal(_) => "INTERNAL",
            EngineError::Runtime(_) => "RUNTIME",
            EngineError::Serialization(_) => "SERIALIZATION",
        }
    }

    /// Dispatch errors fail the affected node; execution errors end the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::ExecutionTimeout { .. }
                | EngineError::Cancelled
                | EngineError::LoopLimitExceeded { .. }
                | EngineError::Internal(_)
        )
    }
}
