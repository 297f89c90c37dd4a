//! Error types for the durable-runtime boundary.

use thiserror::Error;

/// Convenience result type using [`RuntimeError`].
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors raised by a durable-runtime implementation.
///
/// These are infrastructure failures, distinct from handler-reported
/// [`ActivityError`](crate::ActivityError)s: a handler saying "the API
/// rejected me" is an activity error; the runtime having no handler
/// registered for a node type is a [`RuntimeError`].
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// No handler registered for the requested node type.
    #[error("no handler registered for node type '{node_type}'")]
    HandlerNotRegistered { node_type: String },

    /// A requested signal is not available and cannot be waited for.
    #[error("signal '{name}' unavailable for execution '{execution_id}'")]
    SignalUnavailable { execution_id: String, name: String },

    /// Event-log or other I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Event-log serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
