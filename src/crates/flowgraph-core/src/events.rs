//! Per-execution event channel.
//!
//! Events are strictly ordered by a logical timestamp - a monotonic counter
//! owned by the channel, never wall clock - so durable replay produces the
//! same stream. Consumers subscribe over an unbounded tokio channel; an
//! optional [`EventSink`] mirrors every event into persistent storage (the
//! JSONL event log in production).

use flowgraph_durable::JsonlEventLog;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Event kinds on the per-execution channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ExecutionStarted,
    ExecutionProgress,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionPaused,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    ApprovalNeeded,
    ApprovalResolved,
    MessageReceived,
    ToolCallStarted,
    ToolCallCompleted,
    ToolCallFailed,
    DeliverableCreated,
}

impl EventKind {
    /// Handler-originated kinds that may arrive through activity signals.
    pub fn from_signal_name(name: &str) -> Option<EventKind> {
        match name {
            "message_received" => Some(EventKind::MessageReceived),
            "tool_call_started" => Some(EventKind::ToolCallStarted),
            "tool_call_completed" => Some(EventKind::ToolCallCompleted),
            "tool_call_failed" => Some(EventKind::ToolCallFailed),
            "deliverable_created" => Some(EventKind::DeliverableCreated),
            _ => None,
        }
    }
}

/// One event on an execution's channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Execution ID the event belongs to.
    pub channel: String,
    pub kind: EventKind,
    /// Logical timestamp: monotonic counter, not wall clock.
    pub timestamp: u64,
    pub payload: Value,
}

/// Destination for persisted events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &ExecutionEvent);
}

/// [`EventSink`] adapter over the durable JSONL event log.
pub struct JsonlSink(pub JsonlEventLog);

impl EventSink for JsonlSink {
    fn record(&self, event: &ExecutionEvent) {
        if let Err(err) = self.0.append(event) {
            tracing::warn!(%err, "failed to append event to log");
        }
    }
}

/// Ordered event emitter for one execution.
pub struct EventChannel {
    channel: String,
    next_timestamp: u64,
    tx: Option<mpsc::UnboundedSender<ExecutionEvent>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl EventChannel {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            channel: execution_id.into(),
            next_timestamp: 0,
            tx: None,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Attach a live subscriber. One subscriber per channel; a second call
    /// replaces the first.
    pub fn subscribe(&mut self) -> UnboundedReceiverStream<ExecutionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx = Some(tx);
        UnboundedReceiverStream::new(rx)
    }

    /// Forward events into an externally-owned sender.
    pub fn attach(&mut self, tx: mpsc::UnboundedSender<ExecutionEvent>) {
        self.tx = Some(tx);
    }

    /// Emit one event; returns its logical timestamp.
    pub fn emit(&mut self, kind: EventKind, payload: Value) -> u64 {
        let timestamp = self.next_timestamp;
        self.next_timestamp += 1;
        let event = ExecutionEvent {
            channel: self.channel.clone(),
            kind,
            timestamp,
            payload,
        };
        tracing::trace!(channel = %event.channel, ?kind, timestamp, "event");
        if let Some(sink) = &self.sink {
            sink.record(&event);
        }
        if let Some(tx) = &self.tx {
            // A dropped subscriber must not disturb execution.
            let _ = tx.send(event);
        }
        timestamp
    }
}
