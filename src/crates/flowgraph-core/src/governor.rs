//! Size governor - keeps the execution context within declared byte caps.
//!
//! Two budgets apply on every output store: a per-node cap (default 1 MiB)
//! and a total context cap (default 50 MiB), both measured on the canonical
//! JSON encoding. A per-node breach either fails the node or truncates the
//! value to a marker record, per configuration. A total breach evicts the
//! oldest outputs in insertion order - skipping outputs that a not-yet
//! -terminal consumer still needs - and records the evictions so downstream
//! interpolation raises `OUTPUT_PRUNED` instead of reading a stale value.

use crate::context::{canonical_json, canonical_size, ContextSnapshot};
use crate::definition::NodeId;
use crate::error::{EngineError, Result};
use serde_json::{json, Value};

pub const DEFAULT_MAX_NODE_OUTPUT_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_CONTEXT_BYTES: usize = 50 * 1024 * 1024;

/// What to do when a single output exceeds the per-node cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowAction {
    /// Fail the node with `OUTPUT_TOO_LARGE`.
    #[default]
    FailNode,
    /// Keep a marker record (`__truncated`, `original_bytes`, `preview`).
    Truncate,
}

/// Byte budgets, overridable at submission time.
#[derive(Debug, Clone, Copy)]
pub struct SizeLimits {
    pub max_node_output_bytes: usize,
    pub max_context_bytes: usize,
    pub overflow_action: OverflowAction,
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self {
            max_node_output_bytes: DEFAULT_MAX_NODE_OUTPUT_BYTES,
            max_context_bytes: DEFAULT_MAX_CONTEXT_BYTES,
            overflow_action: OverflowAction::default(),
        }
    }
}

/// Result of admitting one output into the context.
#[derive(Debug)]
pub struct StoreOutcome {
    pub snapshot: ContextSnapshot,
    pub stored_bytes: usize,
    pub truncated: bool,
    /// Outputs evicted to bring the total back under the cap, oldest first.
    pub evicted: Vec<NodeId>,
}

/// Enforces [`SizeLimits`] on context stores.
#[derive(Debug, Clone, Default)]
pub struct SizeGovernor {
    limits: SizeLimits,
}

impl SizeGovernor {
    pub fn new(limits: SizeLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SizeLimits {
        &self.limits
    }

    /// Admit one node output.
    ///
    /// `still_required` reports whether some consumer of a stored output is
    /// not yet terminal; such outputs are not eviction candidates.
    pub fn admit(
        &self,
        snapshot: &ContextSnapshot,
        node_id: &str,
        value: Value,
        still_required: &dyn Fn(&str) -> bool,
    ) -> Result<StoreOutcome> {
        let mut value = value;
        let mut truncated = false;
        let mut bytes = canonical_size(&value);

        if bytes > self.limits.max_node_output_bytes {
            match self.limits.overflow_action {
                OverflowAction::FailNode => {
                    return Err(EngineError::OutputTooLarge {
                        node_id: node_id.to_string(),
                        bytes,
                        limit: self.limits.max_node_output_bytes,
                    });
                }
                OverflowAction::Truncate => {
                    value = truncate_marker(&value, bytes);
                    bytes = canonical_size(&value);
                    truncated = true;
                }
            }
        }

        let mut next = snapshot.store_node_output(node_id, value);
        let mut evicted = Vec::new();

        while next.total_bytes() > self.limits.max_context_bytes {
            let candidate = next
                .insertion_order()
                .iter()
                .find(|candidate| candidate.as_str() != node_id && !still_required(candidate))
                .cloned();
            match candidate {
                Some(candidate) => {
                    tracing::debug!(
                        node_id = %candidate,
                        total_bytes = next.total_bytes(),
                        cap = self.limits.max_context_bytes,
                        "evicting oldest output to honour context cap"
                    );
                    next = next.prune_output(&candidate);
                    evicted.push(candidate);
                }
                None => {
                    return Err(EngineError::ContextOverflow {
                        bytes: next.total_bytes(),
                        limit: self.limits.max_context_bytes,
                    });
                }
            }
        }

        Ok(StoreOutcome {
            stored_bytes: next.output_bytes(node_id).unwrap_or(0),
            snapshot: next,
            truncated,
            evicted,
        })
    }
}

fn truncate_marker(value: &Value, original_bytes: usize) -> Value {
    let canonical = canonical_json(value);
    let mut end = canonical.len().min(256);
    while !canonical.is_char_boundary(end) {
        end -= 1;
    }
    json!({
        "__truncated": true,
        "original_bytes": original_bytes,
        "preview": &canonical[..end],
    })
}
