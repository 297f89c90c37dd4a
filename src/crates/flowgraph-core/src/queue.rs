//! Execution queue - the dependency-tracked scheduler state machine.
//!
//! Every reachable node moves through
//! `pending → ready → executing → completed | failed | skipped`, and the six
//! states partition the reachable set at every tick. Edges carry their own
//! tri-state decision (`undecided → active | inactive`), assigned when their
//! source reaches a terminal state; a node becomes ready once all of its
//! in-edges are decided and at least one is active, and becomes skipped once
//! every in-edge is decided inactive.
//!
//! Branch policy lives here: conditionals activate exactly one of their
//! `true`/`false` edges, switches exactly one `case-<v>` (or the default),
//! error edges invert against success edges, parallel fans activate
//! everything, and the loop end sentinel's exit edges activate exactly once,
//! after the final pass. Loop iteration is re-admission: the loop node, its
//! body and the end sentinel return to `pending` with their internal edge
//! decisions erased.

use crate::builder::{BuiltWorkflow, HandleType};
use crate::definition::{EdgeId, NodeId, NodeKind};
use crate::error::{EngineError, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Lifecycle state of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Pending,
    Ready,
    Executing,
    Completed,
    Failed,
    Skipped,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Completed | NodeState::Failed | NodeState::Skipped
        )
    }
}

/// Whether data flows along an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDecision {
    Undecided,
    Active,
    Inactive,
}

/// Scheduler state for one execution.
#[derive(Debug, Clone)]
pub struct ExecutionQueue {
    workflow: Arc<BuiltWorkflow>,
    states: HashMap<NodeId, NodeState>,
    decisions: HashMap<EdgeId, EdgeDecision>,
    /// Mirror of stored outputs for the scheduler's own lookups.
    outputs: HashMap<NodeId, Arc<Value>>,
    /// Re-admissions per loop, bounded by `max_loop_iterations`.
    loop_readmissions: HashMap<NodeId, u64>,
    max_loop_iterations: u64,
}

impl ExecutionQueue {
    /// Every reachable node enters `pending` except the trigger (and declared
    /// additional starts), which enter `ready`. Edges from unreachable
    /// sources are dead on arrival.
    pub fn initialize(workflow: Arc<BuiltWorkflow>, max_loop_iterations: u64) -> Self {
        let mut states = HashMap::new();
        for node_id in workflow.reachable_nodes() {
            states.insert(node_id.clone(), NodeState::Pending);
        }
        states.insert(workflow.trigger_node_id.clone(), NodeState::Ready);
        for node_id in &workflow.additional_start_ids {
            states.insert(node_id.clone(), NodeState::Ready);
        }

        let mut decisions = HashMap::new();
        for edge in workflow.edges.values() {
            let decision = if workflow.is_reachable(&edge.source) {
                EdgeDecision::Undecided
            } else {
                EdgeDecision::Inactive
            };
            decisions.insert(edge.id.clone(), decision);
        }

        Self {
            workflow,
            states,
            decisions,
            outputs: HashMap::new(),
            loop_readmissions: HashMap::new(),
            max_loop_iterations,
        }
    }

    pub fn state(&self, node_id: &str) -> Option<NodeState> {
        self.states.get(node_id).copied()
    }

    pub fn decision(&self, edge_id: &str) -> Option<EdgeDecision> {
        self.decisions.get(edge_id).copied()
    }

    pub fn output(&self, node_id: &str) -> Option<Arc<Value>> {
        self.outputs.get(node_id).cloned()
    }

    /// Node IDs currently in the given state, sorted for determinism.
    pub fn nodes_in(&self, state: NodeState) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(node_id, _)| node_id.clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// True when `pending ∪ ready ∪ executing` is empty.
    pub fn is_complete(&self) -> bool {
        self.states.values().all(|state| state.is_terminal())
    }

    /// Up to `limit` ready nodes, ascending `(depth, position within level)`.
    pub fn get_ready(&self, limit: usize) -> Vec<NodeId> {
        let mut ready: Vec<NodeId> = self
            .states
            .iter()
            .filter(|(_, state)| **state == NodeState::Ready)
            .map(|(node_id, _)| node_id.clone())
            .collect();
        ready.sort_by_key(|node_id| self.workflow.level_position(node_id));
        ready.truncate(limit);
        ready
    }

    pub fn mark_executing(&mut self, node_ids: &[NodeId]) {
        for node_id in node_ids {
            if self.states.get(node_id) == Some(&NodeState::Ready) {
                self.states.insert(node_id.clone(), NodeState::Executing);
            }
        }
    }

    /// Put a dispatched node back in `ready` (used when a loop decision has
    /// to wait for the body to quiesce).
    pub fn revert_to_ready(&mut self, node_id: &str) {
        if self.states.get(node_id) == Some(&NodeState::Executing) {
            self.states.insert(node_id.to_string(), NodeState::Ready);
        }
    }

    /// Record a completion, decide the node's outgoing edges per branch
    /// policy, and advance dependents. Idempotent on repeat.
    pub fn mark_completed(&mut self, node_id: &str, output: Arc<Value>) {
        if self.states.get(node_id) == Some(&NodeState::Completed) {
            return;
        }
        self.states.insert(node_id.to_string(), NodeState::Completed);
        self.outputs.insert(node_id.to_string(), output.clone());
        let decisions = self.branch_decisions(node_id, &output);
        self.apply_decisions(decisions, true);
    }

    /// Record a failure. With an outgoing error edge the failure diverts:
    /// error edges activate, success edges deactivate. Without one, every
    /// strictly-downstream still-pending node is skipped; the skipped set is
    /// returned.
    pub fn mark_failed(
        &mut self,
        node_id: &str,
        error_output: Option<Arc<Value>>,
    ) -> Vec<NodeId> {
        if self
            .states
            .get(node_id)
            .map(|state| state.is_terminal())
            .unwrap_or(false)
        {
            return Vec::new();
        }
        self.states.insert(node_id.to_string(), NodeState::Failed);
        if let Some(output) = error_output {
            self.outputs.insert(node_id.to_string(), output);
        }

        let has_error_edge = self.workflow.has_error_edge(node_id);
        if has_error_edge {
            let decisions: Vec<(EdgeId, EdgeDecision)> = self
                .workflow
                .out_edge_ids(node_id)
                .iter()
                .map(|edge_id| {
                    let decision = if self.workflow.edges[edge_id].handle_type.is_error() {
                        EdgeDecision::Active
                    } else {
                        EdgeDecision::Inactive
                    };
                    (edge_id.clone(), decision)
                })
                .collect();
            self.apply_decisions(decisions, true);
            Vec::new()
        } else {
            self.dependency_skip(node_id)
        }
    }

    /// Skip one node and dependency-skip everything strictly downstream of
    /// it that is still pending.
    pub fn mark_skipped(&mut self, node_id: &str) -> Vec<NodeId> {
        let mut skipped = Vec::new();
        if let Some(state) = self.states.get(node_id) {
            if !state.is_terminal() {
                self.states.insert(node_id.to_string(), NodeState::Skipped);
                skipped.push(node_id.to_string());
            }
        }
        skipped.extend(self.dependency_skip(node_id));
        skipped
    }

    /// Move every non-terminal node to `skipped` (cancellation tick).
    pub fn cancel_all(&mut self) -> Vec<NodeId> {
        let mut skipped = Vec::new();
        for (node_id, state) in self.states.iter_mut() {
            if !state.is_terminal() {
                *state = NodeState::Skipped;
                skipped.push(node_id.clone());
            }
        }
        skipped.sort();
        skipped
    }

    /// Re-admit a loop's body for another pass: the loop node, its body and
    /// the end sentinel return to `pending`, their internal edge decisions
    /// are erased, and the loop node (whose start-sentinel edge is still
    /// active) comes back ready.
    pub fn readmit_loop(&mut self, loop_id: &str) -> Result<()> {
        let context = self
            .workflow
            .loop_contexts
            .get(loop_id)
            .ok_or_else(|| EngineError::Internal(format!("no loop context for '{loop_id}'")))?
            .clone();

        let readmissions = self.loop_readmissions.entry(loop_id.to_string()).or_insert(0);
        *readmissions += 1;
        // Pass N+1 begins with re-admission N; the bound is on total passes.
        if *readmissions >= self.max_loop_iterations {
            return Err(EngineError::LoopLimitExceeded {
                loop_id: loop_id.to_string(),
                limit: self.max_loop_iterations,
            });
        }

        let mut members: HashSet<NodeId> = context.body_nodes.clone();
        members.insert(context.loop_node_id.clone());
        members.insert(context.end_sentinel_id.clone());

        let edge_ids: Vec<EdgeId> = self
            .workflow
            .edges
            .values()
            .filter(|edge| members.contains(&edge.source))
            .map(|edge| edge.id.clone())
            .collect();
        for edge_id in edge_ids {
            self.decisions.insert(edge_id, EdgeDecision::Undecided);
        }

        let mut worklist = Vec::new();
        for member in &members {
            if self.workflow.is_reachable(member) {
                self.states.insert(member.clone(), NodeState::Pending);
                worklist.push(member.clone());
            }
        }
        self.propagate(worklist);
        Ok(())
    }

    /// Passes granted to a loop so far (first pass included).
    pub fn loop_passes(&self, loop_id: &str) -> u64 {
        self.loop_readmissions.get(loop_id).copied().unwrap_or(0) + 1
    }

    /// Whether any of the given nodes is not yet terminal.
    pub fn any_unfinished_in(&self, nodes: &HashSet<NodeId>) -> bool {
        nodes.iter().any(|node_id| {
            self.states
                .get(node_id)
                .map(|state| !state.is_terminal())
                .unwrap_or(false)
        })
    }

    // Branch policy: which outgoing edges carry data after a completion.
    fn branch_decisions(
        &self,
        node_id: &str,
        output: &Value,
    ) -> Vec<(EdgeId, EdgeDecision)> {
        let kind = self
            .workflow
            .node(node_id)
            .map(|node| node.kind)
            .unwrap_or(NodeKind::Transform);
        let out_edges = self.workflow.out_edge_ids(node_id);

        match kind {
            NodeKind::Conditional => {
                let chosen = output
                    .get("result")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                out_edges
                    .iter()
                    .map(|edge_id| {
                        let active = match &self.workflow.edges[edge_id].handle_type {
                            HandleType::True => chosen,
                            HandleType::False => !chosen,
                            _ => false,
                        };
                        (edge_id.clone(), activity(active))
                    })
                    .collect()
            }
            NodeKind::Switch => {
                let value = switch_value(output.get("value"));
                let matched = value
                    .as_deref()
                    .map(|v| {
                        out_edges.iter().any(|edge_id| {
                            matches!(
                                &self.workflow.edges[edge_id].handle_type,
                                HandleType::Case(case) if case == v
                            )
                        })
                    })
                    .unwrap_or(false);
                out_edges
                    .iter()
                    .map(|edge_id| {
                        let active = match &self.workflow.edges[edge_id].handle_type {
                            HandleType::Case(case) => value.as_deref() == Some(case.as_str()),
                            HandleType::Default => !matched,
                            _ => false,
                        };
                        (edge_id.clone(), activity(active))
                    })
                    .collect()
            }
            _ => out_edges
                .iter()
                .map(|edge_id| {
                    let active = !self.workflow.edges[edge_id].handle_type.is_error();
                    (edge_id.clone(), activity(active))
                })
                .collect(),
        }
    }

    /// Apply edge decisions, eagerly prune exclusive-downstream subtrees of
    /// primary deactivations, then refresh affected targets.
    fn apply_decisions(
        &mut self,
        decisions: Vec<(EdgeId, EdgeDecision)>,
        prune_exclusive: bool,
    ) {
        let mut worklist = Vec::new();
        let mut deactivated = Vec::new();
        for (edge_id, decision) in decisions {
            if let Some(target) = self.workflow.edge(&edge_id).map(|edge| edge.target.clone()) {
                worklist.push(target);
            }
            if decision == EdgeDecision::Inactive {
                deactivated.push(edge_id.clone());
            }
            self.decisions.insert(edge_id, decision);
        }

        if prune_exclusive {
            for edge_id in deactivated {
                let exclusive: Vec<NodeId> =
                    self.workflow.exclusive_downstream(&edge_id).to_vec();
                for node_id in exclusive {
                    if matches!(
                        self.states.get(&node_id),
                        Some(NodeState::Pending) | Some(NodeState::Ready)
                    ) {
                        self.skip_with_edges(&node_id, &mut worklist);
                    }
                }
            }
        }

        self.propagate(worklist);
    }

    // Readiness/skip propagation over pending nodes.
    fn propagate(&mut self, mut worklist: Vec<NodeId>) {
        while let Some(node_id) = worklist.pop() {
            if self.states.get(&node_id) != Some(&NodeState::Pending) {
                continue;
            }
            let in_edges = self.workflow.in_edge_ids(&node_id);
            if in_edges.is_empty() {
                continue;
            }
            let mut all_decided = true;
            let mut any_active = false;
            for edge_id in in_edges {
                match self.decisions.get(edge_id).copied() {
                    Some(EdgeDecision::Undecided) | None => {
                        all_decided = false;
                        break;
                    }
                    Some(EdgeDecision::Active) => any_active = true,
                    Some(EdgeDecision::Inactive) => {}
                }
            }
            if !all_decided {
                continue;
            }
            if any_active {
                self.states.insert(node_id, NodeState::Ready);
            } else {
                self.skip_with_edges(&node_id, &mut worklist);
            }
        }
    }

    fn skip_with_edges(&mut self, node_id: &str, worklist: &mut Vec<NodeId>) {
        self.states.insert(node_id.to_string(), NodeState::Skipped);
        let out_edges: Vec<EdgeId> = self.workflow.out_edge_ids(node_id).to_vec();
        for edge_id in out_edges {
            if self.decisions.get(&edge_id) == Some(&EdgeDecision::Undecided) {
                self.decisions.insert(edge_id.clone(), EdgeDecision::Inactive);
            }
            if let Some(edge) = self.workflow.edge(&edge_id) {
                worklist.push(edge.target.clone());
            }
        }
    }

    // Hard skip: forward closure from the node, every still-pending member
    // moves to skipped.
    fn dependency_skip(&mut self, node_id: &str) -> Vec<NodeId> {
        // Deactivate the node's own edges first.
        let own_edges: Vec<(EdgeId, EdgeDecision)> = self
            .workflow
            .out_edge_ids(node_id)
            .iter()
            .map(|edge_id| (edge_id.clone(), EdgeDecision::Inactive))
            .collect();
        for (edge_id, decision) in &own_edges {
            self.decisions.insert(edge_id.clone(), *decision);
        }

        let mut closure = HashSet::new();
        let mut stack: Vec<NodeId> = self
            .workflow
            .out_edge_ids(node_id)
            .iter()
            .filter_map(|edge_id| self.workflow.edge(edge_id))
            .map(|edge| edge.target.clone())
            .collect();
        while let Some(current) = stack.pop() {
            if !closure.insert(current.clone()) {
                continue;
            }
            for edge_id in self.workflow.out_edge_ids(&current) {
                if let Some(edge) = self.workflow.edge(edge_id) {
                    stack.push(edge.target.clone());
                }
            }
        }

        let mut skipped = Vec::new();
        let mut worklist = Vec::new();
        let mut ordered: Vec<NodeId> = closure.into_iter().collect();
        ordered.sort();
        for current in ordered {
            if matches!(
                self.states.get(&current),
                Some(NodeState::Pending) | Some(NodeState::Ready)
            ) {
                self.skip_with_edges(&current, &mut worklist);
                skipped.push(current);
            }
        }
        self.propagate(worklist);
        skipped
    }
}

fn activity(active: bool) -> EdgeDecision {
    if active {
        EdgeDecision::Active
    } else {
        EdgeDecision::Inactive
    }
}

fn switch_value(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    }
}
