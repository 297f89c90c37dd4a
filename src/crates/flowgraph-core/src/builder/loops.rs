//! Stage 2 of the build pipeline: loop normalization.
//!
//! Every `loop` node `L` gets a sentinel pair: `L__LOOP_START` before it and
//! `L__LOOP_END` after it. Inbound edges re-point to the start sentinel,
//! back-edges from the body re-point to the end sentinel, and exit edges
//! re-source from the end sentinel. No static edge closes the cycle - a new
//! iteration is a queue re-admission - so the normalized graph is a DAG.
//!
//! ```text
//!   before:  in ──> L ──loop-body──> B ──┐       after:  in ──> S ──> L ──> B ──> E ──> out
//!                   ▲─────────────────────┘                      (iteration = re-admission)
//!                   └──loop-exit──> out
//! ```

use super::{Draft, DraftEdge, DraftNode, HandleType, LoopContext, LOOP_END_SUFFIX, LOOP_START_SUFFIX};
use crate::definition::{LoopConfig, LoopKind, NodeId, NodeKind};
use crate::error::{BuildCode, BuildIssue};
use serde_json::json;
use std::collections::HashSet;

pub(crate) fn normalize_loops(draft: &mut Draft, errors: &mut Vec<BuildIssue>) {
    let loop_ids: Vec<NodeId> = draft
        .nodes
        .iter()
        .filter(|(_, node)| node.kind == NodeKind::Loop)
        .map(|(node_id, _)| node_id.clone())
        .collect();

    for loop_id in loop_ids {
        normalize_one(draft, &loop_id, errors);
    }
}

fn normalize_one(draft: &mut Draft, loop_id: &NodeId, errors: &mut Vec<BuildIssue>) {
    let config_value = draft.nodes[loop_id].config.clone();
    let config: LoopConfig = match serde_json::from_value(config_value) {
        Ok(config) => config,
        Err(err) => {
            errors.push(BuildIssue::for_node(
                BuildCode::InvalidInput,
                loop_id.clone(),
                format!("invalid loop config: {err}"),
            ));
            return;
        }
    };
    match config.kind {
        LoopKind::ForEach if config.array_path.is_none() => {
            errors.push(BuildIssue::for_node(
                BuildCode::InvalidInput,
                loop_id.clone(),
                "forEach loop requires arrayPath",
            ));
            return;
        }
        LoopKind::While if config.condition.is_none() => {
            errors.push(BuildIssue::for_node(
                BuildCode::InvalidInput,
                loop_id.clone(),
                "while loop requires condition",
            ));
            return;
        }
        LoopKind::Count if config.count.map(|count| count == 0).unwrap_or(true) => {
            errors.push(BuildIssue::for_node(
                BuildCode::InvalidInput,
                loop_id.clone(),
                "count loop requires a positive count",
            ));
            return;
        }
        _ => {}
    }

    let start_id = format!("{loop_id}{LOOP_START_SUFFIX}");
    let end_id = format!("{loop_id}{LOOP_END_SUFFIX}");
    if draft.nodes.contains_key(&start_id) || draft.nodes.contains_key(&end_id) {
        errors.push(BuildIssue::for_node(
            BuildCode::InvalidInput,
            loop_id.clone(),
            "loop sentinel node id already taken",
        ));
        return;
    }

    let body = discover_body(draft, loop_id, &start_id, &end_id);
    if body.is_empty() {
        errors.push(BuildIssue::for_node(
            BuildCode::InvalidInput,
            loop_id.clone(),
            "loop has no loop-body edge",
        ));
        return;
    }

    for edge in draft.edges.iter_mut() {
        if edge.target == *loop_id {
            if body.contains(&edge.source) {
                // Back-edge: the body hands control to the end sentinel.
                edge.target = end_id.clone();
                edge.handle_type = HandleType::LoopBody;
            } else {
                // External entry goes through the start sentinel.
                edge.target = start_id.clone();
            }
        } else if edge.source == *loop_id {
            match edge.handle_type {
                HandleType::LoopBody => {}
                HandleType::Error => {}
                // Exit edges (explicit or default-handled) leave from the
                // end sentinel once the loop is done.
                _ => {
                    edge.source = end_id.clone();
                    edge.handle_type = HandleType::LoopExit;
                }
            }
        }
    }

    let loop_name = draft.nodes[loop_id].name.clone();
    draft.nodes.insert(
        start_id.clone(),
        DraftNode {
            kind: NodeKind::LoopStart,
            name: format!("{loop_name} (start)"),
            config: json!({ "loopNodeId": loop_id }),
        },
    );
    draft.nodes.insert(
        end_id.clone(),
        DraftNode {
            kind: NodeKind::LoopEnd,
            name: format!("{loop_name} (end)"),
            config: json!({ "loopNodeId": loop_id }),
        },
    );
    draft.edges.push(DraftEdge {
        id: format!("{loop_id}__loop_entry"),
        source: start_id.clone(),
        target: loop_id.clone(),
        source_handle: None,
        handle_type: HandleType::LoopBody,
    });

    if draft.entry == *loop_id {
        draft.entry = start_id.clone();
    }

    draft.loop_contexts.insert(
        loop_id.clone(),
        LoopContext {
            loop_node_id: loop_id.clone(),
            kind: config.kind,
            array_path: config.array_path,
            condition: config.condition,
            count: config.count,
            body_nodes: body,
            start_sentinel_id: start_id,
            end_sentinel_id: end_id,
        },
    );
}

/// Forward closure from the loop's `loop-body` edges, stopping at the loop
/// head and its sentinels. Runs before rewiring (to classify back-edges) and
/// again afterwards via [`recompute_bodies`] once expansion may have renamed
/// members.
fn discover_body(
    draft: &Draft,
    loop_id: &NodeId,
    start_id: &NodeId,
    end_id: &NodeId,
) -> HashSet<NodeId> {
    let mut body = HashSet::new();
    let mut stack: Vec<NodeId> = draft
        .edges
        .iter()
        .filter(|edge| edge.source == *loop_id && edge.handle_type == HandleType::LoopBody)
        .map(|edge| edge.target.clone())
        .collect();

    while let Some(node_id) = stack.pop() {
        if node_id == *loop_id || node_id == *start_id || node_id == *end_id {
            continue;
        }
        if !body.insert(node_id.clone()) {
            continue;
        }
        for edge in &draft.edges {
            if edge.source == node_id && edge.target != *loop_id {
                stack.push(edge.target.clone());
            }
        }
    }
    body
}

/// Refresh every loop's body set against the final edge list. Parallel
/// expansion replaces member nodes with per-branch copies, which must be
/// re-admitted on iteration like the originals were.
pub(crate) fn recompute_bodies(draft: &mut Draft) {
    let loop_ids: Vec<NodeId> = draft.loop_contexts.keys().cloned().collect();
    for loop_id in loop_ids {
        let (start_id, end_id) = {
            let context = &draft.loop_contexts[&loop_id];
            (
                context.start_sentinel_id.clone(),
                context.end_sentinel_id.clone(),
            )
        };
        let body = discover_body(draft, &loop_id, &start_id, &end_id);
        if let Some(context) = draft.loop_contexts.get_mut(&loop_id) {
            context.body_nodes = body;
        }
    }
}
