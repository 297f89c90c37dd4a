//! Stage 3 of the build pipeline: parallel branch expansion.
//!
//! A `parallel` node declares its branches and the join node where they
//! reconverge. The subgraph on paths between the parallel node and the join
//! is duplicated once per branch (`<node>__<branch>`), edges are re-pointed,
//! and templates inside duplicated configs are rewritten to reference the
//! branch copies. The join's dependencies become the per-branch copies, so
//! it waits for every branch.

use super::{BranchBinding, Draft, DraftEdge, HandleType};
use crate::definition::{NodeId, NodeKind, ParallelConfig};
use crate::error::{BuildCode, BuildIssue};
use crate::interpolate;
use serde_json::Value;
use std::collections::HashSet;

pub(crate) fn expand_parallels(draft: &mut Draft, errors: &mut Vec<BuildIssue>) {
    let parallel_ids: Vec<NodeId> = draft
        .nodes
        .iter()
        .filter(|(_, node)| node.kind == NodeKind::Parallel)
        .map(|(node_id, _)| node_id.clone())
        .collect();

    for parallel_id in parallel_ids {
        expand_one(draft, &parallel_id, errors);
    }
}

fn expand_one(draft: &mut Draft, parallel_id: &NodeId, errors: &mut Vec<BuildIssue>) {
    let config_value = draft.nodes[parallel_id].config.clone();
    let config: ParallelConfig = match serde_json::from_value(config_value) {
        Ok(config) => config,
        Err(err) => {
            errors.push(BuildIssue::for_node(
                BuildCode::InvalidInput,
                parallel_id.clone(),
                format!("invalid parallel config: {err}"),
            ));
            return;
        }
    };
    if config.branches.is_empty() {
        errors.push(BuildIssue::for_node(
            BuildCode::InvalidInput,
            parallel_id.clone(),
            "parallel node declares no branches",
        ));
        return;
    }
    let mut branch_ids = HashSet::new();
    for branch in &config.branches {
        if branch.id.is_empty() || !branch_ids.insert(branch.id.clone()) {
            errors.push(BuildIssue::for_node(
                BuildCode::InvalidInput,
                parallel_id.clone(),
                format!("branch id '{}' is empty or duplicated", branch.id),
            ));
            return;
        }
    }
    if !draft.nodes.contains_key(&config.join) {
        errors.push(BuildIssue::for_node(
            BuildCode::InvalidInput,
            parallel_id.clone(),
            format!("parallel join '{}' is not a node", config.join),
        ));
        return;
    }

    let members = subgraph_members(draft, parallel_id, &config.join);
    for member in &members {
        let kind = draft.nodes[member].kind;
        if matches!(
            kind,
            NodeKind::Loop | NodeKind::Parallel | NodeKind::LoopStart | NodeKind::LoopEnd
        ) {
            errors.push(BuildIssue::for_node(
                BuildCode::InvalidInput,
                parallel_id.clone(),
                format!(
                    "parallel expansion across {} node '{member}' is not supported",
                    kind.as_str()
                ),
            ));
            return;
        }
    }

    // Duplicate member nodes per branch.
    let mut ordered_members: Vec<&NodeId> = members.iter().collect();
    ordered_members.sort();
    for branch in &config.branches {
        for member in &ordered_members {
            let copy_id = format!("{member}__{}", branch.id);
            if draft.nodes.contains_key(&copy_id) {
                errors.push(BuildIssue::for_node(
                    BuildCode::InvalidInput,
                    parallel_id.clone(),
                    format!("expanded node id '{copy_id}' already taken"),
                ));
                return;
            }
            let mut node = draft.nodes[*member].clone();
            node.config = rewrite_branch_refs(&node.config, &members, &branch.id);
            draft.nodes.insert(copy_id.clone(), node);
            draft.branch_bindings.insert(
                copy_id,
                BranchBinding {
                    parallel_node_id: parallel_id.clone(),
                    branch_id: branch.id.clone(),
                    variables: branch.variables.clone(),
                },
            );
        }
    }

    // Re-point edges across the expansion.
    let mut new_edges: Vec<DraftEdge> = Vec::with_capacity(draft.edges.len());
    for edge in &draft.edges {
        let source_in = members.contains(&edge.source);
        let target_in = members.contains(&edge.target);
        let fans_out = edge.source == *parallel_id
            && (target_in || edge.target == config.join)
            && !edge.handle_type.is_error();

        if fans_out || source_in || target_in {
            for branch in &config.branches {
                let mut copy = edge.clone();
                copy.id = format!("{}__{}", edge.id, branch.id);
                if source_in {
                    copy.source = format!("{}__{}", edge.source, branch.id);
                }
                if target_in {
                    copy.target = format!("{}__{}", edge.target, branch.id);
                }
                new_edges.push(copy);
            }
        } else {
            new_edges.push(edge.clone());
        }
    }
    draft.edges = new_edges;

    for member in &ordered_members {
        draft.nodes.remove(*member);
    }

    draft.parallel_branches.insert(
        parallel_id.clone(),
        config.branches.iter().map(|branch| branch.id.clone()).collect(),
    );
}

/// Nodes on paths between the parallel node and its join, both exclusive:
/// forward closure from the parallel node (not crossing the join) intersected
/// with the backward closure from the join (not crossing the parallel node).
fn subgraph_members(draft: &Draft, parallel_id: &NodeId, join: &NodeId) -> HashSet<NodeId> {
    let mut forward: HashSet<NodeId> = HashSet::new();
    let mut stack: Vec<NodeId> = draft
        .edges
        .iter()
        .filter(|edge| edge.source == *parallel_id && !edge.handle_type.is_error())
        .map(|edge| edge.target.clone())
        .collect();
    while let Some(node_id) = stack.pop() {
        if node_id == *join || !forward.insert(node_id.clone()) {
            continue;
        }
        for edge in &draft.edges {
            if edge.source == node_id {
                stack.push(edge.target.clone());
            }
        }
    }

    let mut backward: HashSet<NodeId> = HashSet::new();
    let mut stack: Vec<NodeId> = draft
        .edges
        .iter()
        .filter(|edge| edge.target == *join)
        .map(|edge| edge.source.clone())
        .collect();
    while let Some(node_id) = stack.pop() {
        if node_id == *parallel_id || !backward.insert(node_id.clone()) {
            continue;
        }
        for edge in &draft.edges {
            if edge.target == node_id {
                stack.push(edge.source.clone());
            }
        }
    }

    forward.intersection(&backward).cloned().collect()
}

/// Rewrite `{{member...}}` template roots inside a duplicated config so the
/// copy references its own branch's nodes.
fn rewrite_branch_refs(config: &Value, members: &HashSet<NodeId>, branch_id: &str) -> Value {
    match config {
        Value::String(text) => Value::String(rewrite_text(text, members, branch_id)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| rewrite_branch_refs(item, members, branch_id))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), rewrite_branch_refs(item, members, branch_id)))
                .collect(),
        ),
        scalar => scalar.clone(),
    }
}

fn rewrite_text(text: &str, members: &HashSet<NodeId>, branch_id: &str) -> String {
    let (refs, _) = interpolate::collect_template_refs(&Value::String(text.to_string()));
    let mut out = text.to_string();
    for reference in refs {
        if members.contains(&reference.root) {
            let old = format!("{{{{{}.", reference.root);
            let new = format!("{{{{{}__{}.", reference.root, branch_id);
            out = out.replace(&old, &new);
            let old_idx = format!("{{{{{}[", reference.root);
            let new_idx = format!("{{{{{}__{}[", reference.root, branch_id);
            out = out.replace(&old_idx, &new_idx);
        }
    }
    out
}
