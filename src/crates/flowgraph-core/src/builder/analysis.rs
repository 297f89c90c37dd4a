//! Stage 1/4 of the build pipeline: structural validation and graph analysis.
//!
//! Validation walks the raw definition and produces code-carrying findings;
//! analysis runs on the normalized draft (sentinels inserted, branches
//! expanded) and computes reachability, longest-path depth, execution levels
//! and cycle findings. Depth follows the dependency rule
//! `depth(n) = 1 + max(depth(dep))`, which is what guarantees every edge
//! strictly increases depth.

use super::{Draft, DraftEdge, DraftNode, HandleType};
use crate::definition::{NodeId, NodeKind, WorkflowDefinition};
use crate::error::{BuildCode, BuildIssue};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Output of [`analyze`].
pub(crate) struct Analysis {
    pub reachable: HashSet<NodeId>,
    pub depth: HashMap<NodeId, usize>,
    pub levels: Vec<Vec<NodeId>>,
    /// Entry point first, then declared additional starts.
    pub roots: Vec<NodeId>,
}

/// Validate the raw definition and produce the initial draft.
pub(crate) fn validate_definition(
    definition: &WorkflowDefinition,
    errors: &mut Vec<BuildIssue>,
) -> Option<Draft> {
    if definition.name.trim().is_empty() {
        errors.push(BuildIssue::new(
            BuildCode::InvalidInput,
            "workflow name must not be empty",
        ));
    }
    if definition.nodes.is_empty() {
        errors.push(BuildIssue::new(BuildCode::NoNodes, "workflow has no nodes"));
        return None;
    }
    if !definition.nodes.contains_key(&definition.entry_point) {
        errors.push(BuildIssue::new(
            BuildCode::NoEntryPoint,
            format!("entry point '{}' is not a node", definition.entry_point),
        ));
    }

    let mut nodes = BTreeMap::new();
    for (node_id, node) in &definition.nodes {
        if node.node_type.trim().is_empty() {
            errors.push(BuildIssue::for_node(
                BuildCode::InvalidInput,
                node_id.clone(),
                "node type must not be empty",
            ));
            continue;
        }
        let kind = match NodeKind::parse(&node.node_type) {
            Some(kind) => kind,
            None => {
                errors.push(BuildIssue::for_node(
                    BuildCode::UnknownNodeType,
                    node_id.clone(),
                    format!("unknown node type '{}'", node.node_type),
                ));
                continue;
            }
        };
        if node.name.trim().is_empty() {
            errors.push(BuildIssue::for_node(
                BuildCode::InvalidInput,
                node_id.clone(),
                "node name must not be empty",
            ));
        }
        if !node.config.is_object() {
            errors.push(BuildIssue::for_node(
                BuildCode::InvalidInput,
                node_id.clone(),
                "node config must be a mapping",
            ));
        }
        if node.position.iter().any(|coordinate| !coordinate.is_finite()) {
            errors.push(BuildIssue::for_node(
                BuildCode::InvalidInput,
                node_id.clone(),
                "node position must be two finite coordinates",
            ));
        }
        nodes.insert(
            node_id.clone(),
            DraftNode {
                kind,
                name: node.name.clone(),
                config: node.config.clone(),
            },
        );
    }

    let mut edges = Vec::new();
    let mut seen_edge_ids = HashSet::new();
    for edge in &definition.edges {
        if !seen_edge_ids.insert(edge.id.clone()) {
            errors.push(BuildIssue::for_edge(
                BuildCode::InvalidInput,
                edge.id.clone(),
                format!("duplicate edge id '{}'", edge.id),
            ));
            continue;
        }
        let source_known = definition.nodes.contains_key(&edge.source);
        let target_known = definition.nodes.contains_key(&edge.target);
        if !source_known {
            errors.push(BuildIssue::for_edge(
                BuildCode::DanglingEdge,
                edge.id.clone(),
                format!("edge source '{}' does not exist", edge.source),
            ));
        }
        if !target_known {
            errors.push(BuildIssue::for_edge(
                BuildCode::DanglingEdge,
                edge.id.clone(),
                format!("edge target '{}' does not exist", edge.target),
            ));
        }
        if !source_known || !target_known {
            continue;
        }
        if edge.source == edge.target {
            errors.push(BuildIssue::for_edge(
                BuildCode::InvalidInput,
                edge.id.clone(),
                "self-loops are forbidden",
            ));
            continue;
        }
        let handle_type = match HandleType::parse(edge.source_handle.as_deref()) {
            Some(handle_type) => handle_type,
            None => {
                errors.push(BuildIssue::for_edge(
                    BuildCode::UnknownHandle,
                    edge.id.clone(),
                    format!(
                        "unknown source handle '{}'",
                        edge.source_handle.as_deref().unwrap_or("")
                    ),
                ));
                continue;
            }
        };
        if let Some(source_kind) = nodes.get(&edge.source).map(|node| node.kind) {
            validate_handle_for_kind(edge, source_kind, &handle_type, errors);
        }
        edges.push(DraftEdge {
            id: edge.id.clone(),
            source: edge.source.clone(),
            target: edge.target.clone(),
            source_handle: edge.source_handle.clone(),
            handle_type,
        });
    }

    validate_branch_handles(&nodes, &edges, errors);

    if errors.is_empty() {
        Some(Draft {
            entry: definition.entry_point.clone(),
            nodes,
            edges,
            loop_contexts: HashMap::new(),
            parallel_branches: HashMap::new(),
            branch_bindings: HashMap::new(),
        })
    } else {
        None
    }
}

fn validate_handle_for_kind(
    edge: &crate::definition::EdgeDefinition,
    source_kind: NodeKind,
    handle_type: &HandleType,
    errors: &mut Vec<BuildIssue>,
) {
    let legal = match source_kind {
        NodeKind::Conditional => matches!(
            handle_type,
            HandleType::True | HandleType::False | HandleType::Error
        ),
        NodeKind::Switch => matches!(
            handle_type,
            HandleType::Case(_) | HandleType::Default | HandleType::Error
        ),
        NodeKind::Loop => matches!(
            handle_type,
            HandleType::LoopBody | HandleType::LoopExit | HandleType::Default | HandleType::Error
        ),
        _ => matches!(handle_type, HandleType::Default | HandleType::Error),
    };
    if !legal {
        errors.push(BuildIssue::for_edge(
            BuildCode::UnknownHandle,
            edge.id.clone(),
            format!(
                "handle '{handle_type}' is not legal on a {} node",
                source_kind.as_str()
            ),
        ));
    }
}

/// Conditional branches must be unique; switch case values must be unique.
fn validate_branch_handles(
    nodes: &BTreeMap<NodeId, DraftNode>,
    edges: &[DraftEdge],
    errors: &mut Vec<BuildIssue>,
) {
    for (node_id, node) in nodes {
        match node.kind {
            NodeKind::Conditional => {
                for wanted in [HandleType::True, HandleType::False] {
                    let count = edges
                        .iter()
                        .filter(|edge| edge.source == *node_id && edge.handle_type == wanted)
                        .count();
                    if count > 1 {
                        errors.push(BuildIssue::for_node(
                            BuildCode::InvalidInput,
                            node_id.clone(),
                            format!("conditional has {count} '{wanted}' edges"),
                        ));
                    }
                }
            }
            NodeKind::Switch => {
                let mut seen_cases: HashMap<&str, &str> = HashMap::new();
                let mut default_count = 0usize;
                for edge in edges.iter().filter(|edge| edge.source == *node_id) {
                    match &edge.handle_type {
                        HandleType::Case(case) => {
                            if seen_cases.insert(case.as_str(), edge.id.as_str()).is_some() {
                                errors.push(BuildIssue::for_edge(
                                    BuildCode::DuplicateCase,
                                    edge.id.clone(),
                                    format!("duplicate case value '{case}'"),
                                ));
                            }
                        }
                        HandleType::Default => default_count += 1,
                        _ => {}
                    }
                }
                if default_count > 1 {
                    errors.push(BuildIssue::for_node(
                        BuildCode::InvalidInput,
                        node_id.clone(),
                        format!("switch has {default_count} default edges"),
                    ));
                }
            }
            _ => {}
        }
    }
}

/// Analyze the normalized draft: reachability, cycles, depth, levels.
pub(crate) fn analyze(
    draft: &Draft,
    errors: &mut Vec<BuildIssue>,
    warnings: &mut Vec<BuildIssue>,
) -> Option<Analysis> {
    let mut forward: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
    for edge in &draft.edges {
        forward.entry(&edge.source).or_default().push(&edge.target);
    }

    // Roots: the entry plus declared additional starts (nodes with no
    // in-edges whose config opts in).
    let has_in_edge: HashSet<&NodeId> = draft.edges.iter().map(|edge| &edge.target).collect();
    let mut roots: Vec<NodeId> = vec![draft.entry.clone()];
    for (node_id, node) in &draft.nodes {
        if *node_id == draft.entry || has_in_edge.contains(node_id) {
            continue;
        }
        let declared = node
            .config
            .get("additionalStart")
            .and_then(|flag| flag.as_bool())
            .unwrap_or(false);
        if declared {
            roots.push(node_id.clone());
        }
    }

    let mut reachable: HashSet<NodeId> = HashSet::new();
    let mut queue: VecDeque<&NodeId> = VecDeque::new();
    for root in &roots {
        if reachable.insert(root.clone()) {
            queue.push_back(root);
        }
    }
    while let Some(node_id) = queue.pop_front() {
        if let Some(targets) = forward.get(node_id) {
            for target in targets {
                if reachable.insert((*target).clone()) {
                    queue.push_back(*target);
                }
            }
        }
    }

    for (node_id, node) in &draft.nodes {
        if !reachable.contains(node_id) && !node.kind.is_sentinel() {
            warnings.push(BuildIssue::for_node(
                BuildCode::UnreachableNode,
                node_id.clone(),
                format!("node '{node_id}' is not reachable from the entry point"),
            ));
        }
    }

    if let Some(cycle_node) = find_cycle(&reachable, &forward) {
        errors.push(BuildIssue::for_node(
            BuildCode::Cycle,
            cycle_node.clone(),
            format!("cycle detected through node '{cycle_node}'"),
        ));
        return None;
    }

    // Kahn's algorithm over the reachable subgraph; doubles as the cycle
    // cross-check and yields the deterministic topological order the levels
    // are derived from.
    let mut in_degree: BTreeMap<&NodeId, usize> = BTreeMap::new();
    for node_id in &reachable {
        in_degree.insert(node_id, 0);
    }
    for edge in &draft.edges {
        if reachable.contains(&edge.source) && reachable.contains(&edge.target) {
            *in_degree.get_mut(&edge.target).expect("reachable target") += 1;
        }
    }
    let mut ready: VecDeque<&NodeId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(node_id, _)| *node_id)
        .collect();
    let mut depth: HashMap<NodeId, usize> = HashMap::new();
    for node_id in &ready {
        depth.insert((*node_id).clone(), 0);
    }
    let mut topological: Vec<NodeId> = Vec::with_capacity(reachable.len());
    while let Some(node_id) = ready.pop_front() {
        topological.push(node_id.clone());
        let node_depth = depth[node_id];
        if let Some(targets) = forward.get(node_id) {
            for target in targets {
                let target = *target;
                if !reachable.contains(target) {
                    continue;
                }
                let entry = depth.entry(target.clone()).or_insert(0);
                *entry = (*entry).max(node_depth + 1);
                let degree = in_degree.get_mut(target).expect("reachable target");
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(target);
                }
            }
        }
    }
    if topological.len() != reachable.len() {
        errors.push(BuildIssue::new(
            BuildCode::Cycle,
            "topological sort failed; graph contains a cycle",
        ));
        return None;
    }

    let max_depth = depth.values().copied().max().unwrap_or(0);
    let mut levels: Vec<Vec<NodeId>> = vec![Vec::new(); max_depth + 1];
    for node_id in &topological {
        levels[depth[node_id]].push(node_id.clone());
    }

    Some(Analysis {
        reachable,
        depth,
        levels,
        roots,
    })
}

/// Iterative DFS with an explicit recursion stack; returns a node on a cycle.
fn find_cycle<'a>(
    reachable: &'a HashSet<NodeId>,
    forward: &HashMap<&NodeId, Vec<&'a NodeId>>,
) -> Option<&'a NodeId> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut colors: HashMap<&NodeId, Color> =
        reachable.iter().map(|node_id| (node_id, Color::White)).collect();

    let mut ordered: Vec<&NodeId> = reachable.iter().collect();
    ordered.sort();

    for start in ordered {
        if colors[start] != Color::White {
            continue;
        }
        // Stack of (node, next child index).
        let mut stack: Vec<(&NodeId, usize)> = vec![(start, 0)];
        colors.insert(start, Color::Gray);
        while let Some((node_id, child_index)) = stack.pop() {
            let children = forward
                .get(node_id)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let mut advanced = false;
            for (offset, child) in children.iter().enumerate().skip(child_index) {
                let child = *child;
                if !reachable.contains(child) {
                    continue;
                }
                match colors[child] {
                    Color::Gray => return Some(child),
                    Color::White => {
                        stack.push((node_id, offset + 1));
                        stack.push((child, 0));
                        colors.insert(child, Color::Gray);
                        advanced = true;
                        break;
                    }
                    Color::Black => {}
                }
            }
            if !advanced {
                colors.insert(node_id, Color::Black);
            }
        }
    }
    None
}
