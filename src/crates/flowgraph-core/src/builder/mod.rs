//! Graph builder - turns a [`WorkflowDefinition`] into a [`BuiltWorkflow`].
//!
//! The builder is the only place graph semantics are decided; every later
//! component treats the built plan as ground truth. The pipeline runs four
//! stages, each feeding the next:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ 1. Structure      validate nodes/edges/handles              │
//! │ 2. Loops          sentinel pairs, body discovery            │
//! │ 3. Parallel       branch duplication, edge re-pointing      │
//! │ 4. Analysis       reachability, depth, cycles, levels,      │
//! │                   edge typing caches, template validation   │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The result is a [`BuildReport`]: either a plan plus warnings, or a list
//! of structured [`BuildIssue`]s. Build errors surface here, synchronously;
//! execution never starts on a failed build.

pub mod analysis;
pub mod expand;
pub mod loops;

use crate::definition::{EdgeId, LoopKind, NodeId, NodeKind, WorkflowDefinition};
use crate::error::{BuildCode, BuildIssue};
use crate::interpolate;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Suffix of the builder-injected loop start sentinel.
pub const LOOP_START_SUFFIX: &str = "__LOOP_START";
/// Suffix of the builder-injected loop end sentinel.
pub const LOOP_END_SUFFIX: &str = "__LOOP_END";

/// Default in-flight activity bound when the submission does not override it.
pub const DEFAULT_MAX_CONCURRENT_NODES: usize = 10;

/// Typed classification of an edge's source handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandleType {
    Default,
    True,
    False,
    Case(String),
    Error,
    LoopBody,
    LoopExit,
}

impl HandleType {
    /// Map a raw handle string. Empty, `output` and `default` all mean the
    /// default handle; unknown strings are rejected by the builder.
    pub fn parse(handle: Option<&str>) -> Option<HandleType> {
        let handle = match handle {
            None => return Some(HandleType::Default),
            Some(h) => h,
        };
        match handle {
            "" | "output" | "default" => Some(HandleType::Default),
            "true" => Some(HandleType::True),
            "false" => Some(HandleType::False),
            "error" => Some(HandleType::Error),
            "loop-body" => Some(HandleType::LoopBody),
            "loop-exit" => Some(HandleType::LoopExit),
            other => other
                .strip_prefix("case-")
                .map(|case| HandleType::Case(case.to_string())),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, HandleType::Error)
    }
}

impl std::fmt::Display for HandleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandleType::Default => write!(f, "default"),
            HandleType::True => write!(f, "true"),
            HandleType::False => write!(f, "false"),
            HandleType::Case(case) => write!(f, "case-{case}"),
            HandleType::Error => write!(f, "error"),
            HandleType::LoopBody => write!(f, "loop-body"),
            HandleType::LoopExit => write!(f, "loop-exit"),
        }
    }
}

/// One edge of the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedEdge {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    pub source_handle: Option<String>,
    pub target_handle: Option<String>,
    pub handle_type: HandleType,
}

/// Binding of an expanded node to its parallel branch.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchBinding {
    pub parallel_node_id: NodeId,
    pub branch_id: String,
    /// Variables overlaid on the context while this node runs.
    pub variables: Map<String, Value>,
}

/// One node of the plan.
#[derive(Debug, Clone)]
pub struct ExecutableNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub name: String,
    pub config: Value,
    /// Longest-path depth from the trigger: `1 + max(depth of dependencies)`.
    pub depth: usize,
    pub dependencies: Vec<NodeId>,
    pub dependents: Vec<NodeId>,
    /// Set on nodes created by parallel branch expansion.
    pub branch: Option<BranchBinding>,
}

/// Compiled description of one loop.
#[derive(Debug, Clone)]
pub struct LoopContext {
    pub loop_node_id: NodeId,
    pub kind: LoopKind,
    pub array_path: Option<String>,
    pub condition: Option<String>,
    pub count: Option<u64>,
    /// Nodes re-admitted on every iteration (loop node and sentinels excluded).
    pub body_nodes: HashSet<NodeId>,
    pub start_sentinel_id: NodeId,
    pub end_sentinel_id: NodeId,
}

/// The execution plan: immutable once built.
#[derive(Debug, Clone)]
pub struct BuiltWorkflow {
    pub name: String,
    pub version: u32,
    pub nodes: HashMap<NodeId, ExecutableNode>,
    pub edges: HashMap<EdgeId, TypedEdge>,
    /// Node IDs grouped by depth; order within a level is topological
    /// discovery order and breaks scheduling ties.
    pub execution_levels: Vec<Vec<NodeId>>,
    pub trigger_node_id: NodeId,
    /// Nodes without in-edges that the definition declared as extra starts.
    pub additional_start_ids: Vec<NodeId>,
    pub output_node_ids: HashSet<NodeId>,
    pub loop_contexts: HashMap<NodeId, LoopContext>,
    pub parallel_branches: HashMap<NodeId, Vec<String>>,
    pub max_concurrent_nodes: usize,
    out_edges: HashMap<NodeId, Vec<EdgeId>>,
    in_edges: HashMap<NodeId, Vec<EdgeId>>,
    level_position: HashMap<NodeId, (usize, usize)>,
    exclusive_downstream: HashMap<EdgeId, Vec<NodeId>>,
    template_refs: HashMap<NodeId, HashSet<NodeId>>,
    reachable: HashSet<NodeId>,
}

impl BuiltWorkflow {
    pub fn node(&self, id: &str) -> Option<&ExecutableNode> {
        self.nodes.get(id)
    }

    pub fn edge(&self, id: &str) -> Option<&TypedEdge> {
        self.edges.get(id)
    }

    pub fn out_edge_ids(&self, node_id: &str) -> &[EdgeId] {
        self.out_edges.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn in_edge_ids(&self, node_id: &str) -> &[EdgeId] {
        self.in_edges.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_reachable(&self, node_id: &str) -> bool {
        self.reachable.contains(node_id)
    }

    pub fn reachable_count(&self) -> usize {
        self.reachable.len()
    }

    pub fn reachable_nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.reachable.iter()
    }

    /// `(depth, position within level)` scheduling key.
    pub fn level_position(&self, node_id: &str) -> (usize, usize) {
        self.level_position
            .get(node_id)
            .copied()
            .unwrap_or((usize::MAX, usize::MAX))
    }

    /// Nodes reachable from the trigger *only* through the given edge.
    pub fn exclusive_downstream(&self, edge_id: &str) -> &[NodeId] {
        self.exclusive_downstream
            .get(edge_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Node IDs referenced by a node's config templates.
    pub fn template_refs(&self, node_id: &str) -> Option<&HashSet<NodeId>> {
        self.template_refs.get(node_id)
    }

    pub fn has_error_edge(&self, node_id: &str) -> bool {
        self.out_edge_ids(node_id)
            .iter()
            .any(|edge_id| self.edges[edge_id].handle_type.is_error())
    }
}

/// Outcome of [`build`]: the plan, or structured findings.
#[derive(Debug)]
pub struct BuildReport {
    pub workflow: Option<BuiltWorkflow>,
    pub errors: Vec<BuildIssue>,
    pub warnings: Vec<BuildIssue>,
}

impl BuildReport {
    pub fn success(&self) -> bool {
        self.workflow.is_some() && self.errors.is_empty()
    }

    fn failed(errors: Vec<BuildIssue>, warnings: Vec<BuildIssue>) -> Self {
        Self {
            workflow: None,
            errors,
            warnings,
        }
    }
}

// Working representation shared by the pipeline stages.
pub(crate) struct Draft {
    pub entry: NodeId,
    pub nodes: BTreeMap<NodeId, DraftNode>,
    pub edges: Vec<DraftEdge>,
    pub loop_contexts: HashMap<NodeId, LoopContext>,
    pub parallel_branches: HashMap<NodeId, Vec<String>>,
    pub branch_bindings: HashMap<NodeId, BranchBinding>,
}

#[derive(Debug, Clone)]
pub(crate) struct DraftNode {
    pub kind: NodeKind,
    pub name: String,
    pub config: Value,
}

#[derive(Debug, Clone)]
pub(crate) struct DraftEdge {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    pub source_handle: Option<String>,
    pub handle_type: HandleType,
}

/// Build a workflow definition into an execution plan.
pub fn build(definition: &WorkflowDefinition) -> BuildReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let mut draft = match analysis::validate_definition(definition, &mut errors) {
        Some(draft) => draft,
        None => return BuildReport::failed(errors, warnings),
    };

    loops::normalize_loops(&mut draft, &mut errors);
    if !errors.is_empty() {
        return BuildReport::failed(errors, warnings);
    }

    expand::expand_parallels(&mut draft, &mut errors);
    if !errors.is_empty() {
        return BuildReport::failed(errors, warnings);
    }

    // Parallel expansion may have renamed loop-body members.
    loops::recompute_bodies(&mut draft);

    let analysis = match analysis::analyze(&draft, &mut errors, &mut warnings) {
        Some(analysis) => analysis,
        None => return BuildReport::failed(errors, warnings),
    };

    assemble(definition, draft, analysis, errors, warnings)
}

fn assemble(
    definition: &WorkflowDefinition,
    draft: Draft,
    analysis: analysis::Analysis,
    mut errors: Vec<BuildIssue>,
    warnings: Vec<BuildIssue>,
) -> BuildReport {
    let mut out_edges: HashMap<NodeId, Vec<EdgeId>> = HashMap::new();
    let mut in_edges: HashMap<NodeId, Vec<EdgeId>> = HashMap::new();
    let mut edges = HashMap::new();
    for edge in &draft.edges {
        out_edges
            .entry(edge.source.clone())
            .or_default()
            .push(edge.id.clone());
        in_edges
            .entry(edge.target.clone())
            .or_default()
            .push(edge.id.clone());
        edges.insert(
            edge.id.clone(),
            TypedEdge {
                id: edge.id.clone(),
                source: edge.source.clone(),
                target: edge.target.clone(),
                source_handle: edge.source_handle.clone(),
                target_handle: None,
                handle_type: edge.handle_type.clone(),
            },
        );
    }

    let mut nodes = HashMap::new();
    for (id, draft_node) in &draft.nodes {
        let mut dependencies: Vec<NodeId> = in_edges
            .get(id)
            .map(|edge_ids| {
                edge_ids
                    .iter()
                    .map(|edge_id| edges[edge_id].source.clone())
                    .collect()
            })
            .unwrap_or_default();
        dependencies.sort();
        dependencies.dedup();
        let mut dependents: Vec<NodeId> = out_edges
            .get(id)
            .map(|edge_ids| {
                edge_ids
                    .iter()
                    .map(|edge_id| edges[edge_id].target.clone())
                    .collect()
            })
            .unwrap_or_default();
        dependents.sort();
        dependents.dedup();

        nodes.insert(
            id.clone(),
            ExecutableNode {
                id: id.clone(),
                kind: draft_node.kind,
                name: draft_node.name.clone(),
                config: draft_node.config.clone(),
                depth: analysis.depth.get(id).copied().unwrap_or(0),
                dependencies,
                dependents,
                branch: draft.branch_bindings.get(id).cloned(),
            },
        );
    }

    let mut level_position = HashMap::new();
    for (level_index, level) in analysis.levels.iter().enumerate() {
        for (position, node_id) in level.iter().enumerate() {
            level_position.insert(node_id.clone(), (level_index, position));
        }
    }

    let mut output_node_ids: HashSet<NodeId> = nodes
        .values()
        .filter(|node| node.kind == NodeKind::Output && analysis.reachable.contains(&node.id))
        .map(|node| node.id.clone())
        .collect();
    if output_node_ids.is_empty() {
        // No declared outputs: the reachable leaves are the outputs.
        output_node_ids = analysis
            .reachable
            .iter()
            .filter(|id| out_edges.get(*id).map(Vec::is_empty).unwrap_or(true))
            .cloned()
            .collect();
    }

    let exclusive_downstream =
        compute_exclusive_downstream(&analysis, &draft.edges, &out_edges);

    let template_refs = validate_templates(&draft, &analysis, &mut errors);
    if !errors.is_empty() {
        return BuildReport::failed(errors, warnings);
    }

    let workflow = BuiltWorkflow {
        name: definition.name.clone(),
        version: definition.version,
        nodes,
        edges,
        execution_levels: analysis.levels,
        trigger_node_id: draft.entry,
        additional_start_ids: analysis
            .roots
            .iter()
            .skip(1)
            .cloned()
            .collect(),
        output_node_ids,
        loop_contexts: draft.loop_contexts,
        parallel_branches: draft.parallel_branches,
        max_concurrent_nodes: DEFAULT_MAX_CONCURRENT_NODES,
        out_edges,
        in_edges,
        level_position,
        exclusive_downstream,
        template_refs,
        reachable: analysis.reachable,
    };

    BuildReport {
        workflow: Some(workflow),
        errors,
        warnings,
    }
}

/// Per-edge cache: which reachable nodes lose their last path when the edge
/// is removed. Branch pruning consults this at runtime.
fn compute_exclusive_downstream(
    analysis: &analysis::Analysis,
    draft_edges: &[DraftEdge],
    out_edges: &HashMap<NodeId, Vec<EdgeId>>,
) -> HashMap<EdgeId, Vec<NodeId>> {
    let targets: HashMap<&EdgeId, &NodeId> = draft_edges
        .iter()
        .map(|edge| (&edge.id, &edge.target))
        .collect();

    let mut result = HashMap::new();
    for edge in draft_edges {
        if !analysis.reachable.contains(&edge.source) {
            continue;
        }
        let mut visited: HashSet<&NodeId> = analysis.roots.iter().collect();
        let mut queue: VecDeque<&NodeId> = analysis.roots.iter().collect();
        while let Some(node_id) = queue.pop_front() {
            if let Some(edge_ids) = out_edges.get(node_id) {
                for edge_id in edge_ids {
                    if *edge_id == edge.id {
                        continue;
                    }
                    if let Some(target) = targets.get(edge_id).copied() {
                        if visited.insert(target) {
                            queue.push_back(target);
                        }
                    }
                }
            }
        }
        let mut exclusive: Vec<NodeId> = analysis
            .reachable
            .iter()
            .filter(|node_id| !visited.contains(node_id))
            .cloned()
            .collect();
        exclusive.sort();
        result.insert(edge.id.clone(), exclusive);
    }
    result
}

/// Invariant: every node ID used inside a template resolves to a node at a
/// strictly smaller depth. Loop-node configs are judged at the end-sentinel
/// depth, because their `condition`/`arrayPath` templates are evaluated by
/// the sentinels rather than at the loop head.
fn validate_templates(
    draft: &Draft,
    analysis: &analysis::Analysis,
    errors: &mut Vec<BuildIssue>,
) -> HashMap<NodeId, HashSet<NodeId>> {
    let mut template_refs: HashMap<NodeId, HashSet<NodeId>> = HashMap::new();

    for (node_id, node) in &draft.nodes {
        if node.kind.is_sentinel() || !analysis.reachable.contains(node_id) {
            // Unreachable nodes still get malformed-template findings.
            let (_, malformed) = interpolate::collect_template_refs(&node.config);
            for token in malformed {
                errors.push(BuildIssue::for_node(
                    BuildCode::InvalidVariableRef,
                    node_id.clone(),
                    format!("malformed template {token}"),
                ));
            }
            continue;
        }

        let effective_depth = if node.kind == NodeKind::Loop {
            draft
                .loop_contexts
                .get(node_id)
                .and_then(|lc| analysis.depth.get(&lc.end_sentinel_id))
                .copied()
                .unwrap_or_else(|| analysis.depth.get(node_id).copied().unwrap_or(0))
        } else {
            analysis.depth.get(node_id).copied().unwrap_or(0)
        };

        let (refs, malformed) = interpolate::collect_template_refs(&node.config);
        for token in malformed {
            errors.push(BuildIssue::for_node(
                BuildCode::InvalidVariableRef,
                node_id.clone(),
                format!("malformed template {token}"),
            ));
        }

        let mut referenced = HashSet::new();
        for reference in refs {
            if reference.root == "inputs" {
                continue;
            }
            if !draft.nodes.contains_key(&reference.root) {
                // Variable reference; nothing to check statically.
                continue;
            }
            if reference.output_node().is_none() {
                errors.push(BuildIssue::for_node(
                    BuildCode::InvalidVariableRef,
                    node_id.clone(),
                    format!(
                        "reference to node '{}' must go through '.output'",
                        reference.root
                    ),
                ));
                continue;
            }
            if !analysis.reachable.contains(&reference.root) {
                errors.push(BuildIssue::for_node(
                    BuildCode::InvalidVariableRef,
                    node_id.clone(),
                    format!("referenced node '{}' is unreachable", reference.root),
                ));
                continue;
            }
            let referenced_depth = analysis.depth.get(&reference.root).copied().unwrap_or(0);
            if referenced_depth >= effective_depth {
                errors.push(BuildIssue::for_node(
                    BuildCode::InvalidVariableRef,
                    node_id.clone(),
                    format!(
                        "referenced node '{}' does not execute before '{}'",
                        reference.root, node_id
                    ),
                ));
                continue;
            }
            referenced.insert(reference.root.clone());
        }
        if !referenced.is_empty() {
            template_refs.insert(node_id.clone(), referenced);
        }
    }
    template_refs
}
