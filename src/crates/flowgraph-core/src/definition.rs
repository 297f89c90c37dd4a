//! Workflow definition model - the user-authored input artifact.
//!
//! A [`WorkflowDefinition`] is what the platform submits: named, versioned,
//! with a node map and an ordered edge list. Node configs are free-form value
//! trees whose string leaves may carry `{{...}}` templates; the node *kind*
//! however is closed ([`NodeKind`]) and unknown kinds are rejected at build
//! time. Wire format is camelCase JSON (or YAML with the same field names).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Node identifier - unique name for each node in the workflow.
pub type NodeId = String;

/// Edge identifier - unique per definition.
pub type EdgeId = String;

/// A user-authored workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub version: u32,
    /// Node ID where execution begins (the trigger).
    pub entry_point: NodeId,
    /// Nodes by ID. A `BTreeMap` keeps definition traversal deterministic.
    pub nodes: BTreeMap<NodeId, NodeDefinition>,
    /// Ordered edge list. Self-loops are forbidden.
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

/// One node of a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDefinition {
    /// Kind string; must parse via [`NodeKind::parse`].
    #[serde(rename = "type")]
    pub node_type: String,
    pub name: String,
    /// Free-form config tree. String leaves may contain `{{...}}` templates.
    #[serde(default = "empty_config")]
    pub config: Value,
    /// Editor coordinates. Carried through but not interpreted by the engine.
    #[serde(default)]
    pub position: [f64; 2],
}

fn empty_config() -> Value {
    Value::Object(Map::new())
}

/// One edge of a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDefinition {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    /// Named socket the edge originates from (`true`, `false`, `case-<v>`,
    /// `error`, `loop-body`, `loop-exit`). Empty or `output` means the
    /// default handle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

/// Closed set of node kinds.
///
/// The first twelve parse from definition `type` strings; `LoopStart` and
/// `LoopEnd` are builder-injected sentinels and never appear in definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Trigger,
    Llm,
    Http,
    Database,
    File,
    Transform,
    Conditional,
    Switch,
    Loop,
    Parallel,
    HumanReview,
    Output,
    LoopStart,
    LoopEnd,
}

impl NodeKind {
    /// Parse a definition `type` string. Sentinel kinds are not parseable.
    pub fn parse(s: &str) -> Option<NodeKind> {
        match s {
            "trigger" => Some(NodeKind::Trigger),
            "llm" => Some(NodeKind::Llm),
            "http" => Some(NodeKind::Http),
            "database" => Some(NodeKind::Database),
            "file" => Some(NodeKind::File),
            "transform" => Some(NodeKind::Transform),
            "conditional" => Some(NodeKind::Conditional),
            "switch" => Some(NodeKind::Switch),
            "loop" => Some(NodeKind::Loop),
            "parallel" => Some(NodeKind::Parallel),
            "human_review" => Some(NodeKind::HumanReview),
            "output" => Some(NodeKind::Output),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Trigger => "trigger",
            NodeKind::Llm => "llm",
            NodeKind::Http => "http",
            NodeKind::Database => "database",
            NodeKind::File => "file",
            NodeKind::Transform => "transform",
            NodeKind::Conditional => "conditional",
            NodeKind::Switch => "switch",
            NodeKind::Loop => "loop",
            NodeKind::Parallel => "parallel",
            NodeKind::HumanReview => "human_review",
            NodeKind::Output => "output",
            NodeKind::LoopStart => "loop_start",
            NodeKind::LoopEnd => "loop_end",
        }
    }

    /// Builder-injected kinds that never execute through the activity
    /// contract.
    pub fn is_sentinel(self) -> bool {
        matches!(self, NodeKind::LoopStart | NodeKind::LoopEnd)
    }

    /// Kinds the dispatcher resolves inline instead of sending to a handler.
    pub fn executes_inline(self) -> bool {
        matches!(
            self,
            NodeKind::Trigger
                | NodeKind::Loop
                | NodeKind::Parallel
                | NodeKind::Output
                | NodeKind::LoopStart
                | NodeKind::LoopEnd
        )
    }
}

/// Iteration strategy of a `loop` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoopKind {
    ForEach,
    While,
    Count,
}

/// Typed view of a `loop` node's config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    pub kind: LoopKind,
    /// Template or bare reference resolving to the iterated array
    /// (`forEach` only).
    #[serde(default)]
    pub array_path: Option<String>,
    /// Template evaluated after every pass (`while` only); truthy continues.
    #[serde(default)]
    pub condition: Option<String>,
    /// Fixed iteration count (`count` only).
    #[serde(default)]
    pub count: Option<u64>,
}

/// One declared branch of a `parallel` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchDecl {
    pub id: String,
    /// Variables overlaid on the context while this branch's nodes run.
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// Typed view of a `parallel` node's config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelConfig {
    pub branches: Vec<BranchDecl>,
    /// Node where the expanded branches reconverge.
    pub join: NodeId,
}
