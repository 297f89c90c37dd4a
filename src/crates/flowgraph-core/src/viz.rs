//! Plan visualization - render a [`BuiltWorkflow`] as Mermaid or DOT.
//!
//! Useful for documentation and for eyeballing what the builder actually
//! produced: sentinel insertion, branch expansion and edge typing are all
//! visible in the rendered graph, not just the authored shape.
//!
//! ```rust,no_run
//! use flowgraph_core::viz::{visualize, VizOptions};
//! # fn example(workflow: &flowgraph_core::BuiltWorkflow) {
//! let mermaid = visualize(workflow, &VizOptions::mermaid().with_title("Order flow"));
//! println!("```mermaid\n{mermaid}\n```");
//! # }
//! ```

use crate::builder::{BuiltWorkflow, HandleType};
use crate::definition::NodeKind;
use std::fmt::Write;

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VizFormat {
    /// Mermaid `flowchart TD`, renders natively on GitHub.
    Mermaid,
    /// DOT for Graphviz.
    Dot,
}

/// Rendering options.
#[derive(Debug, Clone)]
pub struct VizOptions {
    pub format: VizFormat,
    /// Label edges with their handle type (`true`, `case-x`, `error`, ...).
    pub edge_labels: bool,
    pub title: Option<String>,
}

impl Default for VizOptions {
    fn default() -> Self {
        Self {
            format: VizFormat::Mermaid,
            edge_labels: true,
            title: None,
        }
    }
}

impl VizOptions {
    pub fn mermaid() -> Self {
        Self::default()
    }

    pub fn dot() -> Self {
        Self {
            format: VizFormat::Dot,
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn without_edge_labels(mut self) -> Self {
        self.edge_labels = false;
        self
    }
}

/// Render the plan in the requested format.
pub fn visualize(workflow: &BuiltWorkflow, options: &VizOptions) -> String {
    match options.format {
        VizFormat::Mermaid => render_mermaid(workflow, options),
        VizFormat::Dot => render_dot(workflow, options),
    }
}

fn sorted_node_ids(workflow: &BuiltWorkflow) -> Vec<&String> {
    let mut ids: Vec<&String> = workflow.nodes.keys().collect();
    ids.sort();
    ids
}

fn sorted_edge_ids(workflow: &BuiltWorkflow) -> Vec<&String> {
    let mut ids: Vec<&String> = workflow.edges.keys().collect();
    ids.sort();
    ids
}

// Mermaid node ids must avoid special characters; plan ids may carry
// sentinel suffixes with underscores which are fine as-is.
fn mermaid_shape(kind: NodeKind, id: &str, name: &str) -> String {
    match kind {
        NodeKind::Trigger => format!("{id}([{name}])"),
        NodeKind::Conditional | NodeKind::Switch => format!("{id}{{{name}}}"),
        NodeKind::Output => format!("{id}[[{name}]]"),
        NodeKind::LoopStart | NodeKind::LoopEnd => format!("{id}((({name})))"),
        _ => format!("{id}[{name}]"),
    }
}

fn render_mermaid(workflow: &BuiltWorkflow, options: &VizOptions) -> String {
    let mut out = String::new();
    if let Some(title) = &options.title {
        let _ = writeln!(out, "---\ntitle: {title}\n---");
    }
    out.push_str("flowchart TD\n");
    for id in sorted_node_ids(workflow) {
        let node = &workflow.nodes[id];
        let _ = writeln!(out, "    {}", mermaid_shape(node.kind, id, &node.name));
    }
    for edge_id in sorted_edge_ids(workflow) {
        let edge = &workflow.edges[edge_id];
        let arrow = match (&edge.handle_type, options.edge_labels) {
            (HandleType::Error, true) => "-. error .->".to_string(),
            (HandleType::Error, false) => "-.->".to_string(),
            (HandleType::Default, _) => "-->".to_string(),
            (handle, true) => format!("-- {handle} -->"),
            (_, false) => "-->".to_string(),
        };
        let _ = writeln!(out, "    {} {} {}", edge.source, arrow, edge.target);
    }
    out
}

fn render_dot(workflow: &BuiltWorkflow, options: &VizOptions) -> String {
    let mut out = String::new();
    out.push_str("digraph workflow {\n");
    out.push_str("    rankdir=TB;\n");
    if let Some(title) = &options.title {
        let _ = writeln!(out, "    label=\"{title}\";");
    }
    for id in sorted_node_ids(workflow) {
        let node = &workflow.nodes[id];
        let shape = match node.kind {
            NodeKind::Trigger => "ellipse",
            NodeKind::Conditional | NodeKind::Switch => "diamond",
            NodeKind::Output => "doubleoctagon",
            NodeKind::LoopStart | NodeKind::LoopEnd => "point",
            _ => "box",
        };
        let _ = writeln!(out, "    \"{id}\" [label=\"{}\", shape={shape}];", node.name);
    }
    for edge_id in sorted_edge_ids(workflow) {
        let edge = &workflow.edges[edge_id];
        let mut attributes = Vec::new();
        if options.edge_labels && edge.handle_type != HandleType::Default {
            attributes.push(format!("label=\"{}\"", edge.handle_type));
        }
        if edge.handle_type == HandleType::Error {
            attributes.push("style=dashed".to_string());
        }
        let suffix = if attributes.is_empty() {
            String::new()
        } else {
            format!(" [{}]", attributes.join(", "))
        };
        let _ = writeln!(out, "    \"{}\" -> \"{}\"{};", edge.source, edge.target, suffix);
    }
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build;
    use crate::definition::WorkflowDefinition;
    use serde_json::json;

    fn sample() -> BuiltWorkflow {
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "name": "viz", "entryPoint": "in",
            "nodes": {
                "in": {"type": "trigger", "name": "In", "config": {}, "position": [0, 0]},
                "c": {"type": "conditional", "name": "Check", "config": {}, "position": [1, 0]},
                "a": {"type": "transform", "name": "A", "config": {}, "position": [2, 0]},
                "b": {"type": "transform", "name": "B", "config": {}, "position": [2, 1]},
                "rescue": {"type": "transform", "name": "Rescue", "config": {}, "position": [3, 0]},
            },
            "edges": [
                {"id": "e1", "source": "in", "target": "c"},
                {"id": "e2", "source": "c", "target": "a", "sourceHandle": "true"},
                {"id": "e3", "source": "c", "target": "b", "sourceHandle": "false"},
                {"id": "e4", "source": "a", "target": "rescue", "sourceHandle": "error"},
            ]
        }))
        .unwrap();
        build(&definition).workflow.unwrap()
    }

    #[test]
    fn test_mermaid_renders_shapes_and_labels() {
        let workflow = sample();
        let rendered = visualize(&workflow, &VizOptions::mermaid());
        assert!(rendered.starts_with("flowchart TD"));
        assert!(rendered.contains("in([In])"));
        assert!(rendered.contains("c{Check}"));
        assert!(rendered.contains("c -- true --> a"));
        assert!(rendered.contains("a -. error .-> rescue"));
    }

    #[test]
    fn test_mermaid_title_front_matter() {
        let workflow = sample();
        let rendered = visualize(&workflow, &VizOptions::mermaid().with_title("Demo"));
        assert!(rendered.starts_with("---\ntitle: Demo\n---"));
    }

    #[test]
    fn test_dot_renders_digraph() {
        let workflow = sample();
        let rendered = visualize(&workflow, &VizOptions::dot());
        assert!(rendered.starts_with("digraph workflow {"));
        assert!(rendered.contains("\"c\" [label=\"Check\", shape=diamond];"));
        assert!(rendered.contains("\"c\" -> \"a\" [label=\"true\"];"));
        assert!(rendered.contains("\"a\" -> \"rescue\" [label=\"error\", style=dashed];"));
        assert!(rendered.trim_end().ends_with('}'));
    }

    #[test]
    fn test_edge_labels_can_be_suppressed() {
        let workflow = sample();
        let rendered = visualize(&workflow, &VizOptions::mermaid().without_edge_labels());
        assert!(!rendered.contains("-- true -->"));
        assert!(rendered.contains("c --> a"));
    }
}
