//! Property tests over generated DAGs: depth monotonicity, queue partition,
//! and drain-to-completion for arbitrary layered graphs.

use flowgraph_core::{build, ExecutionQueue, NodeState, WorkflowDefinition};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;

/// Build a definition from an adjacency matrix over `n` nodes. Node 0 is the
/// trigger; a spine edge `i-1 -> i` keeps every node reachable, extra
/// forward edges come from the matrix. Forward-only edges guarantee a DAG.
fn definition_from_matrix(n: usize, matrix: &[bool]) -> WorkflowDefinition {
    let mut nodes = serde_json::Map::new();
    for index in 0..n {
        let node_type = if index == 0 { "trigger" } else { "transform" };
        nodes.insert(
            format!("n{index}"),
            json!({
                "type": node_type,
                "name": format!("N{index}"),
                "config": {},
                "position": [index as f64, 0.0],
            }),
        );
    }

    let mut edges = Vec::new();
    for index in 1..n {
        edges.push(json!({
            "id": format!("spine{index}"),
            "source": format!("n{}", index - 1),
            "target": format!("n{index}"),
        }));
    }
    let mut cursor = 0;
    for source in 0..n {
        for target in (source + 1)..n {
            if target != source + 1 && matrix.get(cursor).copied().unwrap_or(false) {
                edges.push(json!({
                    "id": format!("x{source}_{target}"),
                    "source": format!("n{source}"),
                    "target": format!("n{target}"),
                }));
            }
            cursor += 1;
        }
    }

    serde_json::from_value(json!({
        "name": "generated",
        "entryPoint": "n0",
        "nodes": Value::Object(nodes),
        "edges": edges,
    }))
    .unwrap()
}

fn partition_sizes(queue: &ExecutionQueue) -> usize {
    [
        NodeState::Pending,
        NodeState::Ready,
        NodeState::Executing,
        NodeState::Completed,
        NodeState::Failed,
        NodeState::Skipped,
    ]
    .iter()
    .map(|state| queue.nodes_in(*state).len())
    .sum()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_depth_strictly_increases_along_edges(
        n in 2usize..8,
        matrix in proptest::collection::vec(any::<bool>(), 0..32),
    ) {
        let report = build(&definition_from_matrix(n, &matrix));
        prop_assert!(report.success(), "build failed: {:?}", report.errors);
        let workflow = report.workflow.unwrap();

        for edge in workflow.edges.values() {
            let source_depth = workflow.nodes[&edge.source].depth;
            let target_depth = workflow.nodes[&edge.target].depth;
            prop_assert!(
                target_depth > source_depth,
                "edge {} has depth {} -> {}",
                edge.id, source_depth, target_depth
            );
        }

        // Levels agree with node depths.
        for (level_index, level) in workflow.execution_levels.iter().enumerate() {
            for node_id in level {
                prop_assert_eq!(workflow.nodes[node_id].depth, level_index);
            }
        }
    }

    #[test]
    fn prop_queue_partitions_reachable_set_at_every_tick(
        n in 2usize..8,
        matrix in proptest::collection::vec(any::<bool>(), 0..32),
    ) {
        let report = build(&definition_from_matrix(n, &matrix));
        prop_assert!(report.success());
        let workflow = Arc::new(report.workflow.unwrap());
        let mut queue = ExecutionQueue::initialize(workflow.clone(), 100);

        let mut guard = 0;
        while !queue.is_complete() {
            prop_assert_eq!(partition_sizes(&queue), workflow.reachable_count());
            let ready = queue.get_ready(usize::MAX);
            prop_assert!(!ready.is_empty(), "queue stalled before completion");
            for node_id in ready {
                queue.mark_executing(std::slice::from_ref(&node_id));
                queue.mark_completed(&node_id, Arc::new(json!({})));
            }
            guard += 1;
            prop_assert!(guard <= n + 1, "drain did not converge");
        }
        prop_assert_eq!(partition_sizes(&queue), workflow.reachable_count());
        prop_assert_eq!(
            queue.nodes_in(NodeState::Completed).len(),
            workflow.reachable_count()
        );
    }

    #[test]
    fn prop_failure_skip_preserves_partition(
        n in 3usize..8,
        matrix in proptest::collection::vec(any::<bool>(), 0..32),
        victim in 1usize..7,
    ) {
        let report = build(&definition_from_matrix(n, &matrix));
        prop_assert!(report.success());
        let workflow = Arc::new(report.workflow.unwrap());
        let victim = format!("n{}", (victim % (n - 1)) + 1);
        let mut queue = ExecutionQueue::initialize(workflow.clone(), 100);

        let mut guard = 0;
        while !queue.is_complete() {
            let ready = queue.get_ready(usize::MAX);
            prop_assert!(!ready.is_empty());
            for node_id in ready {
                queue.mark_executing(std::slice::from_ref(&node_id));
                if node_id == victim {
                    queue.mark_failed(&node_id, None);
                } else {
                    queue.mark_completed(&node_id, Arc::new(json!({})));
                }
            }
            prop_assert_eq!(partition_sizes(&queue), workflow.reachable_count());
            guard += 1;
            prop_assert!(guard <= n + 1);
        }
        prop_assert_eq!(queue.nodes_in(NodeState::Failed).len(), 1);
    }
}
