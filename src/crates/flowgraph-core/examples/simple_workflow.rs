//! Minimal end-to-end run: build a three-node workflow, execute it against
//! the in-memory runtime, print the outputs and the plan diagram.
//!
//! ```bash
//! cargo run --example simple_workflow -p flowgraph-core
//! ```

use flowgraph_core::viz::{visualize, VizOptions};
use flowgraph_core::{ExecutionRequest, Orchestrator, WorkflowDefinition};
use flowgraph_durable::{ActivityResult, InMemoryRuntime};
use serde_json::json;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.register_fn("transform", |request| {
        let name = request.node_config["name"].as_str().unwrap_or("world");
        ActivityResult::ok(json!({ "greeting": format!("hello, {name}!") }))
    });

    let definition: WorkflowDefinition = serde_json::from_value(json!({
        "name": "greeter",
        "entryPoint": "in",
        "nodes": {
            "in": {"type": "trigger", "name": "Input", "config": {}, "position": [0, 0]},
            "greet": {
                "type": "transform",
                "name": "Greet",
                "config": {"name": "{{inputs.name}}"},
                "position": [1, 0]
            },
            "out": {"type": "output", "name": "Output", "config": {}, "position": [2, 0]}
        },
        "edges": [
            {"id": "e1", "source": "in", "target": "greet"},
            {"id": "e2", "source": "greet", "target": "out"}
        ]
    }))?;

    let orchestrator = Orchestrator::new(runtime);
    let request = ExecutionRequest::new(definition.clone(), json!({"name": "ada"}));
    let outcome = orchestrator
        .submit(request)
        .await
        .expect("definition builds");

    println!("success: {}", outcome.success);
    println!("outputs: {}", serde_json::to_string_pretty(&outcome.outputs)?);
    println!(
        "nodes: {} | retries: {} | pruned: {}",
        outcome.metrics.node_count, outcome.metrics.retried_count,
        outcome.metrics.pruned_output_count,
    );

    let report = flowgraph_core::build(&definition);
    if let Some(workflow) = report.workflow {
        println!("\n{}", visualize(&workflow, &VizOptions::mermaid()));
    }
    Ok(())
}
