//! End-to-end scenarios driven through the orchestrator against the
//! in-memory reference runtime.

use async_trait::async_trait;
use flowgraph_core::{
    CancelToken, EventKind, ExecutionEvent, ExecutionOptions, ExecutionRequest, Orchestrator,
    RetryPolicy, WorkflowDefinition,
};
use flowgraph_durable::{
    ActivityErrorKind, ActivityRequest, ActivityResult, InMemoryRuntime, NodeHandler,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn definition(value: Value) -> WorkflowDefinition {
    serde_json::from_value(value).unwrap()
}

fn node(node_type: &str, name: &str) -> Value {
    json!({"type": node_type, "name": name, "config": {}, "position": [0.0, 0.0]})
}

fn request_with(
    def: Value,
    inputs: Value,
    options: ExecutionOptions,
) -> ExecutionRequest {
    ExecutionRequest {
        execution_id: "exec-test".to_string(),
        definition: definition(def),
        inputs,
        options,
    }
}

fn node_events(events: &[ExecutionEvent], kind: EventKind) -> Vec<String> {
    events
        .iter()
        .filter(|event| event.kind == kind)
        .filter_map(|event| event.payload.get("nodeId").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

fn drain(mut rx: mpsc::UnboundedReceiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_linear_flow_produces_output_and_ordered_events() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.register_fn("transform", |_| ActivityResult::ok(json!({"x": 2})));

    let orchestrator = Orchestrator::new(runtime);
    let (tx, rx) = mpsc::unbounded_channel();
    let request = request_with(
        json!({
            "name": "linear", "entryPoint": "in",
            "nodes": {
                "in": node("trigger", "Input"),
                "t": node("transform", "T"),
                "out": node("output", "Output"),
            },
            "edges": [
                {"id": "e1", "source": "in", "target": "t"},
                {"id": "e2", "source": "t", "target": "out"},
            ]
        }),
        json!({}),
        ExecutionOptions::default(),
    );

    let outcome = orchestrator
        .submit_with(request, CancelToken::new(), Some(tx))
        .await
        .expect("build succeeds");

    assert!(outcome.success, "error: {:?}", outcome.error);
    assert_eq!(outcome.outputs["out"], json!({"x": 2}));
    assert_eq!(outcome.metrics.node_count, 3);

    let events = drain(rx);
    assert_eq!(
        node_events(&events, EventKind::NodeStarted),
        ["in", "t", "out"]
    );
    assert_eq!(
        node_events(&events, EventKind::NodeCompleted),
        ["in", "t", "out"]
    );
    // Logical timestamps are strictly increasing.
    let timestamps: Vec<u64> = events.iter().map(|event| event.timestamp).collect();
    assert!(timestamps.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(events.first().unwrap().kind, EventKind::ExecutionStarted);
    assert_eq!(events.last().unwrap().kind, EventKind::ExecutionCompleted);
}

#[tokio::test]
async fn test_rate_limit_backs_off_then_succeeds() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    runtime.register_fn("http", move |_| {
        if seen.fetch_add(1, Ordering::SeqCst) < 2 {
            ActivityResult::rate_limited("too many requests", None)
        } else {
            ActivityResult::ok(json!({"ok": true}))
        }
    });

    let orchestrator = Orchestrator::new(runtime.clone());
    let options = ExecutionOptions {
        retry_policy: Some(
            RetryPolicy::new(3).with_base_delay(100).with_multiplier(2.0),
        ),
        ..Default::default()
    };
    let request = request_with(
        json!({
            "name": "retry", "entryPoint": "in",
            "nodes": {
                "in": node("trigger", "In"),
                "api": node("http", "Api"),
            },
            "edges": [{"id": "e1", "source": "in", "target": "api"}]
        }),
        json!({}),
        options,
    );

    let outcome = orchestrator.submit(request).await.expect("build succeeds");
    assert!(outcome.success);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.metrics.retried_count, 2);
    assert_eq!(
        runtime.recorded_sleeps(),
        vec![Duration::from_millis(100), Duration::from_millis(200)]
    );
}

#[tokio::test]
async fn test_server_retry_hint_wins_over_backoff() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    runtime.register_fn("http", move |_| {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            ActivityResult::rate_limited("hinted", Some(2))
        } else {
            ActivityResult::ok(json!({}))
        }
    });

    let orchestrator = Orchestrator::new(runtime.clone());
    let request = request_with(
        json!({
            "name": "hint", "entryPoint": "in",
            "nodes": {"in": node("trigger", "In"), "api": node("http", "Api")},
            "edges": [{"id": "e1", "source": "in", "target": "api"}]
        }),
        json!({}),
        ExecutionOptions::default(),
    );
    let outcome = orchestrator.submit(request).await.unwrap();
    assert!(outcome.success);
    assert_eq!(runtime.recorded_sleeps(), vec![Duration::from_secs(2)]);
}

#[tokio::test]
async fn test_conditional_false_branch_prunes_true_subtree() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.register_fn("conditional", |_| {
        ActivityResult::ok(json!({"result": false}))
    });
    runtime.register_fn("transform", |req| {
        ActivityResult::ok(json!({"from": req.meta.node_id}))
    });

    let orchestrator = Orchestrator::new(runtime);
    let (tx, rx) = mpsc::unbounded_channel();
    let request = request_with(
        json!({
            "name": "diamond", "entryPoint": "in",
            "nodes": {
                "in": node("trigger", "In"),
                "c": node("conditional", "C"),
                "a": node("transform", "A"),
                "b": node("transform", "B"),
                "out": node("output", "Out"),
            },
            "edges": [
                {"id": "e1", "source": "in", "target": "c"},
                {"id": "e2", "source": "c", "target": "a", "sourceHandle": "true"},
                {"id": "e3", "source": "c", "target": "b", "sourceHandle": "false"},
                {"id": "e4", "source": "a", "target": "out"},
                {"id": "e5", "source": "b", "target": "out"},
            ]
        }),
        json!({}),
        ExecutionOptions::default(),
    );

    let outcome = orchestrator
        .submit_with(request, CancelToken::new(), Some(tx))
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.outputs["out"], json!({"from": "b"}));

    let events = drain(rx);
    let started = node_events(&events, EventKind::NodeStarted);
    assert!(started.contains(&"b".to_string()));
    assert!(!started.contains(&"a".to_string()), "pruned node must not start");
}

#[tokio::test]
async fn test_parallel_sibling_failure_skips_join_and_fails_run() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.register_fn("transform", |req| {
        if req.meta.node_id == "m2" {
            ActivityResult::fail(ActivityErrorKind::Validation, "m2 exploded")
        } else {
            ActivityResult::ok(json!({"from": req.meta.node_id}))
        }
    });

    let orchestrator = Orchestrator::new(runtime);
    let (tx, rx) = mpsc::unbounded_channel();
    let request = request_with(
        json!({
            "name": "ensemble", "entryPoint": "in",
            "nodes": {
                "in": node("trigger", "In"),
                "m1": node("transform", "M1"),
                "m2": node("transform", "M2"),
                "m3": node("transform", "M3"),
                "merge": node("transform", "Merge"),
                "out": node("output", "Out"),
            },
            "edges": [
                {"id": "e1", "source": "in", "target": "m1"},
                {"id": "e2", "source": "in", "target": "m2"},
                {"id": "e3", "source": "in", "target": "m3"},
                {"id": "e4", "source": "m1", "target": "merge"},
                {"id": "e5", "source": "m2", "target": "merge"},
                {"id": "e6", "source": "m3", "target": "merge"},
                {"id": "e7", "source": "merge", "target": "out"},
            ]
        }),
        json!({}),
        ExecutionOptions::default(),
    );

    let outcome = orchestrator
        .submit_with(request, CancelToken::new(), Some(tx))
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.failed_node_id.as_deref(), Some("m2"));
    assert!(!outcome.outputs.contains_key("out"));

    let events = drain(rx);
    assert_eq!(node_events(&events, EventKind::NodeFailed), ["m2"]);
    let started = node_events(&events, EventKind::NodeStarted);
    assert!(!started.contains(&"merge".to_string()));
    assert!(!started.contains(&"out".to_string()));
    assert_eq!(events.last().unwrap().kind, EventKind::ExecutionFailed);
}

#[tokio::test]
async fn test_context_overflow_evicts_oldest_two() {
    const MIB: usize = 1024 * 1024;
    let payload = "x".repeat(10 * MIB);
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.register_fn("transform", move |_| {
        ActivityResult::ok(json!({"data": payload.clone()}))
    });

    let orchestrator = Orchestrator::new(runtime);
    let mut nodes = serde_json::Map::new();
    nodes.insert("in".to_string(), node("trigger", "In"));
    let mut edges = Vec::new();
    let mut previous = "in".to_string();
    for index in 0..6 {
        let id = format!("node_{index}");
        nodes.insert(id.clone(), node("transform", &id));
        edges.push(json!({
            "id": format!("e{index}"),
            "source": &previous,
            "target": &id,
        }));
        previous = id;
    }

    let options = ExecutionOptions {
        max_node_output_bytes: Some(11 * MIB),
        max_context_bytes: Some(50 * MIB),
        ..Default::default()
    };
    let request = request_with(
        json!({
            "name": "big", "entryPoint": "in",
            "nodes": Value::Object(nodes),
            "edges": edges,
        }),
        json!({}),
        options,
    );

    let outcome = orchestrator.submit(request).await.unwrap();
    assert!(outcome.success, "error: {:?}", outcome.error);
    // Six stores of ~10 MiB against a 50 MiB cap: the fifth and sixth
    // each push the total over and evict the then-oldest output.
    assert_eq!(outcome.metrics.pruned_output_count, 2);
    assert!(outcome.outputs.contains_key("node_5"));
}

#[tokio::test]
async fn test_for_each_loop_runs_body_three_times() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.register_fn("transform", |req: ActivityRequest| {
        ActivityResult::ok(json!({"v": req.node_config["v"]}))
    });

    let orchestrator = Orchestrator::new(runtime);
    let (tx, rx) = mpsc::unbounded_channel();
    let request = request_with(
        json!({
            "name": "each", "entryPoint": "in",
            "nodes": {
                "in": node("trigger", "In"),
                "l": {"type": "loop", "name": "Each",
                       "config": {"kind": "forEach", "arrayPath": "inputs.items"},
                       "position": [0.0, 0.0]},
                "body": {"type": "transform", "name": "Body",
                          "config": {"v": "{{l.output.item}}"}, "position": [0.0, 0.0]},
                "out": node("output", "Out"),
            },
            "edges": [
                {"id": "e1", "source": "in", "target": "l"},
                {"id": "e2", "source": "l", "target": "body", "sourceHandle": "loop-body"},
                {"id": "e3", "source": "body", "target": "l"},
                {"id": "e4", "source": "l", "target": "out", "sourceHandle": "loop-exit"},
            ]
        }),
        json!({"items": ["a", "b", "c"]}),
        ExecutionOptions::default(),
    );

    let outcome = orchestrator
        .submit_with(request, CancelToken::new(), Some(tx))
        .await
        .unwrap();
    assert!(outcome.success, "error: {:?}", outcome.error);

    // The exit edge fired exactly once, carrying the end-sentinel summary.
    assert_eq!(outcome.outputs["out"]["completed"], json!(true));
    assert_eq!(outcome.outputs["out"]["iteration"], json!(3));

    let events = drain(rx);
    let body_runs = node_events(&events, EventKind::NodeStarted)
        .iter()
        .filter(|id| *id == "body")
        .count();
    assert_eq!(body_runs, 3);
    let out_runs = node_events(&events, EventKind::NodeStarted)
        .iter()
        .filter(|id| *id == "out")
        .count();
    assert_eq!(out_runs, 1);
}

#[tokio::test]
async fn test_count_loop_runs_fixed_passes() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = counter.clone();
    runtime.register_fn("transform", move |_| {
        let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
        ActivityResult::ok(json!({"count": n}))
    });

    let orchestrator = Orchestrator::new(runtime);
    let request = request_with(
        json!({
            "name": "count", "entryPoint": "in",
            "nodes": {
                "in": node("trigger", "In"),
                "l": {"type": "loop", "name": "Twice",
                       "config": {"kind": "count", "count": 2}, "position": [0.0, 0.0]},
                "body": node("transform", "Body"),
                "out": node("output", "Out"),
            },
            "edges": [
                {"id": "e1", "source": "in", "target": "l"},
                {"id": "e2", "source": "l", "target": "body", "sourceHandle": "loop-body"},
                {"id": "e3", "source": "body", "target": "l"},
                {"id": "e4", "source": "l", "target": "out", "sourceHandle": "loop-exit"},
            ]
        }),
        json!({}),
        ExecutionOptions::default(),
    );
    let outcome = orchestrator.submit(request).await.unwrap();
    assert!(outcome.success, "error: {:?}", outcome.error);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(outcome.outputs["out"]["iteration"], json!(2));
}

#[tokio::test]
async fn test_loop_limit_fails_runaway_while() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.register_fn("transform", |_| ActivityResult::ok(json!({})));

    let orchestrator = Orchestrator::new(runtime);
    let options = ExecutionOptions {
        max_loop_iterations: Some(5),
        ..Default::default()
    };
    let request = request_with(
        json!({
            "name": "forever", "entryPoint": "in",
            "nodes": {
                "in": node("trigger", "In"),
                "l": {"type": "loop", "name": "Forever",
                       "config": {"kind": "while", "condition": "{{inputs.go}}"},
                       "position": [0.0, 0.0]},
                "body": node("transform", "Body"),
            },
            "edges": [
                {"id": "e1", "source": "in", "target": "l"},
                {"id": "e2", "source": "l", "target": "body", "sourceHandle": "loop-body"},
                {"id": "e3", "source": "body", "target": "l"},
            ]
        }),
        json!({"go": true}),
        options,
    );
    let outcome = orchestrator.submit(request).await.unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.error.unwrap().code, "LOOP_LIMIT_EXCEEDED");
}

#[tokio::test]
async fn test_error_edge_recovers_and_run_succeeds() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.register_fn("http", |_| {
        ActivityResult::fail(ActivityErrorKind::Timeout, "upstream died")
    });
    runtime.register_fn("transform", |req: ActivityRequest| {
        // The handler reads the failed node's error record.
        ActivityResult::ok(json!({
            "recoveredFrom": req.node_config["cause"],
        }))
    });

    let orchestrator = Orchestrator::new(runtime);
    let request = request_with(
        json!({
            "name": "recover", "entryPoint": "in",
            "nodes": {
                "in": node("trigger", "In"),
                "risky": node("http", "Risky"),
                "happy": node("transform", "Happy"),
                "rescue": {"type": "transform", "name": "Rescue",
                            "config": {"cause": "{{risky.output.type}}"},
                            "position": [0.0, 0.0]},
                "out": node("output", "Out"),
            },
            "edges": [
                {"id": "e1", "source": "in", "target": "risky"},
                {"id": "e2", "source": "risky", "target": "happy"},
                {"id": "e3", "source": "risky", "target": "rescue", "sourceHandle": "error"},
                {"id": "e4", "source": "happy", "target": "out"},
                {"id": "e5", "source": "rescue", "target": "out"},
            ]
        }),
        json!({}),
        ExecutionOptions::default(),
    );
    let outcome = orchestrator.submit(request).await.unwrap();
    assert!(outcome.success, "error: {:?}", outcome.error);
    assert_eq!(outcome.outputs["out"], json!({"recoveredFrom": "timeout"}));
}

#[tokio::test]
async fn test_failure_off_the_output_path_is_partial_success() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.register_fn("transform", |req| {
        if req.meta.node_id == "audit" {
            ActivityResult::fail(ActivityErrorKind::Permission, "forbidden")
        } else {
            ActivityResult::ok(json!({"ok": true}))
        }
    });

    let orchestrator = Orchestrator::new(runtime);
    let request = request_with(
        json!({
            "name": "partial", "entryPoint": "in",
            "nodes": {
                "in": node("trigger", "In"),
                "main": node("transform", "Main"),
                "audit": node("transform", "Audit"),
                "out": node("output", "Out"),
            },
            "edges": [
                {"id": "e1", "source": "in", "target": "main"},
                {"id": "e2", "source": "in", "target": "audit"},
                {"id": "e3", "source": "main", "target": "out"},
            ]
        }),
        json!({}),
        ExecutionOptions::default(),
    );
    let outcome = orchestrator.submit(request).await.unwrap();
    // The audit leg failed but no output node was lost.
    assert!(outcome.success, "error: {:?}", outcome.error);
    assert_eq!(outcome.outputs["out"], json!({"ok": true}));
}

#[tokio::test]
async fn test_parallel_node_expansion_runs_each_branch() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.register_fn("llm", |req: ActivityRequest| {
        ActivityResult::ok(json!({"model": req.node_config["model"]}))
    });
    runtime.register_fn("transform", |req: ActivityRequest| {
        ActivityResult::ok(json!({
            "fast": req.node_config["fast"],
            "slow": req.node_config["slow"],
        }))
    });

    let orchestrator = Orchestrator::new(runtime);
    let request = request_with(
        json!({
            "name": "fanout", "entryPoint": "in",
            "nodes": {
                "in": node("trigger", "In"),
                "p": {"type": "parallel", "name": "P",
                       "config": {
                           "branches": [
                               {"id": "fast", "variables": {"model": "small"}},
                               {"id": "slow", "variables": {"model": "large"}}
                           ],
                           "join": "merge"
                       },
                       "position": [0.0, 0.0]},
                "ask": {"type": "llm", "name": "Ask",
                         "config": {"model": "{{model}}"}, "position": [0.0, 0.0]},
                "merge": {"type": "transform", "name": "Merge",
                           "config": {"fast": "{{ask__fast.output.model}}",
                                       "slow": "{{ask__slow.output.model}}"},
                           "position": [0.0, 0.0]},
                "out": node("output", "Out"),
            },
            "edges": [
                {"id": "e1", "source": "in", "target": "p"},
                {"id": "e2", "source": "p", "target": "ask"},
                {"id": "e3", "source": "ask", "target": "merge"},
                {"id": "e4", "source": "merge", "target": "out"},
            ]
        }),
        json!({}),
        ExecutionOptions::default(),
    );
    let outcome = orchestrator.submit(request).await.unwrap();
    assert!(outcome.success, "error: {:?}", outcome.error);
    assert_eq!(
        outcome.outputs["out"],
        json!({"fast": "small", "slow": "large"})
    );
}

#[tokio::test]
async fn test_cancellation_skips_everything() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.register_fn("transform", |_| ActivityResult::ok(json!({})));

    let orchestrator = Orchestrator::new(runtime);
    let cancel = CancelToken::new();
    cancel.cancel();
    let request = request_with(
        json!({
            "name": "cancelled", "entryPoint": "in",
            "nodes": {"in": node("trigger", "In"), "t": node("transform", "T")},
            "edges": [{"id": "e1", "source": "in", "target": "t"}]
        }),
        json!({}),
        ExecutionOptions::default(),
    );
    let outcome = orchestrator
        .submit_with(request, cancel, None)
        .await
        .unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.error.unwrap().code, "CANCELLED");
}

struct SlowHandler;

#[async_trait]
impl NodeHandler for SlowHandler {
    async fn execute(&self, _request: ActivityRequest) -> ActivityResult {
        tokio::time::sleep(Duration::from_secs(60)).await;
        ActivityResult::ok(json!({}))
    }
}

#[tokio::test(start_paused = true)]
async fn test_execution_timeout_fires_umbrella_timer() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.register("transform", Arc::new(SlowHandler));

    let orchestrator = Orchestrator::new(runtime);
    let options = ExecutionOptions {
        execution_timeout_ms: Some(500),
        ..Default::default()
    };
    let request = request_with(
        json!({
            "name": "slow", "entryPoint": "in",
            "nodes": {"in": node("trigger", "In"), "t": node("transform", "T")},
            "edges": [{"id": "e1", "source": "in", "target": "t"}]
        }),
        json!({}),
        options,
    );
    let outcome = orchestrator.submit(request).await.unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.error.unwrap().code, "EXECUTION_TIMEOUT");
}

#[tokio::test]
async fn test_build_errors_surface_without_executing() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    runtime.register_fn("transform", move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        ActivityResult::ok(json!({}))
    });

    let orchestrator = Orchestrator::new(runtime);
    let request = request_with(
        json!({
            "name": "broken", "entryPoint": "in",
            "nodes": {"in": node("trigger", "In"), "t": node("transform", "T")},
            "edges": [{"id": "e1", "source": "t", "target": "ghost"}]
        }),
        json!({}),
        ExecutionOptions::default(),
    );
    let report = orchestrator.submit(request).await.unwrap_err();
    assert!(!report.errors.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0, "execution must never start");
}

#[tokio::test]
async fn test_human_review_emits_approval_events() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.register_fn("human_review", |_| {
        ActivityResult::ok(json!({"approved": true}))
    });

    let orchestrator = Orchestrator::new(runtime);
    let (tx, rx) = mpsc::unbounded_channel();
    let request = request_with(
        json!({
            "name": "review", "entryPoint": "in",
            "nodes": {
                "in": node("trigger", "In"),
                "review": node("human_review", "Review"),
            },
            "edges": [{"id": "e1", "source": "in", "target": "review"}]
        }),
        json!({}),
        ExecutionOptions::default(),
    );
    let outcome = orchestrator
        .submit_with(request, CancelToken::new(), Some(tx))
        .await
        .unwrap();
    assert!(outcome.success);

    let events = drain(rx);
    let kinds: Vec<EventKind> = events.iter().map(|event| event.kind).collect();
    let needed = kinds
        .iter()
        .position(|kind| *kind == EventKind::ApprovalNeeded)
        .unwrap();
    let resolved = kinds
        .iter()
        .position(|kind| *kind == EventKind::ApprovalResolved)
        .unwrap();
    assert!(needed < resolved);
}

#[tokio::test]
async fn test_handler_set_variables_flow_into_later_templates() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.register_fn("database", |_| {
        ActivityResult::ok(json!({"rows": 3}))
            .with_signals(json!({"setVariables": {"customer": "acme"}}))
    });
    runtime.register_fn("transform", |req: ActivityRequest| {
        ActivityResult::ok(json!({"greeting": req.node_config["greeting"]}))
    });

    let orchestrator = Orchestrator::new(runtime);
    let request = request_with(
        json!({
            "name": "vars", "entryPoint": "in",
            "nodes": {
                "in": node("trigger", "In"),
                "lookup": node("database", "Lookup"),
                "greet": {"type": "transform", "name": "Greet",
                           "config": {"greeting": "hello {{customer}}"},
                           "position": [0.0, 0.0]},
                "out": node("output", "Out"),
            },
            "edges": [
                {"id": "e1", "source": "in", "target": "lookup"},
                {"id": "e2", "source": "lookup", "target": "greet"},
                {"id": "e3", "source": "greet", "target": "out"},
            ]
        }),
        json!({}),
        ExecutionOptions::default(),
    );
    let outcome = orchestrator.submit(request).await.unwrap();
    assert!(outcome.success, "error: {:?}", outcome.error);
    assert_eq!(outcome.outputs["out"], json!({"greeting": "hello acme"}));
}

#[tokio::test]
async fn test_handler_signal_events_are_forwarded() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.register_fn("llm", |_| {
        ActivityResult::ok(json!({"text": "done"})).with_signals(json!({
            "events": [
                {"kind": "tool_call_started", "payload": {"tool": "search"}},
                {"kind": "tool_call_completed", "payload": {"tool": "search"}}
            ]
        }))
    });

    let orchestrator = Orchestrator::new(runtime);
    let (tx, rx) = mpsc::unbounded_channel();
    let request = request_with(
        json!({
            "name": "signals", "entryPoint": "in",
            "nodes": {"in": node("trigger", "In"), "ask": node("llm", "Ask")},
            "edges": [{"id": "e1", "source": "in", "target": "ask"}]
        }),
        json!({}),
        ExecutionOptions::default(),
    );
    let outcome = orchestrator
        .submit_with(request, CancelToken::new(), Some(tx))
        .await
        .unwrap();
    assert!(outcome.success);

    let events = drain(rx);
    let kinds: Vec<EventKind> = events.iter().map(|event| event.kind).collect();
    assert!(kinds.contains(&EventKind::ToolCallStarted));
    assert!(kinds.contains(&EventKind::ToolCallCompleted));
}

#[tokio::test]
async fn test_output_node_value_config_selects_fields() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.register_fn("transform", |_| {
        ActivityResult::ok(json!({"x": 2, "noise": "ignore"}))
    });

    let orchestrator = Orchestrator::new(runtime);
    let request = request_with(
        json!({
            "name": "pick", "entryPoint": "in",
            "nodes": {
                "in": node("trigger", "In"),
                "t": node("transform", "T"),
                "out": {"type": "output", "name": "Out",
                         "config": {"value": {"picked": "{{t.output.x}}"}},
                         "position": [0.0, 0.0]},
            },
            "edges": [
                {"id": "e1", "source": "in", "target": "t"},
                {"id": "e2", "source": "t", "target": "out"},
            ]
        }),
        json!({}),
        ExecutionOptions::default(),
    );
    let outcome = orchestrator.submit(request).await.unwrap();
    assert!(outcome.success, "error: {:?}", outcome.error);
    assert_eq!(outcome.outputs["out"], json!({"picked": 2}));
}

#[tokio::test]
async fn test_out_of_range_concurrency_is_rejected_before_running() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    runtime.register_fn("transform", move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        ActivityResult::ok(json!({}))
    });

    let orchestrator = Orchestrator::new(runtime);
    let options = ExecutionOptions {
        max_concurrent_nodes: Some(65),
        ..Default::default()
    };
    let request = request_with(
        json!({
            "name": "caps", "entryPoint": "in",
            "nodes": {"in": node("trigger", "In"), "t": node("transform", "T")},
            "edges": [{"id": "e1", "source": "in", "target": "t"}]
        }),
        json!({}),
        options,
    );
    let outcome = orchestrator.submit(request).await.unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.error.unwrap().code, "INVALID_INPUT");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
