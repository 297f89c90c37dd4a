//! Integration tests for the flowgraph CLI binary: exit codes, validation
//! output, and event-log aggregation over a tempdir fixture.

use std::fs;
use std::path::Path;
use std::process::Command;

fn flowgraph() -> Command {
    Command::new(env!("CARGO_BIN_EXE_flowgraph"))
}

fn write_events(dir: &Path, date: &str, lines: &[&str]) {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(format!("events-{date}.jsonl"));
    fs::write(path, lines.join("\n") + "\n").unwrap();
}

const VALID_DEFINITION: &str = r#"{
    "name": "demo",
    "entryPoint": "in",
    "nodes": {
        "in": {"type": "trigger", "name": "In", "config": {}, "position": [0, 0]},
        "t": {"type": "transform", "name": "T", "config": {}, "position": [1, 0]}
    },
    "edges": [{"id": "e1", "source": "in", "target": "t"}]
}"#;

#[test]
fn test_validate_accepts_a_valid_definition() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("wf.json");
    fs::write(&file, VALID_DEFINITION).unwrap();

    let output = flowgraph().arg("validate").arg(&file).output().unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ok: 'demo'"));
    assert!(stdout.contains("2 reachable nodes"));
}

#[test]
fn test_validate_rejects_with_exit_code_one() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("wf.json");
    fs::write(
        &file,
        r#"{"name": "broken", "entryPoint": "ghost",
            "nodes": {"in": {"type": "trigger", "name": "In", "config": {}, "position": [0, 0]}},
            "edges": []}"#,
    )
    .unwrap();

    let output = flowgraph().arg("validate").arg(&file).output().unwrap();
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("NO_ENTRY_POINT"));
}

#[test]
fn test_aggregate_writes_summary_for_named_day() {
    let dir = tempfile::tempdir().unwrap();
    let events_dir = dir.path().join("events");
    write_events(
        &events_dir,
        "2026-07-30",
        &[
            r#"{"channel": "e1", "kind": "execution_started", "timestamp": 0, "payload": {}}"#,
            r#"{"channel": "e1", "kind": "node_completed", "timestamp": 1, "payload": {"nodeId": "a"}}"#,
            r#"{"channel": "e1", "kind": "execution_completed", "timestamp": 2, "payload": {"durationMs": 42}}"#,
        ],
    );

    let output = flowgraph()
        .arg("--events-dir")
        .arg(&events_dir)
        .arg("aggregate")
        .arg("--date")
        .arg("2026-07-30")
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let summary_path = events_dir.join("summaries").join("summary-2026-07-30.json");
    let summary: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(summary_path).unwrap()).unwrap();
    assert_eq!(summary["executions_started"], 1);
    assert_eq!(summary["nodes_executed"], 1);
    assert_eq!(summary["avg_execution_duration_ms"], 42);
}

#[test]
fn test_aggregate_of_empty_day_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let events_dir = dir.path().join("events");
    fs::create_dir_all(&events_dir).unwrap();

    let output = flowgraph()
        .arg("--events-dir")
        .arg(&events_dir)
        .arg("aggregate")
        .arg("--date")
        .arg("2026-01-01")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"executions_started\": 0"));
}

#[test]
fn test_backfill_requires_positive_days() {
    let dir = tempfile::tempdir().unwrap();
    let output = flowgraph()
        .arg("--events-dir")
        .arg(dir.path())
        .arg("backfill")
        .arg("--days")
        .arg("0")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_backfill_writes_one_summary_per_day() {
    let dir = tempfile::tempdir().unwrap();
    let events_dir = dir.path().join("events");
    fs::create_dir_all(&events_dir).unwrap();

    let output = flowgraph()
        .arg("--events-dir")
        .arg(&events_dir)
        .arg("backfill")
        .arg("--days")
        .arg("3")
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let summaries: Vec<_> = fs::read_dir(events_dir.join("summaries"))
        .unwrap()
        .collect();
    assert_eq!(summaries.len(), 3);
}

#[test]
fn test_graph_renders_mermaid_plan() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("wf.json");
    fs::write(&file, VALID_DEFINITION).unwrap();

    let output = flowgraph().arg("graph").arg(&file).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("flowchart TD"));
    assert!(stdout.contains("in([In])"));
    assert!(stdout.contains("in --> t"));
}

#[test]
fn test_graph_rejects_unknown_format() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("wf.json");
    fs::write(&file, VALID_DEFINITION).unwrap();

    let output = flowgraph()
        .arg("graph")
        .arg(&file)
        .arg("--format")
        .arg("png")
        .output()
        .unwrap();
    assert!(!output.status.success());
}
