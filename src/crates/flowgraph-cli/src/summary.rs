//! Daily aggregation over the JSONL event log.
//!
//! The engine's per-execution event stream is persisted by the durable
//! runtime as one JSONL file per UTC day. Aggregation reduces one day to a
//! [`DailySummary`] and writes it under `<events-dir>/summaries/`.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use flowgraph_durable::JsonlEventLog;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// One day of execution activity, reduced from the event stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: String,
    pub executions_started: u64,
    pub executions_completed: u64,
    pub executions_failed: u64,
    pub nodes_executed: u64,
    pub node_failures: u64,
    pub approvals_requested: u64,
    /// Mean of `durationMs` across completed executions, when reported.
    pub avg_execution_duration_ms: Option<u64>,
}

/// Reduce one day's events to a summary.
pub fn aggregate_day(log: &JsonlEventLog, date: NaiveDate) -> Result<DailySummary> {
    let events = log
        .read_day(date)
        .with_context(|| format!("reading events for {date}"))?;

    let mut summary = DailySummary {
        date: date.format("%Y-%m-%d").to_string(),
        ..Default::default()
    };
    let mut durations: Vec<u64> = Vec::new();

    for event in &events {
        match event.get("kind").and_then(Value::as_str) {
            Some("execution_started") => summary.executions_started += 1,
            Some("execution_completed") => {
                summary.executions_completed += 1;
                if let Some(duration) = event
                    .get("payload")
                    .and_then(|payload| payload.get("durationMs"))
                    .and_then(Value::as_u64)
                {
                    durations.push(duration);
                }
            }
            Some("execution_failed") => summary.executions_failed += 1,
            Some("node_completed") => summary.nodes_executed += 1,
            Some("node_failed") => summary.node_failures += 1,
            Some("approval_needed") => summary.approvals_requested += 1,
            _ => {}
        }
    }

    if !durations.is_empty() {
        summary.avg_execution_duration_ms =
            Some(durations.iter().sum::<u64>() / durations.len() as u64);
    }
    Ok(summary)
}

/// Summary file path for a day.
pub fn summary_path(out_dir: &Path, date: NaiveDate) -> PathBuf {
    out_dir.join(format!("summary-{}.json", date.format("%Y-%m-%d")))
}

/// Aggregate one day and persist the summary.
pub fn write_summary(
    log: &JsonlEventLog,
    out_dir: &Path,
    date: NaiveDate,
) -> Result<DailySummary> {
    let summary = aggregate_day(log, date)?;
    fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;
    let path = summary_path(out_dir, date);
    fs::write(&path, serde_json::to_string_pretty(&summary)?)
        .with_context(|| format!("writing {}", path.display()))?;
    tracing::info!(date = %summary.date, path = %path.display(), "wrote daily summary");
    Ok(summary)
}
