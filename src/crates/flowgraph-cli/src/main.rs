//! # flowgraph-cli
//!
//! Operational CLI for the flowgraph engine: validate workflow definitions
//! and aggregate the durable runtime's event log into daily summaries.

mod summary;

use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use flowgraph_core::viz::{visualize, VizOptions};
use flowgraph_core::{build, WorkflowDefinition};
use flowgraph_durable::JsonlEventLog;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "flowgraph")]
#[command(about = "flowgraph - workflow engine analytics and validation", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory holding the JSONL event log.
    #[arg(long, env = "FLOWGRAPH_EVENTS_DIR", default_value = "./events")]
    events_dir: PathBuf,

    /// Directory to write summaries to (defaults to `<events-dir>/summaries`).
    #[arg(long)]
    out_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate event logs for the last N days (ending yesterday).
    Backfill {
        #[arg(long)]
        days: u32,
    },

    /// Aggregate one day of events (defaults to the previous day).
    Aggregate {
        /// Day to aggregate, YYYY-MM-DD.
        #[arg(long)]
        date: Option<String>,
    },

    /// Validate a workflow definition file (YAML or JSON).
    Validate {
        /// Path to the definition file.
        file: PathBuf,
    },

    /// Render a definition's execution plan as a diagram.
    Graph {
        /// Path to the definition file.
        file: PathBuf,

        /// Output format.
        #[arg(long, default_value = "mermaid")]
        format: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let out_dir = cli
        .out_dir
        .clone()
        .unwrap_or_else(|| cli.events_dir.join("summaries"));

    match cli.command {
        Commands::Backfill { days } => {
            if days == 0 {
                bail!("--days must be positive");
            }
            let log = JsonlEventLog::open(&cli.events_dir)?;
            let yesterday = Utc::now().date_naive() - Duration::days(1);
            for offset in (0..days).rev() {
                let date = yesterday - Duration::days(i64::from(offset));
                let summary = summary::write_summary(&log, &out_dir, date)?;
                println!(
                    "{}: {} executions ({} failed), {} nodes",
                    summary.date,
                    summary.executions_started,
                    summary.executions_failed,
                    summary.nodes_executed,
                );
            }
        }
        Commands::Aggregate { date } => {
            let log = JsonlEventLog::open(&cli.events_dir)?;
            let date = match date {
                Some(raw) => parse_date(&raw)?,
                None => Utc::now().date_naive() - Duration::days(1),
            };
            let summary = summary::write_summary(&log, &out_dir, date)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Validate { file } => {
            let definition = load_definition(&file)?;
            let report = build(&definition);
            for warning in &report.warnings {
                println!("warning: {warning}");
            }
            if report.success() {
                let workflow = report.workflow.expect("successful build has a workflow");
                println!(
                    "ok: '{}' - {} reachable nodes, {} levels",
                    workflow.name,
                    workflow.reachable_count(),
                    workflow.execution_levels.len(),
                );
            } else {
                for error in &report.errors {
                    eprintln!("error: {error}");
                }
                bail!("{} build error(s) in {}", report.errors.len(), file.display());
            }
        }
        Commands::Graph { file, format } => {
            let definition = load_definition(&file)?;
            let report = build(&definition);
            let Some(workflow) = report.workflow else {
                for error in &report.errors {
                    eprintln!("error: {error}");
                }
                bail!("{} build error(s) in {}", report.errors.len(), file.display());
            };
            let options = match format.as_str() {
                "mermaid" => VizOptions::mermaid(),
                "dot" => VizOptions::dot(),
                other => bail!("unknown format '{other}', expected mermaid or dot"),
            };
            print!("{}", visualize(&workflow, &options.with_title(&workflow.name)));
        }
    }

    Ok(())
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{raw}', expected YYYY-MM-DD"))
}

fn load_definition(path: &PathBuf) -> Result<WorkflowDefinition> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let is_yaml = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| matches!(extension, "yaml" | "yml"))
        .unwrap_or(false);
    if is_yaml {
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    } else {
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}
