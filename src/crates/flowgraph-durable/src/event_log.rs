//! Append-only JSONL event log.
//!
//! The durable runtime persists each execution's event stream as JSON lines,
//! one file per UTC day (`events-YYYY-MM-DD.jsonl`). The engine only appends;
//! the analytics CLI reads whole days back for aggregation. Wall-clock dates
//! live here, at the durability boundary - never inside the engine, whose
//! event timestamps are a monotonic counter.

use crate::error::Result;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// JSONL event log rooted at a directory.
#[derive(Debug, Clone)]
pub struct JsonlEventLog {
    dir: PathBuf,
}

impl JsonlEventLog {
    /// Open (creating if needed) an event log rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// File name for a given day.
    pub fn file_name(date: NaiveDate) -> String {
        format!("events-{}.jsonl", date.format("%Y-%m-%d"))
    }

    fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(Self::file_name(date))
    }

    /// Append one event to today's file.
    pub fn append<E: Serialize>(&self, event: &E) -> Result<()> {
        self.append_on(Utc::now().date_naive(), event)
    }

    /// Append one event to a specific day's file. Exposed for backfill tests.
    pub fn append_on<E: Serialize>(&self, date: NaiveDate, event: &E) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(date))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Read every event recorded on a given day. Missing file reads as empty;
    /// unparsable lines are skipped with a warning (the log is append-only and
    /// may carry a torn final line after a crash).
    pub fn read_day(&self, date: NaiveDate) -> Result<Vec<Value>> {
        let path = self.path_for(date);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&line) {
                Ok(value) => events.push(value),
                Err(err) => {
                    tracing::warn!(day = %date, %err, "skipping unparsable event line");
                }
            }
        }
        Ok(events)
    }
}
