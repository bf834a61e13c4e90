//! Per-task call journal under `.scheduler/calls/`.
//!
//! One JSONL file per task; one line per observed call event. This is the
//! durable audit trail for operators and is independent of `RUST_LOG`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::types::{Call, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallEvent {
    Succeeded,
    Failed,
    Suspended,
    /// No terminal status was recorded (budget exceeded or sandbox unavailable).
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub task: String,
    pub ordinal: u32,
    /// Run number within the task (1-indexed).
    pub run: u64,
    pub event: CallEvent,
    pub at: Timestamp,
    pub reason: Option<String>,
    pub call: Call,
}

pub fn call_log_path(calls_dir: &Path, task: &str) -> PathBuf {
    let digest = Sha256::digest(task.as_bytes());
    calls_dir.join(format!("{}.jsonl", hex::encode(digest)))
}

pub fn append_call_record(calls_dir: &Path, record: &CallRecord) -> Result<()> {
    fs::create_dir_all(calls_dir)
        .with_context(|| format!("create directory {}", calls_dir.display()))?;
    let path = call_log_path(calls_dir, &record.task);
    let mut line = serde_json::to_string(record).context("serialize call record")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

/// Read all records for `task` in the order they were written.
pub fn read_call_records(calls_dir: &Path, task: &str) -> Result<Vec<CallRecord>> {
    let path = call_log_path(calls_dir, task);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), idx + 1))
        })
        .collect()
}
