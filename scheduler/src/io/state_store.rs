//! Engine state storage (`.scheduler/state.json`).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::invariants::validate_state;
use crate::core::types::{Codex, Task, TaskSchedule};

pub const STATE_VERSION: u32 = 1;

/// Everything the scheduler persists between host invocations, except
/// checkpoint data which lives in its own per-namespace files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineState {
    pub version: u32,
    /// Next call id to hand out (monotonic across restarts).
    pub next_call_id: u64,
    pub codices: BTreeMap<String, Codex>,
    pub tasks: BTreeMap<String, Task>,
    /// Keyed by task name: one schedule per task at most.
    pub schedules: BTreeMap<String, TaskSchedule>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            next_call_id: 1,
            codices: BTreeMap::new(),
            tasks: BTreeMap::new(),
            schedules: BTreeMap::new(),
        }
    }
}

impl EngineState {
    pub fn allocate_call_id(&mut self) -> u64 {
        let id = self.next_call_id;
        self.next_call_id += 1;
        id
    }
}

/// Load and validate engine state. A missing file yields an empty state.
pub fn load_state(path: &Path) -> Result<EngineState> {
    if !path.exists() {
        debug!(path = %path.display(), "no state file, starting empty");
        return Ok(EngineState::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read state {}", path.display()))?;
    let state: EngineState = serde_json::from_str(&contents)
        .with_context(|| format!("parse state {}", path.display()))?;
    if state.version != STATE_VERSION {
        return Err(anyhow!(
            "unsupported state version {} in {}",
            state.version,
            path.display()
        ));
    }
    let errors = validate_state(&state.codices, &state.tasks, &state.schedules);
    if !errors.is_empty() {
        return Err(anyhow!("state invariants failed: {}", errors.join("; ")));
    }
    debug!(
        tasks = state.tasks.len(),
        next_call_id = state.next_call_id,
        "state loaded"
    );
    Ok(state)
}

/// Atomically write engine state to disk (temp file + rename).
pub fn write_state(path: &Path, state: &EngineState) -> Result<()> {
    debug!(path = %path.display(), next_call_id = state.next_call_id, "writing state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
