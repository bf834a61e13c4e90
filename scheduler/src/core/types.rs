//! Shared deterministic types for the scheduling core.
//!
//! These types are the persisted data model: they round-trip through
//! `state.json` unchanged and must not depend on external state or I/O.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Seconds since the unix epoch, as supplied by the host on every trigger.
pub type Timestamp = u64;

/// Whether a unit completes within one invocation slice or may suspend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    Sync,
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Succeeded | CallStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A named, immutable source unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Codex {
    pub name: String,
    pub source: String,
}

/// One concrete execution attempt of a codex.
///
/// Status only moves forward: `Pending -> Running -> {Succeeded | Failed}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub id: u64,
    pub codex: String,
    pub mode: CallMode,
    pub status: CallStatus,
    /// Set while an async call is suspended on an outbound dependency.
    pub awaiting: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

impl Call {
    pub fn new(id: u64, codex: &str, mode: CallMode) -> Self {
        Self {
            id,
            codex: codex.to_string(),
            mode,
            status: CallStatus::Pending,
            awaiting: None,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self, now: Timestamp) -> Result<(), String> {
        match self.status {
            CallStatus::Pending => {
                self.status = CallStatus::Running;
                self.started_at = Some(now);
                Ok(())
            }
            other => Err(format!("call {} cannot start from {:?}", self.id, other)),
        }
    }

    pub fn suspend(&mut self, awaiting: String) -> Result<(), String> {
        self.ensure_running("suspend")?;
        self.awaiting = Some(awaiting);
        Ok(())
    }

    /// Clear the suspension marker before the host resumes this call.
    pub fn resume(&mut self) -> Result<(), String> {
        self.ensure_running("resume")?;
        if self.awaiting.take().is_none() {
            return Err(format!("call {} is not suspended", self.id));
        }
        Ok(())
    }

    pub fn succeed(&mut self, value: Value, now: Timestamp) -> Result<(), String> {
        self.ensure_running("succeed")?;
        self.status = CallStatus::Succeeded;
        self.awaiting = None;
        self.result = Some(value);
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, error: String, now: Timestamp) -> Result<(), String> {
        self.ensure_running("fail")?;
        self.status = CallStatus::Failed;
        self.awaiting = None;
        self.error = Some(error);
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn is_suspended(&self) -> bool {
        self.status == CallStatus::Running && self.awaiting.is_some()
    }

    fn ensure_running(&self, action: &str) -> Result<(), String> {
        if self.status != CallStatus::Running {
            return Err(format!(
                "call {} cannot {} from {:?}",
                self.id, action, self.status
            ));
        }
        Ok(())
    }
}

/// An ordinal pipeline stage. `call` holds the most recent attempt, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub ordinal: u32,
    pub codex: String,
    pub post_delay_secs: u64,
    /// Mode declared at registration; bypasses the classifier when set.
    pub declared_mode: Option<CallMode>,
    pub call: Option<Call>,
}

/// An ordered pipeline of steps.
///
/// `name` is globally unique and doubles as the checkpoint namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub steps: Vec<TaskStep>,
    pub cursor: usize,
    pub status: TaskStatus,
    /// Earliest time the step at `cursor` may start (post-delay gate).
    pub next_step_at: Option<Timestamp>,
    pub runs_started: u64,
    pub last_error: Option<String>,
    pub last_finished_at: Option<Timestamp>,
}

/// Recurrence descriptor bound to exactly one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSchedule {
    pub task: String,
    pub initial_delay_secs: u64,
    /// Zero means one-shot.
    pub repeat_every_secs: u64,
    pub next_due_at: Timestamp,
    pub enabled: bool,
    pub max_consecutive_failures: Option<u32>,
    pub consecutive_failures: u32,
}

/// What a unit reported at the end of one invocation slice.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    /// Ran to completion with a value.
    Returned(Value),
    /// Raised or returned an error; captured verbatim.
    Raised(String),
    /// Stopped at a suspension point, awaiting the named dependency.
    Suspended { awaiting: String },
}

/// Step definition supplied at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub codex: String,
    #[serde(default)]
    pub post_delay_secs: u64,
    #[serde(default)]
    pub mode: Option<CallMode>,
}

impl StepSpec {
    pub fn new(codex: &str, post_delay_secs: u64) -> Self {
        Self {
            codex: codex.to_string(),
            post_delay_secs,
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: CallMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// Timing definition supplied when a schedule is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScheduleSpec {
    pub initial_delay_secs: u64,
    pub repeat_every_secs: u64,
    pub max_consecutive_failures: Option<u32>,
}
