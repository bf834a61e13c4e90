//! Test-only helpers: deterministic pipelines and in-process sandboxes.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use anyhow::anyhow;
use serde_json::Value;

use crate::core::types::{CallMode, Task, TaskStatus, TaskStep, UnitOutcome};
use crate::io::checkpoint::TaskCheckpoint;
use crate::io::sandbox::{Sandbox, SandboxError, UnitRequest};

/// Create an idle task with deterministic defaults.
pub fn pipeline(name: &str, steps: Vec<TaskStep>) -> Task {
    Task {
        name: name.to_string(),
        steps,
        cursor: 0,
        status: TaskStatus::Idle,
        next_step_at: None,
        runs_started: 0,
        last_error: None,
        last_finished_at: None,
    }
}

/// Create a step with no call attempt yet.
pub fn step(ordinal: u32, codex: &str, post_delay_secs: u64) -> TaskStep {
    TaskStep {
        ordinal,
        codex: codex.to_string(),
        post_delay_secs,
        declared_mode: None,
        call: None,
    }
}

/// A scripted result for one sandbox invocation.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    Outcome(UnitOutcome),
    BudgetExceeded,
    Unavailable(String),
}

/// Owned copy of a [`UnitRequest`] as the sandbox saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct SeenRequest {
    pub task: String,
    pub ordinal: u32,
    pub call_id: u64,
    pub codex: String,
    pub mode: CallMode,
    pub resume: Option<Value>,
}

impl SeenRequest {
    fn from_request(request: &UnitRequest<'_>) -> Self {
        Self {
            task: request.task.to_string(),
            ordinal: request.ordinal,
            call_id: request.call_id,
            codex: request.codex.name.clone(),
            mode: request.mode,
            resume: request.resume.cloned(),
        }
    }
}

/// Sandbox that replays a queue of predetermined results.
///
/// Runs past the end of the queue return `Unavailable`.
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
    runs: RefCell<VecDeque<ScriptedRun>>,
    seen: RefCell<Vec<SeenRequest>>,
}

impl ScriptedSandbox {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            runs: RefCell::new(runs.into()),
            seen: RefCell::new(Vec::new()),
        }
    }

    pub fn push(&self, run: ScriptedRun) {
        self.runs.borrow_mut().push_back(run);
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.runs.borrow().len()
    }
}

impl Sandbox for ScriptedSandbox {
    fn run(
        &self,
        request: &UnitRequest<'_>,
        _checkpoint: &mut TaskCheckpoint<'_>,
    ) -> Result<UnitOutcome, SandboxError> {
        self.seen
            .borrow_mut()
            .push(SeenRequest::from_request(request));
        match self.runs.borrow_mut().pop_front() {
            Some(ScriptedRun::Outcome(outcome)) => Ok(outcome),
            Some(ScriptedRun::BudgetExceeded) => {
                Err(SandboxError::BudgetExceeded { budget_secs: 0 })
            }
            Some(ScriptedRun::Unavailable(reason)) => {
                Err(SandboxError::Unavailable(anyhow!(reason)))
            }
            None => Err(SandboxError::Unavailable(anyhow!("script exhausted"))),
        }
    }
}

type UnitFn =
    Box<dyn Fn(&UnitRequest<'_>, &mut TaskCheckpoint<'_>) -> Result<UnitOutcome, SandboxError>>;

/// Sandbox that dispatches on codex name to in-process closures.
///
/// Closures get the namespaced checkpoint handle, so they behave like real
/// units that persist progress between calls.
#[derive(Default)]
pub struct FnSandbox {
    units: HashMap<String, UnitFn>,
    seen: RefCell<Vec<SeenRequest>>,
}

impl FnSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unit<F>(mut self, codex: &str, f: F) -> Self
    where
        F: Fn(&UnitRequest<'_>, &mut TaskCheckpoint<'_>) -> Result<UnitOutcome, SandboxError>
            + 'static,
    {
        self.units.insert(codex.to_string(), Box::new(f));
        self
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.borrow().clone()
    }
}

impl Sandbox for FnSandbox {
    fn run(
        &self,
        request: &UnitRequest<'_>,
        checkpoint: &mut TaskCheckpoint<'_>,
    ) -> Result<UnitOutcome, SandboxError> {
        self.seen
            .borrow_mut()
            .push(SeenRequest::from_request(request));
        let unit = self.units.get(&request.codex.name).ok_or_else(|| {
            SandboxError::Unavailable(anyhow!("no unit for codex '{}'", request.codex.name))
        })?;
        unit(request, checkpoint)
    }
}
