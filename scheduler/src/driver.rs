//! Scheduler driver: the host-invoked entry points.
//!
//! Each heartbeat walks every task once (in name order) and performs at most
//! one step execution per task before returning control to the host. State is
//! persisted before a call is handed to the sandbox, so an invocation the host
//! aborts leaves a durable `Running` call behind and the same step is retried
//! by the next heartbeat.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::classify;
use crate::core::schedule::{Rearm, is_due, rearm};
use crate::core::task_machine::{
    Readiness, StepTransition, apply_outcome, begin_run, readiness, start_call,
};
use crate::core::types::{Call, CallMode, Codex, Task, TaskStatus, Timestamp};
use crate::error::SchedulerError;
use crate::io::call_log::{CallEvent, CallRecord, append_call_record};
use crate::io::checkpoint::{
    CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, TaskCheckpoint,
};
use crate::io::config::{SchedulerConfig, load_config};
use crate::io::init::SchedulerPaths;
use crate::io::lock::StateLock;
use crate::io::sandbox::{Sandbox, UnitRequest};
use crate::io::state_store::{EngineState, load_state, write_state};

/// Why a schedule stopped arming its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    OneShotConsumed,
    FailureLimit,
}

/// One observable thing that happened to a task during a trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskActivity {
    Started {
        task: String,
        run: u64,
    },
    StepSucceeded {
        task: String,
        ordinal: u32,
        call_id: u64,
    },
    StepSuspended {
        task: String,
        ordinal: u32,
        call_id: u64,
        awaiting: String,
    },
    StepFailed {
        task: String,
        ordinal: u32,
        call_id: u64,
        error: String,
    },
    Aborted {
        task: String,
        ordinal: u32,
        call_id: u64,
        reason: String,
    },
    Completed {
        task: String,
    },
    Rearmed {
        task: String,
        next_due_at: Timestamp,
    },
    ScheduleDisabled {
        task: String,
        reason: DisableReason,
    },
}

/// Everything a single heartbeat did, in execution order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatReport {
    pub at: Timestamp,
    pub activity: Vec<TaskActivity>,
}

impl HeartbeatReport {
    /// Number of step executions handed to the sandbox.
    pub fn executions(&self) -> usize {
        self.activity
            .iter()
            .filter(|a| {
                matches!(
                    a,
                    TaskActivity::StepSucceeded { .. }
                        | TaskActivity::StepSuspended { .. }
                        | TaskActivity::StepFailed { .. }
                        | TaskActivity::Aborted { .. }
                )
            })
            .count()
    }
}

/// The scheduling engine: engine state, checkpoint backend, and config.
pub struct Scheduler {
    pub(crate) state: EngineState,
    pub(crate) checkpoints: Box<dyn CheckpointStore>,
    pub(crate) paths: Option<SchedulerPaths>,
    pub(crate) config: SchedulerConfig,
}

/// A step about to be handed to the sandbox.
struct Invocation {
    index: usize,
    ordinal: u32,
    call_id: u64,
    mode: CallMode,
    codex: Codex,
    /// Dependency the call was suspended on, when this is a resumption.
    resumed_from: Option<String>,
}

impl Scheduler {
    /// Engine with no files: state and checkpoints live in memory.
    pub fn in_memory(config: SchedulerConfig) -> Self {
        Self {
            state: EngineState::default(),
            checkpoints: Box::new(MemoryCheckpointStore::new()),
            paths: None,
            config,
        }
    }

    /// Open the file-backed engine rooted at `root` (`root/.scheduler/`).
    pub fn open(root: &Path) -> Result<Self> {
        let paths = SchedulerPaths::new(root);
        if !paths.scheduler_dir.is_dir() {
            return Err(anyhow!(
                "{} is not initialized (run `scheduler init`)",
                paths.root.display()
            ));
        }
        let config = load_config(&paths.config_path)?;
        let state = load_state(&paths.state_path)
            .with_context(|| format!("load {}", paths.state_path.display()))?;
        Ok(Self {
            state,
            checkpoints: Box::new(FileCheckpointStore::new(&paths.checkpoints_dir)),
            paths: Some(paths),
            config,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn paths(&self) -> Option<&SchedulerPaths> {
        self.paths.as_ref()
    }

    /// Re-read state other processes may have written. No-op in memory.
    pub fn reload(&mut self) -> Result<()> {
        if let Some(paths) = &self.paths {
            self.state = load_state(&paths.state_path)
                .with_context(|| format!("load {}", paths.state_path.display()))?;
        }
        Ok(())
    }

    /// Run `op` holding the workspace lock, on state freshly read from disk.
    ///
    /// Every mutating entry point goes through here and must not nest.
    pub(crate) fn exclusive<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let _lock = match &self.paths {
            Some(paths) => Some(StateLock::acquire(&paths.lock_path)?),
            None => None,
        };
        self.reload()?;
        op(self)
    }

    /// Trigger entry point: evaluate all schedules and perform due work.
    #[instrument(skip_all, fields(now = now))]
    pub fn on_heartbeat<X: Sandbox>(
        &mut self,
        sandbox: &X,
        now: Timestamp,
    ) -> Result<HeartbeatReport> {
        self.exclusive(|engine| {
            let mut activity = Vec::new();
            let names: Vec<String> = engine.state.tasks.keys().cloned().collect();
            for name in &names {
                engine.drive_task(sandbox, name, now, &mut activity)?;
            }
            debug!(events = activity.len(), "heartbeat finished");
            Ok(HeartbeatReport { at: now, activity })
        })
    }

    /// Resume the suspended call of `task` with the response it awaited.
    ///
    /// The same call is resumed; no new call is created.
    #[instrument(skip_all, fields(task = task, now = now))]
    pub fn deliver_response<X: Sandbox>(
        &mut self,
        sandbox: &X,
        task: &str,
        payload: Value,
        now: Timestamp,
    ) -> Result<Vec<TaskActivity>> {
        self.exclusive(|engine| engine.resume_call(sandbox, task, payload, now))
    }

    fn resume_call<X: Sandbox>(
        &mut self,
        sandbox: &X,
        task: &str,
        payload: Value,
        now: Timestamp,
    ) -> Result<Vec<TaskActivity>> {
        let entry = self
            .state
            .tasks
            .get_mut(task)
            .ok_or_else(|| SchedulerError::UnknownTask(task.to_string()))?;
        if entry.status != TaskStatus::Running {
            return Err(SchedulerError::NotAwaiting(task.to_string()).into());
        }
        let index = entry.cursor;
        let step = &mut entry.steps[index];
        let ordinal = step.ordinal;
        let call = step
            .call
            .as_mut()
            .filter(|call| call.is_suspended())
            .ok_or_else(|| SchedulerError::NotAwaiting(task.to_string()))?;
        let awaiting = call.awaiting.clone();
        call.resume().map_err(|err| anyhow!(err))?;
        let (call_id, mode, codex_name) = (call.id, call.mode, call.codex.clone());

        let codex = self
            .state
            .codices
            .get(&codex_name)
            .cloned()
            .ok_or(SchedulerError::UnknownCodex(codex_name))?;
        self.persist()?;

        info!(task, call_id, "resuming suspended call");
        let mut activity = Vec::new();
        self.invoke(
            sandbox,
            task,
            Invocation {
                index,
                ordinal,
                call_id,
                mode,
                codex,
                resumed_from: awaiting,
            },
            Some(payload),
            now,
            &mut activity,
        )?;
        Ok(activity)
    }

    fn drive_task<X: Sandbox>(
        &mut self,
        sandbox: &X,
        name: &str,
        now: Timestamp,
        activity: &mut Vec<TaskActivity>,
    ) -> Result<()> {
        let status = self.task(name)?.status;
        if status != TaskStatus::Running {
            let due = self
                .state
                .schedules
                .get(name)
                .is_some_and(|schedule| is_due(schedule, now));
            if !due {
                return Ok(());
            }
            let task = self.task_mut(name)?;
            let started = begin_run(task, now).map_err(|err| anyhow!(err))?;
            let run = task.runs_started;
            info!(task = name, run, "run started");
            activity.push(TaskActivity::Started {
                task: name.to_string(),
                run,
            });
            if started == TaskStatus::Completed {
                activity.push(TaskActivity::Completed {
                    task: name.to_string(),
                });
                self.finish_run(name, now, activity)?;
                return self.persist();
            }
        }

        match readiness(self.task(name)?, now) {
            Readiness::Ready { index } => self.execute_step(sandbox, name, index, now, activity),
            Readiness::Waiting { until } => {
                debug!(task = name, until, "waiting for post-delay");
                Ok(())
            }
            Readiness::Suspended { call_id } => {
                debug!(task = name, call_id, "call suspended, awaiting response");
                Ok(())
            }
            Readiness::Inactive => Ok(()),
        }
    }

    #[instrument(skip_all, fields(task = name, index = index))]
    fn execute_step<X: Sandbox>(
        &mut self,
        sandbox: &X,
        name: &str,
        index: usize,
        now: Timestamp,
        activity: &mut Vec<TaskActivity>,
    ) -> Result<()> {
        let (codex_name, ordinal, declared) = {
            let step = &self.task(name)?.steps[index];
            (step.codex.clone(), step.ordinal, step.declared_mode)
        };
        let codex = self
            .state
            .codices
            .get(&codex_name)
            .cloned()
            .ok_or(SchedulerError::UnknownCodex(codex_name))?;
        // Mode is decided once, when the call is created.
        let mode = declared.unwrap_or_else(|| classify(&codex.source));
        let call_id = self.state.allocate_call_id();

        let task = self.task_mut(name)?;
        start_call(task, Call::new(call_id, &codex.name, mode), now)
            .map_err(|err| anyhow!("start call failed: {err}"))?;
        self.persist()?;

        debug!(task = name, ordinal, call_id, ?mode, "executing step");
        self.invoke(
            sandbox,
            name,
            Invocation {
                index,
                ordinal,
                call_id,
                mode,
                codex,
                resumed_from: None,
            },
            None,
            now,
            activity,
        )
    }

    fn invoke<X: Sandbox>(
        &mut self,
        sandbox: &X,
        name: &str,
        invocation: Invocation,
        resume: Option<Value>,
        now: Timestamp,
        activity: &mut Vec<TaskActivity>,
    ) -> Result<()> {
        let request = UnitRequest {
            task: name,
            ordinal: invocation.ordinal,
            call_id: invocation.call_id,
            codex: &invocation.codex,
            mode: invocation.mode,
            resume: resume.as_ref(),
        };
        let result = {
            let mut checkpoint = TaskCheckpoint::new(self.checkpoints.as_mut(), name);
            sandbox.run(&request, &mut checkpoint)
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                let reason = err.to_string();
                warn!(
                    task = name,
                    call_id = invocation.call_id,
                    %reason,
                    "invocation aborted, step will be retried"
                );
                if let Some(awaiting) = invocation.resumed_from {
                    // Keep the call waiting so the host can deliver the response again.
                    let task = self.task_mut(name)?;
                    if let Some(call) = task.steps[invocation.index].call.as_mut() {
                        call.suspend(awaiting).map_err(|err| anyhow!(err))?;
                    }
                }
                activity.push(TaskActivity::Aborted {
                    task: name.to_string(),
                    ordinal: invocation.ordinal,
                    call_id: invocation.call_id,
                    reason: reason.clone(),
                });
                self.log_call(name, invocation.index, CallEvent::Aborted, Some(reason), now)?;
                return self.persist();
            }
        };

        let task = self.task_mut(name)?;
        let transition = apply_outcome(task, outcome, now)
            .map_err(|err| anyhow!("state update failed: {err}"))?;

        let (task_name, ordinal, call_id) =
            (name.to_string(), invocation.ordinal, invocation.call_id);
        match &transition {
            StepTransition::Suspended { awaiting } => {
                info!(task = name, ordinal, call_id, awaiting = %awaiting, "call suspended");
                activity.push(TaskActivity::StepSuspended {
                    task: task_name,
                    ordinal,
                    call_id,
                    awaiting: awaiting.clone(),
                });
                self.log_call(name, invocation.index, CallEvent::Suspended, None, now)?;
            }
            StepTransition::Advanced { cursor, not_before } => {
                info!(task = name, ordinal, call_id, cursor, not_before, "step succeeded");
                activity.push(TaskActivity::StepSucceeded {
                    task: task_name,
                    ordinal,
                    call_id,
                });
                self.log_call(name, invocation.index, CallEvent::Succeeded, None, now)?;
            }
            StepTransition::Completed => {
                info!(task = name, ordinal, call_id, "step succeeded, task completed");
                activity.push(TaskActivity::StepSucceeded {
                    task: task_name.clone(),
                    ordinal,
                    call_id,
                });
                activity.push(TaskActivity::Completed { task: task_name });
                self.log_call(name, invocation.index, CallEvent::Succeeded, None, now)?;
            }
            StepTransition::Failed { error } => {
                warn!(task = name, ordinal, call_id, %error, "step failed");
                activity.push(TaskActivity::StepFailed {
                    task: task_name,
                    ordinal,
                    call_id,
                    error: error.clone(),
                });
                self.log_call(
                    name,
                    invocation.index,
                    CallEvent::Failed,
                    Some(error.clone()),
                    now,
                )?;
            }
        }

        if transition.is_terminal() {
            self.finish_run(name, now, activity)?;
        }
        self.persist()
    }

    /// Re-arm the task's schedule after a run reached `Completed` or `Failed`.
    fn finish_run(
        &mut self,
        name: &str,
        now: Timestamp,
        activity: &mut Vec<TaskActivity>,
    ) -> Result<()> {
        let Some(schedule) = self.state.schedules.get_mut(name) else {
            return Ok(());
        };
        let task = self
            .state
            .tasks
            .get_mut(name)
            .ok_or_else(|| SchedulerError::UnknownTask(name.to_string()))?;
        match rearm(schedule, task, now).map_err(|err| anyhow!(err))? {
            Rearm::Disabled => {
                info!(task = name, "one-shot schedule consumed");
                activity.push(TaskActivity::ScheduleDisabled {
                    task: name.to_string(),
                    reason: DisableReason::OneShotConsumed,
                });
            }
            Rearm::Rearmed { next_due_at } => {
                info!(task = name, next_due_at, "schedule re-armed");
                activity.push(TaskActivity::Rearmed {
                    task: name.to_string(),
                    next_due_at,
                });
            }
            Rearm::FailureLimitReached { failures } => {
                warn!(task = name, failures, "failure limit reached, schedule disabled");
                activity.push(TaskActivity::ScheduleDisabled {
                    task: name.to_string(),
                    reason: DisableReason::FailureLimit,
                });
            }
        }
        Ok(())
    }

    fn log_call(
        &self,
        name: &str,
        index: usize,
        event: CallEvent,
        reason: Option<String>,
        now: Timestamp,
    ) -> Result<()> {
        let Some(paths) = &self.paths else {
            return Ok(());
        };
        let task = self.task(name)?;
        let step = &task.steps[index];
        let Some(call) = &step.call else {
            return Ok(());
        };
        append_call_record(
            &paths.calls_dir,
            &CallRecord {
                task: name.to_string(),
                ordinal: step.ordinal,
                run: task.runs_started,
                event,
                at: now,
                reason,
                call: call.clone(),
            },
        )
    }

    pub(crate) fn persist(&self) -> Result<()> {
        match &self.paths {
            Some(paths) => write_state(&paths.state_path, &self.state),
            None => Ok(()),
        }
    }

    pub(crate) fn task(&self, name: &str) -> Result<&Task> {
        self.state
            .tasks
            .get(name)
            .ok_or_else(|| SchedulerError::UnknownTask(name.to_string()).into())
    }

    pub(crate) fn task_mut(&mut self, name: &str) -> Result<&mut Task> {
        self.state
            .tasks
            .get_mut(name)
            .ok_or_else(|| SchedulerError::UnknownTask(name.to_string()).into())
    }
}
