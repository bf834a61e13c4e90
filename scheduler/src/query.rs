//! Read-only introspection for operator tooling.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use crate::core::types::{CallMode, CallStatus, TaskSchedule, TaskStatus, Timestamp};
use crate::driver::Scheduler;
use crate::error::SchedulerError;
use crate::io::call_log::{CallRecord, read_call_records};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleView {
    pub enabled: bool,
    pub next_due_at: Timestamp,
    pub repeat_every_secs: u64,
    pub consecutive_failures: u32,
    pub max_consecutive_failures: Option<u32>,
}

impl From<&TaskSchedule> for ScheduleView {
    fn from(schedule: &TaskSchedule) -> Self {
        Self {
            enabled: schedule.enabled,
            next_due_at: schedule.next_due_at,
            repeat_every_secs: schedule.repeat_every_secs,
            consecutive_failures: schedule.consecutive_failures,
            max_consecutive_failures: schedule.max_consecutive_failures,
        }
    }
}

/// Detailed status of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatusView {
    pub name: String,
    pub status: TaskStatus,
    pub cursor: usize,
    pub step_count: usize,
    pub last_error: Option<String>,
    pub runs_started: u64,
    pub next_step_at: Option<Timestamp>,
    /// Dependency the current call is suspended on.
    pub awaiting: Option<String>,
    pub schedule: Option<ScheduleView>,
}

/// One line of `list_tasks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub name: String,
    pub status: TaskStatus,
    pub cursor: usize,
    pub steps: usize,
    pub next_due_at: Option<Timestamp>,
    pub enabled: bool,
}

/// Outcome of the most recent call of a step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallResult {
    Result {
        call_id: u64,
        mode: CallMode,
        value: Value,
    },
    Error {
        call_id: u64,
        mode: CallMode,
        error: String,
    },
    /// Call exists but has no terminal status yet.
    InFlight {
        call_id: u64,
        mode: CallMode,
        status: CallStatus,
        awaiting: Option<String>,
    },
    /// The step has never been attempted.
    NotRun,
}

impl Scheduler {
    pub fn get_task_status(&self, name: &str) -> Result<TaskStatusView> {
        let task = self.task(name)?;
        let awaiting = task
            .steps
            .get(task.cursor)
            .and_then(|step| step.call.as_ref())
            .filter(|call| call.status == CallStatus::Running)
            .and_then(|call| call.awaiting.clone());
        Ok(TaskStatusView {
            name: task.name.clone(),
            status: task.status,
            cursor: task.cursor,
            step_count: task.steps.len(),
            last_error: task.last_error.clone(),
            runs_started: task.runs_started,
            next_step_at: task.next_step_at,
            awaiting,
            schedule: self.state.schedules.get(name).map(ScheduleView::from),
        })
    }

    pub fn get_call_result(&self, name: &str, ordinal: u32) -> Result<CallResult> {
        let task = self.task(name)?;
        let step = task
            .steps
            .iter()
            .find(|step| step.ordinal == ordinal)
            .ok_or_else(|| SchedulerError::UnknownStep {
                task: name.to_string(),
                ordinal,
            })?;
        let Some(call) = &step.call else {
            return Ok(CallResult::NotRun);
        };
        Ok(match call.status {
            CallStatus::Succeeded => CallResult::Result {
                call_id: call.id,
                mode: call.mode,
                value: call.result.clone().unwrap_or(Value::Null),
            },
            CallStatus::Failed => CallResult::Error {
                call_id: call.id,
                mode: call.mode,
                error: call.error.clone().unwrap_or_default(),
            },
            CallStatus::Pending | CallStatus::Running => CallResult::InFlight {
                call_id: call.id,
                mode: call.mode,
                status: call.status,
                awaiting: call.awaiting.clone(),
            },
        })
    }

    /// Debug read of a task's checkpoint. Units are the only writers.
    pub fn get_checkpoint(&self, name: &str, key: &str) -> Result<Option<Value>> {
        self.task(name)?;
        self.checkpoints.get(name, key)
    }

    pub fn list_tasks(&self) -> Vec<TaskSummary> {
        self.state
            .tasks
            .values()
            .map(|task| {
                let schedule = self.state.schedules.get(&task.name);
                TaskSummary {
                    name: task.name.clone(),
                    status: task.status,
                    cursor: task.cursor,
                    steps: task.steps.len(),
                    next_due_at: schedule.map(|s| s.next_due_at),
                    enabled: schedule.is_some_and(|s| s.enabled),
                }
            })
            .collect()
    }

    /// Journaled call events for a task, oldest first. Empty for in-memory engines.
    pub fn call_history(&self, name: &str) -> Result<Vec<CallRecord>> {
        self.task(name)?;
        match &self.paths {
            Some(paths) => read_call_records(&paths.calls_dir, name),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ScheduleSpec, StepSpec, UnitOutcome};
    use crate::io::config::SchedulerConfig;
    use crate::test_support::{ScriptedRun, ScriptedSandbox};
    use serde_json::json;

    fn two_step() -> Scheduler {
        let mut scheduler = Scheduler::in_memory(SchedulerConfig::default());
        scheduler.register_codex("a", "echo a").expect("codex");
        scheduler.register_codex("b", "echo b").expect("codex");
        scheduler
            .register_task(
                "t",
                vec![StepSpec::new("a", 0), StepSpec::new("b", 0)],
                ScheduleSpec::default(),
                0,
            )
            .expect("register");
        scheduler
    }

    #[test]
    fn call_result_reflects_last_call() {
        let mut scheduler = two_step();
        assert_eq!(
            scheduler.get_call_result("t", 0).expect("result"),
            CallResult::NotRun
        );

        let sandbox = ScriptedSandbox::new(vec![
            ScriptedRun::Outcome(UnitOutcome::Returned(json!({"rows": 3}))),
            ScriptedRun::Outcome(UnitOutcome::Raised("disk full".to_string())),
        ]);
        scheduler.on_heartbeat(&sandbox, 0).expect("hb");
        scheduler.on_heartbeat(&sandbox, 1).expect("hb");

        assert!(matches!(
            scheduler.get_call_result("t", 0).expect("result"),
            CallResult::Result { value, .. } if value == json!({"rows": 3})
        ));
        assert!(matches!(
            scheduler.get_call_result("t", 1).expect("result"),
            CallResult::Error { error, .. } if error == "disk full"
        ));

        let status = scheduler.get_task_status("t").expect("status");
        assert_eq!(status.status, TaskStatus::Failed);
        assert_eq!(status.cursor, 1);
        assert_eq!(status.last_error.as_deref(), Some("disk full"));
    }

    #[test]
    fn unknown_step_is_not_found() {
        let scheduler = two_step();
        let err = scheduler.get_call_result("t", 9).unwrap_err();
        assert!(
            err.downcast_ref::<SchedulerError>()
                .is_some_and(SchedulerError::is_not_found)
        );
    }

    #[test]
    fn list_includes_schedule_state() {
        let mut scheduler = two_step();
        scheduler.set_schedule_enabled("t", false).expect("disable");
        let tasks = scheduler.list_tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].steps, 2);
        assert!(!tasks[0].enabled);
        assert_eq!(tasks[0].next_due_at, Some(0));
    }
}
