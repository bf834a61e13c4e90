//! Task state transitions: `Idle -> Running -> {Completed | Failed}`.
//!
//! Everything here is pure. The driver decides *when* to call these
//! functions; this module decides *what* a transition does to a task.

use crate::core::types::{Call, CallMode, Task, TaskStatus, Timestamp, UnitOutcome};

/// What a running task needs before its current step can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Task is not running; only its schedule can start it.
    Inactive,
    /// The previous step's post-delay has not elapsed.
    Waiting { until: Timestamp },
    /// The current call is suspended and must be resumed by the host.
    Suspended { call_id: u64 },
    /// The step at `index` should run with a fresh call.
    Ready { index: usize },
}

/// Effect of a unit outcome on the owning task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepTransition {
    Suspended { awaiting: String },
    Advanced { cursor: usize, not_before: Timestamp },
    Completed,
    Failed { error: String },
}

impl StepTransition {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepTransition::Completed | StepTransition::Failed { .. })
    }
}

/// Start a new run from `cursor = 0`.
///
/// An empty pipeline completes immediately without creating any call.
pub fn begin_run(task: &mut Task, now: Timestamp) -> Result<TaskStatus, String> {
    if task.status == TaskStatus::Running {
        return Err(format!("task '{}' is already running", task.name));
    }
    task.cursor = 0;
    task.next_step_at = None;
    task.last_error = None;
    task.runs_started += 1;
    if task.steps.is_empty() {
        task.status = TaskStatus::Completed;
        task.last_finished_at = Some(now);
    } else {
        task.status = TaskStatus::Running;
    }
    Ok(task.status)
}

pub fn readiness(task: &Task, now: Timestamp) -> Readiness {
    if task.status != TaskStatus::Running {
        return Readiness::Inactive;
    }
    if let Some(until) = task.next_step_at
        && now < until
    {
        return Readiness::Waiting { until };
    }
    let Some(step) = task.steps.get(task.cursor) else {
        return Readiness::Inactive;
    };
    match &step.call {
        Some(call) if call.is_suspended() => Readiness::Suspended { call_id: call.id },
        // A running call that is not suspended never recorded a terminal
        // status (host abort). Re-run the same step with a fresh call.
        _ => Readiness::Ready {
            index: task.cursor,
        },
    }
}

/// Replace the current step's call with a fresh one and mark it running.
pub fn start_call(task: &mut Task, mut call: Call, now: Timestamp) -> Result<(), String> {
    if task.status != TaskStatus::Running {
        return Err(format!("task '{}' is not running", task.name));
    }
    call.mark_running(now)?;
    let step = &mut task.steps[task.cursor];
    step.call = Some(call);
    Ok(())
}

/// Apply what the unit reported to the current step's call and the task.
///
/// The cursor only moves after an observed `Succeeded`.
pub fn apply_outcome(
    task: &mut Task,
    outcome: UnitOutcome,
    now: Timestamp,
) -> Result<StepTransition, String> {
    if task.status != TaskStatus::Running {
        return Err(format!("task '{}' is not running", task.name));
    }
    let cursor = task.cursor;
    let step_count = task.steps.len();
    let step = &mut task.steps[cursor];
    let post_delay = step.post_delay_secs;
    let call = step
        .call
        .as_mut()
        .ok_or_else(|| format!("step {} has no call", step.ordinal))?;

    let outcome = match outcome {
        UnitOutcome::Suspended { awaiting } if call.mode == CallMode::Sync => UnitOutcome::Raised(
            format!("synchronous unit attempted to suspend (awaiting {awaiting})"),
        ),
        other => other,
    };

    match outcome {
        UnitOutcome::Suspended { awaiting } => {
            call.suspend(awaiting.clone())?;
            Ok(StepTransition::Suspended { awaiting })
        }
        UnitOutcome::Returned(value) => {
            call.succeed(value, now)?;
            if cursor + 1 == step_count {
                task.cursor = step_count;
                task.status = TaskStatus::Completed;
                task.next_step_at = None;
                task.last_finished_at = Some(now);
                Ok(StepTransition::Completed)
            } else {
                let not_before = now.saturating_add(post_delay);
                task.cursor = cursor + 1;
                task.next_step_at = Some(not_before);
                Ok(StepTransition::Advanced {
                    cursor: task.cursor,
                    not_before,
                })
            }
        }
        UnitOutcome::Raised(error) => {
            call.fail(error.clone(), now)?;
            task.status = TaskStatus::Failed;
            task.next_step_at = None;
            task.last_error = Some(error.clone());
            task.last_finished_at = Some(now);
            Ok(StepTransition::Failed { error })
        }
    }
}

/// Return a finished task to `Idle` at `cursor = 0` for its next run.
pub fn reset_for_recurrence(task: &mut Task) {
    task.status = TaskStatus::Idle;
    task.cursor = 0;
    task.next_step_at = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::CallStatus;
    use crate::test_support::{pipeline, step};
    use serde_json::json;

    fn start_current(task: &mut Task, id: u64, mode: CallMode, now: Timestamp) {
        let codex = task.steps[task.cursor].codex.clone();
        start_call(task, Call::new(id, &codex, mode), now).expect("start call");
    }

    #[test]
    fn empty_pipeline_completes_on_begin() {
        let mut task = pipeline("empty", Vec::new());
        let status = begin_run(&mut task, 5).expect("begin");
        assert_eq!(status, TaskStatus::Completed);
        assert_eq!(task.cursor, 0);
        assert_eq!(readiness(&task, 5), Readiness::Inactive);
    }

    #[test]
    fn begin_run_rejects_running_task() {
        let mut task = pipeline("t", vec![step(0, "a", 0)]);
        begin_run(&mut task, 0).expect("begin");
        assert!(begin_run(&mut task, 1).is_err());
    }

    #[test]
    fn success_advances_cursor_and_sets_delay_gate() {
        let mut task = pipeline("t2", vec![step(0, "a", 0), step(1, "b", 5), step(2, "c", 0)]);
        begin_run(&mut task, 100).expect("begin");
        start_current(&mut task, 1, CallMode::Sync, 100);
        apply_outcome(&mut task, UnitOutcome::Returned(json!("a")), 100).expect("apply");

        start_current(&mut task, 2, CallMode::Sync, 100);
        let transition =
            apply_outcome(&mut task, UnitOutcome::Returned(json!("b")), 101).expect("apply");
        assert_eq!(
            transition,
            StepTransition::Advanced {
                cursor: 2,
                not_before: 106
            }
        );
        assert_eq!(readiness(&task, 105), Readiness::Waiting { until: 106 });
        assert_eq!(readiness(&task, 106), Readiness::Ready { index: 2 });
    }

    #[test]
    fn last_success_completes_with_cursor_at_end() {
        let mut task = pipeline("t", vec![step(0, "a", 3)]);
        begin_run(&mut task, 0).expect("begin");
        start_current(&mut task, 1, CallMode::Sync, 0);
        let transition =
            apply_outcome(&mut task, UnitOutcome::Returned(json!(1)), 2).expect("apply");
        assert_eq!(transition, StepTransition::Completed);
        assert_eq!(task.cursor, 1);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.next_step_at, None);
    }

    #[test]
    fn failure_keeps_cursor_and_records_error() {
        let mut task = pipeline("t", vec![step(0, "a", 0), step(1, "b", 0)]);
        begin_run(&mut task, 0).expect("begin");
        start_current(&mut task, 1, CallMode::Sync, 0);
        apply_outcome(&mut task, UnitOutcome::Returned(json!(1)), 0).expect("apply");
        start_current(&mut task, 2, CallMode::Sync, 0);
        let transition =
            apply_outcome(&mut task, UnitOutcome::Raised("boom".to_string()), 1).expect("apply");

        assert_eq!(
            transition,
            StepTransition::Failed {
                error: "boom".to_string()
            }
        );
        assert_eq!(task.cursor, 1);
        assert_eq!(task.last_error.as_deref(), Some("boom"));
        let call = task.steps[1].call.as_ref().expect("call");
        assert_eq!(call.status, CallStatus::Failed);
    }

    #[test]
    fn async_suspension_keeps_call_running() {
        let mut task = pipeline("t", vec![step(0, "a", 0)]);
        begin_run(&mut task, 0).expect("begin");
        start_current(&mut task, 9, CallMode::Async, 0);
        let transition = apply_outcome(
            &mut task,
            UnitOutcome::Suspended {
                awaiting: "treasury".to_string(),
            },
            0,
        )
        .expect("apply");

        assert!(!transition.is_terminal());
        assert_eq!(task.cursor, 0);
        assert_eq!(readiness(&task, 50), Readiness::Suspended { call_id: 9 });
    }

    #[test]
    fn sync_suspension_fails_the_call() {
        let mut task = pipeline("t", vec![step(0, "a", 0)]);
        begin_run(&mut task, 0).expect("begin");
        start_current(&mut task, 1, CallMode::Sync, 0);
        let transition = apply_outcome(
            &mut task,
            UnitOutcome::Suspended {
                awaiting: "x".to_string(),
            },
            0,
        )
        .expect("apply");
        assert!(matches!(transition, StepTransition::Failed { .. }));
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[test]
    fn aborted_running_call_is_ready_for_same_step() {
        let mut task = pipeline("t", vec![step(0, "a", 0), step(1, "b", 0)]);
        begin_run(&mut task, 0).expect("begin");
        start_current(&mut task, 1, CallMode::Sync, 0);
        // No outcome applied: the host aborted the invocation.
        assert_eq!(readiness(&task, 1), Readiness::Ready { index: 0 });
        assert_eq!(task.cursor, 0);
    }

    #[test]
    fn reset_returns_to_idle_at_zero() {
        let mut task = pipeline("t", vec![step(0, "a", 0)]);
        begin_run(&mut task, 0).expect("begin");
        start_current(&mut task, 1, CallMode::Sync, 0);
        apply_outcome(&mut task, UnitOutcome::Returned(json!(1)), 0).expect("apply");
        reset_for_recurrence(&mut task);
        assert_eq!(task.status, TaskStatus::Idle);
        assert_eq!(task.cursor, 0);
    }
}
