//! TaskSchedule arming and re-arming.

use crate::core::task_machine::reset_for_recurrence;
use crate::core::types::{ScheduleSpec, Task, TaskSchedule, TaskStatus, Timestamp};

/// Result of re-arming a schedule after its task finished a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rearm {
    /// One-shot schedule consumed.
    Disabled,
    /// Recurring schedule armed for the next run; task reset to `Idle`.
    Rearmed { next_due_at: Timestamp },
    /// `max_consecutive_failures` reached; schedule disabled, task left `Failed`.
    FailureLimitReached { failures: u32 },
}

/// Arm a new schedule: first due at `now + initial_delay`.
pub fn arm(task: &str, spec: &ScheduleSpec, now: Timestamp) -> TaskSchedule {
    TaskSchedule {
        task: task.to_string(),
        initial_delay_secs: spec.initial_delay_secs,
        repeat_every_secs: spec.repeat_every_secs,
        next_due_at: now.saturating_add(spec.initial_delay_secs),
        enabled: true,
        max_consecutive_failures: spec.max_consecutive_failures,
        consecutive_failures: 0,
    }
}

pub fn is_due(schedule: &TaskSchedule, now: Timestamp) -> bool {
    schedule.enabled && now >= schedule.next_due_at
}

/// Re-arm after the bound task reached `Completed` or `Failed`.
///
/// Recurrence does not depend on success: a failed run is re-armed exactly
/// like a completed one unless the failure limit is configured and reached.
pub fn rearm(
    schedule: &mut TaskSchedule,
    task: &mut Task,
    now: Timestamp,
) -> Result<Rearm, String> {
    if !task.status.is_terminal() {
        return Err(format!(
            "task '{}' cannot be re-armed from {:?}",
            task.name, task.status
        ));
    }

    if task.status == TaskStatus::Failed {
        schedule.consecutive_failures = schedule.consecutive_failures.saturating_add(1);
    } else {
        schedule.consecutive_failures = 0;
    }

    if let Some(limit) = schedule.max_consecutive_failures
        && limit > 0
        && schedule.consecutive_failures >= limit
    {
        schedule.enabled = false;
        return Ok(Rearm::FailureLimitReached {
            failures: schedule.consecutive_failures,
        });
    }

    if schedule.repeat_every_secs == 0 {
        schedule.enabled = false;
        return Ok(Rearm::Disabled);
    }

    schedule.next_due_at = now.saturating_add(schedule.repeat_every_secs);
    reset_for_recurrence(task);
    Ok(Rearm::Rearmed {
        next_due_at: schedule.next_due_at,
    })
}

/// Operator restart: make a non-running task due at `now`.
pub fn retrigger(
    schedule: &mut TaskSchedule,
    task: &mut Task,
    now: Timestamp,
) -> Result<(), String> {
    if task.status == TaskStatus::Running {
        return Err(format!("task '{}' is running", task.name));
    }
    schedule.enabled = true;
    schedule.next_due_at = now;
    schedule.consecutive_failures = 0;
    reset_for_recurrence(task);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{pipeline, step};

    fn spec(initial: u64, repeat: u64) -> ScheduleSpec {
        ScheduleSpec {
            initial_delay_secs: initial,
            repeat_every_secs: repeat,
            max_consecutive_failures: None,
        }
    }

    #[test]
    fn first_arming_adds_initial_delay() {
        let schedule = arm("t", &spec(30, 0), 1_000);
        assert_eq!(schedule.next_due_at, 1_030);
        assert!(!is_due(&schedule, 1_029));
        assert!(is_due(&schedule, 1_030));
    }

    #[test]
    fn disabled_schedule_is_never_due() {
        let mut schedule = arm("t", &spec(0, 0), 0);
        schedule.enabled = false;
        assert!(!is_due(&schedule, u64::MAX));
    }

    #[test]
    fn one_shot_is_disabled_after_completion() {
        let mut schedule = arm("t", &spec(0, 0), 0);
        let mut task = pipeline("t", vec![step(0, "a", 0)]);
        task.status = TaskStatus::Completed;

        let outcome = rearm(&mut schedule, &mut task, 10).expect("rearm");
        assert_eq!(outcome, Rearm::Disabled);
        assert!(!schedule.enabled);
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn recurring_failure_is_rearmed_and_reset() {
        let mut schedule = arm("t", &spec(0, 60), 0);
        let mut task = pipeline("t", vec![step(0, "a", 0)]);
        task.status = TaskStatus::Failed;

        let outcome = rearm(&mut schedule, &mut task, 10).expect("rearm");
        assert_eq!(outcome, Rearm::Rearmed { next_due_at: 70 });
        assert_eq!(task.status, TaskStatus::Idle);
        assert_eq!(task.cursor, 0);
        assert_eq!(schedule.consecutive_failures, 1);
    }

    #[test]
    fn failure_limit_disables_schedule() {
        let mut schedule = arm(
            "t",
            &ScheduleSpec {
                initial_delay_secs: 0,
                repeat_every_secs: 60,
                max_consecutive_failures: Some(2),
            },
            0,
        );
        let mut task = pipeline("t", vec![step(0, "a", 0)]);

        task.status = TaskStatus::Failed;
        assert!(matches!(
            rearm(&mut schedule, &mut task, 1).expect("rearm"),
            Rearm::Rearmed { .. }
        ));
        task.status = TaskStatus::Failed;
        assert_eq!(
            rearm(&mut schedule, &mut task, 2).expect("rearm"),
            Rearm::FailureLimitReached { failures: 2 }
        );
        assert!(!schedule.enabled);
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[test]
    fn completion_resets_failure_counter() {
        let mut schedule = arm("t", &spec(0, 60), 0);
        schedule.consecutive_failures = 4;
        let mut task = pipeline("t", vec![step(0, "a", 0)]);
        task.status = TaskStatus::Completed;
        rearm(&mut schedule, &mut task, 0).expect("rearm");
        assert_eq!(schedule.consecutive_failures, 0);
    }

    #[test]
    fn rearm_requires_terminal_task() {
        let mut schedule = arm("t", &spec(0, 60), 0);
        let mut task = pipeline("t", vec![step(0, "a", 0)]);
        task.status = TaskStatus::Running;
        assert!(rearm(&mut schedule, &mut task, 0).is_err());
    }

    #[test]
    fn retrigger_makes_failed_task_due_now() {
        let mut schedule = arm("t", &spec(0, 0), 0);
        schedule.enabled = false;
        let mut task = pipeline("t", vec![step(0, "a", 0)]);
        task.status = TaskStatus::Failed;
        task.cursor = 0;

        retrigger(&mut schedule, &mut task, 500).expect("retrigger");
        assert!(is_due(&schedule, 500));
        assert_eq!(task.status, TaskStatus::Idle);

        task.status = TaskStatus::Running;
        assert!(retrigger(&mut schedule, &mut task, 501).is_err());
    }
}
