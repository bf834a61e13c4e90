//! Definition lifecycle: codex and pipeline registration, schedule binding,
//! and the operator actions that change a schedule without running anything.

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument};

use crate::core::invariants::validate_task;
use crate::core::schedule::{arm, retrigger};
use crate::core::types::{
    Codex, ScheduleSpec, StepSpec, Task, TaskSchedule, TaskStatus, TaskStep, Timestamp,
};
use crate::driver::Scheduler;
use crate::error::SchedulerError;

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(
            SchedulerError::InvalidDefinition(format!("{kind} name must be non-empty")).into(),
        );
    }
    if name.trim() != name || name.chars().any(char::is_control) {
        return Err(SchedulerError::InvalidDefinition(format!(
            "{kind} name '{}' has surrounding whitespace or control characters",
            name.escape_debug()
        ))
        .into());
    }
    Ok(())
}

fn validate_schedule(spec: &ScheduleSpec) -> Result<()> {
    if spec.max_consecutive_failures == Some(0) {
        return Err(SchedulerError::InvalidDefinition(
            "max_consecutive_failures must be at least 1".to_string(),
        )
        .into());
    }
    Ok(())
}

impl Scheduler {
    /// Register an immutable codex unit.
    ///
    /// Re-registering identical source is a no-op; different source under an
    /// existing name is a [`SchedulerError::CodexConflict`].
    #[instrument(skip_all, fields(codex = name))]
    pub fn register_codex(&mut self, name: &str, source: &str) -> Result<()> {
        validate_name("codex", name)?;
        self.exclusive(|engine| {
            match engine.state.codices.get(name) {
                Some(existing) if existing.source == source => {
                    debug!("identical codex already registered");
                    return Ok(());
                }
                Some(_) => return Err(SchedulerError::CodexConflict(name.to_string()).into()),
                None => {}
            }
            engine.state.codices.insert(
                name.to_string(),
                Codex {
                    name: name.to_string(),
                    source: source.to_string(),
                },
            );
            engine.persist()?;
            info!(bytes = source.len(), "codex registered");
            Ok(())
        })
    }

    /// Register a pipeline and arm its schedule. Returns the task id (its name).
    ///
    /// Steps get ordinals `0..n` in the order given. Re-registration under an
    /// existing name is rejected, never overwritten.
    #[instrument(skip_all, fields(task = name, steps = steps.len()))]
    pub fn register_task(
        &mut self,
        name: &str,
        steps: Vec<StepSpec>,
        schedule: ScheduleSpec,
        now: Timestamp,
    ) -> Result<String> {
        validate_name("task", name)?;
        validate_schedule(&schedule)?;
        self.exclusive(|engine| {
            if engine.state.tasks.contains_key(name) {
                return Err(SchedulerError::TaskExists(name.to_string()).into());
            }
            if engine.state.schedules.contains_key(name) {
                return Err(SchedulerError::ScheduleExists(name.to_string()).into());
            }

            let mut task_steps = Vec::with_capacity(steps.len());
            for (idx, spec) in steps.into_iter().enumerate() {
                if !engine.state.codices.contains_key(&spec.codex) {
                    return Err(SchedulerError::UnknownCodex(spec.codex).into());
                }
                let ordinal = u32::try_from(idx).map_err(|_| {
                    SchedulerError::InvalidDefinition("too many steps".to_string())
                })?;
                task_steps.push(TaskStep {
                    ordinal,
                    codex: spec.codex,
                    post_delay_secs: spec.post_delay_secs,
                    declared_mode: spec.mode,
                    call: None,
                });
            }

            let task = Task {
                name: name.to_string(),
                steps: task_steps,
                cursor: 0,
                status: TaskStatus::Idle,
                next_step_at: None,
                runs_started: 0,
                last_error: None,
                last_finished_at: None,
            };
            let problems = validate_task(&task);
            if !problems.is_empty() {
                return Err(SchedulerError::InvalidDefinition(problems.join("; ")).into());
            }

            let schedule = engine.arm_with_defaults(name, schedule, now);
            info!(
                next_due_at = schedule.next_due_at,
                repeat_every_secs = schedule.repeat_every_secs,
                "task registered"
            );
            engine.state.tasks.insert(name.to_string(), task);
            engine.state.schedules.insert(name.to_string(), schedule);
            engine.persist()?;
            Ok(name.to_string())
        })
    }

    /// Bind a schedule to a task that currently has none.
    #[instrument(skip_all, fields(task = name))]
    pub fn bind_schedule(&mut self, name: &str, spec: ScheduleSpec, now: Timestamp) -> Result<()> {
        validate_schedule(&spec)?;
        self.exclusive(|engine| {
            engine.task(name)?;
            if engine.state.schedules.contains_key(name) {
                return Err(SchedulerError::ScheduleExists(name.to_string()).into());
            }
            let schedule = engine.arm_with_defaults(name, spec, now);
            info!(next_due_at = schedule.next_due_at, "schedule bound");
            engine.state.schedules.insert(name.to_string(), schedule);
            engine.persist()
        })
    }

    /// Detach and return the task's schedule. A run in progress still finishes.
    #[instrument(skip_all, fields(task = name))]
    pub fn unbind_schedule(&mut self, name: &str) -> Result<TaskSchedule> {
        self.exclusive(|engine| {
            engine.task(name)?;
            let schedule = engine
                .state
                .schedules
                .remove(name)
                .ok_or_else(|| SchedulerError::NoSchedule(name.to_string()))?;
            info!("schedule unbound");
            engine.persist()?;
            Ok(schedule)
        })
    }

    /// Enable or disable a schedule. Takes effect at the next due check and
    /// never interrupts a call in flight.
    #[instrument(skip_all, fields(task = name, enabled = enabled))]
    pub fn set_schedule_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        self.exclusive(|engine| {
            engine.task(name)?;
            let schedule = engine
                .state
                .schedules
                .get_mut(name)
                .ok_or_else(|| SchedulerError::NoSchedule(name.to_string()))?;
            if schedule.enabled == enabled {
                return Ok(());
            }
            schedule.enabled = enabled;
            if enabled {
                schedule.consecutive_failures = 0;
            }
            info!("schedule toggled");
            engine.persist()
        })
    }

    /// Make a non-running task due at `now`, restarting from its first step.
    #[instrument(skip_all, fields(task = name, now = now))]
    pub fn retrigger(&mut self, name: &str, now: Timestamp) -> Result<()> {
        self.exclusive(|engine| {
            let task = engine
                .state
                .tasks
                .get_mut(name)
                .ok_or_else(|| SchedulerError::UnknownTask(name.to_string()))?;
            if task.status == TaskStatus::Running {
                return Err(SchedulerError::TaskRunning(name.to_string()).into());
            }
            let schedule = engine
                .state
                .schedules
                .get_mut(name)
                .ok_or_else(|| SchedulerError::NoSchedule(name.to_string()))?;
            retrigger(schedule, task, now).map_err(|err| anyhow!(err))?;
            info!("task retriggered");
            engine.persist()
        })
    }

    /// Remove a task together with its schedule. Refused while running.
    ///
    /// Checkpoint data is left in place under the task's namespace.
    #[instrument(skip_all, fields(task = name))]
    pub fn remove_task(&mut self, name: &str) -> Result<Task> {
        self.exclusive(|engine| {
            if engine.task(name)?.status == TaskStatus::Running {
                return Err(SchedulerError::TaskRunning(name.to_string()).into());
            }
            engine.state.schedules.remove(name);
            let task = engine
                .state
                .tasks
                .remove(name)
                .ok_or_else(|| SchedulerError::UnknownTask(name.to_string()))?;
            info!("task removed");
            engine.persist()?;
            Ok(task)
        })
    }

    fn arm_with_defaults(
        &self,
        name: &str,
        mut spec: ScheduleSpec,
        now: Timestamp,
    ) -> TaskSchedule {
        if spec.max_consecutive_failures.is_none() {
            spec.max_consecutive_failures = self.config.default_max_consecutive_failures;
        }
        arm(name, &spec, now)
    }
}
