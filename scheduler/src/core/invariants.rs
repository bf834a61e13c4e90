//! Structural invariants checked on registration and whenever state is loaded.

use std::collections::{BTreeMap, HashSet};

use crate::core::types::{Codex, Task, TaskSchedule, TaskStatus};

/// Check a single task:
/// - Non-empty name
/// - Ordinals strictly increasing
/// - `cursor <= steps.len()`
/// - `cursor == steps.len()` only for a finished task (non-empty pipelines)
/// - A running task has a step at its cursor
pub fn validate_task(task: &Task) -> Vec<String> {
    let mut errors = Vec::new();

    if task.name.trim().is_empty() {
        errors.push("task name must be non-empty".to_string());
    }

    if !task
        .steps
        .windows(2)
        .all(|pair| pair[0].ordinal < pair[1].ordinal)
    {
        errors.push(format!(
            "{}: step ordinals must be strictly increasing",
            task.name
        ));
    }

    if task.cursor > task.steps.len() {
        errors.push(format!(
            "{}: cursor {} exceeds step count {}",
            task.name,
            task.cursor,
            task.steps.len()
        ));
    } else if task.cursor == task.steps.len() {
        if task.status == TaskStatus::Running {
            errors.push(format!(
                "{}: running task has no step at cursor {}",
                task.name, task.cursor
            ));
        } else if !task.steps.is_empty() && !task.status.is_terminal() {
            errors.push(format!(
                "{}: cursor at end requires a finished task, found {:?}",
                task.name, task.status
            ));
        }
    }

    errors
}

/// Check cross-references across the whole engine state.
pub fn validate_state(
    codices: &BTreeMap<String, Codex>,
    tasks: &BTreeMap<String, Task>,
    schedules: &BTreeMap<String, TaskSchedule>,
) -> Vec<String> {
    let mut errors = Vec::new();

    for (key, task) in tasks {
        if key != &task.name {
            errors.push(format!("task keyed '{}' is named '{}'", key, task.name));
        }
        errors.extend(validate_task(task));
        for step in &task.steps {
            if !codices.contains_key(&step.codex) {
                errors.push(format!(
                    "{}: step {} references unknown codex '{}'",
                    task.name, step.ordinal, step.codex
                ));
            }
        }
    }

    let mut bound = HashSet::new();
    for (key, schedule) in schedules {
        if key != &schedule.task {
            errors.push(format!(
                "schedule keyed '{}' is bound to '{}'",
                key, schedule.task
            ));
        }
        if !tasks.contains_key(&schedule.task) {
            errors.push(format!(
                "schedule references unknown task '{}'",
                schedule.task
            ));
        }
        if !bound.insert(schedule.task.as_str()) {
            errors.push(format!("task '{}' has more than one schedule", schedule.task));
        }
    }

    errors
}
