//! Domain errors callers may need to tell apart.
//!
//! Operations return `anyhow::Result`; these values travel inside the
//! `anyhow::Error` and are recovered with `downcast_ref::<SchedulerError>()`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("task '{0}' is already registered")]
    TaskExists(String),
    #[error("task '{0}' already has a schedule")]
    ScheduleExists(String),
    #[error("codex '{0}' is already registered with different source")]
    CodexConflict(String),
    #[error("unknown task '{0}'")]
    UnknownTask(String),
    #[error("unknown codex '{0}'")]
    UnknownCodex(String),
    #[error("task '{task}' has no step with ordinal {ordinal}")]
    UnknownStep { task: String, ordinal: u32 },
    #[error("task '{0}' has no schedule")]
    NoSchedule(String),
    #[error("task '{0}' has no suspended call")]
    NotAwaiting(String),
    #[error("task '{0}' is running")]
    TaskRunning(String),
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),
}

impl SchedulerError {
    /// Registration conflicts are rejected, never merged.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            SchedulerError::TaskExists(_)
                | SchedulerError::ScheduleExists(_)
                | SchedulerError::CodexConflict(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SchedulerError::UnknownTask(_)
                | SchedulerError::UnknownCodex(_)
                | SchedulerError::UnknownStep { .. }
                | SchedulerError::NoSchedule(_)
        )
    }
}
