//! Stable exit codes for `scheduler` CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input, config, or state, or any other failure.
pub const INVALID: i32 = 1;
/// Registration conflict: task, schedule, or codex already present.
pub const CONFLICT: i32 = 2;
/// Referenced task, codex, step, or schedule does not exist.
pub const NOT_FOUND: i32 = 3;
