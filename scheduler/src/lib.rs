//! Heartbeat-driven task execution and scheduling engine.
//!
//! Named source units (codices) are composed into ordered pipelines (tasks)
//! and driven forward one step at a time by an external host trigger. The
//! architecture keeps the same split throughout:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, task state
//!   machine, schedule arming, invariants). No I/O.
//! - **[`io`]**: Side-effecting pieces (config, state files, checkpoint
//!   store, sandbox processes, call journal).
//!
//! Orchestration modules ([`driver`], [`registry`], [`query`]) combine the two
//! into the operations a host calls.

pub mod core;
pub mod driver;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod query;
pub mod registry;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use driver::{HeartbeatReport, Scheduler, TaskActivity};
pub use error::SchedulerError;
