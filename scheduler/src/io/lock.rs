//! Advisory lock serializing state writers across processes.
//!
//! The CLI and a long-running host share `.scheduler/state.json`. Each
//! mutating operation takes this lock, re-reads state, mutates, and writes
//! before releasing, so neither side overwrites the other's changes.

use std::fs::{File, OpenOptions};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

/// Exclusive hold on the workspace lock file. Released on drop.
#[derive(Debug)]
pub struct StateLock {
    _file: File,
}

impl StateLock {
    /// Block until the lock at `path` is held exclusively.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("open lock file {}", path.display()))?;
        file.lock()
            .with_context(|| format!("lock {}", path.display()))?;
        debug!(path = %path.display(), "state lock acquired");
        Ok(Self { _file: file })
    }
}
