//! Layout of the `.scheduler/` workspace directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use super::config::{SchedulerConfig, write_config};

/// All canonical paths within `.scheduler/` for a workspace root.
#[derive(Debug, Clone)]
pub struct SchedulerPaths {
    pub root: PathBuf,
    pub scheduler_dir: PathBuf,
    pub config_path: PathBuf,
    pub state_path: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub calls_dir: PathBuf,
    /// Held by every process while it reads, mutates and writes state.
    pub lock_path: PathBuf,
}

impl SchedulerPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let scheduler_dir = root.join(".scheduler");
        Self {
            root: root.clone(),
            config_path: scheduler_dir.join("config.toml"),
            state_path: scheduler_dir.join("state.json"),
            checkpoints_dir: scheduler_dir.join("checkpoints"),
            calls_dir: scheduler_dir.join("calls"),
            lock_path: scheduler_dir.join("state.lock"),
            scheduler_dir,
        }
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config with defaults.
    pub force: bool,
}

/// Create `.scheduler/` with a default config. Existing state is never touched.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<SchedulerPaths> {
    let paths = SchedulerPaths::new(root);
    for dir in [&paths.scheduler_dir, &paths.checkpoints_dir, &paths.calls_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    if options.force || !paths.config_path.exists() {
        write_config(&paths.config_path, &SchedulerConfig::default())?;
    }
    info!(root = %root.display(), "scheduler workspace initialized");
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_layout_and_keeps_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_workspace(temp.path(), &InitOptions { force: false }).expect("init");
        assert!(paths.checkpoints_dir.is_dir());
        assert!(paths.calls_dir.is_dir());

        fs::write(&paths.config_path, "step_budget_secs = 9\n").expect("edit config");
        init_workspace(temp.path(), &InitOptions { force: false }).expect("re-init");
        let contents = fs::read_to_string(&paths.config_path).expect("read");
        assert!(contents.contains("step_budget_secs = 9"));

        init_workspace(temp.path(), &InitOptions { force: true }).expect("force");
        let contents = fs::read_to_string(&paths.config_path).expect("read");
        assert!(contents.contains("step_budget_secs = 30"));
    }
}
