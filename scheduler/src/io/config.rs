//! Scheduler configuration stored under `.scheduler/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Scheduler configuration (TOML).
///
/// Edited by operators; missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Hard compute budget for one call invocation, in seconds.
    pub step_budget_secs: u64,

    /// Truncate captured unit stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Failure limit applied to schedules registered without one.
    /// Unset means a failing task keeps recurring forever.
    pub default_max_consecutive_failures: Option<u32>,

    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter argv; codex source is piped to its stdin.
    pub command: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command: vec!["sh".to_string(), "-s".to_string()],
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            step_budget_secs: 30,
            output_limit_bytes: 100_000,
            default_max_consecutive_failures: None,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.step_budget_secs == 0 {
            return Err(anyhow!("step_budget_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.default_max_consecutive_failures == Some(0) {
            return Err(anyhow!(
                "default_max_consecutive_failures must be > 0 when set"
            ));
        }
        if self.sandbox.command.is_empty() || self.sandbox.command[0].trim().is_empty() {
            return Err(anyhow!("sandbox.command must be a non-empty array"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SchedulerConfig::default()`.
pub fn load_config(path: &Path) -> Result<SchedulerConfig> {
    if !path.exists() {
        let cfg = SchedulerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SchedulerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SchedulerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
