//! Execution sandbox boundary.
//!
//! The [`Sandbox`] trait decouples the scheduler from whatever actually runs
//! codex source. The host's compute budget surfaces here as
//! [`SandboxError::BudgetExceeded`], so retry-on-abort is testable without a
//! constrained host. Tests use scripted sandboxes that return predetermined
//! outcomes without spawning processes.

use std::collections::BTreeMap;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, anyhow};
use jsonschema::Validator;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::types::{CallMode, Codex, UnitOutcome};
use crate::io::checkpoint::TaskCheckpoint;
use crate::io::config::SchedulerConfig;
use crate::io::process::run_command_with_timeout;

const UNIT_RESPONSE_SCHEMA: &str = include_str!("../../schemas/unit_response.schema.json");

/// Everything a sandbox needs to run one invocation slice of a call.
#[derive(Debug, Clone, Copy)]
pub struct UnitRequest<'a> {
    pub task: &'a str,
    pub ordinal: u32,
    pub call_id: u64,
    pub codex: &'a Codex,
    pub mode: CallMode,
    /// Response delivered by the host when resuming a suspended call.
    pub resume: Option<&'a Value>,
}

/// Failures at the sandbox boundary. Neither variant records a terminal
/// call status: the step is retried by a later trigger.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("compute budget of {budget_secs}s exceeded")]
    BudgetExceeded { budget_secs: u64 },
    #[error("sandbox unavailable: {0:#}")]
    Unavailable(anyhow::Error),
}

/// Abstraction over unit execution backends.
pub trait Sandbox {
    /// Run `request` until it returns, raises, or suspends.
    ///
    /// `checkpoint` is bound to the owning task's namespace and is the only
    /// sanctioned channel for persisting partial progress.
    fn run(
        &self,
        request: &UnitRequest<'_>,
        checkpoint: &mut TaskCheckpoint<'_>,
    ) -> Result<UnitOutcome, SandboxError>;
}

/// Sandbox that pipes codex source into an interpreter process.
///
/// The request is exposed through environment variables:
/// `SCHEDULER_TASK`, `SCHEDULER_STEP`, `SCHEDULER_CALL_ID`, `SCHEDULER_MODE`,
/// `SCHEDULER_CHECKPOINT` (JSON object) and, when resuming, `SCHEDULER_RESUME`.
/// The last non-empty stdout line may be a JSON response (see
/// `schemas/unit_response.schema.json`); otherwise exit status decides.
pub struct ProcessSandbox {
    command: Vec<String>,
    budget: Duration,
    output_limit_bytes: usize,
    validator: Validator,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ResponseStatus {
    Returned,
    Raised,
    Suspended,
}

#[derive(Debug, Deserialize)]
struct UnitResponse {
    status: ResponseStatus,
    #[serde(default)]
    value: Value,
    error: Option<String>,
    awaiting: Option<String>,
    #[serde(default)]
    checkpoint_put: BTreeMap<String, Value>,
    #[serde(default)]
    checkpoint_delete: Vec<String>,
}

impl ProcessSandbox {
    pub fn new(
        command: Vec<String>,
        budget: Duration,
        output_limit_bytes: usize,
    ) -> anyhow::Result<Self> {
        if command.is_empty() {
            return Err(anyhow!("sandbox command must be non-empty"));
        }
        let schema: Value =
            serde_json::from_str(UNIT_RESPONSE_SCHEMA).context("parse unit response schema")?;
        let validator = jsonschema::validator_for(&schema)
            .map_err(|err| anyhow!("invalid unit response schema: {}", err))?;
        Ok(Self {
            command,
            budget,
            output_limit_bytes,
            validator,
        })
    }

    pub fn from_config(cfg: &SchedulerConfig) -> anyhow::Result<Self> {
        Self::new(
            cfg.sandbox.command.clone(),
            Duration::from_secs(cfg.step_budget_secs),
            cfg.output_limit_bytes,
        )
    }

    fn build_command(
        &self,
        request: &UnitRequest<'_>,
        snapshot: &BTreeMap<String, Value>,
    ) -> anyhow::Result<Command> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .env("SCHEDULER_TASK", request.task)
            .env("SCHEDULER_STEP", request.ordinal.to_string())
            .env("SCHEDULER_CALL_ID", request.call_id.to_string())
            .env(
                "SCHEDULER_MODE",
                match request.mode {
                    CallMode::Sync => "sync",
                    CallMode::Async => "async",
                },
            )
            .env(
                "SCHEDULER_CHECKPOINT",
                serde_json::to_string(snapshot).context("serialize checkpoint snapshot")?,
            );
        match request.resume {
            Some(payload) => {
                cmd.env(
                    "SCHEDULER_RESUME",
                    serde_json::to_string(payload).context("serialize resume payload")?,
                );
            }
            None => {
                cmd.env_remove("SCHEDULER_RESUME");
            }
        }
        Ok(cmd)
    }

    fn parse_response(&self, line: &str) -> Option<Result<UnitResponse, String>> {
        let value: Value = serde_json::from_str(line).ok()?;
        if !value.as_object()?.contains_key("status") {
            return None;
        }
        if !self.validator.is_valid(&value) {
            let messages = self
                .validator
                .iter_errors(&value)
                .map(|err| err.to_string())
                .collect::<Vec<_>>();
            return Some(Err(format!(
                "invalid unit response: {}",
                messages.join("; ")
            )));
        }
        Some(serde_json::from_value(value).map_err(|err| format!("invalid unit response: {err}")))
    }
}

impl Sandbox for ProcessSandbox {
    #[instrument(
        skip_all,
        fields(
            task = request.task,
            call_id = request.call_id,
            budget_secs = self.budget.as_secs()
        )
    )]
    fn run(
        &self,
        request: &UnitRequest<'_>,
        checkpoint: &mut TaskCheckpoint<'_>,
    ) -> Result<UnitOutcome, SandboxError> {
        let snapshot = checkpoint.snapshot().map_err(SandboxError::Unavailable)?;
        let cmd = self
            .build_command(request, &snapshot)
            .map_err(SandboxError::Unavailable)?;

        let output = run_command_with_timeout(
            cmd,
            request.codex.source.as_bytes(),
            self.budget,
            self.output_limit_bytes,
        )
        .map_err(SandboxError::Unavailable)?;

        if output.timed_out {
            warn!("unit exceeded compute budget");
            return Err(SandboxError::BudgetExceeded {
                budget_secs: self.budget.as_secs(),
            });
        }

        let stdout = output.stdout_lossy();
        let last_line = stdout.lines().rev().find(|line| !line.trim().is_empty());
        if let Some(parsed) = last_line.and_then(|line| self.parse_response(line.trim())) {
            let response = match parsed {
                Ok(response) => response,
                Err(message) => return Ok(UnitOutcome::Raised(message)),
            };
            // Writes apply even when the unit raised: partial progress must
            // survive for the retry.
            for (key, value) in response.checkpoint_put {
                checkpoint
                    .put(&key, value)
                    .map_err(SandboxError::Unavailable)?;
            }
            for key in &response.checkpoint_delete {
                checkpoint.delete(key).map_err(SandboxError::Unavailable)?;
            }
            debug!(status = ?response.status, "unit responded");
            return Ok(match response.status {
                ResponseStatus::Returned => UnitOutcome::Returned(response.value),
                ResponseStatus::Raised => {
                    UnitOutcome::Raised(response.error.unwrap_or_default())
                }
                ResponseStatus::Suspended => UnitOutcome::Suspended {
                    awaiting: response.awaiting.unwrap_or_default(),
                },
            });
        }

        if output.status.success() {
            Ok(UnitOutcome::Returned(Value::String(stdout.trim().to_string())))
        } else {
            let stderr = output.stderr_lossy();
            let message = if stderr.trim().is_empty() {
                format!("unit exited with status {:?}", output.status.code())
            } else {
                stderr.trim().to_string()
            };
            Ok(UnitOutcome::Raised(message))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::io::checkpoint::{CheckpointStore, MemoryCheckpointStore};
    use serde_json::json;

    fn sandbox(budget: Duration) -> ProcessSandbox {
        ProcessSandbox::new(vec!["sh".to_string(), "-s".to_string()], budget, 10_000)
            .expect("sandbox")
    }

    fn run_source(
        sandbox: &ProcessSandbox,
        store: &mut MemoryCheckpointStore,
        source: &str,
        resume: Option<&Value>,
    ) -> Result<UnitOutcome, SandboxError> {
        let codex = Codex {
            name: "unit".to_string(),
            source: source.to_string(),
        };
        let request = UnitRequest {
            task: "t",
            ordinal: 0,
            call_id: 1,
            codex: &codex,
            mode: CallMode::Async,
            resume,
        };
        let mut handle = TaskCheckpoint::new(store, "t");
        sandbox.run(&request, &mut handle)
    }

    #[test]
    fn plain_output_is_returned_as_text() {
        let mut store = MemoryCheckpointStore::new();
        let outcome = run_source(
            &sandbox(Duration::from_secs(5)),
            &mut store,
            "echo \"task=$SCHEDULER_TASK\"\n",
            None,
        )
        .expect("run");
        assert_eq!(outcome, UnitOutcome::Returned(json!("task=t")));
    }

    #[test]
    fn nonzero_exit_raises_stderr() {
        let mut store = MemoryCheckpointStore::new();
        let outcome = run_source(
            &sandbox(Duration::from_secs(5)),
            &mut store,
            "echo 'treasury locked' >&2\nexit 3\n",
            None,
        )
        .expect("run");
        assert_eq!(outcome, UnitOutcome::Raised("treasury locked".to_string()));
    }

    #[test]
    fn json_response_applies_checkpoint_writes_even_on_raise() {
        let mut store = MemoryCheckpointStore::new();
        store.put("t", "stale", json!(true)).expect("seed");
        let source = concat!(
            r#"echo '{"status":"raised","error":"halfway","#,
            r#""checkpoint_put":{"pos":5},"checkpoint_delete":["stale"]}'"#
        );
        let outcome =
            run_source(&sandbox(Duration::from_secs(5)), &mut store, source, None).expect("run");

        assert_eq!(outcome, UnitOutcome::Raised("halfway".to_string()));
        assert_eq!(store.get("t", "pos").expect("get"), Some(json!(5)));
        assert_eq!(store.get("t", "stale").expect("get"), None);
    }

    #[test]
    fn suspension_and_resume_payload() {
        let mut store = MemoryCheckpointStore::new();
        let source = r#"if [ -z "$SCHEDULER_RESUME" ]; then
  echo '{"status":"suspended","awaiting":"ledger"}'
else
  echo "{\"status\":\"returned\",\"value\":$SCHEDULER_RESUME}"
fi
"#;
        let sb = sandbox(Duration::from_secs(5));
        let first = run_source(&sb, &mut store, source, None).expect("first");
        assert_eq!(
            first,
            UnitOutcome::Suspended {
                awaiting: "ledger".to_string()
            }
        );
        let payload = json!({"balance": 12});
        let second = run_source(&sb, &mut store, source, Some(&payload)).expect("second");
        assert_eq!(second, UnitOutcome::Returned(payload));
    }

    #[test]
    fn schema_violation_raises() {
        let mut store = MemoryCheckpointStore::new();
        let outcome = run_source(
            &sandbox(Duration::from_secs(5)),
            &mut store,
            r#"echo '{"status":"suspended"}'"#,
            None,
        )
        .expect("run");
        match outcome {
            UnitOutcome::Raised(message) => assert!(message.contains("invalid unit response")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn budget_overrun_is_distinguished() {
        let mut store = MemoryCheckpointStore::new();
        let err = run_source(
            &sandbox(Duration::from_millis(200)),
            &mut store,
            "exec sleep 5\n",
            None,
        )
        .unwrap_err();
        assert!(matches!(err, SandboxError::BudgetExceeded { .. }));
    }

    #[test]
    fn budget_covers_processes_the_unit_forks() {
        let mut store = MemoryCheckpointStore::new();
        let started = std::time::Instant::now();
        let err = run_source(
            &sandbox(Duration::from_secs(1)),
            &mut store,
            "sleep 6\necho done\n",
            None,
        )
        .unwrap_err();
        assert!(matches!(err, SandboxError::BudgetExceeded { budget_secs: 1 }));
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "1s budget took {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn missing_interpreter_is_unavailable() {
        let sb = ProcessSandbox::new(
            vec!["/nonexistent/interpreter".to_string()],
            Duration::from_secs(1),
            100,
        )
        .expect("sandbox");
        let mut store = MemoryCheckpointStore::new();
        let err = run_source(&sb, &mut store, "", None).unwrap_err();
        assert!(matches!(err, SandboxError::Unavailable(_)));
    }
}
