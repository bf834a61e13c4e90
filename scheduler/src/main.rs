//! `scheduler` command-line host.
//!
//! Every invocation opens `.scheduler/` under `--root`, performs one operation,
//! and persists. A cron entry running `scheduler heartbeat` is a complete host.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use scheduler::Scheduler;
use scheduler::core::types::{CallMode, ScheduleSpec, StepSpec, Timestamp};
use scheduler::error::SchedulerError;
use scheduler::exit_codes;
use scheduler::io::clock;
use scheduler::io::init::{InitOptions, init_workspace};
use scheduler::io::sandbox::ProcessSandbox;
use scheduler::logging;

#[derive(Parser)]
#[command(
    name = "scheduler",
    version,
    about = "Heartbeat-driven codex task scheduler"
)]
struct Cli {
    /// Workspace root containing `.scheduler/`.
    #[arg(short = 'C', long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.scheduler/` with a default config.
    Init {
        /// Overwrite an existing config with defaults.
        #[arg(short, long)]
        force: bool,
    },
    /// Manage codex units.
    Codex {
        #[command(subcommand)]
        command: CodexCommand,
    },
    /// Register a pipeline and arm its schedule.
    Register {
        name: String,
        /// Step as `codex[:post_delay_secs[:sync|async]]`; repeat in order.
        #[arg(short, long = "step", required = true)]
        steps: Vec<String>,
        #[arg(long, default_value_t = 0)]
        initial_delay: u64,
        /// Seconds between runs; 0 is one-shot.
        #[arg(long, default_value_t = 0)]
        repeat_every: u64,
        /// Disable the schedule after this many consecutive failed runs.
        #[arg(long)]
        max_failures: Option<u32>,
        #[arg(long)]
        now: Option<Timestamp>,
    },
    /// Run one heartbeat and print its report.
    Heartbeat {
        #[arg(long)]
        now: Option<Timestamp>,
    },
    /// Resume a suspended call with a JSON payload.
    Respond {
        task: String,
        payload: String,
        #[arg(long)]
        now: Option<Timestamp>,
    },
    /// Print status of one task.
    Status { task: String },
    /// Print a status summary of every task.
    List,
    /// Print the last call outcome of a step.
    #[command(name = "result")]
    CallResult { task: String, ordinal: u32 },
    /// Print one checkpoint value of a task.
    Checkpoint { task: String, key: String },
    /// Print the call journal of a task.
    Calls { task: String },
    /// Make a task due now, restarting from its first step.
    Retrigger {
        task: String,
        #[arg(long)]
        now: Option<Timestamp>,
    },
    /// Enable a task's schedule.
    Enable { task: String },
    /// Disable a task's schedule.
    Disable { task: String },
    /// Remove a task and its schedule.
    Remove { task: String },
}

#[derive(Subcommand)]
enum CodexCommand {
    /// Register a codex from a file.
    Add { name: String, file: PathBuf },
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(exit_code_for(&err));
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<SchedulerError>() {
        Some(err) if err.is_conflict() => exit_codes::CONFLICT,
        Some(err) if err.is_not_found() => exit_codes::NOT_FOUND,
        _ => exit_codes::INVALID,
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let root = cli.root;
    match cli.command {
        Command::Init { force } => {
            let paths = init_workspace(&root, &InitOptions { force })?;
            println!("{}", paths.scheduler_dir.display());
            Ok(())
        }
        Command::Codex {
            command: CodexCommand::Add { name, file },
        } => {
            let source =
                fs::read_to_string(&file).with_context(|| format!("read {}", file.display()))?;
            Scheduler::open(&root)?.register_codex(&name, &source)
        }
        Command::Register {
            name,
            steps,
            initial_delay,
            repeat_every,
            max_failures,
            now,
        } => {
            let steps = steps
                .iter()
                .map(|raw| parse_step(raw))
                .collect::<Result<Vec<_>>>()?;
            let spec = ScheduleSpec {
                initial_delay_secs: initial_delay,
                repeat_every_secs: repeat_every,
                max_consecutive_failures: max_failures,
            };
            let id = Scheduler::open(&root)?.register_task(&name, steps, spec, now_or_clock(now))?;
            println!("{id}");
            Ok(())
        }
        Command::Heartbeat { now } => {
            let mut scheduler = Scheduler::open(&root)?;
            let sandbox = ProcessSandbox::from_config(scheduler.config())?;
            let report = scheduler.on_heartbeat(&sandbox, now_or_clock(now))?;
            print_json(&report)
        }
        Command::Respond { task, payload, now } => {
            let payload: Value = serde_json::from_str(&payload).context("parse payload json")?;
            let mut scheduler = Scheduler::open(&root)?;
            let sandbox = ProcessSandbox::from_config(scheduler.config())?;
            let activity = scheduler.deliver_response(&sandbox, &task, payload, now_or_clock(now))?;
            print_json(&activity)
        }
        Command::Status { task } => print_json(&Scheduler::open(&root)?.get_task_status(&task)?),
        Command::List => print_json(&Scheduler::open(&root)?.list_tasks()),
        Command::CallResult { task, ordinal } => {
            print_json(&Scheduler::open(&root)?.get_call_result(&task, ordinal)?)
        }
        Command::Checkpoint { task, key } => {
            let value = Scheduler::open(&root)?.get_checkpoint(&task, &key)?;
            print_json(&value)
        }
        Command::Calls { task } => print_json(&Scheduler::open(&root)?.call_history(&task)?),
        Command::Retrigger { task, now } => {
            Scheduler::open(&root)?.retrigger(&task, now_or_clock(now))
        }
        Command::Enable { task } => Scheduler::open(&root)?.set_schedule_enabled(&task, true),
        Command::Disable { task } => Scheduler::open(&root)?.set_schedule_enabled(&task, false),
        Command::Remove { task } => Scheduler::open(&root)?.remove_task(&task).map(|_| ()),
    }
}

fn now_or_clock(now: Option<Timestamp>) -> Timestamp {
    now.unwrap_or_else(clock::now)
}

/// Parse `codex[:post_delay_secs[:sync|async]]`.
fn parse_step(raw: &str) -> Result<StepSpec> {
    let mut parts = raw.split(':');
    let codex = parts
        .next()
        .filter(|codex| !codex.is_empty())
        .ok_or_else(|| anyhow!("step '{raw}' is missing a codex name"))?;
    let delay = match parts.next() {
        Some(delay) => delay
            .parse::<u64>()
            .with_context(|| format!("step '{raw}' has invalid post delay"))?,
        None => 0,
    };
    let mut spec = StepSpec::new(codex, delay);
    if let Some(mode) = parts.next() {
        spec = spec.with_mode(match mode {
            "sync" => CallMode::Sync,
            "async" => CallMode::Async,
            other => return Err(anyhow!("step '{raw}' has unknown mode '{other}'")),
        });
    }
    if parts.next().is_some() {
        return Err(anyhow!("step '{raw}' has too many fields"));
    }
    Ok(spec)
}

/// Pretty-printed JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
