//! Shared application state for the host server.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use scheduler::io::sandbox::ProcessSandbox;
use scheduler::{HeartbeatReport, Scheduler, TaskActivity};
use serde::Serialize;
use tokio::sync::broadcast;

/// Events broadcast to SSE clients after the engine did work.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    Heartbeat {
        report: HeartbeatReport,
    },
    Response {
        task: String,
        activity: Vec<TaskActivity>,
    },
}

impl HostEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HostEvent::Heartbeat { .. } => "heartbeat",
            HostEvent::Response { .. } => "response",
        }
    }
}

/// Shared state accessible from all request handlers and the ticker.
#[derive(Clone)]
pub struct AppState {
    /// The one engine this host owns; every trigger goes through this lock.
    pub scheduler: Arc<Mutex<Scheduler>>,
    pub sandbox: Arc<ProcessSandbox>,
    /// Broadcast sender for engine events.
    pub event_tx: Arc<broadcast::Sender<HostEvent>>,
}

impl AppState {
    pub fn new(scheduler: Scheduler, sandbox: ProcessSandbox) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            scheduler: Arc::new(Mutex::new(scheduler)),
            sandbox: Arc::new(sandbox),
            event_tx: Arc::new(event_tx),
        }
    }

    /// Open the engine under `project_dir/.scheduler/` with a process sandbox
    /// built from its config.
    pub fn open(project_dir: &Path) -> anyhow::Result<Self> {
        let scheduler = Scheduler::open(project_dir)?;
        let sandbox = ProcessSandbox::from_config(scheduler.config())?;
        Ok(Self::new(scheduler, sandbox))
    }

    /// Run `f` against the engine on the blocking pool.
    ///
    /// Heartbeats spawn unit processes and hold the lock for the whole step,
    /// so engine access never happens on an async worker thread. State is
    /// re-read first: the `scheduler` CLI may have written it since.
    pub async fn blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Scheduler, &ProcessSandbox) -> anyhow::Result<T> + Send + 'static,
    {
        let scheduler = Arc::clone(&self.scheduler);
        let sandbox = Arc::clone(&self.sandbox);
        tokio::task::spawn_blocking(move || {
            let mut guard = scheduler
                .lock()
                .map_err(|_| anyhow!("scheduler lock poisoned"))?;
            guard.reload()?;
            f(&mut guard, &sandbox)
        })
        .await
        .context("engine task panicked")?
    }

    pub fn publish(&self, event: HostEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}
