//! Periodic heartbeat trigger.

use std::time::Duration;

use scheduler::HeartbeatReport;
use scheduler::core::types::Timestamp;
use scheduler::io::clock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::state::{AppState, HostEvent};

/// Fire `on_heartbeat` every `every` in a background task.
pub fn start_ticker(state: AppState, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // A slow step must not cause a burst of catch-up heartbeats.
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(err) = run_heartbeat(&state, clock::now()).await {
                warn!(error = %format!("{err:#}"), "heartbeat failed");
            }
        }
    });
}

/// Run one heartbeat and publish its report when anything happened.
pub async fn run_heartbeat(state: &AppState, now: Timestamp) -> anyhow::Result<HeartbeatReport> {
    let report = state
        .blocking(move |scheduler, sandbox| scheduler.on_heartbeat(sandbox, now))
        .await?;
    if report.activity.is_empty() {
        debug!(now, "heartbeat idle");
    } else {
        info!(
            now,
            events = report.activity.len(),
            executions = report.executions(),
            "heartbeat"
        );
        state.publish(HostEvent::Heartbeat {
            report: report.clone(),
        });
    }
    Ok(report)
}
