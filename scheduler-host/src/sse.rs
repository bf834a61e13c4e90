//! Server-Sent Events stream of engine activity.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio::sync::broadcast;
use tracing::warn;

use crate::state::{AppState, HostEvent};

fn to_sse(event: &HostEvent) -> Option<Event> {
    let json = serde_json::to_string(event).ok()?;
    Some(Event::default().event(event.name()).data(json))
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(host_event) => {
                    if let Some(event) = to_sse(&host_event) {
                        yield Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler::{HeartbeatReport, TaskActivity};
    use serde_json::{Value, json};

    #[test]
    fn events_serialize_with_type_tag() {
        let event = HostEvent::Heartbeat {
            report: HeartbeatReport {
                at: 7,
                activity: vec![TaskActivity::Completed {
                    task: "t".to_string(),
                }],
            },
        };
        assert_eq!(event.name(), "heartbeat");
        let value: Value = serde_json::to_value(&event).expect("json");
        assert_eq!(
            value,
            json!({
                "type": "heartbeat",
                "report": {"at": 7, "activity": [{"event": "completed", "task": "t"}]}
            })
        );
        assert!(to_sse(&event).is_some());
    }
}
