//! HTTP route handlers for the operator API.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use scheduler::core::types::{ScheduleSpec, StepSpec, Task, Timestamp};
use scheduler::io::call_log::CallRecord;
use scheduler::io::clock;
use scheduler::query::{CallResult, TaskStatusView, TaskSummary};
use scheduler::{HeartbeatReport, SchedulerError, TaskActivity};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::state::{AppState, HostEvent};
use crate::ticker::run_heartbeat;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/codices", post(register_codex))
        .route("/tasks", get(list_tasks).post(register_task))
        .route("/tasks/{name}", get(get_task).delete(remove_task))
        .route("/tasks/{name}/retrigger", post(retrigger))
        .route("/tasks/{name}/enable", post(enable))
        .route("/tasks/{name}/disable", post(disable))
        .route("/tasks/{name}/steps/{ordinal}", get(get_step_result))
        .route("/tasks/{name}/checkpoint/{key}", get(get_checkpoint))
        .route("/tasks/{name}/calls", get(get_calls))
        .route("/tasks/{name}/respond", post(respond))
        .route("/heartbeat", post(heartbeat))
}

/// Engine error rendered as a status code plus message.
#[derive(Debug)]
pub struct ApiError(anyhow::Error);

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(error = %format!("{:#}", self.0), "request failed");
        }
        (status, format!("{:#}", self.0)).into_response()
    }
}

fn status_for(err: &anyhow::Error) -> StatusCode {
    match err.downcast_ref::<SchedulerError>() {
        Some(err) if err.is_not_found() => StatusCode::NOT_FOUND,
        Some(err) if err.is_conflict() => StatusCode::CONFLICT,
        Some(SchedulerError::NotAwaiting(_) | SchedulerError::TaskRunning(_)) => {
            StatusCode::CONFLICT
        }
        Some(SchedulerError::InvalidDefinition(_)) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/tasks - status summary of every task.
async fn list_tasks(State(state): State<AppState>) -> Result<Json<Vec<TaskSummary>>, ApiError> {
    let tasks = state
        .blocking(|scheduler, _| Ok(scheduler.list_tasks()))
        .await?;
    Ok(Json(tasks))
}

/// GET /api/tasks/:name - detailed task status.
async fn get_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<TaskStatusView>, ApiError> {
    let status = state
        .blocking(move |scheduler, _| scheduler.get_task_status(&name))
        .await?;
    Ok(Json(status))
}

/// GET /api/tasks/:name/steps/:ordinal - last call outcome of a step.
async fn get_step_result(
    State(state): State<AppState>,
    Path((name, ordinal)): Path<(String, u32)>,
) -> Result<Json<CallResult>, ApiError> {
    let result = state
        .blocking(move |scheduler, _| scheduler.get_call_result(&name, ordinal))
        .await?;
    Ok(Json(result))
}

/// GET /api/tasks/:name/checkpoint/:key - debug read of one checkpoint value.
async fn get_checkpoint(
    State(state): State<AppState>,
    Path((name, key)): Path<(String, String)>,
) -> Result<Json<Value>, Response> {
    let value = state
        .blocking(move |scheduler, _| scheduler.get_checkpoint(&name, &key))
        .await
        .map_err(|err| ApiError(err).into_response())?;
    value
        .map(Json)
        .ok_or_else(|| StatusCode::NOT_FOUND.into_response())
}

/// GET /api/tasks/:name/calls - call journal, oldest first.
async fn get_calls(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<CallRecord>>, ApiError> {
    let records = state
        .blocking(move |scheduler, _| scheduler.call_history(&name))
        .await?;
    Ok(Json(records))
}

#[derive(Debug, Deserialize)]
struct TriggerParams {
    /// Override the wall clock (seconds since epoch).
    now: Option<Timestamp>,
}

/// POST /api/heartbeat - run one heartbeat immediately.
async fn heartbeat(
    State(state): State<AppState>,
    Query(params): Query<TriggerParams>,
) -> Result<Json<HeartbeatReport>, ApiError> {
    let now = params.now.unwrap_or_else(clock::now);
    Ok(Json(run_heartbeat(&state, now).await?))
}

/// POST /api/tasks/:name/respond - deliver an awaited response (JSON body).
async fn respond(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<TriggerParams>,
    Json(payload): Json<Value>,
) -> Result<Json<Vec<TaskActivity>>, ApiError> {
    let now = params.now.unwrap_or_else(clock::now);
    let task = name.clone();
    let activity = state
        .blocking(move |scheduler, sandbox| {
            scheduler.deliver_response(sandbox, &task, payload, now)
        })
        .await?;
    state.publish(HostEvent::Response {
        task: name,
        activity: activity.clone(),
    });
    Ok(Json(activity))
}

#[derive(Debug, Deserialize)]
struct CodexBody {
    name: String,
    source: String,
}

/// POST /api/codices - register an immutable codex unit.
async fn register_codex(
    State(state): State<AppState>,
    Json(body): Json<CodexBody>,
) -> Result<StatusCode, ApiError> {
    state
        .blocking(move |scheduler, _| scheduler.register_codex(&body.name, &body.source))
        .await?;
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    name: String,
    steps: Vec<StepSpec>,
    #[serde(default)]
    schedule: ScheduleSpec,
}

/// POST /api/tasks - register a pipeline and arm its schedule.
async fn register_task(
    State(state): State<AppState>,
    Query(params): Query<TriggerParams>,
    Json(body): Json<RegisterBody>,
) -> Result<(StatusCode, Json<TaskStatusView>), ApiError> {
    let now = params.now.unwrap_or_else(clock::now);
    let status = state
        .blocking(move |scheduler, _| {
            let id = scheduler.register_task(&body.name, body.steps, body.schedule, now)?;
            scheduler.get_task_status(&id)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(status)))
}

/// DELETE /api/tasks/:name - remove a task and its schedule.
async fn remove_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let task = state
        .blocking(move |scheduler, _| scheduler.remove_task(&name))
        .await?;
    Ok(Json(task))
}

/// POST /api/tasks/:name/retrigger - make a task due now from its first step.
async fn retrigger(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<TriggerParams>,
) -> Result<Json<TaskStatusView>, ApiError> {
    let now = params.now.unwrap_or_else(clock::now);
    let status = state
        .blocking(move |scheduler, _| {
            scheduler.retrigger(&name, now)?;
            scheduler.get_task_status(&name)
        })
        .await?;
    Ok(Json(status))
}

/// POST /api/tasks/:name/enable
async fn enable(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<TaskStatusView>, ApiError> {
    toggle(state, name, true).await
}

/// POST /api/tasks/:name/disable
async fn disable(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<TaskStatusView>, ApiError> {
    toggle(state, name, false).await
}

async fn toggle(
    state: AppState,
    name: String,
    enabled: bool,
) -> Result<Json<TaskStatusView>, ApiError> {
    let status = state
        .blocking(move |scheduler, _| {
            scheduler.set_schedule_enabled(&name, enabled)?;
            scheduler.get_task_status(&name)
        })
        .await?;
    Ok(Json(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use scheduler::Scheduler;
    use scheduler::io::init::{InitOptions, init_workspace};

    #[test]
    fn errors_map_to_http_status() {
        let cases = [
            (SchedulerError::UnknownTask("t".to_string()), StatusCode::NOT_FOUND),
            (SchedulerError::TaskExists("t".to_string()), StatusCode::CONFLICT),
            (SchedulerError::NotAwaiting("t".to_string()), StatusCode::CONFLICT),
            (
                SchedulerError::InvalidDefinition("bad".to_string()),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(status_for(&anyhow::Error::from(err)), expected);
        }
        assert_eq!(
            status_for(&anyhow!("disk full")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    fn now(at: Timestamp) -> Query<TriggerParams> {
        Query(TriggerParams { now: Some(at) })
    }

    #[tokio::test]
    async fn operator_writes_survive_host_heartbeats() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_workspace(temp.path(), &InitOptions { force: false }).expect("init");
        let state = AppState::open(temp.path()).expect("state");

        let body = CodexBody {
            name: "noop".to_string(),
            source: "true".to_string(),
        };
        register_codex(State(state.clone()), Json(body))
            .await
            .expect("codex");
        let body = RegisterBody {
            name: "x".to_string(),
            steps: Vec::new(),
            schedule: ScheduleSpec {
                repeat_every_secs: 60,
                ..ScheduleSpec::default()
            },
        };
        register_task(State(state.clone()), now(0), Json(body))
            .await
            .expect("register x");

        // The cli registers next to the running host.
        {
            let mut cli = Scheduler::open(temp.path()).expect("cli");
            cli.register_task(
                "y",
                vec![StepSpec::new("noop", 0)],
                ScheduleSpec {
                    initial_delay_secs: 1_000,
                    ..ScheduleSpec::default()
                },
                0,
            )
            .expect("register y");
        }

        let report = run_heartbeat(&state, 0).await.expect("heartbeat");
        assert!(report.activity.contains(&TaskActivity::Completed {
            task: "x".to_string()
        }));

        let Json(tasks) = list_tasks(State(state.clone())).await.expect("list");
        let names: Vec<_> = tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["x", "y"]);
        let reopened = Scheduler::open(temp.path()).expect("reopen");
        assert!(reopened.state().tasks.contains_key("y"));

        let Json(status) = disable(State(state.clone()), Path("y".to_string()))
            .await
            .expect("disable");
        assert!(!status.schedule.expect("schedule").enabled);
        let Json(removed) = remove_task(State(state.clone()), Path("y".to_string()))
            .await
            .expect("remove");
        assert_eq!(removed.name, "y");

        let err = get_task(State(state), Path("y".to_string()))
            .await
            .err()
            .expect("removed task is gone");
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }
}
