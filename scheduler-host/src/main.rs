//! Scheduler host: owns one engine, fires heartbeats on a fixed tick, and
//! serves the operator API.

mod routes;
mod sse;
mod state;
mod ticker;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "scheduler-host")]
#[command(about = "Long-running host that drives the scheduler on a heartbeat")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Project directory (contains .scheduler/)
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,

    /// Seconds between heartbeats; 0 disables the ticker (POST /api/heartbeat only)
    #[arg(long, default_value = "60")]
    tick_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scheduler_host=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let project_dir = args.project_dir.canonicalize().unwrap_or(args.project_dir);
    info!(project_dir = %project_dir.display(), "starting scheduler-host");

    let state = AppState::open(&project_dir)?;

    if args.tick_secs > 0 {
        ticker::start_ticker(state.clone(), Duration::from_secs(args.tick_secs));
        info!(tick_secs = args.tick_secs, "heartbeat ticker started");
    } else {
        info!("heartbeat ticker disabled");
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_router())
        .route("/events", get(sse::events_handler))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
