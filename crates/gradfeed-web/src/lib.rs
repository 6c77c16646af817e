//! Axum JSON surface for triggering ingestion runs and reading the analysis summary.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use gradfeed_storage::StoreSummary;
use gradfeed_sync::{BusyConflict, IngestionController, Outcome, RunError, RunPhase, SyncConfig};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "gradfeed-web";

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<IngestionController>,
}

impl AppState {
    pub fn new(controller: Arc<IngestionController>) -> Self {
        Self { controller }
    }
}

#[derive(Debug, Serialize)]
struct DashboardView {
    phase: RunPhase,
    busy: bool,
    #[serde(flatten)]
    summary: StoreSummary,
    acceptance_percent: Option<f64>,
    international_percent: Option<f64>,
}

impl DashboardView {
    fn new(phase: RunPhase, summary: StoreSummary) -> Self {
        Self {
            phase,
            busy: phase != RunPhase::Idle,
            acceptance_percent: summary.acceptance_percent(),
            international_percent: summary.international_percent(),
            summary,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusView {
    phase: RunPhase,
    busy: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(dashboard_handler))
        .route("/status", get(status_handler))
        .route("/pull-data", post(pull_data_handler))
        .route("/update-analysis", post(update_analysis_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let port = config.web_port;
    let controller = Arc::new(IngestionController::from_config(config)?);

    // Held for the lifetime of the server; dropping it stops the cron jobs.
    let scheduler = controller.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %controller.config().sync_cron, "scheduled runs enabled");
    }

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "serving");
    axum::serve(listener, app(AppState::new(controller)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn dashboard_handler(State(state): State<Arc<AppState>>) -> Response {
    let phase = state.controller.busy_state().phase();
    match state.controller.summary().await {
        Ok(summary) => Json(DashboardView::new(phase, summary)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusView> {
    let phase = state.controller.busy_state().phase();
    Json(StatusView {
        phase,
        busy: phase != RunPhase::Idle,
    })
}

async fn pull_data_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.controller.start_run().await {
        Ok(Outcome::Completed(summary)) => Json(summary).into_response(),
        Ok(Outcome::Busy(conflict)) => busy(conflict),
        Err(err) => server_error(err),
    }
}

async fn update_analysis_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.controller.refresh().await {
        Ok(Outcome::Completed(summary)) => {
            Json(DashboardView::new(RunPhase::Idle, summary)).into_response()
        }
        Ok(Outcome::Busy(conflict)) => busy(conflict),
        Err(err) => server_error(err),
    }
}

fn busy(conflict: BusyConflict) -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({ "busy": true, "phase": conflict.phase })),
    )
        .into_response()
}

fn server_error(err: RunError) -> Response {
    let message = format!("{:#}", anyhow::Error::new(err));
    error!(error = %message, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
        .into_response()
}
