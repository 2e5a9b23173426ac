use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct HealthState {
    pub status: HealthStatus,
    pub formatted_total: u64,
    pub failed_total: u64,
    pub last_kill_id: Option<u64>,
    pub last_message_processed: Option<Instant>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            status: HealthStatus::Starting,
            formatted_total: 0,
            failed_total: 0,
            last_kill_id: None,
            last_message_processed: None,
        }
    }
}

impl HealthState {
    pub fn record_formatted(&mut self, kill_id: u64) {
        self.formatted_total += 1;
        self.last_kill_id = Some(kill_id);
        self.last_message_processed = Some(Instant::now());
    }

    pub fn record_failure(&mut self) {
        self.failed_total += 1;
    }
}

pub type SharedHealthState = Arc<RwLock<HealthState>>;

pub async fn set_status(health_state: &SharedHealthState, status: HealthStatus) {
    health_state.write().await.status = status;
}

#[derive(Debug, Serialize)]
struct StatusReport {
    status: HealthStatus,
    formatted_total: u64,
    failed_total: u64,
    last_kill_id: Option<u64>,
    seconds_since_last_message: Option<u64>,
}

async fn liveness_probe(State(health_state): State<SharedHealthState>) -> StatusCode {
    match health_state.read().await.status {
        HealthStatus::Healthy | HealthStatus::Starting => StatusCode::OK,
        HealthStatus::Unhealthy => {
            warn!("Liveness probe: unhealthy");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn readiness_probe(State(health_state): State<SharedHealthState>) -> StatusCode {
    match health_state.read().await.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Starting | HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn startup_probe(State(health_state): State<SharedHealthState>) -> StatusCode {
    match health_state.read().await.status {
        HealthStatus::Starting => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Unhealthy => StatusCode::OK,
    }
}

async fn status_report(State(health_state): State<SharedHealthState>) -> Json<StatusReport> {
    let state = health_state.read().await;
    Json(StatusReport {
        status: state.status,
        formatted_total: state.formatted_total,
        failed_total: state.failed_total,
        last_kill_id: state.last_kill_id,
        seconds_since_last_message: state
            .last_message_processed
            .map(|at| at.elapsed().as_secs()),
    })
}

pub fn router(health_state: SharedHealthState) -> Router {
    Router::new()
        .route("/healthz", get(liveness_probe))
        .route("/ready", get(readiness_probe))
        .route("/startup", get(startup_probe))
        .route("/status", get(status_report))
        .with_state(health_state)
}

pub async fn run_health_server(port: u16, health_state: SharedHealthState) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind health server on {addr}"))?;

    info!(event = "health_server_listening", %addr, "Health check server listening");

    axum::serve(listener, router(health_state))
        .await
        .context("Health server error")?;

    Ok(())
}
