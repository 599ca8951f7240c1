use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use autopoliza_agent::{Orchestrator, SystemHealth};

#[derive(Clone)]
pub struct HealthState {
    orchestrator: Arc<Orchestrator>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub system: SystemHealth,
    pub checked_at: String,
}

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { orchestrator })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let system = state.orchestrator.get_system_health().await;
    let ready = system.orchestrator == "healthy";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        system,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}
