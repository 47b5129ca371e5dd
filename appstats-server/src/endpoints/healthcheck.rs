//! A simple healthcheck endpoint for the daemon.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};

use crate::service::ServiceState;

/// The kind of check.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsHealthy {
    /// The process is running.
    Live,
    /// The store is reachable and the writer accepts messages.
    Ready,
}

#[derive(Serialize)]
struct Status {
    is_healthy: bool,
}

async fn is_healthy(state: &ServiceState, kind: IsHealthy) -> bool {
    match kind {
        IsHealthy::Live => true,
        IsHealthy::Ready => !state.ingest().is_closed() && state.store().connect().await.is_ok(),
    }
}

/// Handles `GET /api/healthcheck/{live|ready}`.
pub async fn handle(
    State(state): State<ServiceState>,
    Path(kind): Path<IsHealthy>,
) -> impl IntoResponse {
    if is_healthy(&state, kind).await {
        (StatusCode::OK, Json(Status { is_healthy: true }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(Status { is_healthy: false }),
        )
    }
}
