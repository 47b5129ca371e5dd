//! Web server endpoints.
//!
//! All responses of the query API use the envelope `{"error_code": 0, "data": ...}`. Failed
//! requests carry a non-zero code, an `error_message` and `"data": null`.

use axum::Router;
use axum::routing::get;

use crate::service::ServiceState;

mod healthcheck;
mod logs;
mod stats;

/// Returns the router with all API routes.
pub fn routes() -> Router<ServiceState> {
    Router::new()
        .route("/api/healthcheck/{kind}", get(healthcheck::handle))
        .route("/api/stats/{process}", get(stats::handle))
        .route("/api/log", get(logs::handle))
}
