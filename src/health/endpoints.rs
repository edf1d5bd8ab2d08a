//! Liveness and readiness endpoints.
//!
//! # Design Decisions
//! - Liveness only says the process is serving requests
//! - Readiness is taken from the startup report; `DEGRADED` is ready

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::http::server::AppState;
use crate::lifecycle::startup::{StartupPhase, StartupState};

pub async fn live() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

pub async fn ready(State(state): State<AppState>) -> Response {
    match state.readiness.current() {
        StartupPhase::Initializing => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "state": StartupState::Initializing.as_str() })),
        )
            .into_response(),
        StartupPhase::Complete(report) => {
            let status = if report.accepts_traffic() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            (status, Json(report.as_ref().clone())).into_response()
        }
    }
}
