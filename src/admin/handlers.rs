use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::http::server::AppState;
use crate::net::manager::{BroadcastReport, ConnectionMetrics};
use crate::resilience::boundary::ChannelSnapshot;
use crate::resilience::circuit_breaker::BreakerSnapshot;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub state: &'static str,
    pub breakers_open: usize,
    pub connections: usize,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub owner: Option<String>,
    pub tag: Option<String>,
    pub payload: serde_json::Value,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let breakers_open = state
        .breakers
        .snapshot()
        .iter()
        .filter(|b| b.state != crate::resilience::CircuitState::Closed)
        .count();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        state: state.readiness.current().state().as_str(),
        breakers_open,
        connections: state.connections.active_count(),
    })
}

pub async fn get_breakers(State(state): State<AppState>) -> Json<Vec<BreakerSnapshot>> {
    Json(state.breakers.snapshot())
}

pub async fn open_breaker(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.breakers.known(&name) {
        Some(breaker) => {
            breaker.force_open();
            tracing::warn!(breaker = %name, "Circuit forced open by operator");
            (StatusCode::OK, Json(breaker.snapshot())).into_response()
        }
        None => (StatusCode::NOT_FOUND, "Unknown breaker").into_response(),
    }
}

pub async fn close_breaker(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.breakers.get(&name) {
        Some(breaker) => {
            breaker.force_close();
            tracing::warn!(breaker = %name, "Circuit forced closed by operator");
            (StatusCode::OK, Json(breaker.snapshot())).into_response()
        }
        None => (StatusCode::NOT_FOUND, "Unknown breaker").into_response(),
    }
}

pub async fn get_connections(State(state): State<AppState>) -> Json<ConnectionMetrics> {
    Json(state.connections.metrics_snapshot())
}

pub async fn broadcast(
    State(state): State<AppState>,
    Json(request): Json<BroadcastRequest>,
) -> Json<BroadcastReport> {
    let BroadcastRequest { owner, tag, payload } = request;
    let report = state.connections.broadcast(
        |record| {
            owner.as_deref().map_or(true, |o| record.owner() == o)
                && tag.as_deref().map_or(true, |t| record.metadata().has_tag(t))
        },
        payload,
    );
    Json(report)
}

pub async fn get_boundary(State(state): State<AppState>) -> Json<Vec<ChannelSnapshot>> {
    Json(state.boundary.snapshot())
}
