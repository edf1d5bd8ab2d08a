//! Operator surface: breaker control, connection stats, broadcast.
//!
//! Every route requires `Authorization: Bearer <admin.api_key>`.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn setup_admin_router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/breakers", get(get_breakers))
        .route("/admin/breakers/{name}/open", post(open_breaker))
        .route("/admin/breakers/{name}/close", post(close_breaker))
        .route("/admin/connections", get(get_connections))
        .route("/admin/broadcast", post(broadcast))
        .route("/admin/boundary", get(get_boundary))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
}
