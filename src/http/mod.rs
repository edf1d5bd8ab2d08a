//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, tracing)
//!     → /health/*  → health::endpoints
//!     → /admin/*   → admin::handlers
//!     → /stream    → websocket.rs (admitted through the connection manager)
//! ```

pub mod server;
pub mod websocket;

pub use server::{AppState, HttpServer};
