//! Streaming WebSocket channel.
//!
//! # Responsibilities
//! - Admit each stream through the connection manager before upgrading
//! - Forward broadcast payloads as text frames and heartbeats as pings
//! - Touch the record on every inbound frame except pongs answering the
//!   heartbeat, so idle streams still age out
//!
//! # Data Flow
//! ```text
//! GET /stream?owner=..&tags=a,b
//!     → admit (429 on CapacityExceeded)
//!     → upgrade
//!     → loop { outbound channel → client | client frame (not pong) → touch }
//!     → handle dropped → record released
//! ```

use std::collections::BTreeSet;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::http::server::AppState;
use crate::net::connection::{ConnectionMetadata, Outbound};
use crate::net::manager::ConnectionHandle;

/// Buffer estimate charged per stream.
const STREAM_SIZE_ESTIMATE: usize = 16 * 1024;

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub owner: String,
    /// Comma-separated tags used by broadcast filters.
    #[serde(default)]
    pub tags: Option<String>,
}

impl StreamParams {
    fn metadata(&self) -> ConnectionMetadata {
        let tags: BTreeSet<String> = self
            .tags
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect();
        ConnectionMetadata {
            size_estimate: STREAM_SIZE_ESTIMATE,
            tags,
        }
    }
}

pub async fn stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Response {
    match state.connections.admit(&params.owner, params.metadata()) {
        Ok(handle) => ws.on_upgrade(move |socket| serve_stream(socket, handle)),
        Err(e) => (StatusCode::TOO_MANY_REQUESTS, e.to_string()).into_response(),
    }
}

async fn serve_stream(socket: WebSocket, mut handle: ConnectionHandle) {
    let (mut sink, mut inbound) = socket.split();
    tracing::debug!(connection_id = %handle.id(), owner = %handle.owner(), "Stream opened");

    loop {
        tokio::select! {
            outbound = handle.recv() => {
                let frame = match outbound {
                    Some(Outbound::Payload(value)) => Message::Text(value.to_string().into()),
                    Some(Outbound::Ping) => Message::Ping(Bytes::new()),
                    None => {
                        // released by the manager
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            frame = inbound.next() => match frame {
                Some(Ok(Message::Close(_))) | None => break,
                // heartbeat replies are not client activity
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(_)) => {
                    handle.touch();
                }
                Some(Err(e)) => {
                    tracing::debug!(connection_id = %handle.id(), error = %e, "Stream read failed");
                    break;
                }
            }
        }
    }

    tracing::debug!(connection_id = %handle.id(), "Stream closed");
    handle.close();
}
