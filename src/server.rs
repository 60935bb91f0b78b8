//! HTTP/WebSocket surface of the relay.
//!
//! One axum router serves both the `/ws` upgrade and the `/health`
//! liveness probe, mirroring how the upstream deployment shares a
//! single listener for both. Each upgraded socket runs its own task:
//! register with the registry, pump frames both directions, clean up
//! on any exit path.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::events::{iso_timestamp, ClientEvent};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::router::EventRouter;

/// Shared handles threaded through every request handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<EventRouter>,
}

/// Build the relay's HTTP router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
    connected_count: usize,
}

/// Liveness probe: process health plus the open-connection count.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: iso_timestamp(),
        connected_count: state.registry.connected_count(),
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-connection lifecycle: CONNECTED → (room joins/leaves) → DISCONNECTED.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let id = ConnectionId::new();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<String>();
    state.registry.register(id, frames_tx);
    info!(connection_id = %id, "client connected");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            outbound = frames_rx.recv() => match outbound {
                Some(frame) => {
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                // Registry dropped our sender: server shutdown.
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => handle_frame(&state, id, &text),
                Some(Ok(Message::Close(_))) | None => break,
                // Ping/pong are answered by axum, binary frames ignored.
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    // Transport failure takes the same path as a normal
                    // disconnect.
                    debug!(connection_id = %id, %error, "transport error");
                    break;
                }
            },
        }
    }

    state.registry.on_disconnect(id);
    info!(connection_id = %id, "client disconnected");
}

/// Decode one inbound text frame and act on it.
///
/// A frame that fails to decode is logged and dropped; the connection
/// is never terminated for malformed input.
fn handle_frame(state: &AppState, id: ConnectionId, text: &str) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(error) => {
            warn!(connection_id = %id, %error, "dropping malformed message");
            return;
        }
    };
    match event {
        ClientEvent::JoinUserRoom(target) => {
            if let Err(error) = state.registry.join(id, &target.user_id) {
                warn!(connection_id = %id, %error, "join rejected");
            }
        }
        ClientEvent::LeaveUserRoom(target) => {
            if let Err(error) = state.registry.leave(id, &target.user_id) {
                warn!(connection_id = %id, %error, "leave rejected");
            }
        }
        other => state.router.dispatch(id, other),
    }
}
