//! Signaling relay server
//!
//! A room-scoped broadcast relay over WebSocket:
//! - `GET /ws/:room` joins a room; the first frame sent back is `subscribed`
//! - every `broadcast` frame from a client is forwarded to every other client
//!   in the same room (the sender never hears itself)
//! - `GET /api/rooms` and `GET /api/rooms/:room` report room occupancy
//!
//! The relay never looks inside payloads.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use super::message::RoomId;
use crate::config::RelayConfig;
use crate::error::{AppError, Result};

/// Room broadcast capacity
const ROOM_CHANNEL_CAPACITY: usize = 512;

/// Frame exchanged between relay and client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum RelayFrame {
    /// Server -> client: room joined
    Subscribed { room: RoomId, connections: usize },
    /// Both directions: opaque room payload
    Broadcast { payload: String },
    /// Server -> client: request rejected
    Error { message: String },
}

impl RelayFrame {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone)]
struct RelayEnvelope {
    sender: u64,
    payload: String,
}

struct RoomChannel {
    tx: broadcast::Sender<RelayEnvelope>,
    connections: usize,
}

/// Room occupancy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room: RoomId,
    pub connections: usize,
}

/// Shared relay state
pub struct RelayState {
    config: RelayConfig,
    rooms: RwLock<HashMap<RoomId, RoomChannel>>,
    next_connection: AtomicU64,
    shutdown: CancellationToken,
}

impl RelayState {
    pub fn new(config: RelayConfig, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            config,
            rooms: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            shutdown,
        })
    }

    /// Occupancy of every non-empty room
    pub fn rooms(&self) -> Vec<RoomInfo> {
        let mut rooms: Vec<RoomInfo> = self
            .rooms
            .read()
            .iter()
            .map(|(room, channel)| RoomInfo {
                room: room.clone(),
                connections: channel.connections,
            })
            .collect();
        rooms.sort_by(|a, b| a.room.cmp(&b.room));
        rooms
    }

    pub fn room(&self, room: &RoomId) -> Option<RoomInfo> {
        self.rooms.read().get(room).map(|channel| RoomInfo {
            room: room.clone(),
            connections: channel.connections,
        })
    }

    fn join(&self, room: &RoomId) -> Result<(u64, usize, broadcast::Sender<RelayEnvelope>)> {
        let mut rooms = self.rooms.write();
        let channel = rooms.entry(room.clone()).or_insert_with(|| RoomChannel {
            tx: broadcast::channel(ROOM_CHANNEL_CAPACITY).0,
            connections: 0,
        });

        if channel.connections >= self.config.room_capacity {
            return Err(AppError::InvalidState(format!(
                "Room {} is full ({} connections)",
                room, self.config.room_capacity
            )));
        }

        channel.connections += 1;
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        Ok((id, channel.connections, channel.tx.clone()))
    }

    fn leave(&self, room: &RoomId) {
        let mut rooms = self.rooms.write();
        if let Some(channel) = rooms.get_mut(room) {
            channel.connections = channel.connections.saturating_sub(1);
            if channel.connections == 0 {
                rooms.remove(room);
            }
        }
    }
}

/// Build the relay router
pub fn create_router(state: Arc<RelayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/rooms", get(list_rooms))
        .route("/api/rooms/:room", get(get_room))
        .route("/ws/:room", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the relay until `state`'s shutdown token is cancelled
pub async fn serve(listener: TcpListener, state: Arc<RelayState>) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = create_router(state);

    info!("Signaling relay listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("Signaling relay stopped");
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "success": true }))
}

async fn list_rooms(State(state): State<Arc<RelayState>>) -> Json<Vec<RoomInfo>> {
    Json(state.rooms())
}

async fn get_room(
    Path(room): Path<String>,
    State(state): State<Arc<RelayState>>,
) -> Result<Json<RoomInfo>> {
    let room = RoomId::from(room);
    state
        .room(&room)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Room not found: {}", room)))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room): Path<String>,
    State(state): State<Arc<RelayState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, RoomId::from(room), state))
}

/// Relay one client connection
async fn handle_socket(socket: WebSocket, room: RoomId, state: Arc<RelayState>) {
    let (mut sender, mut receiver) = socket.split();

    let (conn_id, connections, room_tx) = match state.join(&room) {
        Ok(joined) => joined,
        Err(e) => {
            warn!("Rejecting relay client: {}", e);
            let frame = RelayFrame::Error {
                message: e.to_string(),
            };
            if let Ok(json) = frame.to_json() {
                let _ = sender.send(Message::Text(json)).await;
            }
            let _ = sender.close().await;
            return;
        }
    };
    let mut room_rx = room_tx.subscribe();

    info!("Relay client {} joined room {} ({} connected)", conn_id, room, connections);

    let subscribed = RelayFrame::Subscribed {
        room: room.clone(),
        connections,
    };
    let subscribed_sent = match subscribed.to_json() {
        Ok(json) => sender.send(Message::Text(json)).await.is_ok(),
        Err(_) => false,
    };

    let mut heartbeat_interval = tokio::time::interval(tokio::time::Duration::from_secs(
        state.config.heartbeat_secs.max(1),
    ));

    while subscribed_sent {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<RelayFrame>(&text) {
                        Ok(RelayFrame::Broadcast { payload }) => {
                            let _ = room_tx.send(RelayEnvelope { sender: conn_id, payload });
                        }
                        Ok(other) => debug!("Ignoring client frame: {:?}", other),
                        Err(e) => debug!("Dropping malformed relay frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("Relay receive error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            envelope = room_rx.recv() => {
                match envelope {
                    Ok(env) if env.sender == conn_id => {}
                    Ok(env) => {
                        let frame = RelayFrame::Broadcast { payload: env.payload };
                        if let Ok(json) = frame.to_json() {
                            if sender.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Relay client {} lagged by {} messages", conn_id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = heartbeat_interval.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
            }
        }
    }

    state.leave(&room);
    info!("Relay client {} left room {}", conn_id, room);
}
