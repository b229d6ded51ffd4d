//! WebSocket signaling client for the relay server

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::message::RoomId;
use super::relay::RelayFrame;
use super::transport::{SignalingTransport, Subscription, SubscriptionEvent};
use crate::error::{AppError, Result};

struct RoomConnection {
    frames: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

/// Signaling transport speaking to a relay server
pub struct WsTransport {
    base_url: String,
    rooms: Mutex<HashMap<RoomId, RoomConnection>>,
}

impl WsTransport {
    /// `base_url` is the relay root, e.g. `ws://127.0.0.1:8787`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rooms: Mutex::new(HashMap::new()),
        }
    }

    fn room_url(&self, room: &RoomId) -> Result<String> {
        let name = room.as_str();
        if name.is_empty()
            || name
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, '/' | '?' | '#' | '%'))
        {
            return Err(AppError::Signaling(format!(
                "Room id {:?} cannot be used in a relay URL",
                name
            )));
        }
        Ok(format!("{}/ws/{}", self.base_url, name))
    }

    fn frame_sender(&self, room: &RoomId) -> Result<mpsc::UnboundedSender<String>> {
        self.rooms
            .lock()
            .get(room)
            .map(|conn| conn.frames.clone())
            .ok_or_else(|| AppError::ChannelNotReady(room.to_string()))
    }
}

#[async_trait]
impl SignalingTransport for WsTransport {
    async fn subscribe(&self, room: &RoomId) -> Result<Subscription> {
        let url = self.room_url(room)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| AppError::Signaling(format!("websocket connect failed: {}", e)))?;
        debug!("Signaling websocket connected: {}", url);

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    frame = frame_rx.recv() => match frame {
                        Some(text) => {
                            if ws_write.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            // Drain frames queued before cancellation (e.g. a final leave)
            while let Ok(text) = frame_rx.try_recv() {
                let _ = ws_write.send(Message::Text(text)).await;
            }
            let _ = ws_write.close().await;
        });

        let reader_cancel = cancel.clone();
        let room_name = room.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    msg = ws_read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            trace!("Relay frame on {}: {}", room_name, text);
                            let event = match serde_json::from_str::<RelayFrame>(&text) {
                                Ok(RelayFrame::Subscribed { connections, .. }) => {
                                    info!("Subscribed to room {} ({} connected)", room_name, connections);
                                    SubscriptionEvent::Subscribed
                                }
                                Ok(RelayFrame::Broadcast { payload }) => SubscriptionEvent::Message(payload),
                                Ok(RelayFrame::Error { message }) => {
                                    warn!("Relay rejected room {}: {}", room_name, message);
                                    continue;
                                }
                                Err(e) => {
                                    debug!("Dropping malformed relay frame: {}", e);
                                    continue;
                                }
                            };
                            if event_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!("Signaling websocket error on {}: {}", room_name, e);
                            break;
                        }
                        _ => {}
                    },
                }
            }
            let _ = event_tx.send(SubscriptionEvent::Closed);
        });

        let previous = self.rooms.lock().insert(
            room.clone(),
            RoomConnection {
                frames: frame_tx,
                cancel,
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        Ok(Subscription::new(room.clone(), event_rx))
    }

    async fn publish(&self, room: &RoomId, payload: String) -> Result<()> {
        self.publish_now(room, payload)
    }

    fn publish_now(&self, room: &RoomId, payload: String) -> Result<()> {
        let frames = self.frame_sender(room)?;
        let frame = RelayFrame::Broadcast { payload }.to_json()?;
        frames
            .send(frame)
            .map_err(|_| AppError::ChannelNotReady(room.to_string()))
    }

    async fn unsubscribe(&self, room: &RoomId) -> Result<()> {
        if let Some(conn) = self.rooms.lock().remove(room) {
            conn.cancel.cancel();
        }
        Ok(())
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        for (_, conn) in self.rooms.lock().drain() {
            conn.cancel.cancel();
        }
    }
}
