//! Live check-in feed over WebSocket.
//!
//! Each event gets its own [`broadcast`] channel, created when the first
//! client subscribes and dropped when the last one leaves. Messages are
//! serialized once and shared between receivers.
//!
//! Every frame is a JSON envelope:
//!
//! ```json
//! { "type": "checkin", "event_id": 3, "data": { ... } }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::Extension;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::app::SharedState;
use crate::error::Result;
use crate::login::CurrentUser;
use crate::models::Permission;

/// Kind of frame pushed to dashboard clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Hello,
    Checkin,
    Checkout,
    Reset,
    AttendeeAdded,
    AttendeeUpdated,
    AttendeeRemoved,
    Stats,
    /// The client fell behind and should reload its view.
    Resync,
    Pong,
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: MessageKind,
    event_id: i64,
    data: &'a T,
}

/// Serialize one frame.
///
/// # Errors
///
/// Returns an error if `data` cannot be serialized.
pub fn encode<T: Serialize>(kind: MessageKind, event_id: i64, data: &T) -> Result<String> {
    Ok(serde_json::to_string(&Envelope {
        kind,
        event_id,
        data,
    })?)
}

/// Registry of per-event broadcast channels.
#[derive(Debug)]
pub struct WsManager {
    capacity: usize,
    channels: Mutex<HashMap<i64, broadcast::Sender<Arc<str>>>>,
}

impl WsManager {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, event_id: i64) -> broadcast::Receiver<Arc<str>> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(event_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop the channel of an event once nobody listens to it any more.
    /// Call after the receiver has been dropped.
    pub fn release(&self, event_id: i64) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if channels
            .get(&event_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            channels.remove(&event_id);
            debug!(event_id, "Closed realtime channel");
        }
    }

    #[must_use]
    pub fn subscriber_count(&self, event_id: i64) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.get(&event_id).map_or(0, broadcast::Sender::receiver_count)
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Push a frame to everyone watching `event_id`.
    ///
    /// Returns how many clients it reached. Nothing is serialized when no
    /// one is listening.
    pub fn publish<T: Serialize>(&self, event_id: i64, kind: MessageKind, data: &T) -> usize {
        let Some(tx) = self
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event_id)
            .cloned()
        else {
            return 0;
        };

        match encode(kind, event_id, data) {
            Ok(frame) => tx.send(Arc::from(frame)).unwrap_or(0),
            Err(e) => {
                warn!(event_id, error = %e, "Failed to encode realtime message");
                0
            }
        }
    }
}

#[derive(Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    kind: String,
}

/// `GET /ws/events/:event_id`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(event_id): Path<i64>,
) -> Result<Response> {
    state.authorize(user.id, event_id, Permission::View)?;
    let user_id = user.id;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, event_id, user_id)))
}

async fn handle_socket(mut socket: WebSocket, state: SharedState, event_id: i64, user_id: i64) {
    let mut rx = state.realtime.subscribe(event_id);
    debug!(event_id, user_id, "Realtime client connected");

    let hello = crate::dashboard::cached_stats(&state, event_id)
        .and_then(|stats| encode(MessageKind::Hello, event_id, &stats));
    match hello {
        Ok(frame) => {
            if socket.send(Message::Text(frame)).await.is_err() {
                drop(rx);
                state.realtime.release(event_id);
                return;
            }
        }
        Err(e) => warn!(event_id, error = %e, "Could not build hello frame"),
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let is_ping = text.trim() == "ping"
                        || serde_json::from_str::<ClientFrame>(&text).is_ok_and(|f| f.kind == "ping");
                    if is_ping {
                        let pong = encode(MessageKind::Pong, event_id, &serde_json::Value::Null);
                        if let Ok(frame) = pong {
                            if socket.send(Message::Text(frame)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            outgoing = rx.recv() => match outgoing {
                Ok(frame) => {
                    if socket.send(Message::Text(frame.to_string())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(event_id, skipped, "Realtime client lagged");
                    let resync = encode(
                        MessageKind::Resync,
                        event_id,
                        &serde_json::json!({ "skipped": skipped }),
                    );
                    if let Ok(frame) = resync {
                        if socket.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    drop(rx);
    state.realtime.release(event_id);
    debug!(event_id, user_id, "Realtime client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let frame = encode(MessageKind::AttendeeAdded, 4, &serde_json::json!({"id": 9})).unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "attendee_added");
        assert_eq!(value["event_id"], 4);
        assert_eq!(value["data"]["id"], 9);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let manager = WsManager::new(8);
        assert_eq!(manager.publish(1, MessageKind::Stats, &1), 0);
        assert_eq!(manager.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_of_that_event_only() {
        let manager = WsManager::new(8);
        let mut first = manager.subscribe(1);
        let mut second = manager.subscribe(1);
        let mut other = manager.subscribe(2);

        assert_eq!(manager.publish(1, MessageKind::Checkin, &"SV01"), 2);

        let a = first.recv().await.unwrap();
        let b = second.recv().await.unwrap();
        assert_eq!(a, b);
        assert!(a.contains("\"type\":\"checkin\""));
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn test_release_drops_idle_channels() {
        let manager = WsManager::new(8);
        let first = manager.subscribe(1);
        let second = manager.subscribe(1);
        assert_eq!(manager.subscriber_count(1), 2);

        drop(first);
        manager.release(1);
        assert_eq!(manager.channel_count(), 1);

        drop(second);
        manager.release(1);
        assert_eq!(manager.channel_count(), 0);
        assert_eq!(manager.subscriber_count(1), 0);
    }

    #[tokio::test]
    async fn test_slow_receiver_lags() {
        let manager = WsManager::new(2);
        let mut rx = manager.subscribe(1);
        for i in 0..5 {
            manager.publish(1, MessageKind::Stats, &i);
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
    }
}
