// src/gateway/connection.rs
// A thin wrapper around the WebSocket sender half that serializes sends and
// tolerates a connection that has already gone away, mirroring the teacher's
// `api/ws/chat/connection.rs` `WebSocketConnection` (shared sink behind a
// mutex, a closed flag checked before every send so a lagging heartbeat or
// fan-out task never errors on a dead socket).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::Mutex;

use super::message::WsServerMessage;

pub struct WebSocketConnection {
    sender: Mutex<SplitSink<WebSocket, Message>>,
    closed: AtomicBool,
}

impl WebSocketConnection {
    pub fn new(sender: SplitSink<WebSocket, Message>) -> Arc<Self> {
        Arc::new(Self { sender: Mutex::new(sender), closed: AtomicBool::new(false) })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Serializes and sends one server event. A best-effort no-op once the
    /// connection is known closed, so a fan-out racing a disconnect never
    /// surfaces a spurious send error.
    pub async fn send(&self, msg: &WsServerMessage) -> Result<(), axum::Error> {
        if self.is_closed() {
            return Ok(());
        }
        let text = serde_json::to_string(msg).expect("WsServerMessage is always serializable");
        let mut sender = self.sender.lock().await;
        sender.send(Message::Text(text.into())).await
    }

    pub async fn ping(&self) -> Result<(), axum::Error> {
        if self.is_closed() {
            return Ok(());
        }
        let mut sender = self.sender.lock().await;
        sender.send(Message::Ping(Vec::new().into())).await
    }

    pub async fn close(&self) {
        self.mark_closed();
        let mut sender = self.sender.lock().await;
        let _ = sender.close().await;
    }
}
