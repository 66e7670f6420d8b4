//! WebSocket connection management
//!
//! Represents an authenticated WebSocket connection with room tracking. The
//! transport itself is owned by the writer task; everything else talks to it
//! through the outbound channel.

use std::collections::HashSet;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::events::{ErrorPayload, ServerEvent};

/// Close codes sent by the server
pub mod close_code {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Origin header missing or not allowed
    pub const ORIGIN_REJECTED: u16 = 1001;
    /// No token query parameter
    pub const TOKEN_MISSING: u16 = 1002;
    /// Token failed verification
    pub const TOKEN_INVALID: u16 = 1003;
    /// Peer stopped answering pings
    pub const HEARTBEAT_TIMEOUT: u16 = 1001;
    /// Server is shutting down
    pub const GOING_AWAY: u16 = 1001;
}

/// Frame queued for the writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

#[derive(Debug, thiserror::Error)]
#[error("Connection closed")]
pub struct ConnectionClosed;

/// Represents an active WebSocket connection
#[derive(Debug)]
pub struct Connection {
    /// Unique session ID for this connection
    pub session_id: Uuid,

    /// Identity from the verified token; immutable for the connection lifetime
    pub uid: String,

    /// Channel to send frames to this connection
    sender: mpsc::UnboundedSender<Outbound>,

    /// Rooms this connection is registered in on this instance
    rooms: RwLock<HashSet<String>>,
}

impl Connection {
    /// Create a new connection
    pub fn new(uid: impl Into<String>, sender: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            uid: uid.into(),
            sender,
            rooms: RwLock::new(HashSet::new()),
        }
    }

    /// Queue a raw JSON text frame
    pub fn send_text(&self, text: String) -> Result<(), ConnectionClosed> {
        self.sender.send(Outbound::Text(text)).map_err(|_| ConnectionClosed)
    }

    /// Serialize and queue a server event
    pub fn send_event(&self, event: &ServerEvent) -> Result<(), ConnectionClosed> {
        match serde_json::to_string(event) {
            Ok(json) => self.send_text(json),
            Err(e) => {
                tracing::error!(error = ?e, event = event.name(), "Failed to serialize WebSocket event");
                Ok(())
            }
        }
    }

    /// Answer a protocol mistake on this socket. The connection stays open.
    pub fn send_error(&self, message: impl ToString) {
        let payload = ErrorPayload {
            message: message.to_string(),
        };
        match serde_json::to_string(&payload) {
            Ok(json) => {
                if self.send_text(json).is_err() {
                    tracing::debug!(session_id = %self.session_id, "Dropped error payload for closed connection");
                }
            }
            Err(e) => tracing::error!(error = ?e, "Failed to serialize error payload"),
        }
    }

    pub fn ping(&self) -> Result<(), ConnectionClosed> {
        self.sender.send(Outbound::Ping).map_err(|_| ConnectionClosed)
    }

    /// Ask the writer to send a close frame and stop
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.sender.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub(crate) async fn track_room(&self, room_id: &str) {
        self.rooms.write().await.insert(room_id.to_string());
    }

    pub(crate) async fn untrack_room(&self, room_id: &str) {
        self.rooms.write().await.remove(room_id);
    }

    /// Rooms this connection is currently registered in
    pub async fn joined_rooms(&self) -> HashSet<String> {
        self.rooms.read().await.clone()
    }
}
