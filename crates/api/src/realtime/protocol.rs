//! Client event handling
//!
//! Validates decoded client events, records presence and publishes the
//! resulting room events. Protocol mistakes are answered on the same socket
//! and never close it.

use std::sync::Arc;

use serde_json::{Map, Value};

use drn_shared::MemberProfile;

use super::RealtimeService;
use crate::websocket::connection::Connection;
use crate::websocket::events::{ClientEvent, ServerEvent};
use crate::websocket::room::LocalJoin;

/// Mistakes reported back to the client as `{ "message": ... }`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid event format")]
    InvalidEvent,

    #[error("No room id")]
    NoRoomId,

    #[error("No such room")]
    NoSuchRoom,

    #[error("Profile is needed")]
    ProfileNeeded,

    #[error("Already in the room. If you are trying to connect from different client, disconnect that client first.")]
    AlreadyInRoom,

    #[error("Could not join the room, try again")]
    JoinFailed,
}

impl RealtimeService {
    /// Decode and handle one text frame from a client
    pub async fn handle_text(&self, conn: &Arc<Connection>, text: &str) {
        let event = match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    session_id = %conn.session_id,
                    error = %e,
                    "Failed to parse client event"
                );
                conn.send_error(ProtocolError::InvalidEvent);
                return;
            }
        };

        if let Err(e) = self.handle_event(conn, event).await {
            tracing::debug!(session_id = %conn.session_id, uid = %conn.uid, error = %e, "Rejected client event");
            conn.send_error(e);
        }
    }

    pub async fn handle_event(&self, conn: &Arc<Connection>, event: ClientEvent) -> Result<(), ProtocolError> {
        match event {
            ClientEvent::Join { room_id, profile } => self.join(conn, room_id, profile).await,
            ClientEvent::Message { room_id, payload } => {
                self.message(conn, room_id, payload).await;
                Ok(())
            }
            ClientEvent::Leave { room_id } => {
                self.leave(conn, room_id).await;
                Ok(())
            }
        }
    }

    /// Enter a room
    ///
    /// The member list is read before the presence entry is written, so the
    /// direct reply lists everyone who was there first. The write is a
    /// set-if-absent; a uid already present anywhere is refused.
    pub async fn join(
        &self,
        conn: &Arc<Connection>,
        room_id: Option<String>,
        profile: Option<Value>,
    ) -> Result<(), ProtocolError> {
        let room_id = room_id
            .filter(|id| !id.is_empty())
            .ok_or(ProtocolError::NoRoomId)?;
        let room = self
            .inner
            .rooms
            .room(&room_id)
            .await
            .ok_or(ProtocolError::NoSuchRoom)?;
        let fields = match profile {
            Some(Value::Object(fields)) => fields,
            _ => return Err(ProtocolError::ProfileNeeded),
        };
        let profile = MemberProfile::new(conn.uid.clone(), fields);

        let member_profiles = self.inner.presence.members(&room_id).await.map_err(|e| {
            tracing::error!(room_id = %room_id, error = %e, "Failed to read room members");
            ProtocolError::JoinFailed
        })?;

        match self.inner.presence.claim(&room, &profile).await {
            Ok(true) => {}
            Ok(false) => return Err(ProtocolError::AlreadyInRoom),
            Err(e) => {
                tracing::error!(room_id = %room_id, uid = %conn.uid, error = %e, "Failed to record presence");
                return Err(ProtocolError::JoinFailed);
            }
        }

        let registered = self.inner.rooms.join(&room_id, Arc::clone(conn)).await;
        if registered != LocalJoin::Joined {
            self.drop_presence(&room_id, &conn.uid).await;
            return Err(match registered {
                LocalJoin::UnknownRoom => ProtocolError::NoSuchRoom,
                _ => ProtocolError::AlreadyInRoom,
            });
        }

        let joined = ServerEvent::Joined {
            uid: conn.uid.clone(),
            room_id: room_id.clone(),
            profile: Some(profile.fields.clone()),
            member_profiles: None,
        };
        if self.publish_event(&room_id, &joined).await.is_err() {
            self.inner.rooms.leave(&room_id, conn).await;
            self.drop_presence(&room_id, &conn.uid).await;
            return Err(ProtocolError::JoinFailed);
        }

        let reply = ServerEvent::Joined {
            uid: conn.uid.clone(),
            room_id: room_id.clone(),
            profile: Some(profile.fields),
            member_profiles: Some(member_profiles),
        };
        if conn.send_event(&reply).is_err() {
            tracing::debug!(session_id = %conn.session_id, "Connection closed before join reply");
        }

        tracing::info!(room_id = %room_id, uid = %conn.uid, session_id = %conn.session_id, "Member joined room");
        Ok(())
    }

    /// Relay a payload to the room. Ignored unless this connection joined it.
    pub async fn message(&self, conn: &Connection, room_id: Option<String>, mut payload: Map<String, Value>) {
        let Some(room_id) = room_id else {
            return;
        };
        if !self.inner.rooms.is_member(&room_id, conn).await {
            tracing::debug!(room_id = %room_id, uid = %conn.uid, "Ignoring message for room not joined");
            return;
        }

        // The sender is always the verified identity
        payload.remove("uid");

        let event = ServerEvent::Message {
            uid: conn.uid.clone(),
            room_id: room_id.clone(),
            payload,
        };
        // Failure is already logged
        let _ = self.publish_event(&room_id, &event).await;
    }

    /// Leave a room. Ignored unless this connection joined it.
    pub async fn leave(&self, conn: &Connection, room_id: Option<String>) {
        let Some(room_id) = room_id else {
            return;
        };
        if !self.inner.rooms.leave(&room_id, conn).await {
            return;
        }

        self.drop_presence(&room_id, &conn.uid).await;

        let event = ServerEvent::Left {
            uid: conn.uid.clone(),
            room_id: room_id.clone(),
            closed: None,
        };
        let _ = self.publish_event(&room_id, &event).await;

        tracing::info!(room_id = %room_id, uid = %conn.uid, "Member left room");
    }

    /// Close path for a connection, whatever ended it
    pub async fn disconnect(&self, conn: &Connection) {
        let rooms = self.inner.rooms.remove_connection(conn).await;

        for room_id in &rooms {
            self.drop_presence(room_id, &conn.uid).await;

            let event = ServerEvent::Left {
                uid: conn.uid.clone(),
                room_id: room_id.clone(),
                closed: Some(true),
            };
            let _ = self.publish_event(room_id, &event).await;
        }

        tracing::info!(
            session_id = %conn.session_id,
            uid = %conn.uid,
            rooms = rooms.len(),
            "Connection closed"
        );
    }

    async fn drop_presence(&self, room_id: &str, uid: &str) {
        if let Err(e) = self.inner.presence.remove(room_id, uid).await {
            tracing::error!(room_id = %room_id, uid = %uid, error = %e, "Failed to delete presence");
        }
    }
}
