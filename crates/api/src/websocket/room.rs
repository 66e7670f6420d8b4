//! Local room map
//!
//! Tracks, for every room known to this instance, the room record and the
//! connections registered in it here. Membership across instances lives in
//! the shared store; this map only decides who receives a fanned-out frame.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use drn_shared::Room;

use super::connection::Connection;

/// Room record plus the local members keyed by uid
#[derive(Debug)]
struct LocalRoom {
    room: Room,
    members: HashMap<String, Arc<Connection>>,
}

/// Outcome of registering a connection in a local room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalJoin {
    Joined,
    AlreadyMember,
    UnknownRoom,
}

/// Manages the rooms known to this instance
pub struct RoomManager {
    rooms: RwLock<HashMap<String, LocalRoom>>,
}

impl RoomManager {
    /// Create a new room manager
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Start tracking a room. Returns false if it was already known.
    pub async fn insert_room(&self, room: Room) -> bool {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(&room.id) {
            return false;
        }

        tracing::debug!(room_id = %room.id, "Tracking room locally");
        rooms.insert(
            room.id.clone(),
            LocalRoom {
                room,
                members: HashMap::new(),
            },
        );
        true
    }

    /// Replace the metadata of a known room, keeping its members
    pub async fn update_room(&self, room: Room) -> bool {
        let mut rooms = self.rooms.write().await;
        match rooms.get_mut(&room.id) {
            Some(local) => {
                local.room = room;
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    pub async fn room(&self, room_id: &str) -> Option<Room> {
        self.rooms.read().await.get(room_id).map(|local| local.room.clone())
    }

    /// Forget a room and hand back the connections that were registered in it
    pub async fn remove_room(&self, room_id: &str) -> Option<Vec<Arc<Connection>>> {
        let removed = self.rooms.write().await.remove(room_id)?;
        let members: Vec<_> = removed.members.into_values().collect();

        for conn in &members {
            conn.untrack_room(room_id).await;
        }

        tracing::debug!(room_id = %room_id, members = members.len(), "Removed local room");
        Some(members)
    }

    /// Register a connection in a room under its uid
    pub async fn join(&self, room_id: &str, conn: Arc<Connection>) -> LocalJoin {
        let mut rooms = self.rooms.write().await;
        let Some(local) = rooms.get_mut(room_id) else {
            return LocalJoin::UnknownRoom;
        };
        if local.members.contains_key(&conn.uid) {
            return LocalJoin::AlreadyMember;
        }

        local.members.insert(conn.uid.clone(), Arc::clone(&conn));
        conn.track_room(room_id).await;

        tracing::debug!(
            room_id = %room_id,
            session_id = %conn.session_id,
            uid = %conn.uid,
            room_size = local.members.len(),
            "Connection joined room"
        );
        LocalJoin::Joined
    }

    /// Remove a connection's registration. Returns false if this exact
    /// connection was not registered.
    pub async fn leave(&self, room_id: &str, conn: &Connection) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(local) = rooms.get_mut(room_id) else {
            return false;
        };

        let registered = local
            .members
            .get(&conn.uid)
            .is_some_and(|member| member.session_id == conn.session_id);
        if !registered {
            return false;
        }

        local.members.remove(&conn.uid);
        conn.untrack_room(room_id).await;

        tracing::debug!(
            room_id = %room_id,
            session_id = %conn.session_id,
            room_size = local.members.len(),
            "Connection left room"
        );
        true
    }

    /// Whether this exact connection is registered in the room
    pub async fn is_member(&self, room_id: &str, conn: &Connection) -> bool {
        self.rooms
            .read()
            .await
            .get(room_id)
            .and_then(|local| local.members.get(&conn.uid))
            .is_some_and(|member| member.session_id == conn.session_id)
    }

    /// Remove a connection from every room it is registered in and return
    /// those room ids
    pub async fn remove_connection(&self, conn: &Connection) -> Vec<String> {
        let joined = conn.joined_rooms().await;
        let mut removed_from = Vec::with_capacity(joined.len());

        for room_id in joined {
            if self.leave(&room_id, conn).await {
                removed_from.push(room_id);
            } else {
                conn.untrack_room(&room_id).await;
            }
        }

        if !removed_from.is_empty() {
            tracing::debug!(
                session_id = %conn.session_id,
                room_count = removed_from.len(),
                "Removed connection from rooms"
            );
        }
        removed_from
    }

    /// Send a text frame to every local member of a room, optionally skipping
    /// one uid. A failed send is logged and does not stop the broadcast.
    pub async fn broadcast(&self, room_id: &str, text: &str, skip_uid: Option<&str>) -> usize {
        let rooms = self.rooms.read().await;
        let Some(local) = rooms.get(room_id) else {
            tracing::debug!(room_id = %room_id, "No local room for broadcast");
            return 0;
        };

        let mut success_count = 0;
        let mut failed_count = 0;

        for (uid, conn) in &local.members {
            if skip_uid == Some(uid.as_str()) {
                continue;
            }
            match conn.send_text(text.to_string()) {
                Ok(()) => success_count += 1,
                Err(_) => {
                    failed_count += 1;
                    tracing::warn!(
                        room_id = %room_id,
                        session_id = %conn.session_id,
                        uid = %uid,
                        "Failed to deliver room event to connection (likely closed)"
                    );
                }
            }
        }

        tracing::debug!(
            room_id = %room_id,
            recipients = success_count,
            failed = failed_count,
            "Broadcast event to room"
        );
        success_count
    }

    pub async fn members(&self, room_id: &str) -> Vec<Arc<Connection>> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(|local| local.members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every (room id, uid) pair registered on this instance
    pub async fn local_members(&self) -> Vec<(String, String)> {
        self.rooms
            .read()
            .await
            .iter()
            .flat_map(|(room_id, local)| {
                local
                    .members
                    .keys()
                    .map(move |uid| (room_id.clone(), uid.clone()))
            })
            .collect()
    }

    pub async fn room_ids(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub async fn get_room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::websocket::connection::Outbound;
    use serde_json::Map;
    use tokio::sync::mpsc;

    fn room(id: &str) -> Room {
        Room {
            id: id.to_string(),
            name: format!("Room {id}"),
            no_expiration: false,
            metadata: Map::new(),
        }
    }

    fn connection(uid: &str) -> (Arc<Connection>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Connection::new(uid, tx)), rx)
    }

    #[tokio::test]
    async fn test_room_join_and_leave() {
        let room_manager = RoomManager::new();
        let (conn, _rx) = connection("u1");

        assert_eq!(room_manager.join("r1", Arc::clone(&conn)).await, LocalJoin::UnknownRoom);

        assert!(room_manager.insert_room(room("r1")).await);
        assert!(!room_manager.insert_room(room("r1")).await);

        assert_eq!(room_manager.join("r1", Arc::clone(&conn)).await, LocalJoin::Joined);
        assert_eq!(room_manager.join("r1", Arc::clone(&conn)).await, LocalJoin::AlreadyMember);
        assert_eq!(room_manager.members("r1").await.len(), 1);
        assert!(room_manager.is_member("r1", &conn).await);
        assert!(conn.joined_rooms().await.contains("r1"));

        assert!(room_manager.leave("r1", &conn).await);
        assert!(!room_manager.leave("r1", &conn).await);
        assert_eq!(room_manager.members("r1").await.len(), 0);
        assert!(conn.joined_rooms().await.is_empty());

        // Rooms outlive their members
        assert!(room_manager.contains("r1").await);
    }

    #[tokio::test]
    async fn test_leave_ignores_other_session_with_same_uid() {
        let room_manager = RoomManager::new();
        room_manager.insert_room(room("r1")).await;

        let (first, _rx1) = connection("u1");
        let (second, _rx2) = connection("u1");

        room_manager.join("r1", Arc::clone(&first)).await;
        assert!(!room_manager.is_member("r1", &second).await);
        assert!(!room_manager.leave("r1", &second).await);
        assert!(room_manager.is_member("r1", &first).await);
    }

    #[tokio::test]
    async fn test_broadcast_to_room() {
        let room_manager = RoomManager::new();
        room_manager.insert_room(room("r1")).await;

        let (conn1, mut rx1) = connection("u1");
        let (conn2, mut rx2) = connection("u2");
        room_manager.join("r1", conn1).await;
        room_manager.join("r1", conn2).await;

        let delivered = room_manager.broadcast("r1", "{}", None).await;
        assert_eq!(delivered, 2);
        assert_eq!(rx1.try_recv().unwrap(), Outbound::Text("{}".to_string()));
        assert_eq!(rx2.try_recv().unwrap(), Outbound::Text("{}".to_string()));

        let delivered = room_manager.broadcast("r1", "{}", Some("u1")).await;
        assert_eq!(delivered, 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_survives_closed_connection() {
        let room_manager = RoomManager::new();
        room_manager.insert_room(room("r1")).await;

        let (gone, gone_rx) = connection("u1");
        let (alive, mut alive_rx) = connection("u2");
        room_manager.join("r1", gone).await;
        room_manager.join("r1", alive).await;
        drop(gone_rx);

        assert_eq!(room_manager.broadcast("r1", "{}", None).await, 1);
        assert!(alive_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_remove_connection_from_all_rooms() {
        let room_manager = RoomManager::new();
        room_manager.insert_room(room("r1")).await;
        room_manager.insert_room(room("r2")).await;

        let (conn, _rx) = connection("u1");
        room_manager.join("r1", Arc::clone(&conn)).await;
        room_manager.join("r2", Arc::clone(&conn)).await;
        assert_eq!(room_manager.local_members().await.len(), 2);

        let mut removed = room_manager.remove_connection(&conn).await;
        removed.sort();
        assert_eq!(removed, vec!["r1".to_string(), "r2".to_string()]);
        assert!(room_manager.local_members().await.is_empty());
        assert_eq!(room_manager.get_room_count().await, 2);
    }

    #[tokio::test]
    async fn test_remove_room_returns_members() {
        let room_manager = RoomManager::new();
        room_manager.insert_room(room("r1")).await;

        let (conn, _rx) = connection("u1");
        room_manager.join("r1", Arc::clone(&conn)).await;

        let members = room_manager.remove_room("r1").await.unwrap();
        assert_eq!(members.len(), 1);
        assert!(!room_manager.contains("r1").await);
        assert!(conn.joined_rooms().await.is_empty());
        assert!(room_manager.remove_room("r1").await.is_none());
    }

    #[tokio::test]
    async fn test_update_room_keeps_members() {
        let room_manager = RoomManager::new();
        room_manager.insert_room(room("r1")).await;
        let (conn, _rx) = connection("u1");
        room_manager.join("r1", conn).await;

        let mut renamed = room("r1");
        renamed.name = "Renamed".to_string();
        assert!(room_manager.update_room(renamed).await);
        assert_eq!(room_manager.room("r1").await.unwrap().name, "Renamed");
        assert_eq!(room_manager.members("r1").await.len(), 1);

        assert!(!room_manager.update_room(room("missing")).await);
    }
}
