//! Room registry operations for administrative callers

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use drn_shared::{Expiry, MemberProfile, Room, RoomInput};

use super::RealtimeService;
use crate::error::{ApiError, ApiResult};
use crate::websocket::events::ServerEvent;

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomOptions {
    /// Room record and member presence never expire
    #[serde(default)]
    pub no_expiration: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRemoval {
    pub room_id: String,
}

/// Snapshot of every persisted room and its present members
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    pub rooms: Vec<Room>,
    pub profiles_per_room: BTreeMap<String, Vec<MemberProfile>>,
}

impl RealtimeService {
    fn room_expiry(&self, room: &Room) -> Expiry {
        if room.no_expiration {
            Expiry::Never
        } else {
            Expiry::After(self.inner.settings.presence_ttl)
        }
    }

    /// Persist a new room, start serving it here and announce it to every
    /// other instance
    pub async fn create_room(&self, input: RoomInput, options: CreateRoomOptions) -> ApiResult<Room> {
        let mut room = input.into_room();
        room.no_expiration |= options.no_expiration;
        let room_id = room.id.clone();

        if !self.inner.rooms.insert_room(room.clone()).await {
            return Err(ApiError::Conflict("Room exist already".to_string()));
        }

        let room_key = self.inner.keys.room_key(&room_id);
        let persisted = self
            .inner
            .store
            .set_json(&room_key, &room, self.room_expiry(&room))
            .await;
        if let Err(e) = persisted {
            self.inner.rooms.remove_room(&room_id).await;
            return Err(e.into());
        }

        if let Err(e) = self.subscribe_room(&room_id).await {
            self.inner.rooms.remove_room(&room_id).await;
            if let Err(cleanup) = self.inner.store.delete(&[room_key]).await {
                tracing::error!(room_id = %room_id, error = %cleanup, "Failed to delete room record after subscribe failure");
            }
            return Err(e.into());
        }

        let announcement = serde_json::to_string(&room).map_err(|_| ApiError::Internal)?;
        if let Err(e) = self
            .publish(&self.inner.keys.control_channel(), &announcement)
            .await
        {
            // Other instances still learn about the room on their next start
            tracing::error!(room_id = %room_id, error = %e, "Failed to announce room");
        }

        tracing::info!(room_id = %room_id, no_expiration = room.no_expiration, "Room created");
        Ok(room)
    }

    /// Every persisted room
    pub async fn get_rooms(&self) -> ApiResult<Vec<Room>> {
        Ok(self.get_persisted_rooms().await?)
    }

    pub(super) async fn get_persisted_rooms(&self) -> drn_shared::StoreResult<Vec<Room>> {
        self.inner
            .store
            .get_matched_json(&self.inner.keys.room_pattern())
            .await
    }

    /// Replace the metadata of a room and notify its members
    pub async fn update_room(&self, id: &str, input: RoomInput) -> ApiResult<Room> {
        let Some(current) = self.inner.rooms.room(id).await else {
            return Err(ApiError::NotFound("No such room".to_string()));
        };

        if input.id.as_deref().is_some_and(|payload_id| payload_id != id) {
            return Err(ApiError::BadRequest(
                "Room id in payload and in path do not match".to_string(),
            ));
        }

        let room = Room {
            id: id.to_string(),
            name: input.name,
            no_expiration: current.no_expiration,
            metadata: input.metadata,
        };

        self.inner
            .store
            .set_json(&self.inner.keys.room_key(id), &room, Expiry::Keep)
            .await?;

        self.publish_event(id, &ServerEvent::RoomUpdated { room: room.clone() })
            .await?;

        tracing::info!(room_id = %id, "Room updated");
        Ok(room)
    }

    /// Announce removal on the room channel. Every instance serving the room
    /// closes its members and forgets the room when the event arrives.
    pub async fn remove_room(&self, id: &str) -> ApiResult<RoomRemoval> {
        if !self.inner.rooms.contains(id).await {
            return Err(ApiError::NotFound(format!("There is no live room by id {id}")));
        }

        self.publish_event(
            id,
            &ServerEvent::RoomRemoved {
                room_id: id.to_string(),
            },
        )
        .await?;

        Ok(RoomRemoval {
            room_id: id.to_string(),
        })
    }

    pub async fn debug_info(&self) -> ApiResult<DebugInfo> {
        let rooms = self.get_persisted_rooms().await?;

        let mut profiles_per_room = BTreeMap::new();
        for room in &rooms {
            let members = self.inner.presence.members(&room.id).await?;
            profiles_per_room.insert(room.id.clone(), members);
        }

        Ok(DebugInfo {
            rooms,
            profiles_per_room,
        })
    }
}
