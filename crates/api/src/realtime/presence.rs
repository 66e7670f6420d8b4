//! Member presence in the shared store
//!
//! One entry per (room, uid), holding the member profile. Entries of
//! expiring rooms carry a TTL that live connections keep refreshing.

use std::sync::Arc;
use std::time::Duration;

use drn_shared::{Expiry, Keyspace, MemberProfile, Room, SharedStore, StoreResult};

pub struct PresenceTracker {
    store: Arc<dyn SharedStore>,
    keys: Keyspace,
    ttl: Duration,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn SharedStore>, keys: Keyspace, ttl: Duration) -> Self {
        Self { store, keys, ttl }
    }

    fn expiry(&self, room: &Room) -> Expiry {
        if room.no_expiration {
            Expiry::Never
        } else {
            Expiry::After(self.ttl)
        }
    }

    /// Profiles of every member currently present in a room
    pub async fn members(&self, room_id: &str) -> StoreResult<Vec<MemberProfile>> {
        self.store
            .get_matched_json(&self.keys.member_pattern(room_id))
            .await
    }

    /// Record a member atomically. Returns false when the member is already
    /// present, in which case nothing is written.
    pub async fn claim(&self, room: &Room, profile: &MemberProfile) -> StoreResult<bool> {
        let key = self.keys.member_key(&room.id, &profile.uid);
        let value = serde_json::to_string(profile)?;
        self.store
            .set_if_absent(&key, &value, self.expiry(room))
            .await
    }

    /// Push back the expiry of a member entry. Entries of non-expiring rooms
    /// are left alone. Returns false when the entry no longer exists.
    pub async fn refresh(&self, room: &Room, uid: &str) -> StoreResult<bool> {
        if room.no_expiration {
            return Ok(true);
        }
        self.store
            .expire(&self.keys.member_key(&room.id, uid), self.ttl)
            .await
    }

    pub async fn remove(&self, room_id: &str, uid: &str) -> StoreResult<()> {
        self.store
            .delete(&[self.keys.member_key(room_id, uid)])
            .await
    }

    /// Delete the entries of several (room id, uid) pairs at once
    pub async fn remove_many(&self, members: &[(String, String)]) -> StoreResult<()> {
        let keys: Vec<String> = members
            .iter()
            .map(|(room_id, uid)| self.keys.member_key(room_id, uid))
            .collect();
        self.store.delete(&keys).await
    }

    /// Delete every member entry of a room. Returns how many were found.
    pub async fn clear_room(&self, room_id: &str) -> StoreResult<usize> {
        let keys: Vec<String> = self
            .members(room_id)
            .await?
            .iter()
            .map(|member| self.keys.member_key(room_id, &member.uid))
            .collect();

        self.store.delete(&keys).await?;
        Ok(keys.len())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use drn_shared::MemoryStore;
    use serde_json::{json, Map};

    fn tracker(store: &MemoryStore) -> PresenceTracker {
        PresenceTracker::new(
            Arc::new(store.clone()),
            Keyspace::new("drn"),
            Duration::from_secs(60),
        )
    }

    fn room(id: &str, no_expiration: bool) -> Room {
        Room {
            id: id.to_string(),
            name: "Room".to_string(),
            no_expiration,
            metadata: Map::new(),
        }
    }

    fn profile(uid: &str) -> MemberProfile {
        MemberProfile::new(uid, json!({ "name": uid }).as_object().cloned().unwrap())
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = MemoryStore::new();
        let presence = tracker(&store);
        let r1 = room("r1", false);

        assert!(presence.claim(&r1, &profile("u1")).await.unwrap());
        assert!(!presence.claim(&r1, &profile("u1")).await.unwrap());

        let members = presence.members("r1").await.unwrap();
        assert_eq!(members, vec![profile("u1")]);
    }

    #[tokio::test]
    async fn test_expiry_follows_room_flag() {
        let store = MemoryStore::new();
        let presence = tracker(&store);
        let keys = Keyspace::new("drn");

        presence.claim(&room("r1", false), &profile("u1")).await.unwrap();
        presence.claim(&room("r2", true), &profile("u1")).await.unwrap();

        assert!(store.ttl(&keys.member_key("r1", "u1")).is_some());
        assert!(store.ttl(&keys.member_key("r2", "u1")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_keeps_member_alive() {
        let store = MemoryStore::new();
        let presence = tracker(&store);
        let r1 = room("r1", false);
        presence.claim(&r1, &profile("u1")).await.unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(presence.refresh(&r1, "u1").await.unwrap());

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(presence.members("r1").await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(presence.members("r1").await.unwrap().is_empty());
        assert!(!presence.refresh(&r1, "u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_room_only_touches_that_room() {
        let store = MemoryStore::new();
        let presence = tracker(&store);

        for uid in ["u1", "u2"] {
            presence.claim(&room("r1", true), &profile(uid)).await.unwrap();
        }
        presence.claim(&room("r2", true), &profile("u3")).await.unwrap();

        assert_eq!(presence.clear_room("r1").await.unwrap(), 2);
        assert!(presence.members("r1").await.unwrap().is_empty());
        assert_eq!(presence.members("r2").await.unwrap().len(), 1);

        presence
            .remove_many(&[("r2".to_string(), "u3".to_string())])
            .await
            .unwrap();
        assert!(presence.members("r2").await.unwrap().is_empty());
    }
}
