//! Realtime room service
//!
//! `RealtimeService` is constructed once per process with its store and
//! settings, then shared by the WebSocket gateway and the admin routes. It
//! owns the local room map, the per-room channel subscriptions and the
//! presence tracker.
//!
//! # Cross-instance flow
//!
//! Client events are validated by the protocol handler, recorded in the
//! shared store and published on the room channel. Every instance that knows
//! the room (including the publisher) receives the event through its room
//! subscription and fans it out to its own local members.

mod fanout;
mod presence;
mod protocol;
mod registry;

pub use presence::PresenceTracker;
pub use protocol::ProtocolError;
pub use registry::{CreateRoomOptions, DebugInfo, RoomRemoval};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use drn_shared::{Keyspace, SharedStore, StoreResult};

use crate::websocket::connection::{close_code, Connection};
use crate::websocket::events::ServerEvent;
use crate::websocket::heartbeat::Heartbeat;
use crate::websocket::room::RoomManager;

use self::fanout::RoomChannel;

/// Publish retry: first backoff in milliseconds
const PUBLISH_RETRY_BASE_MS: u64 = 10;
const PUBLISH_RETRY_MAX_DELAY: Duration = Duration::from_millis(500);
const PUBLISH_MAX_RETRIES: usize = 3;

pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(3600);

/// Settings for one realtime instance
#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    /// Namespace prefix for every store key and channel
    pub service_name: String,
    /// Expiry of presence entries in expiring rooms
    pub presence_ttl: Duration,
    pub heartbeat: Heartbeat,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            service_name: "drn".to_string(),
            presence_ttl: DEFAULT_PRESENCE_TTL,
            heartbeat: Heartbeat::default(),
        }
    }
}

/// Room, presence and fan-out service of one instance
#[derive(Clone)]
pub struct RealtimeService {
    inner: Arc<Inner>,
}

struct Inner {
    settings: RealtimeSettings,
    keys: Keyspace,
    store: Arc<dyn SharedStore>,
    rooms: RoomManager,
    presence: PresenceTracker,
    /// Room id -> live subscription on the room channel
    channels: Mutex<HashMap<String, RoomChannel>>,
    /// Subscription on the room announcement channel
    control: Mutex<Option<RoomChannel>>,
}

impl RealtimeService {
    pub fn new(store: Arc<dyn SharedStore>, settings: RealtimeSettings) -> Self {
        let keys = Keyspace::new(settings.service_name.clone());
        let presence = PresenceTracker::new(Arc::clone(&store), keys.clone(), settings.presence_ttl);

        Self {
            inner: Arc::new(Inner {
                settings,
                keys,
                store,
                rooms: RoomManager::new(),
                presence,
                channels: Mutex::new(HashMap::new()),
                control: Mutex::new(None),
            }),
        }
    }

    pub fn heartbeat(&self) -> Heartbeat {
        self.inner.settings.heartbeat
    }

    pub fn keys(&self) -> &Keyspace {
        &self.inner.keys
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.inner.store
    }

    /// Local room map of this instance
    pub fn rooms(&self) -> &RoomManager {
        &self.inner.rooms
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.inner.presence
    }

    /// Minimum spacing between presence refreshes of one connection
    pub fn presence_refresh_interval(&self) -> Duration {
        self.inner.settings.presence_ttl / 3
    }

    /// Connect the instance to the shared store
    ///
    /// Subscribes to room announcements, loads every persisted room,
    /// subscribes to its channel and sweeps the presence entries left behind
    /// by instances that went away without cleaning up. Any store failure
    /// here is returned; the instance cannot serve without the store.
    pub async fn start(&self) -> StoreResult<()> {
        self.inner.store.ping().await?;

        self.subscribe_control().await?;

        let rooms = self.get_persisted_rooms().await?;
        let room_count = rooms.len();
        let mut swept = 0;

        for room in rooms {
            let room_id = room.id.clone();
            self.init_room(room).await?;
            swept += self.inner.presence.clear_room(&room_id).await?;
        }

        tracing::info!(
            service = %self.inner.keys.service_name(),
            rooms = room_count,
            stale_members = swept,
            "Realtime service started"
        );
        Ok(())
    }

    /// Remove every local member's presence, close local sockets and drop all
    /// subscriptions
    pub async fn shutdown(&self) {
        let members = self.inner.rooms.local_members().await;
        if let Err(e) = self.inner.presence.remove_many(&members).await {
            tracing::error!(error = %e, members = members.len(), "Failed to clear presence on shutdown");
        }

        for room_id in self.inner.rooms.room_ids().await {
            for conn in self.inner.rooms.members(&room_id).await {
                conn.close(close_code::GOING_AWAY, "Server shutting down");
            }
        }

        if let Some(control) = self.inner.control.lock().await.take() {
            control.cancel(self.inner.store.as_ref()).await;
        }

        let channels: Vec<RoomChannel> = self.inner.channels.lock().await.drain().map(|(_, ch)| ch).collect();
        for channel in channels {
            channel.cancel(self.inner.store.as_ref()).await;
        }

        tracing::info!(members = members.len(), "Realtime service shut down");
    }

    /// Publish with a short exponential backoff before giving up
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let retry_strategy = ExponentialBackoff::from_millis(PUBLISH_RETRY_BASE_MS)
            .max_delay(PUBLISH_RETRY_MAX_DELAY)
            .take(PUBLISH_MAX_RETRIES)
            .map(jitter);

        Retry::spawn(retry_strategy, || async {
            self.inner.store.publish(channel, payload).await.map_err(|e| {
                tracing::debug!(channel = %channel, error = %e, "Publish failed - will retry");
                e
            })
        })
        .await
    }

    async fn publish_event(&self, room_id: &str, event: &ServerEvent) -> StoreResult<()> {
        let payload = serde_json::to_string(event)?;
        self.publish(&self.inner.keys.room_channel(room_id), &payload)
            .await
            .map_err(|e| {
                tracing::warn!(
                    room_id = %room_id,
                    event = event.name(),
                    error = %e,
                    "Failed to publish room event"
                );
                e
            })
    }

    /// Push back the expiry of every presence entry held by a connection
    pub async fn refresh_presence(&self, conn: &Connection) {
        for room_id in conn.joined_rooms().await {
            let Some(room) = self.inner.rooms.room(&room_id).await else {
                continue;
            };
            match self.inner.presence.refresh(&room, &conn.uid).await {
                Ok(true) => {}
                Ok(false) => tracing::warn!(
                    room_id = %room_id,
                    uid = %conn.uid,
                    "Presence entry missing for connected member"
                ),
                Err(e) => tracing::warn!(
                    room_id = %room_id,
                    uid = %conn.uid,
                    error = %e,
                    "Failed to refresh presence"
                ),
            }
        }
    }
}
