//! Room channel subscriptions and fan-out
//!
//! Every known room has exactly one subscription on its channel. Each
//! subscription feeds a task that runs the same dispatcher with its room id,
//! so subscribing and unsubscribing a room are symmetric.

use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use drn_shared::{Room, SharedStore, StoreResult, Subscription};

use super::{Inner, RealtimeService};
use crate::websocket::connection::close_code;
use crate::websocket::events::ServerEvent;

/// Live subscription plus the task consuming it
pub(super) struct RoomChannel {
    subscription_id: Uuid,
    channel: String,
    task: JoinHandle<()>,
}

impl RoomChannel {
    /// Release the store subscription. The consuming task ends once its
    /// receiver drains.
    async fn release(self, store: &dyn SharedStore) {
        if let Err(e) = store.unsubscribe(self.subscription_id, &self.channel).await {
            tracing::warn!(channel = %self.channel, error = %e, "Failed to unsubscribe channel");
        }
    }

    /// Stop the consuming task right away and release the subscription
    pub(super) async fn cancel(self, store: &dyn SharedStore) {
        self.task.abort();
        self.release(store).await;
    }
}

/// Run `handler` for every payload until the subscription ends or the
/// service is dropped
fn spawn_consumer<F, Fut>(inner: &Arc<Inner>, mut subscription: Subscription, handler: F) -> JoinHandle<()>
where
    F: Fn(RealtimeService, String) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        while let Some(payload) = subscription.recv().await {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            handler(RealtimeService { inner }, payload).await;
        }
        tracing::debug!(channel = %subscription.channel(), "Channel consumer stopped");
    })
}

impl RealtimeService {
    /// Listen for rooms created on any instance
    pub(super) async fn subscribe_control(&self) -> StoreResult<()> {
        let channel = self.inner.keys.control_channel();
        let subscription = self.inner.store.subscribe(&channel).await?;
        let subscription_id = subscription.id();

        let task = spawn_consumer(&self.inner, subscription, |service, payload| async move {
            service.on_room_announced(&payload).await;
        });

        let previous = self.inner.control.lock().await.replace(RoomChannel {
            subscription_id,
            channel,
            task,
        });
        if let Some(previous) = previous {
            previous.cancel(self.inner.store.as_ref()).await;
        }
        Ok(())
    }

    async fn on_room_announced(&self, payload: &str) {
        let room = match serde_json::from_str::<Room>(payload) {
            Ok(room) => room,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring undecodable room announcement");
                return;
            }
        };

        let room_id = room.id.clone();
        match self.init_room(room).await {
            Ok(true) => tracing::info!(room_id = %room_id, "Room announced, now serving it"),
            // Created here, or already loaded
            Ok(false) => {}
            Err(e) => tracing::error!(room_id = %room_id, error = %e, "Failed to initialize announced room"),
        }
    }

    /// Start serving a room on this instance. Returns false if it was
    /// already known.
    pub(super) async fn init_room(&self, room: Room) -> StoreResult<bool> {
        let room_id = room.id.clone();
        if !self.inner.rooms.insert_room(room).await {
            return Ok(false);
        }

        if let Err(e) = self.subscribe_room(&room_id).await {
            self.inner.rooms.remove_room(&room_id).await;
            return Err(e);
        }
        Ok(true)
    }

    pub(super) async fn subscribe_room(&self, room_id: &str) -> StoreResult<()> {
        let mut channels = self.inner.channels.lock().await;
        if channels.contains_key(room_id) {
            return Ok(());
        }

        let channel = self.inner.keys.room_channel(room_id);
        let subscription = self.inner.store.subscribe(&channel).await?;
        let subscription_id = subscription.id();

        let dispatch_room = room_id.to_string();
        let task = spawn_consumer(&self.inner, subscription, move |service, payload| {
            let room_id = dispatch_room.clone();
            async move { service.dispatch(&room_id, &payload).await }
        });

        channels.insert(
            room_id.to_string(),
            RoomChannel {
                subscription_id,
                channel,
                task,
            },
        );
        tracing::debug!(room_id = %room_id, "Subscribed to room channel");
        Ok(())
    }

    pub(super) async fn unsubscribe_room(&self, room_id: &str) {
        let removed = self.inner.channels.lock().await.remove(room_id);
        if let Some(channel) = removed {
            channel.release(self.inner.store.as_ref()).await;
            tracing::debug!(room_id = %room_id, "Unsubscribed from room channel");
        }
    }

    /// Deliver one room channel payload to the local members of the room
    async fn dispatch(&self, room_id: &str, payload: &str) {
        let event = match serde_json::from_str::<ServerEvent>(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(room_id = %room_id, error = %e, "Dropping undecodable room event");
                return;
            }
        };

        match event {
            // The joining socket already got its confirmation directly
            ServerEvent::Joined { ref uid, .. } => {
                self.inner.rooms.broadcast(room_id, payload, Some(uid.as_str())).await;
            }
            ServerEvent::RoomUpdated { mut room } => {
                room.id = room_id.to_string();
                self.inner.rooms.update_room(room).await;
                self.inner.rooms.broadcast(room_id, payload, None).await;
            }
            ServerEvent::RoomRemoved { .. } => {
                self.inner.rooms.broadcast(room_id, payload, None).await;
                self.teardown_room(room_id).await;
            }
            _ => {
                self.inner.rooms.broadcast(room_id, payload, None).await;
            }
        }
    }

    /// Close local members, drop their presence and the room record, and
    /// stop serving the room
    async fn teardown_room(&self, room_id: &str) {
        let members = self.inner.rooms.remove_room(room_id).await.unwrap_or_default();

        let mut present = Vec::with_capacity(members.len());
        for conn in &members {
            conn.close(close_code::NORMAL, "Room removed");
            present.push((room_id.to_string(), conn.uid.clone()));
        }

        if let Err(e) = self.inner.presence.remove_many(&present).await {
            tracing::error!(room_id = %room_id, error = %e, "Failed to delete presence of removed room");
        }

        let room_key = self.inner.keys.room_key(room_id);
        if let Err(e) = self.inner.store.delete(&[room_key]).await {
            tracing::error!(room_id = %room_id, error = %e, "Failed to delete room record");
        }

        self.unsubscribe_room(room_id).await;

        tracing::info!(room_id = %room_id, closed = members.len(), "Room removed");
    }
}
