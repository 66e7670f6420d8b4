//! Store wrapper for exercising slow and failing store paths

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use drn_shared::{Expiry, MemoryStore, SharedStore, StoreError, StoreResult, Subscription};
use uuid::Uuid;

/// `MemoryStore` that can answer presence writes late and report the
/// pub/sub connection as lost
#[derive(Default)]
pub struct ScriptedStore {
    pub inner: MemoryStore,
    /// Delay between writing a set-if-absent key and replying
    pub claim_delay: Option<Duration>,
    pub pubsub_down: AtomicBool,
}

impl ScriptedStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn with_claim_delay(mut self, delay: Duration) -> Self {
        self.claim_delay = Some(delay);
        self
    }

    pub fn lose_pubsub(&self) {
        self.pubsub_down.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SharedStore for ScriptedStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, expiry: Expiry) -> StoreResult<()> {
        self.inner.set(key, value, expiry).await
    }

    async fn set_if_absent(&self, key: &str, value: &str, expiry: Expiry) -> StoreResult<bool> {
        let written = self.inner.set_if_absent(key, value, expiry).await?;
        if let Some(delay) = self.claim_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(written)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.inner.expire(key, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        self.inner.delete(keys).await
    }

    async fn get_matched(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.inner.get_matched(pattern).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        self.inner.subscribe(channel).await
    }

    async fn unsubscribe(&self, subscription_id: Uuid, channel: &str) -> StoreResult<()> {
        self.inner.unsubscribe(subscription_id, channel).await
    }

    async fn ping(&self) -> StoreResult<()> {
        if self.pubsub_down.load(Ordering::SeqCst) {
            return Err(StoreError::PubSubClosed);
        }
        self.inner.ping().await
    }
}
