//! In-memory shared store
//!
//! Single-process only. Cloning a `MemoryStore` yields another handle to the
//! same data and channels, which lets several service instances in one
//! process behave like instances sharing one Redis.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use super::{redis_glob, Expiry, SharedStore, Subscription};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

type ChannelMap = HashMap<String, HashMap<Uuid, mpsc::UnboundedSender<String>>>;

#[derive(Default)]
struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<ChannelMap>,
}

/// In-memory key-value store with pub/sub
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> StoreResult<MutexGuard<'_, HashMap<String, Entry>>> {
        self.inner
            .entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn channels(&self) -> StoreResult<MutexGuard<'_, ChannelMap>> {
        self.inner
            .channels
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    /// Remaining TTL of a key, `None` if missing or non-expiring
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.entries().ok()?;
        let expires_at = entries.get(key)?.expires_at?;
        Some(expires_at.saturating_duration_since(Instant::now()))
    }

    /// Number of live subscriptions on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels()
            .map(|channels| channels.get(channel).map(|subs| subs.len()).unwrap_or(0))
            .unwrap_or(0)
    }
}

fn expires_at(expiry: Expiry, now: Instant) -> Option<Instant> {
    match expiry {
        Expiry::After(ttl) => Some(now + ttl),
        Expiry::Never | Expiry::Keep => None,
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, expiry: Expiry) -> StoreResult<()> {
        let now = Instant::now();
        let mut entries = self.entries()?;

        let expires_at = match expiry {
            Expiry::Keep => entries
                .get(key)
                .filter(|entry| !entry.is_expired(now))
                .and_then(|entry| entry.expires_at),
            other => expires_at(other, now),
        };

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, expiry: Expiry) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries()?;

        if entries.get(key).is_some_and(|entry| !entry.is_expired(now)) {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: expires_at(expiry, now),
            },
        );
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        let mut entries = self.entries()?;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn get_matched(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let matcher = redis_glob(pattern)?;
        let now = Instant::now();
        let mut entries = self.entries()?;
        entries.retain(|_, entry| !entry.is_expired(now));

        Ok(entries
            .iter()
            .filter(|(key, _)| matcher.is_match(key.as_str()))
            .map(|(_, entry)| entry.value.clone())
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut channels = self.channels()?;
        if let Some(subscribers) = channels.get_mut(channel) {
            // Receivers dropped without unsubscribing are pruned here
            subscribers.retain(|_, tx| tx.send(payload.to_string()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = Subscription::new(channel, rx);

        self.channels()?
            .entry(channel.to_string())
            .or_default()
            .insert(subscription.id(), tx);

        Ok(subscription)
    }

    async fn unsubscribe(&self, subscription_id: Uuid, channel: &str) -> StoreResult<()> {
        let mut channels = self.channels()?;
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.remove(&subscription_id);
            if subscribers.is_empty() {
                channels.remove(channel);
            }
        }
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.entries().map(|_| ())
    }
}
