//! Shared presence store abstraction
//!
//! Every running instance talks to the same key-value store with simple
//! pub/sub channel semantics. Room records and member presence live there so
//! that membership and broadcast work across instances.
//!
//! # Backends
//!
//! - `RedisStore` - Redis for multi-instance deployments
//! - `MemoryStore` - in-process backend for single-instance development and
//!   tests; several service instances can share one `MemoryStore`

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use globset::{GlobBuilder, GlobMatcher};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::StoreResult;

/// Expiry applied when writing a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Value never expires
    Never,
    /// Value expires after the given duration
    After(Duration),
    /// Keep whatever TTL the existing value has
    Keep,
}

/// Live subscription to one pub/sub channel
///
/// Messages published on the channel after the subscription was created are
/// delivered in publish order until the subscription is unsubscribed or the
/// backend connection is lost.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    channel: String,
    receiver: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    pub(crate) fn new(channel: &str, receiver: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.to_string(),
            receiver,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next payload; `None` once the subscription is gone
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

/// Operations the realtime core consumes from the shared store
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, expiry: Expiry) -> StoreResult<()>;

    /// Write only when the key does not exist. Returns whether it was written.
    async fn set_if_absent(&self, key: &str, value: &str, expiry: Expiry) -> StoreResult<bool>;

    /// Reset the TTL of an existing key. Returns false when the key is gone.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    async fn delete(&self, keys: &[String]) -> StoreResult<()>;

    /// Values of every key matching a Redis glob pattern
    async fn get_matched(&self, pattern: &str) -> StoreResult<Vec<String>>;

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;

    async fn unsubscribe(&self, subscription_id: Uuid, channel: &str) -> StoreResult<()>;

    /// Connectivity check used by readiness probes and startup
    async fn ping(&self) -> StoreResult<()>;
}

impl dyn SharedStore {
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        expiry: Expiry,
    ) -> StoreResult<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw, expiry).await
    }

    /// Decode every matched value, skipping entries that no longer parse
    pub async fn get_matched_json<T: DeserializeOwned>(&self, pattern: &str) -> StoreResult<Vec<T>> {
        let values = self.get_matched(pattern).await?;
        Ok(values
            .into_iter()
            .filter_map(|raw| match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "Skipping undecodable store value");
                    None
                }
            })
            .collect())
    }
}

/// Namespacing scheme for every key and channel of one service
///
/// Service names and ids are opaque; patterns escape them so that glob
/// characters inside an id only ever match themselves.
#[derive(Debug, Clone)]
pub struct Keyspace {
    service: String,
}

impl Keyspace {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service: service_name.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    pub fn room_key(&self, room_id: &str) -> String {
        format!("<{}>room<{}>", self.service, room_id)
    }

    pub fn room_pattern(&self) -> String {
        format!("<{}>room<*>", escape_glob(&self.service))
    }

    pub fn member_key(&self, room_id: &str, uid: &str) -> String {
        format!("<{}>room<{}>member<{}>profile", self.service, room_id, uid)
    }

    pub fn member_pattern(&self, room_id: &str) -> String {
        format!(
            "<{}>room<{}>member<*>profile",
            escape_glob(&self.service),
            escape_glob(room_id)
        )
    }

    /// Channel announcing newly created rooms to every instance
    pub fn control_channel(&self) -> String {
        format!("<{}>room", self.service)
    }

    pub fn room_channel(&self, room_id: &str) -> String {
        format!("<{}>channel<{}>", self.service, room_id)
    }
}

/// Backslash-escape every character Redis or the in-memory matcher would
/// treat as pattern syntax
pub fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\' | '{' | '}' | ',') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Compile a Redis `SCAN MATCH` style pattern: `*` and `?` cross every
/// character, `[...]` classes and `\` escapes are honored
pub(crate) fn redis_glob(pattern: &str) -> StoreResult<GlobMatcher> {
    let glob = GlobBuilder::new(pattern)
        .literal_separator(false)
        .backslash_escape(true)
        .build()?;
    Ok(glob.compile_matcher())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn glob_hits(pattern: &str, key: &str) -> bool {
        redis_glob(pattern).unwrap().is_match(key)
    }

    #[test]
    fn test_room_pattern_excludes_member_keys() {
        let keys = Keyspace::new("drn");
        let pattern = keys.room_pattern();

        assert!(glob_hits(&pattern, &keys.room_key("course-1")));
        assert!(!glob_hits(&pattern, &keys.member_key("course-1", "u1")));
    }

    #[test]
    fn test_member_pattern_is_scoped_to_room() {
        let keys = Keyspace::new("drn");
        let pattern = keys.member_pattern("r1");

        assert!(glob_hits(&pattern, &keys.member_key("r1", "u1")));
        assert!(!glob_hits(&pattern, &keys.member_key("r2", "u1")));
    }

    #[test]
    fn test_glob_characters_in_room_id_match_literally() {
        let keys = Keyspace::new("drn");

        for room_id in ["r?", "r*", "r[1]", "r\\", "r{1,2}"] {
            let pattern = keys.member_pattern(room_id);
            assert!(glob_hits(&pattern, &keys.member_key(room_id, "u1")), "{room_id}");
            assert!(!glob_hits(&pattern, &keys.member_key("r1", "u1")), "{room_id}");
            assert!(!glob_hits(&pattern, &keys.member_key("r2", "u1")), "{room_id}");
        }
    }

    #[test]
    fn test_service_name_is_escaped() {
        let keys = Keyspace::new("d*");
        assert!(glob_hits(&keys.room_pattern(), &keys.room_key("r1")));
        assert!(!glob_hits(&keys.room_pattern(), &Keyspace::new("drn").room_key("r1")));
    }

    #[test]
    fn test_keyspace_is_namespaced() {
        let a = Keyspace::new("a");
        let b = Keyspace::new("b");
        assert!(!glob_hits(&a.room_pattern(), &b.room_key("r1")));
        assert_ne!(a.control_channel(), b.control_channel());
        assert_ne!(a.room_channel("r1"), a.control_channel());
    }

    #[test]
    fn test_redis_glob_semantics() {
        assert!(glob_hits("r?", "r1"));
        assert!(!glob_hits("r?", "r10"));
        assert!(glob_hits("*", ""));
        assert!(glob_hits("a*z", "a/b/z"));
        assert!(glob_hits("r[12]", "r2"));
        assert!(!glob_hits("r[12]", "r3"));
        assert!(glob_hits("r\\?", "r?"));
        assert!(!glob_hits("r\\?", "r1"));
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("plain-id"), "plain-id");
        assert_eq!(escape_glob("a*b?"), "a\\*b\\?");
    }
}
