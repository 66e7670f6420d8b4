//! Redis shared store
//!
//! Key-value operations go through a `ConnectionManager` (reconnects on its
//! own). Pub/sub uses one dedicated connection per instance: a listener task
//! reads every message and routes it to the local subscriptions of its
//! channel. That connection does not reconnect; once it is lost the store
//! reports `PubSubClosed` from `ping`, `publish` and `subscribe`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use ::redis::aio::{ConnectionManager, PubSubSink};
use ::redis::{cmd, Client, Msg, Value};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{Expiry, SharedStore, Subscription};
use crate::error::{StoreError, StoreResult};

/// Keys fetched per SCAN round trip
const SCAN_COUNT: usize = 100;

type RouteTable = HashMap<String, HashMap<Uuid, mpsc::UnboundedSender<String>>>;
type Routes = Arc<StdMutex<RouteTable>>;

/// Redis-backed shared store
pub struct RedisStore {
    conn: ConnectionManager,
    sink: Mutex<PubSubSink>,
    routes: Routes,
    /// Cleared when the pub/sub stream ends
    listening: Arc<AtomicBool>,
    listener: JoinHandle<()>,
}

impl RedisStore {
    /// Connect both the command and the pub/sub connection
    ///
    /// Fails when Redis is unreachable; callers treat that as fatal at startup.
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        let (sink, stream) = client.get_async_pubsub().await?.split();

        let routes: Routes = Arc::new(StdMutex::new(HashMap::new()));
        let listening = Arc::new(AtomicBool::new(true));
        let listener = tokio::spawn(listen(stream, Arc::clone(&routes), Arc::clone(&listening)));

        let store = Self {
            conn,
            sink: Mutex::new(sink),
            routes,
            listening,
            listener,
        };
        store.ping().await?;

        tracing::info!("Connected to Redis");
        Ok(store)
    }

    fn routes(&self) -> StoreResult<MutexGuard<'_, RouteTable>> {
        self.routes
            .lock()
            .map_err(|_| StoreError::Unavailable("pub/sub route table poisoned".to_string()))
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

fn ensure_listening(listening: &AtomicBool) -> StoreResult<()> {
    if listening.load(Ordering::Acquire) {
        Ok(())
    } else {
        Err(StoreError::PubSubClosed)
    }
}

async fn listen<S>(stream: S, routes: Routes, listening: Arc<AtomicBool>)
where
    S: Stream<Item = Msg>,
{
    let mut stream = std::pin::pin!(stream);
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Dropping non-text pub/sub payload");
                continue;
            }
        };

        let Ok(mut routes) = routes.lock() else {
            break;
        };
        if let Some(subscribers) = routes.get_mut(&channel) {
            subscribers.retain(|_, tx| tx.send(payload.clone()).is_ok());
        }
    }

    listening.store(false, Ordering::Release);
    tracing::error!("Redis pub/sub stream ended; room channels stop receiving events");

    // Dropping the senders ends every local subscription
    if let Ok(mut routes) = routes.lock() {
        routes.clear();
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, expiry: Expiry) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut command = cmd("SET");
        command.arg(key).arg(value);
        match expiry {
            Expiry::Never => {}
            Expiry::After(ttl) => {
                command.arg("PX").arg(ttl.as_millis() as u64);
            }
            Expiry::Keep => {
                command.arg("KEEPTTL");
            }
        }

        let _: () = command.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, expiry: Expiry) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let mut command = cmd("SET");
        command.arg(key).arg(value).arg("NX");
        if let Expiry::After(ttl) = expiry {
            command.arg("PX").arg(ttl.as_millis() as u64);
        }

        // Nil reply means the key already existed
        let reply: Value = command.query_async(&mut conn).await?;
        Ok(!matches!(reply, Value::Nil))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        // UNLINK reclaims memory in the background instead of blocking
        let _: () = cmd("UNLINK").arg(keys).query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_matched(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = HashSet::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = keys.into_iter().collect();
        let values: Vec<Option<String>> = cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        // Keys can expire between SCAN and MGET
        Ok(values.into_iter().flatten().collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        // Nothing on this instance would hear it
        ensure_listening(&self.listening)?;

        let mut conn = self.conn.clone();
        let receivers: i64 = cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        tracing::trace!(channel = %channel, receivers, "Published to channel");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        ensure_listening(&self.listening)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = Subscription::new(channel, rx);

        let first = {
            let mut routes = self.routes()?;
            let subscribers = routes.entry(channel.to_string()).or_default();
            subscribers.insert(subscription.id(), tx);
            subscribers.len() == 1
        };

        if first {
            if let Err(e) = self.sink.lock().await.subscribe(channel).await {
                if let Ok(mut routes) = self.routes() {
                    routes.remove(channel);
                }
                return Err(e.into());
            }
            tracing::debug!(channel = %channel, "Subscribed to Redis channel");
        }

        Ok(subscription)
    }

    async fn unsubscribe(&self, subscription_id: Uuid, channel: &str) -> StoreResult<()> {
        let last = {
            let mut routes = self.routes()?;
            match routes.get_mut(channel) {
                Some(subscribers) => {
                    subscribers.remove(&subscription_id);
                    if subscribers.is_empty() {
                        routes.remove(channel);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if last {
            self.sink.lock().await.unsubscribe(channel).await?;
            tracing::debug!(channel = %channel, "Unsubscribed from Redis channel");
        }

        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = cmd("PING").query_async(&mut conn).await?;
        ensure_listening(&self.listening)
    }
}
