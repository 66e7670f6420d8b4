//! Per-connection heartbeat
//!
//! Pings the peer on an interval and closes the connection when a pong does
//! not arrive within the timeout. The reader loop forwards every pong it sees
//! into the monitor's channel.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::connection::{close_code, Connection};

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(2000);
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Ping cadence for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Why a heartbeat stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// No pong within the timeout; a close frame was queued
    TimedOut,
    /// The connection went away first
    Disconnected,
}

impl Heartbeat {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Drive the heartbeat until the peer stops answering or the connection
    /// is gone. Dropping the future cancels every pending timer.
    pub async fn run(
        self,
        conn: Arc<Connection>,
        mut pongs: mpsc::UnboundedReceiver<()>,
    ) -> HeartbeatOutcome {
        loop {
            // Pongs that arrived while idle do not answer the next ping
            while pongs.try_recv().is_ok() {}

            if conn.ping().is_err() {
                return HeartbeatOutcome::Disconnected;
            }

            match tokio::time::timeout(self.timeout, pongs.recv()).await {
                Ok(Some(())) => {}
                Ok(None) => return HeartbeatOutcome::Disconnected,
                Err(_) => {
                    tracing::warn!(
                        session_id = %conn.session_id,
                        uid = %conn.uid,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "No pong received, closing connection"
                    );
                    conn.close(close_code::HEARTBEAT_TIMEOUT, "Heartbeat timeout");
                    return HeartbeatOutcome::TimedOut;
                }
            }

            tokio::time::sleep(self.interval).await;
        }
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new(DEFAULT_PING_INTERVAL, DEFAULT_PONG_TIMEOUT)
    }
}
