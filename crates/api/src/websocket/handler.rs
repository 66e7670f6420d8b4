//! WebSocket handler for Axum
//!
//! Authenticates the upgrade request, then drives one connection: a writer
//! task draining the outbound channel, a heartbeat task and the read loop.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header::ORIGIN, HeaderMap},
    response::Response,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::TokenVerifier;
use crate::realtime::{ProtocolError, RealtimeService};
use crate::state::AppState;

use super::{
    connection::{close_code, Connection, Outbound},
    events::ServerEvent,
    heartbeat::HeartbeatOutcome,
};

/// How long a queued close frame may take to reach the peer
const WRITER_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Deserialize)]
pub struct WebSocketQuery {
    #[serde(default)]
    token: Option<String>,
}

/// Why an upgrade was refused. Sent to the peer as a close frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("Origin header is missing")]
    OriginRejected,

    #[error("Auth token is missing")]
    TokenMissing,

    #[error("Invalid or expired token")]
    TokenInvalid,
}

impl Rejection {
    pub fn code(&self) -> u16 {
        match self {
            Rejection::OriginRejected => close_code::ORIGIN_REJECTED,
            Rejection::TokenMissing => close_code::TOKEN_MISSING,
            Rejection::TokenInvalid => close_code::TOKEN_INVALID,
        }
    }
}

/// Check origin and token of an upgrade request. Returns the uid to bind to
/// the connection.
pub async fn authorize(
    allowed_hosts: &[String],
    verifier: &dyn TokenVerifier,
    origin: Option<&str>,
    token: Option<&str>,
) -> Result<String, Rejection> {
    let origin_allowed = origin.is_some_and(|origin| allowed_hosts.iter().any(|host| host == origin));
    if !origin_allowed {
        return Err(Rejection::OriginRejected);
    }

    let token = token.filter(|t| !t.is_empty()).ok_or(Rejection::TokenMissing)?;

    match verifier.verify(token).await {
        Ok(claims) => Ok(claims.sub),
        Err(e) => {
            tracing::warn!(error = %e, "WebSocket auth failed: invalid token");
            Err(Rejection::TokenInvalid)
        }
    }
}

/// WebSocket handler - upgrades HTTP connection to WebSocket
///
/// Authenticates via the `token` query parameter. Rejected requests are
/// still upgraded so the client receives a close code it can act on.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<WebSocketQuery>,
) -> Response {
    let origin = headers.get(ORIGIN).and_then(|value| value.to_str().ok());

    match authorize(
        &state.allowed_hosts,
        state.verifier.as_ref(),
        origin,
        params.token.as_deref(),
    )
    .await
    {
        Ok(uid) => {
            tracing::info!(uid = %uid, "WebSocket connection upgrade requested");
            let realtime = state.realtime.clone();
            ws.on_upgrade(move |socket| handle_socket(socket, uid, realtime))
        }
        Err(rejection) => {
            tracing::info!(
                origin = origin.unwrap_or("-"),
                code = rejection.code(),
                reason = %rejection,
                "WebSocket connection rejected"
            );
            ws.on_upgrade(move |socket| reject_socket(socket, rejection))
        }
    }
}

async fn reject_socket(mut socket: WebSocket, rejection: Rejection) {
    let frame = CloseFrame {
        code: rejection.code(),
        reason: rejection.to_string().into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %e, "Failed to send rejection close frame");
    }
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, uid: String, realtime: RealtimeService) {
    let (sender, receiver) = socket.split();
    serve_connection(sender, receiver, uid, realtime).await;
}

/// Drive one authenticated connection until the peer, the heartbeat or the
/// writer ends it, then run the close path
///
/// Only the reader runs protocol operations, and it stops between frames:
/// a frame being handled always finishes before the close path starts.
pub(crate) async fn serve_connection<S, R>(sink: S, receiver: R, uid: String, realtime: RealtimeService)
where
    S: Sink<Message> + Send + Unpin + 'static,
    S::Error: std::fmt::Display + Send,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    // Create channel for sending frames to this connection
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let conn = Arc::new(Connection::new(uid, tx));
    let session_id = conn.session_id;
    let stop = CancellationToken::new();

    let mut send_task = tokio::spawn(write_loop(sink, rx, session_id, stop.clone()));

    let (pong_tx, pong_rx) = mpsc::unbounded_channel();
    let heartbeat = realtime.heartbeat();
    let heartbeat_conn = Arc::clone(&conn);
    let heartbeat_stop = stop.clone();
    let heartbeat_task = tokio::spawn(async move {
        let outcome = heartbeat.run(Arc::clone(&heartbeat_conn), pong_rx).await;
        if outcome == HeartbeatOutcome::TimedOut {
            tracing::info!(session_id = %heartbeat_conn.session_id, uid = %heartbeat_conn.uid, "WebSocket heartbeat timed out");
        }
        heartbeat_stop.cancel();
    });

    if conn.send_event(&ServerEvent::Connected).is_err() {
        tracing::debug!(session_id = %session_id, "Connection closed before acknowledgment");
    }

    read_loop(&realtime, &conn, receiver, pong_tx, &stop).await;
    stop.cancel();

    // Cleanup on disconnect
    heartbeat_task.abort();
    realtime.disconnect(&conn).await;
    drop(conn);

    // Let a queued close frame reach the peer
    if tokio::time::timeout(WRITER_GRACE, &mut send_task).await.is_err() {
        send_task.abort();
    }

    tracing::info!(session_id = %session_id, "WebSocket connection closed");
}

/// Forward queued frames to the transport. Stops after a close frame or the
/// first send failure.
async fn write_loop<S>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    session_id: Uuid,
    stop: CancellationToken,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display + Send,
{
    while let Some(frame) = rx.recv().await {
        let (message, last) = match frame {
            Outbound::Text(text) => (Message::Text(text), false),
            Outbound::Ping => (Message::Ping(Vec::new()), false),
            Outbound::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                true,
            ),
        };
        if let Err(e) = sink.send(message).await {
            tracing::debug!(session_id = %session_id, error = %e, "WebSocket send failed");
            break;
        }
        if last {
            break;
        }
    }
    stop.cancel();
}

async fn read_loop<R>(
    realtime: &RealtimeService,
    conn: &Arc<Connection>,
    mut receiver: R,
    pongs: mpsc::UnboundedSender<()>,
    stop: &CancellationToken,
) where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let refresh_every = realtime.presence_refresh_interval();
    let mut last_refresh = Instant::now();

    loop {
        let msg = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            msg = receiver.next() => msg,
        };
        let Some(msg) = msg else {
            break;
        };

        match msg {
            Ok(Message::Text(text)) => realtime.handle_text(conn, &text).await,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => realtime.handle_text(conn, &text).await,
                Err(_) => conn.send_error(ProtocolError::InvalidEvent),
            },
            Ok(Message::Pong(_)) => {
                let _ = pongs.send(());
                if last_refresh.elapsed() >= refresh_every {
                    last_refresh = Instant::now();
                    realtime.refresh_presence(conn).await;
                }
            }
            Ok(Message::Close(frame)) => {
                tracing::info!(
                    session_id = %conn.session_id,
                    code = ?frame.as_ref().map(|f| f.code),
                    "WebSocket close frame received"
                );
                break;
            }
            // Pings are answered by the transport
            Ok(Message::Ping(_)) => {}
            Err(e) => {
                tracing::warn!(session_id = %conn.session_id, error = %e, "WebSocket transport error");
                break;
            }
        }
    }
}
