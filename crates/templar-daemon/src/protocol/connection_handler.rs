//! Connection handler: drives one websocket through a protocol session.
//!
//! # Protocol Sequence
//!
//! 1. Server sends the `menu` frame, then `session_id`
//! 2. Client sends one message; server dispatches it and replies
//! 3. Repeat until `close`, a protocol violation, the idle timeout, server
//!    shutdown or the transport closing
//!
//! The idle timeout counts from the last text or binary frame; pings and pongs
//! do not keep a session alive.
//!
//! Messages are handled strictly one at a time; the next frame is not read
//! until the reply to the previous one has been sent.

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use super::dispatch::{CloseReason, DispatchOutcome};
use super::error::ProtocolError;
use super::session::ProtocolSession;
use crate::state::SharedState;

/// Serves a websocket until the session ends and returns why it ended.
///
/// When the server starts shutting down the session is closed after the
/// message in flight, if any, has been answered.
pub async fn serve_connection(mut socket: WebSocket, state: SharedState) -> CloseReason {
    let mut shutdown = state.shutdown_signal();
    let metrics = state.metrics().daemon_metrics().clone();
    let mut session = ProtocolSession::new(state.reference_policy());
    metrics.session_opened();
    info!(session_id = %session.id(), "session opened");

    let reason = match open(&mut socket, &state, &session).await {
        Ok(()) => {
            session.activate();
            serve(&mut socket, &state, &mut session, &mut shutdown).await
        },
        Err(reason) => reason,
    };

    session.close();
    // The peer may already be gone.
    let _ = socket.send(Message::Close(None)).await;
    metrics.session_closed(reason.as_str());
    info!(session_id = %session.id(), reason = reason.as_str(), "session closed");
    reason
}

async fn open(
    socket: &mut WebSocket,
    state: &SharedState,
    session: &ProtocolSession,
) -> Result<(), CloseReason> {
    let dispatcher = state.dispatcher();
    let session_frame = dispatcher
        .session_frame(session)
        .map_err(|_| CloseReason::TransportError)?;
    for frame in [dispatcher.catalog().menu_frame().to_owned(), session_frame] {
        socket
            .send(Message::Text(frame))
            .await
            .map_err(|_| CloseReason::TransportError)?;
    }
    Ok(())
}

async fn serve(
    socket: &mut WebSocket,
    state: &SharedState,
    session: &mut ProtocolSession,
    shutdown: &mut watch::Receiver<bool>,
) -> CloseReason {
    let dispatcher = state.dispatcher();
    let max_message_bytes = state.max_message_bytes();
    let idle_timeout = state.idle_timeout();
    let mut deadline = Instant::now() + idle_timeout;
    loop {
        let received = tokio::select! {
            received = socket.recv() => received,
            () = tokio::time::sleep_until(deadline) => return CloseReason::IdleTimeout,
            () = stopping(shutdown) => return CloseReason::Shutdown,
        };
        let message = match received {
            None => return CloseReason::TransportClosed,
            Some(Err(e)) => {
                debug!(session_id = %session.id(), error = %e, "transport error");
                return CloseReason::TransportError;
            },
            Some(Ok(message)) => message,
        };
        if matches!(message, Message::Text(_) | Message::Binary(_)) {
            deadline = Instant::now() + idle_timeout;
        }

        let outcome = match message {
            Message::Text(text) if text.len() > max_message_bytes => dispatcher.fail(
                session,
                "unknown",
                &ProtocolError::FrameTooLarge {
                    size: text.len(),
                    max: max_message_bytes,
                },
            ),
            Message::Text(text) => dispatcher.dispatch(session, &text).await,
            Message::Binary(_) => {
                dispatcher.fail(session, "unknown", &ProtocolError::UnsupportedFrame)
            },
            // Pings are answered by the transport.
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return CloseReason::TransportClosed,
        };

        match outcome {
            DispatchOutcome::Reply(frame) => {
                if socket.send(Message::Text(frame)).await.is_err() {
                    return CloseReason::TransportError;
                }
                deadline = Instant::now() + idle_timeout;
            },
            DispatchOutcome::Close { reason, notice } => {
                if let Some(frame) = notice {
                    let _ = socket.send(Message::Text(frame)).await;
                }
                return reason;
            },
        }
    }
}

/// Resolves once shutdown is signalled; never resolves if the signal can no
/// longer be sent.
async fn stopping(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stopping| *stopping).await.is_err() {
        std::future::pending::<()>().await;
    }
}
