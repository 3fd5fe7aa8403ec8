//! HTTP router.
//!
//! | Route      | Purpose                                   |
//! |------------|-------------------------------------------|
//! | `GET /`    | websocket upgrade into a protocol session |
//! | `/healthz` | liveness probe                            |
//! | `/metrics` | Prometheus text exposition                |

use std::future::Future;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::protocol::connection_handler::serve_connection;
use crate::state::SharedState;

/// Builds the router serving `state`.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(upgrade))
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<SharedState>) -> Response {
    // Oversized frames must reach the handler so it can answer
    // `frame_too_large` before closing.
    let transport_limit = state.max_message_bytes().saturating_mul(2);
    ws.max_message_size(transport_limit)
        .max_frame_size(transport_limit)
        .on_upgrade(move |socket| async move {
            serve_connection(socket, state).await;
        })
}

async fn metrics(State(state): State<SharedState>) -> Response {
    match state.metrics().encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {e}"),
            )
                .into_response()
        },
    }
}

/// Serves `state` on `listener` until `shutdown` resolves.
///
/// Once `shutdown` resolves the listener stops accepting, every open session
/// is asked to close, and the call returns when the last one has.
///
/// # Errors
///
/// Returns an error if the listener fails.
pub async fn serve<F>(listener: TcpListener, state: SharedState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "templar daemon listening");
    }
    let signal_state = Arc::clone(&state);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("shutting down, closing open sessions");
            signal_state.request_shutdown();
        })
        .await
}
