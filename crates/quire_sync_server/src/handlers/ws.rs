//! WebSocket upgrade handler and per-connection socket loop.
//!
//! Each accepted socket gets one task running a select loop over three
//! sources: inbound frames from the client, the location's fan-out channel
//! (filtered by the connection's subscription set and origin tag), and the
//! keepalive interval. The keepalive timer lives inside the loop, so
//! closing the connection cancels it structurally.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::registry::{DocRegistry, LocationHub};

/// Query parameters for connection establishment.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Persistence root this connection is scoped to
    pub location: String,
    /// Garbage-collection of tombstoned history (default: enabled)
    pub gc: Option<bool>,
}

/// Shared state for the WebSocket handler.
#[derive(Clone)]
pub struct WsState {
    pub registry: Arc<DocRegistry>,
    pub ping_interval: Duration,
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    State(state): State<WsState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if query.location.is_empty() {
        warn!("connection rejected: empty location");
        return StatusCode::BAD_REQUEST.into_response();
    }

    // Resolve the hub first: a failed storage migration must reject the
    // connection instead of serving inconsistent data.
    let hub = match state.registry.get_or_create_hub(&query.location).await {
        Ok(hub) => hub,
        Err(e) => {
            error!(location = %query.location, "failed to open location: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let gc = query.gc.unwrap_or(true);
    info!(location = %query.location, gc, "websocket upgrade");

    ws.on_upgrade(move |socket| handle_socket(socket, state, hub, gc))
        .into_response()
}

/// Serve an established WebSocket connection until it closes.
async fn handle_socket(socket: WebSocket, state: WsState, hub: Arc<LocationHub>, gc: bool) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Subscribe to fan-out before the handshake so nothing is missed
    // between the initial SyncStep1 and entering the loop.
    let mut fanout_rx = hub.subscribe_channel();

    let (mut conn, initial) = match Connection::open(Arc::clone(&hub), gc).await {
        Ok(open) => open,
        Err(e) => {
            error!(location = %hub.location(), "failed to open connection: {e}");
            return;
        }
    };

    info!(
        conn = conn.id(),
        location = %hub.location(),
        connections = hub.connection_count(),
        "connected"
    );

    // Base document SyncStep1, then the awareness snapshot when non-empty
    for frame in initial {
        if let Err(e) = ws_tx.send(Message::Binary(frame.into())).await {
            error!(conn = conn.id(), "failed to send initial frame: {e}");
            conn.close().await;
            state.registry.maybe_remove_hub(hub.location()).await;
            return;
        }
    }

    let mut ping_interval = tokio::time::interval(state.ping_interval);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Consume the immediate first tick so probing starts one period in
    ping_interval.tick().await;
    let mut pong_received = true;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        match conn.handle_frame(&data).await {
                            Ok(replies) => {
                                let mut failed = false;
                                for reply in replies.into_iter().filter(|r| quire_core::has_content(r)) {
                                    if let Err(e) = ws_tx.send(Message::Binary(reply.into())).await {
                                        error!(conn = conn.id(), "failed to send reply: {e}");
                                        failed = true;
                                        break;
                                    }
                                }
                                if failed {
                                    break;
                                }
                            }
                            // Frame-level errors are logged and dropped;
                            // only the transport closes connections
                            Err(e) => {
                                warn!(conn = conn.id(), "dropping frame: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_received = true;
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(conn = conn.id(), "client requested close");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(conn = conn.id(), "websocket error: {e}");
                        break;
                    }
                    None => break,
                }
            }

            // Updates applied by other connections to documents we follow
            ev = fanout_rx.recv() => {
                match ev {
                    Ok(ev) => {
                        if ev.origin == conn.id() || !conn.is_subscribed(&ev.guid) {
                            continue;
                        }
                        if let Err(e) = ws_tx.send(Message::Binary(ev.frame.into())).await {
                            error!(conn = conn.id(), "failed to send broadcast: {e}");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Dropped fan-out frames; resynchronize every
                        // followed document from full state
                        warn!(conn = conn.id(), "lagged {n} frames, resyncing");
                        if resync(&mut conn, &hub, &mut ws_tx).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = ping_interval.tick() => {
                if !pong_received {
                    warn!(conn = conn.id(), "liveness timeout, closing");
                    break;
                }
                pong_received = false;
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    info!(conn = conn.id(), location = %hub.location(), "disconnected");

    // Deregister from every subscriber set and stop the keepalive (owned
    // by this scope) before the transport is dropped
    conn.close().await;
    state.registry.maybe_remove_hub(hub.location()).await;
}

/// Push the full state of every document this connection follows. Used
/// after the fan-out channel lagged; re-applying is idempotent on the
/// client.
async fn resync<S>(conn: &mut Connection, hub: &Arc<LocationHub>, ws_tx: &mut S) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    for guid in conn.subscribed_guids() {
        if let Some(doc) = hub.doc(&guid).await {
            let frame = quire_core::Message::Sync {
                guid,
                payload: quire_core::SyncPayload::Step2(doc.encode_state_as_update()),
            }
            .encode();
            if ws_tx.send(Message::Binary(frame.into())).await.is_err() {
                return Err(());
            }
        }
    }
    Ok(())
}
