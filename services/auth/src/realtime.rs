//! Realtime websocket endpoint
//!
//! The handshake is authenticated by the access token middleware, so by the
//! time a socket is upgraded its (user, session) pair is known. Each socket
//! gets a writer task draining the connection's outbound channel; the
//! registry and the invalidation listener only ever talk to that channel.

use std::sync::Arc;

use axum::{
    Extension,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::presence::PresenceStore;
use crate::registry::{ConnectionHandle, Outbound};
use crate::service::AuthContext;

/// Reply to frames this endpoint does not accept
pub const INVALID_MESSAGE_TYPE: &str = "Invalid message type";

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, context))
}

async fn handle_socket(socket: WebSocket, state: AppState, context: AuthContext) {
    let (mut sender, mut receiver) = socket.split();

    let now = Utc::now();
    let (handle, mut outbound) = ConnectionHandle::new(context.user_id, context.session_id, now);
    state.registry.register(handle.clone());
    record_presence(Arc::clone(&state.presence), context.user_id, now);

    info!(
        connection = %handle.id(),
        user = %context.user_id,
        session = %context.session_id,
        "Realtime connection opened for {}", context.username
    );

    let mut send_task = tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            match item {
                Outbound::Text(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            // Writer finished: forced close or dead transport
            _ = &mut send_task => break,
            message = receiver.next() => match message {
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    touch_liveness(&state, &handle);
                }
                Some(Ok(Message::Close(_))) => {
                    touch_liveness(&state, &handle);
                    break;
                }
                Some(Ok(Message::Binary(_))) => {
                    handle.send_text(INVALID_MESSAGE_TYPE);
                }
                Some(Ok(Message::Text(_))) => {}
                Some(Err(e)) => {
                    warn!(connection = %handle.id(), error = %e, "WebSocket error");
                    break;
                }
                None => break,
            }
        }
    }

    state.registry.unregister(&handle);
    send_task.abort();
    debug!(connection = %handle.id(), "Realtime connection closed");
}

fn touch_liveness(state: &AppState, handle: &ConnectionHandle) {
    let now = Utc::now();
    if state.registry.touch_liveness(handle, now) {
        record_presence(Arc::clone(&state.presence), handle.user_id(), now);
    }
}

/// Write the user's last-online instant without holding up the socket
fn record_presence(presence: Arc<dyn PresenceStore>, user_id: Uuid, at: DateTime<Utc>) {
    tokio::spawn(async move {
        if let Err(e) = presence.set_last_online(user_id, at).await {
            warn!(user = %user_id, "Failed to update last online: {}", e);
        }
    });
}
