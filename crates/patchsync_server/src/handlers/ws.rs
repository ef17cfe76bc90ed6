use crate::sync::{RoomConnection, RoomUpdate, SyncState};
use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use patchsync_core::EntityKey;
use patchsync_core::transport::{EnvelopeSource, TransportEnvelope};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Recorded as `userId` on patches this connection proposes
    pub user: Option<String>,
}

/// Shared state for WebSocket handler
#[derive(Clone)]
pub struct WsState {
    pub sync_state: Arc<SyncState>,
}

/// Per-connection bookkeeping
struct Session {
    connection_id: String,
    user_id: Option<String>,
    out_tx: mpsc::UnboundedSender<String>,
    /// One relay task per subscribed entity
    subscriptions: HashMap<EntityKey, JoinHandle<()>>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    State(state): State<WsState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let connection_id = uuid::Uuid::new_v4().to_string();
    info!("WebSocket upgrade: connection={}, user={:?}", connection_id, query.user);

    ws.on_upgrade(move |socket| handle_socket(socket, state, connection_id, query.user))
}

/// Handle an established WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    state: WsState,
    connection_id: String,
    user_id: Option<String>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let mut session = Session {
        connection_id,
        user_id,
        out_tx,
        subscriptions: HashMap::new(),
    };

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&state, &mut session, text.as_str()).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            error!("Failed to send pong: {}", e);
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client closed: {}", session.connection_id);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }

            Some(frame) = out_rx.recv() => {
                if let Err(e) = ws_tx.send(Message::Text(frame.into())).await {
                    error!("Failed to send frame: {}", e);
                    break;
                }
            }
        }
    }

    info!(
        "WebSocket disconnected: connection={}, subscriptions={}",
        session.connection_id,
        session.subscriptions.len()
    );

    for (key, task) in session.subscriptions.drain() {
        task.abort();
        // the relay owns the RoomConnection; wait for it to unsubscribe
        let _ = task.await;
        state.sync_state.maybe_remove_room(&key).await;
    }
}

async fn handle_frame(state: &WsState, session: &mut Session, text: &str) {
    let envelope = match TransportEnvelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Discarding frame from {}: {}", session.connection_id, e);
            return;
        }
    };
    let key = envelope.entity_key();

    match envelope {
        TransportEnvelope::Subscribe { .. } => {
            if session.subscriptions.contains_key(&key) {
                debug!("{} already subscribed to {}", session.connection_id, key);
                return;
            }
            let room = match state.sync_state.get_or_create_room(&key).await {
                Ok(room) => room,
                Err(e) => {
                    warn!("Subscribe to {} refused: {}", key, e);
                    return;
                }
            };

            let connection = RoomConnection::new(session.connection_id.clone(), room);
            if let Some(frame) = encode(&key, connection.initial_sync()) {
                let _ = session.out_tx.send(frame);
            }
            let task = tokio::spawn(relay(key.clone(), connection, session.out_tx.clone()));
            session.subscriptions.insert(key.clone(), task);
            info!("{} subscribed to {}", session.connection_id, key);
        }
        TransportEnvelope::Patches { patches, .. } => {
            let room = match state.sync_state.get_or_create_room(&key).await {
                Ok(room) => room,
                Err(e) => {
                    warn!("Patches for {} refused: {}", key, e);
                    return;
                }
            };
            match room.submit(patches, session.user_id.as_deref()) {
                Ok(batch) => debug!(
                    "{} committed change {} on {}",
                    session.connection_id, batch.change_number, key
                ),
                Err(e) => warn!("Patches for {} rejected: {}", key, e),
            }
        }
        TransportEnvelope::Snapshot { .. } => {
            warn!(
                "Ignoring client snapshot for {} from {}",
                key, session.connection_id
            );
        }
    }
}

/// Forward room updates to the socket until either side goes away.
async fn relay(
    key: EntityKey,
    mut connection: RoomConnection,
    out_tx: mpsc::UnboundedSender<String>,
) {
    while let Some(update) = connection.recv().await {
        let Some(frame) = encode(&key, update) else {
            continue;
        };
        if out_tx.send(frame).is_err() {
            break;
        }
    }
}

fn encode(key: &EntityKey, update: RoomUpdate) -> Option<String> {
    let envelope = match update {
        RoomUpdate::Patches(batch) => TransportEnvelope::patches(&batch, EnvelopeSource::Server),
        RoomUpdate::Snapshot {
            state,
            change_number,
        } => TransportEnvelope::snapshot(key, state, change_number),
    };
    match envelope.encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!("Failed to encode frame for {}: {}", key, e);
            None
        }
    }
}
