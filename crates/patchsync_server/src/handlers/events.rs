//! Server-push stream: `GET /entities/{type}/{id}/events`.

use crate::error::ApiError;
use crate::handlers::api::ApiState;
use crate::sync::{RoomConnection, RoomUpdate};
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt, future, stream};
use patchsync_core::EntityKey;
use patchsync_core::transport::PushEvent;
use std::convert::Infallible;
use tracing::{info, warn};

pub async fn entity_events(
    State(state): State<ApiState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let key = EntityKey::new(entity_type, entity_id);
    let room = state.sync_state.get_or_create_room(&key).await?;

    // subscribe before the snapshot so nothing falls in between
    let connection = RoomConnection::new(format!("sse-{}", uuid::Uuid::new_v4()), room);
    let initial = connection.initial_sync();
    info!("Push stream opened: {} for {}", connection.connection_id, key);

    let updates = stream::unfold(connection, |mut connection| async move {
        let update = connection.recv().await?;
        Some((update, connection))
    });

    let events = stream::once(future::ready(initial))
        .chain(updates)
        .filter_map(|update| future::ready(to_event(update).map(Ok)));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn to_event(update: RoomUpdate) -> Option<Event> {
    let (name, event) = match update {
        RoomUpdate::Patches(batch) => (
            "patches",
            PushEvent::Patches {
                patches: batch.patches.clone(),
            },
        ),
        RoomUpdate::Snapshot {
            state,
            change_number,
        } => (
            "snapshot",
            PushEvent::Snapshot {
                state,
                change_number,
            },
        ),
    };
    match serde_json::to_string(&event) {
        Ok(data) => Some(Event::default().event(name).data(data)),
        Err(e) => {
            warn!("Failed to encode push event: {}", e);
            None
        }
    }
}
