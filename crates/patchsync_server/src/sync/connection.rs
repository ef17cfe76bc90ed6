use super::{EntityRoom, RoomUpdate};
use patchsync_core::PatchBatch;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// One observer of a room: a socket subscription or a push stream
pub struct RoomConnection {
    pub connection_id: String,
    room: Arc<EntityRoom>,
    broadcast_rx: broadcast::Receiver<Arc<PatchBatch>>,
}

impl RoomConnection {
    pub fn new(connection_id: String, room: Arc<EntityRoom>) -> Self {
        let broadcast_rx = room.subscribe();
        debug!(
            "Observer {} joined {} ({} connected)",
            connection_id,
            room.key(),
            room.connection_count()
        );
        Self {
            connection_id,
            room,
            broadcast_rx,
        }
    }

    pub fn room(&self) -> &Arc<EntityRoom> {
        &self.room
    }

    /// Full state for a joining observer
    pub fn initial_sync(&self) -> RoomUpdate {
        let (state, change_number) = self.room.snapshot();
        RoomUpdate::Snapshot {
            state,
            change_number,
        }
    }

    /// Receive the next update for this observer
    pub async fn recv(&mut self) -> Option<RoomUpdate> {
        match self.broadcast_rx.recv().await {
            Ok(batch) => Some(RoomUpdate::Patches(batch)),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(
                    "Observer {} lagged {} batches on {}, sending full state",
                    self.connection_id,
                    n,
                    self.room.key()
                );
                Some(self.initial_sync())
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

impl Drop for RoomConnection {
    fn drop(&mut self) {
        self.room.unsubscribe();
        debug!(
            "Observer {} left {}",
            self.connection_id,
            self.room.key()
        );
    }
}
