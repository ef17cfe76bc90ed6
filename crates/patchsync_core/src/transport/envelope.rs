//! Wire envelopes.
//!
//! ```text
//! patches   { type:"patches", entityType, entityId, patches[], timestamp, source }
//! snapshot  { type:"snapshot", entityType, entityId, state, changeNumber }
//! subscribe { type:"subscribe", entityType, entityId }
//! ```
//!
//! The server-push stream carries [`PushEvent`]s (the entity is in the URL), and
//! the write path posts a [`PatchesBody`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TransportMessage;
use crate::error::{PatchSyncError, Result};
use crate::patch::{EntityKey, Patch, PatchBatch, PatchSource};

/// Which channel an envelope travelled over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeSource {
    Broadcast,
    #[default]
    Socket,
    Server,
}

impl EnvelopeSource {
    fn patch_source(self) -> PatchSource {
        match self {
            EnvelopeSource::Broadcast => PatchSource::Remote,
            EnvelopeSource::Socket | EnvelopeSource::Server => PatchSource::Server,
        }
    }
}

/// Framed message on the local channel and the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEnvelope {
    #[serde(rename_all = "camelCase")]
    Patches {
        entity_type: String,
        entity_id: String,
        patches: Vec<Patch>,
        #[serde(default)]
        timestamp: i64,
        #[serde(default)]
        source: EnvelopeSource,
    },
    #[serde(rename_all = "camelCase")]
    Snapshot {
        entity_type: String,
        entity_id: String,
        state: Value,
        #[serde(default)]
        change_number: u64,
    },
    /// Client asks the server to relay an entity
    #[serde(rename_all = "camelCase")]
    Subscribe {
        entity_type: String,
        entity_id: String,
    },
}

impl TransportEnvelope {
    pub fn patches(batch: &PatchBatch, source: EnvelopeSource) -> Self {
        TransportEnvelope::Patches {
            entity_type: batch.entity_type.clone(),
            entity_id: batch.entity_id.clone(),
            patches: batch.patches.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            source,
        }
    }

    pub fn snapshot(key: &EntityKey, state: Value, change_number: u64) -> Self {
        TransportEnvelope::Snapshot {
            entity_type: key.entity_type.clone(),
            entity_id: key.entity_id.clone(),
            state,
            change_number,
        }
    }

    pub fn subscribe(key: &EntityKey) -> Self {
        TransportEnvelope::Subscribe {
            entity_type: key.entity_type.clone(),
            entity_id: key.entity_id.clone(),
        }
    }

    pub fn entity_key(&self) -> EntityKey {
        match self {
            TransportEnvelope::Patches {
                entity_type,
                entity_id,
                ..
            }
            | TransportEnvelope::Snapshot {
                entity_type,
                entity_id,
                ..
            }
            | TransportEnvelope::Subscribe {
                entity_type,
                entity_id,
            } => EntityKey::new(entity_type.clone(), entity_id.clone()),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a frame. Any failure is [`PatchSyncError::MalformedPayload`].
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| PatchSyncError::MalformedPayload(e.to_string()))
    }

    /// Convert into an inbound message. `None` for control frames.
    pub fn into_message(self) -> Option<TransportMessage> {
        match self {
            TransportEnvelope::Patches {
                entity_type,
                entity_id,
                patches,
                source,
                ..
            } => {
                let key = EntityKey::new(entity_type, entity_id);
                Some(TransportMessage::Patches(PatchBatch::new(
                    &key,
                    patches,
                    source.patch_source(),
                )))
            }
            TransportEnvelope::Snapshot {
                entity_type,
                entity_id,
                state,
                change_number,
            } => Some(TransportMessage::Snapshot {
                key: EntityKey::new(entity_type, entity_id),
                state,
                change_number,
            }),
            TransportEnvelope::Subscribe { .. } => None,
        }
    }
}

/// Event on the server-push stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    Patches {
        patches: Vec<Patch>,
    },
    #[serde(rename_all = "camelCase")]
    Snapshot {
        state: Value,
        #[serde(default)]
        change_number: u64,
    },
}

impl PushEvent {
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| PatchSyncError::MalformedPayload(e.to_string()))
    }

    pub fn into_message(self, key: &EntityKey) -> TransportMessage {
        match self {
            PushEvent::Patches { patches } => {
                TransportMessage::Patches(PatchBatch::new(key, patches, PatchSource::Server))
            }
            PushEvent::Snapshot {
                state,
                change_number,
            } => TransportMessage::Snapshot {
                key: key.clone(),
                state,
                change_number,
            },
        }
    }
}

/// Body of the `POST .../patches` write path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchesBody {
    pub patches: Vec<Patch>,
}
