//! Wire-level patch model.
//!
//! A [`Patch`] is one atomic, path-addressed mutation. A [`PatchBatch`] groups the
//! patches produced for one entity and carries their high-water change number.
//! [`PatchResponse`] is what a patch-producing request returns to its caller.
//!
//! All types serialize as camelCase JSON so that every implementation sees the
//! same field names:
//!
//! ```text
//! Patch         { operation, fieldPath, value, index, key, oldIndex,
//!                 changeNumber, timestamp, userId, transactionId }
//! PatchBatch    { entityType, entityId, patches[], changeNumber, source, metadata{} }
//! PatchResponse { patchBatches[], success, errorMessage, newChangeNumber }
//! ```

pub mod path;
mod value;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use path::{PathSegment, format_field_path, parse_field_path};

/// The mutation a patch performs at its field path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchOperation {
    /// Assign `value` at the path
    Set,
    /// Insert `value` into the list at `index`, or append
    InsertList,
    /// Remove the list element at `index`
    RemoveList,
    /// Move the list element at `oldIndex` to `index`
    MoveList,
    /// Set `key` to `value` in the map at the path
    InsertMap,
    /// Delete `key` from the map at the path
    RemoveMap,
    /// Empty the list at the path
    ClearList,
    /// Empty the map at the path
    ClearMap,
}

impl PatchOperation {
    /// Wire name of the operation
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchOperation::Set => "SET",
            PatchOperation::InsertList => "INSERT_LIST",
            PatchOperation::RemoveList => "REMOVE_LIST",
            PatchOperation::MoveList => "MOVE_LIST",
            PatchOperation::InsertMap => "INSERT_MAP",
            PatchOperation::RemoveMap => "REMOVE_MAP",
            PatchOperation::ClearList => "CLEAR_LIST",
            PatchOperation::ClearMap => "CLEAR_MAP",
        }
    }
}

impl fmt::Display for PatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One atomic mutation instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    /// What to do at `field_path`
    pub operation: PatchOperation,

    /// Dotted/bracketed address into the entity graph (e.g. `board.cells[3]`)
    pub field_path: String,

    /// New value. Encoded as a JSON string on the wire, decoded once here.
    #[serde(default, with = "value::encoded", skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    /// Target position for list operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,

    /// Map key for map operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Source position for `MOVE_LIST`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_index: Option<usize>,

    /// Per-entity sequence number assigned by the authoritative generator
    #[serde(default)]
    pub change_number: u64,

    /// Creation time in Unix milliseconds (advisory)
    #[serde(default)]
    pub timestamp: i64,

    /// User that caused the mutation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Groups patches emitted by one logical operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl Patch {
    /// Create a bare patch with no arguments and change number 0.
    pub fn new(operation: PatchOperation, field_path: impl Into<String>) -> Self {
        Self {
            operation,
            field_path: field_path.into(),
            value: None,
            index: None,
            key: None,
            old_index: None,
            change_number: 0,
            timestamp: chrono::Utc::now().timestamp_millis(),
            user_id: None,
            transaction_id: None,
        }
    }

    /// `SET path = value`
    pub fn set(field_path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::new(PatchOperation::Set, field_path)
        }
    }

    /// Insert into a list at `index`, or append when `index` is `None`
    pub fn insert_list(
        field_path: impl Into<String>,
        value: impl Into<Value>,
        index: Option<usize>,
    ) -> Self {
        Self {
            value: Some(value.into()),
            index,
            ..Self::new(PatchOperation::InsertList, field_path)
        }
    }

    /// Remove the list element at `index`
    pub fn remove_list(field_path: impl Into<String>, index: usize) -> Self {
        Self {
            index: Some(index),
            ..Self::new(PatchOperation::RemoveList, field_path)
        }
    }

    /// Move the list element at `old_index` to `index`
    pub fn move_list(field_path: impl Into<String>, old_index: usize, index: usize) -> Self {
        Self {
            index: Some(index),
            old_index: Some(old_index),
            ..Self::new(PatchOperation::MoveList, field_path)
        }
    }

    /// Set `key` in the map at the path
    pub fn insert_map(
        field_path: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            key: Some(key.into()),
            value: Some(value.into()),
            ..Self::new(PatchOperation::InsertMap, field_path)
        }
    }

    /// Delete `key` from the map at the path
    pub fn remove_map(field_path: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::new(PatchOperation::RemoveMap, field_path)
        }
    }

    /// Empty the list at the path
    pub fn clear_list(field_path: impl Into<String>) -> Self {
        Self::new(PatchOperation::ClearList, field_path)
    }

    /// Empty the map at the path
    pub fn clear_map(field_path: impl Into<String>) -> Self {
        Self::new(PatchOperation::ClearMap, field_path)
    }

    pub fn with_change_number(mut self, change_number: u64) -> Self {
        self.change_number = change_number;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_transaction(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }
}

/// Identifies one entity instance: `(entity_type, entity_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Name of this entity's durable records under a caller-supplied prefix.
    pub fn storage_name(&self, prefix: &str) -> String {
        format!("{}{}:{}", prefix, self.entity_type, self.entity_id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

impl FromStr for EntityKey {
    type Err = String;

    /// Accepts `type:id` or `type/id`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (entity_type, entity_id) = s
            .split_once(':')
            .or_else(|| s.split_once('/'))
            .ok_or_else(|| format!("Expected 'type:id', got '{}'", s))?;
        if entity_type.is_empty() || entity_id.is_empty() {
            return Err(format!("Expected 'type:id', got '{}'", s));
        }
        Ok(EntityKey::new(entity_type, entity_id))
    }
}

/// Where a batch came from. Informational only; it never gates ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchSource {
    /// Produced in this process
    Local,
    /// Received from a peer
    Remote,
    /// Received from the authoritative server
    Server,
    /// Replayed from durable storage
    Storage,
}

impl fmt::Display for PatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchSource::Local => write!(f, "local"),
            PatchSource::Remote => write!(f, "remote"),
            PatchSource::Server => write!(f, "server"),
            PatchSource::Storage => write!(f, "storage"),
        }
    }
}

impl FromStr for PatchSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(PatchSource::Local),
            "remote" => Ok(PatchSource::Remote),
            "server" => Ok(PatchSource::Server),
            "storage" => Ok(PatchSource::Storage),
            _ => Err(format!("Unknown patch source: {}", s)),
        }
    }
}

/// A named, addressed collection of patches for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchBatch {
    pub entity_type: String,
    pub entity_id: String,
    /// Patches in generation order
    pub patches: Vec<Patch>,
    /// Maximum change number among `patches`
    #[serde(default)]
    pub change_number: u64,
    pub source: PatchSource,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl PatchBatch {
    /// Build a batch and compute its high-water change number.
    pub fn new(key: &EntityKey, patches: Vec<Patch>, source: PatchSource) -> Self {
        let change_number = max_change_number(&patches);
        Self {
            entity_type: key.entity_type.clone(),
            entity_id: key.entity_id.clone(),
            patches,
            change_number,
            source,
            metadata: HashMap::new(),
        }
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Same batch, relabelled with a different provenance tag.
    pub fn with_source(mut self, source: PatchSource) -> Self {
        self.source = source;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

/// Highest change number in a slice of patches, 0 when empty.
pub fn max_change_number(patches: &[Patch]) -> u64 {
    patches.iter().map(|p| p.change_number).max().unwrap_or(0)
}

/// Result of a patch-producing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchResponse {
    #[serde(default)]
    pub patch_batches: Vec<PatchBatch>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub new_change_number: u64,
}

impl PatchResponse {
    /// Create a successful response
    pub fn success(patch_batches: Vec<PatchBatch>) -> Self {
        let new_change_number = patch_batches
            .iter()
            .map(|b| b.change_number)
            .max()
            .unwrap_or(0);
        Self {
            patch_batches,
            success: true,
            error_message: None,
            new_change_number,
        }
    }

    /// Create a failed response
    pub fn failure(error: impl Into<String>, current_change_number: u64) -> Self {
        Self {
            patch_batches: Vec::new(),
            success: false,
            error_message: Some(error.into()),
            new_change_number: current_change_number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_wire_shape() {
        let patch = Patch::set("board.cells[3]", "P1")
            .with_change_number(7)
            .with_timestamp(1_700_000_000_000)
            .with_user("alice");

        let wire = serde_json::to_value(&patch).unwrap();
        assert_eq!(wire["operation"], "SET");
        assert_eq!(wire["fieldPath"], "board.cells[3]");
        // value travels as an encoded string
        assert_eq!(wire["value"], "\"P1\"");
        assert_eq!(wire["changeNumber"], 7);
        assert_eq!(wire["userId"], "alice");
        assert!(wire.get("index").is_none());
    }

    #[test]
    fn test_patch_value_decoded_once() {
        let wire = json!({
            "operation": "INSERT_LIST",
            "fieldPath": "players",
            "value": "{\"name\":\"bob\",\"score\":3}",
            "index": 1,
            "changeNumber": 4
        });
        let patch: Patch = serde_json::from_value(wire).unwrap();
        assert_eq!(patch.operation, PatchOperation::InsertList);
        assert_eq!(patch.value, Some(json!({"name": "bob", "score": 3})));
        assert_eq!(patch.index, Some(1));
        assert_eq!(patch.change_number, 4);
    }

    #[test]
    fn test_patch_value_lenient() {
        // raw JSON instead of an encoded string
        let raw: Patch = serde_json::from_value(json!({
            "operation": "SET",
            "fieldPath": "a",
            "value": [1, 2]
        }))
        .unwrap();
        assert_eq!(raw.value, Some(json!([1, 2])));

        // a string that is not valid JSON stays a string
        let plain: Patch = serde_json::from_value(json!({
            "operation": "SET",
            "fieldPath": "a",
            "value": "P1"
        }))
        .unwrap();
        assert_eq!(plain.value, Some(json!("P1")));
    }

    #[test]
    fn test_batch_change_number_is_max() {
        let key = EntityKey::new("board", "1");
        let batch = PatchBatch::new(
            &key,
            vec![
                Patch::set("a", 1).with_change_number(3),
                Patch::set("b", 2).with_change_number(5),
                Patch::set("c", 3).with_change_number(4),
            ],
            PatchSource::Local,
        );
        assert_eq!(batch.change_number, 5);
        assert_eq!(batch.entity_key(), key);

        let wire = serde_json::to_value(&batch).unwrap();
        assert_eq!(wire["entityType"], "board");
        assert_eq!(wire["source"], "LOCAL");
    }

    #[test]
    fn test_entity_key_parse() {
        let key: EntityKey = "board:42".parse().unwrap();
        assert_eq!(key, EntityKey::new("board", "42"));
        let key: EntityKey = "board/42".parse().unwrap();
        assert_eq!(key.to_string(), "board:42");
        assert!("board".parse::<EntityKey>().is_err());
        assert!(":42".parse::<EntityKey>().is_err());
        assert_eq!(key.storage_name("game/"), "game/board:42");
    }

    #[test]
    fn test_patch_source_from_str() {
        assert_eq!("SERVER".parse::<PatchSource>().unwrap(), PatchSource::Server);
        assert_eq!("storage".parse::<PatchSource>().unwrap(), PatchSource::Storage);
        assert!("peer".parse::<PatchSource>().is_err());
        assert_eq!(PatchSource::Remote.to_string(), "remote");
    }

    #[test]
    fn test_patch_response() {
        let key = EntityKey::new("board", "1");
        let batch = PatchBatch::new(
            &key,
            vec![Patch::set("a", 1).with_change_number(9)],
            PatchSource::Server,
        );
        let ok = PatchResponse::success(vec![batch]);
        assert!(ok.success);
        assert_eq!(ok.new_change_number, 9);

        let err = PatchResponse::failure("no authority", 9);
        assert!(!err.success);
        assert_eq!(err.error_message.as_deref(), Some("no authority"));
        assert_eq!(err.new_change_number, 9);
    }
}
