//! Durable snapshot and patch-log storage.
//!
//! Every entity is stored under a storage name (`{prefix}{type}:{id}`, see
//! [`EntityKey::storage_name`](crate::patch::EntityKey::storage_name)) and has up
//! to three records:
//!
//! 1. **Snapshot**: the full entity state plus the watermark it reflects.
//! 2. **Patch log**: every applied patch, append-only, for replay when the
//!    snapshot is missing.
//! 3. **Counter**: the generator's last minted change number, so numbers are
//!    never reused across restarts.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use serde_json::Value;

use crate::error::PatchSyncError;
use crate::patch::Patch;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, PatchSyncError>;

/// A persisted full-state snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSnapshot {
    pub state: Value,
    /// Watermark at the time of the snapshot; `None` for a seed that no patch
    /// has touched yet.
    pub change_number: Option<u64>,
    /// Milliseconds since epoch
    pub updated_at: i64,
}

/// One entry of the patch log.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPatch {
    /// Monotonic log position
    pub id: i64,
    pub change_number: u64,
    pub patch: Patch,
    /// Milliseconds since epoch
    pub created_at: i64,
}

/// Trait for persistence backends.
pub trait PatchStorage: Send + Sync {
    /// Load the latest snapshot. Returns `None` if none was saved.
    fn load_snapshot(&self, name: &str) -> StorageResult<Option<StoredSnapshot>>;

    /// Save the full entity state, overwriting any existing snapshot.
    fn save_snapshot(&self, name: &str, state: &Value, change_number: Option<u64>)
    -> StorageResult<()>;

    /// Append applied patches to the log, in order.
    ///
    /// Returns the log IDs of the new entries.
    fn append_patches(&self, name: &str, patches: &[Patch]) -> StorageResult<Vec<i64>>;

    /// Load the whole log in append order.
    fn load_patch_log(&self, name: &str) -> StorageResult<Vec<StoredPatch>>;

    /// Load log entries with a change number strictly above `change_number`.
    fn load_patches_since(&self, name: &str, change_number: u64) -> StorageResult<Vec<StoredPatch>> {
        Ok(self
            .load_patch_log(name)?
            .into_iter()
            .filter(|entry| entry.change_number > change_number)
            .collect())
    }

    /// Load the generator counter. `None` if authority was never claimed.
    fn load_counter(&self, name: &str) -> StorageResult<Option<u64>>;

    fn save_counter(&self, name: &str, value: u64) -> StorageResult<()>;

    /// Delete the snapshot, log and counter of an entity.
    fn delete_entity(&self, name: &str) -> StorageResult<()>;

    /// Names of all entities with a snapshot or a log.
    fn list_entities(&self) -> StorageResult<Vec<String>>;

    /// Drop all but the most recent `keep` log entries.
    ///
    /// Requires a snapshot, since the log may be the only copy of the state
    /// otherwise.
    fn compact(&self, name: &str, keep: usize) -> StorageResult<()>;
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
