//! In-memory storage implementation for testing.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use super::{PatchStorage, StorageResult, StoredPatch, StoredSnapshot, now_millis};
use crate::error::PatchSyncError;
use crate::patch::Patch;

/// In-memory storage for tests and development.
///
/// Clones share the same data, which makes it easy to simulate a process
/// restart: drop the engine, keep a clone of the storage, build a new engine.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    /// Snapshots (name -> snapshot)
    snapshots: Arc<RwLock<HashMap<String, StoredSnapshot>>>,

    /// Patch logs (name -> entries in append order)
    logs: Arc<RwLock<HashMap<String, Vec<StoredPatch>>>>,

    /// Generator counters (name -> last minted change number)
    counters: Arc<RwLock<HashMap<String, u64>>>,

    /// Counter for generating log IDs
    next_id: Arc<RwLock<i64>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_log_id(&self) -> i64 {
        let mut id = self.next_id.write().unwrap_or_else(PoisonError::into_inner);
        *id += 1;
        *id
    }

    /// Number of log entries for an entity.
    pub fn log_len(&self, name: &str) -> usize {
        self.logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl PatchStorage for MemoryStorage {
    fn load_snapshot(&self, name: &str) -> StorageResult<Option<StoredSnapshot>> {
        let snapshots = self.snapshots.read().unwrap_or_else(PoisonError::into_inner);
        Ok(snapshots.get(name).cloned())
    }

    fn save_snapshot(
        &self,
        name: &str,
        state: &Value,
        change_number: Option<u64>,
    ) -> StorageResult<()> {
        let mut snapshots = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
        snapshots.insert(
            name.to_string(),
            StoredSnapshot {
                state: state.clone(),
                change_number,
                updated_at: now_millis(),
            },
        );
        Ok(())
    }

    fn append_patches(&self, name: &str, patches: &[Patch]) -> StorageResult<Vec<i64>> {
        let entries: Vec<StoredPatch> = patches
            .iter()
            .map(|patch| StoredPatch {
                id: self.next_log_id(),
                change_number: patch.change_number,
                patch: patch.clone(),
                created_at: now_millis(),
            })
            .collect();
        let ids = entries.iter().map(|e| e.id).collect();

        let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
        logs.entry(name.to_string()).or_default().extend(entries);
        Ok(ids)
    }

    fn load_patch_log(&self, name: &str) -> StorageResult<Vec<StoredPatch>> {
        let logs = self.logs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(logs.get(name).cloned().unwrap_or_default())
    }

    fn load_counter(&self, name: &str) -> StorageResult<Option<u64>> {
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        Ok(counters.get(name).copied())
    }

    fn save_counter(&self, name: &str, value: u64) -> StorageResult<()> {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        counters.insert(name.to_string(), value);
        Ok(())
    }

    fn delete_entity(&self, name: &str) -> StorageResult<()> {
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        self.logs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        self.counters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }

    fn list_entities(&self) -> StorageResult<Vec<String>> {
        let snapshots = self.snapshots.read().unwrap_or_else(PoisonError::into_inner);
        let logs = self.logs.read().unwrap_or_else(PoisonError::into_inner);
        let names: BTreeSet<String> = snapshots
            .keys()
            .chain(logs.iter().filter(|(_, l)| !l.is_empty()).map(|(k, _)| k))
            .cloned()
            .collect();
        Ok(names.into_iter().collect())
    }

    fn compact(&self, name: &str, keep: usize) -> StorageResult<()> {
        if self.load_snapshot(name)?.is_none() {
            return Err(PatchSyncError::Storage(format!(
                "cannot compact '{}' without a snapshot",
                name
            )));
        }
        let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(log) = logs.get_mut(name)
            && log.len() > keep
        {
            let drop = log.len() - keep;
            log.drain(..drop);
        }
        Ok(())
    }
}
