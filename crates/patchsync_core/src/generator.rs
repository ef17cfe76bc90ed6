//! Authoritative patch generation.
//!
//! Only the process holding authority over an entity mints change numbers for
//! it. Each mutation consumes exactly one number, shared by every patch it
//! produces, and numbers are persisted before the batch leaves the generator so
//! a restart never reuses one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::error::{PatchSyncError, Result};
use crate::patch::{EntityKey, Patch, PatchBatch, PatchSource};
use crate::storage::PatchStorage;

/// Translates one semantic operation into patches, given the current state.
pub trait Mutation: Send + Sync {
    /// Name recorded in batch metadata and logs.
    fn name(&self) -> &str {
        "patches"
    }

    /// Compute the patches for this mutation. Must not have side effects.
    fn patches(&self, state: &Value) -> Result<Vec<Patch>>;
}

impl Mutation for Vec<Patch> {
    fn patches(&self, _state: &Value) -> Result<Vec<Patch>> {
        Ok(self.clone())
    }
}

/// A named pass-through proposal: patches computed elsewhere, submitted as-is.
#[derive(Debug, Clone)]
pub struct PatchList {
    pub name: String,
    pub patches: Vec<Patch>,
}

impl PatchList {
    pub fn new(name: impl Into<String>, patches: Vec<Patch>) -> Self {
        Self {
            name: name.into(),
            patches,
        }
    }
}

impl Mutation for PatchList {
    fn name(&self) -> &str {
        &self.name
    }

    fn patches(&self, _state: &Value) -> Result<Vec<Patch>> {
        Ok(self.patches.clone())
    }
}

/// Provenance stamped onto generated patches.
#[derive(Debug, Clone)]
pub struct MutationContext {
    pub user_id: Option<String>,
    /// Defaults to a fresh UUID per mutation
    pub transaction_id: Option<String>,
    /// Milliseconds since epoch; defaults to now
    pub timestamp: Option<i64>,
    pub source: PatchSource,
}

impl Default for MutationContext {
    fn default() -> Self {
        Self {
            user_id: None,
            transaction_id: None,
            timestamp: None,
            source: PatchSource::Local,
        }
    }
}

impl MutationContext {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn with_source(mut self, source: PatchSource) -> Self {
        self.source = source;
        self
    }
}

/// Mints change numbers and stamps generated patches.
pub struct PatchGenerator {
    /// Last minted change number per claimed entity
    counters: Mutex<HashMap<EntityKey, u64>>,
    storage: Option<Arc<dyn PatchStorage>>,
    prefix: String,
}

impl PatchGenerator {
    /// A generator whose counters live only in memory.
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            storage: None,
            prefix: String::new(),
        }
    }

    /// A generator that persists counters under `prefix`.
    pub fn with_storage(storage: Arc<dyn PatchStorage>, prefix: impl Into<String>) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            storage: Some(storage),
            prefix: prefix.into(),
        }
    }

    /// Take authority over `key`, resuming from the persisted counter.
    ///
    /// Claiming an entity already held is a no-op. Returns the current change
    /// number.
    pub fn claim_authority(&self, key: &EntityKey) -> Result<u64> {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = counters.get(key) {
            return Ok(*current);
        }

        let current = match &self.storage {
            Some(storage) => storage
                .load_counter(&key.storage_name(&self.prefix))?
                .unwrap_or(0),
            None => 0,
        };
        counters.insert(key.clone(), current);
        log::info!(
            "[PatchGenerator] claimed authority over {} at change {}",
            key,
            current
        );
        Ok(current)
    }

    /// Give up authority. Returns `false` if it was not held.
    pub fn release_authority(&self, key: &EntityKey) -> bool {
        let released = self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some();
        if released {
            log::info!("[PatchGenerator] released authority over {}", key);
        }
        released
    }

    pub fn is_authoritative(&self, key: &EntityKey) -> bool {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Last minted change number, or `None` without authority.
    pub fn current_change_number(&self, key: &EntityKey) -> Option<u64> {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    /// Turn `mutation` into an ordered batch carrying the next change number.
    ///
    /// Fails closed: without authority, on an empty mutation, or when the new
    /// counter cannot be persisted, no number is consumed and nothing is
    /// returned.
    pub fn generate(
        &self,
        key: &EntityKey,
        state: &Value,
        mutation: &dyn Mutation,
        context: &MutationContext,
    ) -> Result<PatchBatch> {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let current = *counters
            .get(key)
            .ok_or_else(|| PatchSyncError::NotAuthoritative(key.to_string()))?;

        let mut patches = mutation.patches(state)?;
        if patches.is_empty() {
            return Err(PatchSyncError::EmptyMutation(key.to_string()));
        }

        let next = current + 1;
        if let Some(storage) = &self.storage {
            storage.save_counter(&key.storage_name(&self.prefix), next)?;
        }
        counters.insert(key.clone(), next);
        drop(counters);

        let timestamp = context
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let transaction_id = context
            .transaction_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        for patch in &mut patches {
            patch.change_number = next;
            patch.timestamp = timestamp;
            if patch.user_id.is_none() {
                patch.user_id = context.user_id.clone();
            }
            if patch.transaction_id.is_none() {
                patch.transaction_id = Some(transaction_id.clone());
            }
        }

        log::debug!(
            "[PatchGenerator] {} on {}: {} patches at change {}",
            mutation.name(),
            key,
            patches.len(),
            next
        );

        Ok(PatchBatch::new(key, patches, context.source).with_metadata("mutation", mutation.name()))
    }
}

impl Default for PatchGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PatchGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchGenerator")
            .field("prefix", &self.prefix)
            .field("persistent", &self.storage.is_some())
            .finish_non_exhaustive()
    }
}
