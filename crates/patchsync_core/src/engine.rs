//! Consumer-side patch application.
//!
//! [`PatchEngine`] owns the local copy of every registered entity together with
//! its watermark (the highest change number applied so far). Incoming batches
//! are grouped per entity, ordered by the entity's [`ConflictStrategy`], filtered
//! against the watermark and interpreted one patch at a time.
//!
//! # Guarantees
//!
//! - A patch whose change number is at or below the watermark at the start of
//!   the call is skipped, so redelivery is harmless.
//! - Patches of one mutation share a change number and are all applied.
//! - The watermark never decreases.
//! - Subscribers are notified once per entity per call, after all of that
//!   entity's patches have been applied.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::apply::{PathPolicy, apply_patch};
use crate::callback::{Callback, CallbackRegistry, SubscriptionId};
use crate::conflict::ConflictStrategy;
use crate::error::{PatchSyncError, Result};
use crate::patch::{EntityKey, Patch, PatchBatch, PatchSource};
use crate::storage::PatchStorage;

/// Engine tunables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub path_policy: PathPolicy,
    /// Prefix for storage names (`{prefix}{type}:{id}`)
    pub storage_prefix: String,
}

/// Emitted once per entity per apply call.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChanged {
    pub key: EntityKey,
    pub state: Value,
    pub last_change_number: u64,
    /// Patches consumed in this call (applied or failed)
    pub consumed: usize,
    pub source: PatchSource,
}

/// Outcome of applying patches to one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityReport {
    pub key: EntityKey,
    pub applied: usize,
    /// Stale or duplicate
    pub skipped: usize,
    /// Consumed but rejected by the interpreter
    pub failed: usize,
    pub last_change_number: u64,
}

/// Outcome of one [`PatchEngine::apply_batches`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub entities: Vec<EntityReport>,
}

impl ApplyReport {
    pub fn applied(&self) -> usize {
        self.entities.iter().map(|e| e.applied).sum()
    }

    pub fn skipped(&self) -> usize {
        self.entities.iter().map(|e| e.skipped).sum()
    }

    pub fn failed(&self) -> usize {
        self.entities.iter().map(|e| e.failed).sum()
    }

    pub fn entity(&self, key: &EntityKey) -> Option<&EntityReport> {
        self.entities.iter().find(|e| &e.key == key)
    }
}

/// Which path [`PatchEngine::restore_entity`] took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreSource {
    /// Loaded the stored snapshot (plus any log tail past it)
    Snapshot,
    /// Replayed the patch log from an empty state
    Log,
    /// Nothing stored; started empty
    Empty,
}

#[derive(Debug, Clone)]
struct EntityState {
    state: Value,
    last_change_number: u64,
    strategy: ConflictStrategy,
}

/// Applies patch batches to local entity copies.
pub struct PatchEngine {
    entities: HashMap<EntityKey, EntityState>,
    config: EngineConfig,
    storage: Option<Arc<dyn PatchStorage>>,
    callbacks: CallbackRegistry<StateChanged>,
}

impl PatchEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            entities: HashMap::new(),
            config,
            storage: None,
            callbacks: CallbackRegistry::new(),
        }
    }

    /// An engine that persists a snapshot and the applied patches after every
    /// successful apply.
    pub fn with_storage(config: EngineConfig, storage: Arc<dyn PatchStorage>) -> Self {
        Self {
            storage: Some(storage),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> Option<&Arc<dyn PatchStorage>> {
        self.storage.as_ref()
    }

    fn storage_name(&self, key: &EntityKey) -> String {
        key.storage_name(&self.config.storage_prefix)
    }

    // ==================== Entity registry ====================

    /// Seed an entity with a full state and a zero watermark.
    pub fn register_entity(
        &mut self,
        key: EntityKey,
        initial_state: Value,
        strategy: ConflictStrategy,
    ) -> Result<()> {
        if self.entities.contains_key(&key) {
            return Err(PatchSyncError::EntityAlreadyRegistered(key.to_string()));
        }
        log::debug!("[PatchEngine] registered {} ({})", key, strategy);
        self.entities.insert(
            key,
            EntityState {
                state: initial_state,
                last_change_number: 0,
                strategy,
            },
        );
        Ok(())
    }

    /// Drop an entity from memory, returning its state and watermark.
    pub fn unregister_entity(&mut self, key: &EntityKey) -> Option<(Value, u64)> {
        self.entities
            .remove(key)
            .map(|e| (e.state, e.last_change_number))
    }

    pub fn is_registered(&self, key: &EntityKey) -> bool {
        self.entities.contains_key(key)
    }

    pub fn state(&self, key: &EntityKey) -> Option<&Value> {
        self.entities.get(key).map(|e| &e.state)
    }

    pub fn last_change_number(&self, key: &EntityKey) -> Option<u64> {
        self.entities.get(key).map(|e| e.last_change_number)
    }

    pub fn strategy(&self, key: &EntityKey) -> Option<ConflictStrategy> {
        self.entities.get(key).map(|e| e.strategy)
    }

    /// Registered keys, sorted.
    pub fn entity_keys(&self) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self.entities.keys().cloned().collect();
        keys.sort();
        keys
    }

    // ==================== Subscriptions ====================

    pub fn on_state_changed(&self, callback: Callback<StateChanged>) -> SubscriptionId {
        self.callbacks.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.callbacks.unsubscribe(id)
    }

    fn notify(&self, key: &EntityKey, consumed: usize, source: PatchSource) {
        if !self.callbacks.has_subscribers() {
            return;
        }
        if let Some(entity) = self.entities.get(key) {
            self.callbacks.emit(&StateChanged {
                key: key.clone(),
                state: entity.state.clone(),
                last_change_number: entity.last_change_number,
                consumed,
                source,
            });
        }
    }

    // ==================== Application ====================

    pub fn apply_batch(&mut self, batch: &PatchBatch) -> Result<ApplyReport> {
        self.apply_batches(std::slice::from_ref(batch))
    }

    /// Apply every batch, grouped per entity.
    ///
    /// Fails with [`PatchSyncError::UnknownEntity`] before touching anything if
    /// any batch addresses an unregistered entity. Individual patch failures do
    /// not fail the call; they are counted in the report.
    pub fn apply_batches(&mut self, batches: &[PatchBatch]) -> Result<ApplyReport> {
        // (key, patches, source) in first-seen order
        let mut groups: Vec<(EntityKey, Vec<Patch>, PatchSource)> = Vec::new();
        let mut index: HashMap<EntityKey, usize> = HashMap::new();

        for batch in batches {
            let key = batch.entity_key();
            if !self.entities.contains_key(&key) {
                return Err(PatchSyncError::UnknownEntity(key.to_string()));
            }
            match index.get(&key) {
                Some(&i) => groups[i].1.extend(batch.patches.iter().cloned()),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push((key, batch.patches.clone(), batch.source));
                }
            }
        }

        let mut report = ApplyReport::default();
        for (key, patches, source) in groups {
            report.entities.push(self.apply_to_entity(&key, patches, source)?);
        }
        Ok(report)
    }

    fn apply_to_entity(
        &mut self,
        key: &EntityKey,
        mut patches: Vec<Patch>,
        source: PatchSource,
    ) -> Result<EntityReport> {
        let policy = self.config.path_policy;
        let entity = self
            .entities
            .get_mut(key)
            .ok_or_else(|| PatchSyncError::UnknownEntity(key.to_string()))?;

        entity.strategy.order(&mut patches);
        let floor = entity.last_change_number;

        let mut report = EntityReport {
            key: key.clone(),
            applied: 0,
            skipped: 0,
            failed: 0,
            last_change_number: floor,
        };
        let mut consumed: Vec<Patch> = Vec::new();

        for patch in patches {
            if patch.change_number <= floor || consumed.contains(&patch) {
                report.skipped += 1;
                continue;
            }

            match apply_patch(&mut entity.state, &patch, policy) {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    log::warn!(
                        "[PatchEngine] {} {} at '{}' on {} failed: {}",
                        patch.operation,
                        patch.change_number,
                        patch.field_path,
                        key,
                        e
                    );
                    report.failed += 1;
                }
            }
            entity.last_change_number = entity.last_change_number.max(patch.change_number);
            consumed.push(patch);
        }

        report.last_change_number = entity.last_change_number;

        if report.skipped > 0 {
            log::debug!(
                "[PatchEngine] skipped {} stale/duplicate patches on {} (watermark {})",
                report.skipped,
                key,
                floor
            );
        }

        if !consumed.is_empty() {
            self.persist_applied(key, &consumed);
            self.notify(key, consumed.len(), source);
        }

        Ok(report)
    }

    /// Snapshot plus log append. Failures are logged; the in-memory state stays
    /// authoritative for this process.
    fn persist_applied(&self, key: &EntityKey, consumed: &[Patch]) {
        let (Some(storage), Some(entity)) = (&self.storage, self.entities.get(key)) else {
            return;
        };
        let name = self.storage_name(key);
        if let Err(e) = storage.append_patches(&name, consumed) {
            log::error!("[PatchEngine] failed to append log for {}: {}", key, e);
        }
        if let Err(e) =
            storage.save_snapshot(&name, &entity.state, Some(entity.last_change_number))
        {
            log::error!("[PatchEngine] failed to save snapshot for {}: {}", key, e);
        }
    }

    /// Replace an entity's state with a full-state seed from the authority.
    ///
    /// A snapshot older than the watermark is ignored and `false` returned.
    pub fn apply_snapshot(
        &mut self,
        key: &EntityKey,
        state: Value,
        change_number: u64,
    ) -> Result<bool> {
        let entity = self
            .entities
            .get_mut(key)
            .ok_or_else(|| PatchSyncError::UnknownEntity(key.to_string()))?;

        if change_number < entity.last_change_number {
            log::debug!(
                "[PatchEngine] ignoring stale snapshot for {} ({} < {})",
                key,
                change_number,
                entity.last_change_number
            );
            return Ok(false);
        }

        entity.state = state;
        entity.last_change_number = change_number;

        if let Some(storage) = &self.storage {
            let name = self.storage_name(key);
            if let Some(entity) = self.entities.get(key) {
                storage.save_snapshot(&name, &entity.state, Some(change_number))?;
            }
        }
        self.notify(key, 0, PatchSource::Server);
        Ok(true)
    }

    // ==================== Persistence ====================

    /// Register an entity from storage.
    ///
    /// Loads the snapshot when there is one (then replays any log entries past
    /// its watermark); otherwise replays the whole log from an empty object in
    /// change-number order; otherwise starts empty.
    pub fn restore_entity(
        &mut self,
        key: EntityKey,
        strategy: ConflictStrategy,
    ) -> Result<RestoreSource> {
        if self.entities.contains_key(&key) {
            return Err(PatchSyncError::EntityAlreadyRegistered(key.to_string()));
        }

        let policy = self.config.path_policy;
        let name = self.storage_name(&key);
        let mut state = Value::Object(Map::new());
        let mut watermark = 0;

        let source = match &self.storage {
            None => RestoreSource::Empty,
            Some(storage) => match storage.load_snapshot(&name)? {
                Some(snapshot) => {
                    state = snapshot.state;
                    watermark = snapshot.change_number.unwrap_or(0);
                    let mut tail: Vec<Patch> = storage
                        .load_patches_since(&name, watermark)?
                        .into_iter()
                        .map(|e| e.patch)
                        .collect();
                    tail.sort_by_key(|p| p.change_number);
                    watermark = replay(&mut state, watermark, tail.into_iter(), policy);
                    RestoreSource::Snapshot
                }
                None => {
                    let log = storage.load_patch_log(&name)?;
                    if log.is_empty() {
                        RestoreSource::Empty
                    } else {
                        let mut patches: Vec<Patch> = log.into_iter().map(|e| e.patch).collect();
                        patches.sort_by_key(|p| p.change_number);
                        watermark = replay(&mut state, 0, patches.into_iter(), policy);
                        RestoreSource::Log
                    }
                }
            },
        };

        log::info!(
            "[PatchEngine] restored {} from {:?} at change {}",
            key,
            source,
            watermark
        );

        self.entities.insert(
            key.clone(),
            EntityState {
                state,
                last_change_number: watermark,
                strategy,
            },
        );
        if source != RestoreSource::Empty {
            self.notify(&key, 0, PatchSource::Storage);
        }
        Ok(source)
    }

    /// Write the current snapshot of an entity.
    pub fn persist_entity(&self, key: &EntityKey) -> Result<()> {
        let entity = self
            .entities
            .get(key)
            .ok_or_else(|| PatchSyncError::UnknownEntity(key.to_string()))?;
        if let Some(storage) = &self.storage {
            storage.save_snapshot(
                &self.storage_name(key),
                &entity.state,
                Some(entity.last_change_number),
            )?;
        }
        Ok(())
    }

    /// Delete every stored record of an entity.
    pub fn delete_stored(&self, key: &EntityKey) -> Result<()> {
        if let Some(storage) = &self.storage {
            storage.delete_entity(&self.storage_name(key))?;
        }
        Ok(())
    }

    /// Snapshot the entity, then trim its log to the last `keep` entries.
    pub fn compact(&self, key: &EntityKey, keep: usize) -> Result<()> {
        self.persist_entity(key)?;
        if let Some(storage) = &self.storage {
            storage.compact(&self.storage_name(key), keep)?;
        }
        Ok(())
    }
}

/// Apply already-ordered patches above `watermark`, returning the new watermark.
fn replay(
    state: &mut Value,
    mut watermark: u64,
    patches: impl Iterator<Item = Patch>,
    policy: PathPolicy,
) -> u64 {
    for patch in patches {
        if let Err(e) = apply_patch(state, &patch, policy) {
            log::warn!(
                "[PatchEngine] replay of '{}' at change {} failed: {}",
                patch.field_path,
                patch.change_number,
                e
            );
        }
        watermark = watermark.max(patch.change_number);
    }
    watermark
}

impl std::fmt::Debug for PatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchEngine")
            .field("entities", &self.entities.len())
            .field("config", &self.config)
            .field("persistent", &self.storage.is_some())
            .finish()
    }
}
