use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use patchsync_core::generator::PatchList;
use patchsync_core::storage::PatchStorage;
use patchsync_core::{
    EngineConfig, EntityKey, MutationContext, Patch, PatchBatch, PatchEngine, PatchGenerator,
    PatchSource, PatchSyncError, RestoreSource,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ApiError;
use crate::rpc::{EntityTypeRegistry, EntityTypeSpec, MethodContext, MethodRegistry, MethodSpec};

/// Statistics about the sync state
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub active_connections: usize,
    pub active_rooms: usize,
}

/// Global sync state managing all rooms
pub struct SyncState {
    /// Open rooms by entity
    rooms: RwLock<HashMap<EntityKey, Arc<EntityRoom>>>,
    storage: Arc<dyn PatchStorage>,
    /// Shared by every room so counters live in one place
    generator: Arc<PatchGenerator>,
    types: EntityTypeRegistry,
    methods: MethodRegistry,
    engine_config: EngineConfig,
    broadcast_capacity: usize,
    started_at: DateTime<Utc>,
}

impl SyncState {
    pub fn new(
        storage: Arc<dyn PatchStorage>,
        types: EntityTypeRegistry,
        methods: MethodRegistry,
        config: &Config,
    ) -> Self {
        let generator = Arc::new(PatchGenerator::with_storage(
            storage.clone(),
            config.storage_prefix.clone(),
        ));
        Self {
            rooms: RwLock::new(HashMap::new()),
            storage,
            generator,
            types,
            methods,
            engine_config: EngineConfig {
                storage_prefix: config.storage_prefix.clone(),
                ..EngineConfig::default()
            },
            broadcast_capacity: config.broadcast_capacity.max(1),
            started_at: Utc::now(),
        }
    }

    pub fn types(&self) -> &EntityTypeRegistry {
        &self.types
    }

    pub fn methods(&self) -> &MethodRegistry {
        &self.methods
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Get or open the room for an entity, restoring it from storage.
    pub async fn get_or_create_room(&self, key: &EntityKey) -> Result<Arc<EntityRoom>, ApiError> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(key) {
                return Ok(room.clone());
            }
        }

        let spec = self.types.get(&key.entity_type)?;
        let mut rooms = self.rooms.write().await;

        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(key) {
            return Ok(room.clone());
        }

        let room = Arc::new(EntityRoom::open(
            key.clone(),
            spec,
            self.storage.clone(),
            self.generator.clone(),
            self.engine_config.clone(),
            self.broadcast_capacity,
        )?);
        rooms.insert(key.clone(), room.clone());
        info!("Opened room for {}", key);

        Ok(room)
    }

    /// Get an existing room (does not create if not found)
    pub async fn get_room(&self, key: &EntityKey) -> Option<Arc<EntityRoom>> {
        self.rooms.read().await.get(key).cloned()
    }

    /// Close a room if it has no active connections
    pub async fn maybe_remove_room(&self, key: &EntityKey) {
        let mut rooms = self.rooms.write().await;

        if let Some(room) = rooms.get(key)
            && room.connection_count() == 0
        {
            room.close();
            rooms.remove(key);
            info!("Closed idle room: {}", key);
        }
    }

    /// Get statistics about the sync state
    pub async fn get_stats(&self) -> SyncStats {
        let rooms = self.rooms.read().await;
        SyncStats {
            active_connections: rooms.values().map(|r| r.connection_count()).sum(),
            active_rooms: rooms.len(),
        }
    }

    /// Persist and close every room.
    pub async fn shutdown(&self) {
        let mut rooms = self.rooms.write().await;
        for (_, room) in rooms.drain() {
            room.close();
        }
        info!("All rooms closed");
    }
}

/// Something a room pushes to its observers.
#[derive(Debug, Clone)]
pub enum RoomUpdate {
    Patches(Arc<PatchBatch>),
    /// Full state, sent on join and after a subscriber lags
    Snapshot { state: Value, change_number: u64 },
}

/// The authoritative copy of one entity and its observers.
pub struct EntityRoom {
    key: EntityKey,
    engine: Mutex<PatchEngine>,
    generator: Arc<PatchGenerator>,
    /// Batches for every observer
    broadcast_tx: broadcast::Sender<Arc<PatchBatch>>,
    /// Number of active connections
    connection_count: AtomicUsize,
}

impl std::fmt::Debug for EntityRoom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRoom")
            .field("key", &self.key)
            .field("connection_count", &self.connection_count)
            .finish_non_exhaustive()
    }
}

impl EntityRoom {
    /// Restore an entity from storage, seeding new ones with the type's
    /// initial state, and claim authority for it.
    pub fn open(
        key: EntityKey,
        spec: &EntityTypeSpec,
        storage: Arc<dyn PatchStorage>,
        generator: Arc<PatchGenerator>,
        config: EngineConfig,
        broadcast_capacity: usize,
    ) -> Result<Self, PatchSyncError> {
        let mut engine = PatchEngine::with_storage(config, storage);
        let source = engine.restore_entity(key.clone(), spec.strategy)?;
        if source == RestoreSource::Empty {
            engine.unregister_entity(&key);
            engine.register_entity(key.clone(), spec.initial_state.clone(), spec.strategy)?;
            engine.persist_entity(&key)?;
            debug!("Seeded {} with its initial state", key);
        }

        let counter = generator.claim_authority(&key)?;
        let watermark = engine.last_change_number(&key).unwrap_or(0);
        if counter != watermark {
            warn!(
                "Counter for {} is {} but stored state is at {}",
                key, counter, watermark
            );
        }

        let (broadcast_tx, _) = broadcast::channel(broadcast_capacity);
        Ok(Self {
            key,
            engine: Mutex::new(engine),
            generator,
            broadcast_tx,
            connection_count: AtomicUsize::new(0),
        })
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    fn lock(&self) -> MutexGuard<'_, PatchEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state and watermark
    pub fn snapshot(&self) -> (Value, u64) {
        let engine = self.lock();
        (
            engine.state(&self.key).cloned().unwrap_or(Value::Null),
            engine.last_change_number(&self.key).unwrap_or(0),
        )
    }

    pub fn last_change_number(&self) -> u64 {
        self.lock().last_change_number(&self.key).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PatchBatch>> {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        self.broadcast_tx.subscribe()
    }

    pub fn unsubscribe(&self) {
        self.connection_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    fn publish(&self, batch: &PatchBatch) {
        let receivers = self.broadcast_tx.send(Arc::new(batch.clone())).unwrap_or(0);
        debug!(
            "Broadcast change {} on {} to {} observers",
            batch.change_number, self.key, receivers
        );
    }

    fn context(user_id: Option<&str>) -> MutationContext {
        MutationContext {
            user_id: user_id.map(str::to_string),
            ..MutationContext::default()
        }
        .with_source(PatchSource::Server)
    }

    /// Number, apply and broadcast patches proposed by a client.
    ///
    /// Proposed change numbers are replaced; only this room mints them.
    /// Broadcast happens under the engine lock so observers see change
    /// numbers in the order they were minted.
    pub fn submit(&self, patches: Vec<Patch>, user_id: Option<&str>) -> Result<PatchBatch, PatchSyncError> {
        let mut engine = self.lock();
        let state = engine
            .state(&self.key)
            .ok_or_else(|| PatchSyncError::UnknownEntity(self.key.to_string()))?;
        let batch = self.generator.generate(
            &self.key,
            state,
            &PatchList::new("client_patches", patches),
            &Self::context(user_id),
        )?;
        engine.apply_batch(&batch)?;
        self.publish(&batch);
        Ok(batch)
    }

    /// Run a registered method against the authoritative state.
    ///
    /// Returns the method's result value and, for patch-producing methods that
    /// changed something, the committed batch.
    pub fn invoke(
        &self,
        method: &str,
        spec: &MethodSpec,
        args: &Value,
        user_id: Option<&str>,
    ) -> Result<(Value, Option<PatchBatch>), ApiError> {
        let mut engine = self.lock();
        let state = engine
            .state(&self.key)
            .ok_or_else(|| PatchSyncError::UnknownEntity(self.key.to_string()))?;
        let outcome = (spec.handler)(&MethodContext {
            key: &self.key,
            state,
            args,
            user_id,
        })?;

        if !spec.patch_producing {
            if !outcome.patches.is_empty() {
                warn!("Query method {} on {} returned patches; ignored", method, self.key);
            }
            return Ok((outcome.result, None));
        }
        if outcome.patches.is_empty() {
            return Ok((outcome.result, None));
        }

        let batch = self.generator.generate(
            &self.key,
            state,
            &PatchList::new(method, outcome.patches),
            &Self::context(user_id),
        )?;
        engine.apply_batch(&batch)?;
        if spec.broadcast {
            self.publish(&batch);
        }
        Ok((outcome.result, Some(batch)))
    }

    /// Save a snapshot and give up authority.
    pub fn close(&self) {
        if let Err(e) = self.lock().persist_entity(&self.key) {
            error!("Failed to persist {} on close: {}", self.key, e);
        }
        self.generator.release_authority(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::default_registries;
    use patchsync_core::MemoryStorage;
    use serde_json::json;

    fn state_with(storage: Arc<MemoryStorage>) -> SyncState {
        let (types, methods) = default_registries();
        SyncState::new(storage, types, methods, &Config::default())
    }

    #[tokio::test]
    async fn test_new_room_is_seeded() {
        let sync = state_with(Arc::new(MemoryStorage::new()));
        let room = sync
            .get_or_create_room(&EntityKey::new("board", "g1"))
            .await
            .unwrap();
        let (state, change_number) = room.snapshot();
        assert_eq!(state["currentPlayer"], "P1");
        assert_eq!(change_number, 0);
        assert_eq!(sync.get_stats().await.active_rooms, 1);
    }

    #[tokio::test]
    async fn test_unknown_type_has_no_room() {
        let sync = state_with(Arc::new(MemoryStorage::new()));
        let err = sync
            .get_or_create_room(&EntityKey::new("chess", "g1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::UnknownEntityType(_)));
    }

    #[tokio::test]
    async fn test_submit_restamps_and_broadcasts() {
        let sync = state_with(Arc::new(MemoryStorage::new()));
        let room = sync
            .get_or_create_room(&EntityKey::new("board", "g1"))
            .await
            .unwrap();
        let mut rx = room.subscribe();

        let batch = room
            .submit(
                vec![Patch::set("note", "hi").with_change_number(999)],
                Some("u1"),
            )
            .unwrap();
        assert_eq!(batch.change_number, 1);
        assert_eq!(batch.patches[0].user_id.as_deref(), Some("u1"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.change_number, 1);
        assert_eq!(room.snapshot().0["note"], "hi");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submits_broadcast_in_change_order() {
        let sync = state_with(Arc::new(MemoryStorage::new()));
        let room = sync
            .get_or_create_room(&EntityKey::new("board", "g1"))
            .await
            .unwrap();
        let mut rx = room.subscribe();

        let writers: Vec<_> = (0..8)
            .map(|writer| {
                let room = Arc::clone(&room);
                tokio::task::spawn_blocking(move || {
                    for n in 0..100 {
                        room.submit(vec![Patch::set(format!("w{}", writer), n)], None)
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let mut last = 0;
        for _ in 0..800 {
            let batch = rx.recv().await.unwrap();
            assert_eq!(batch.change_number, last + 1);
            last = batch.change_number;
        }
        assert_eq!(room.last_change_number(), 800);
    }

    #[tokio::test]
    async fn test_invoke_query_and_patching_methods() {
        let sync = state_with(Arc::new(MemoryStorage::new()));
        let room = sync
            .get_or_create_room(&EntityKey::new("board", "g1"))
            .await
            .unwrap();

        let spec = sync.methods().get("board", "get_board").unwrap();
        let (result, batch) = room.invoke("get_board", spec, &json!({}), None).unwrap();
        assert!(batch.is_none());
        assert_eq!(result["turn"], 0);

        let spec = sync.methods().get("board", "place_token").unwrap();
        let (result, batch) = room
            .invoke("place_token", spec, &json!({"column": 3, "player": "P1"}), None)
            .unwrap();
        assert_eq!(result["row"], 0);
        let batch = batch.unwrap();
        assert_eq!(batch.change_number, 1);
        assert_eq!(batch.metadata["mutation"], "place_token");
        assert_eq!(room.snapshot().1, 1);
    }

    #[tokio::test]
    async fn test_reopened_room_continues_numbering() {
        let storage = Arc::new(MemoryStorage::new());
        let key = EntityKey::new("board", "g1");
        {
            let sync = state_with(storage.clone());
            let room = sync.get_or_create_room(&key).await.unwrap();
            room.submit(vec![Patch::set("a", 1)], None).unwrap();
            room.submit(vec![Patch::set("a", 2)], None).unwrap();
            sync.shutdown().await;
        }

        let sync = state_with(storage);
        let room = sync.get_or_create_room(&key).await.unwrap();
        assert_eq!(room.snapshot().1, 2);
        let batch = room.submit(vec![Patch::set("a", 3)], None).unwrap();
        assert_eq!(batch.change_number, 3);
    }

    #[tokio::test]
    async fn test_idle_room_is_removed() {
        let sync = state_with(Arc::new(MemoryStorage::new()));
        let key = EntityKey::new("board", "g1");
        let room = sync.get_or_create_room(&key).await.unwrap();
        let rx = room.subscribe();

        sync.maybe_remove_room(&key).await;
        assert!(sync.get_room(&key).await.is_some());

        drop(rx);
        room.unsubscribe();
        sync.maybe_remove_room(&key).await;
        assert!(sync.get_room(&key).await.is_none());
    }
}
