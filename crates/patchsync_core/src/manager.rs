//! Sync manager: the handle the service layer talks to.
//!
//! [`SyncManager`] wires a [`PatchEngine`], an optional [`PatchGenerator`] and
//! the active [`Transport`] together:
//!
//! - locally produced batches are applied first and then queued for the
//!   transport (local-first); one sender task drains the queue in order;
//! - inbound batches and snapshots are applied as they arrive;
//! - the transport can be swapped at runtime without touching entity state.
//!
//! State-change listeners run after the engine lock is released, so they may
//! call back into the manager.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::callback::{Callback, CallbackRegistry, SubscriptionId};
use crate::conflict::ConflictStrategy;
use crate::engine::{ApplyReport, PatchEngine, RestoreSource, StateChanged};
use crate::error::{PatchSyncError, Result};
use crate::generator::{Mutation, MutationContext, PatchGenerator};
use crate::patch::{EntityKey, PatchBatch};
use crate::transport::{
    Delivery, MessageCallback, Transport, TransportFactory, TransportKind, TransportMessage,
    TransportStatus,
};

/// What [`SyncManager::close_entity`] does with the entity's state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetainPolicy {
    /// Save a final snapshot
    #[default]
    Persist,
    /// Delete every stored record
    Discard,
}

/// Engine plus deferred state-change fan-out.
struct EngineCell {
    engine: Mutex<PatchEngine>,
    pending: Arc<Mutex<Vec<StateChanged>>>,
    listeners: CallbackRegistry<StateChanged>,
}

impl EngineCell {
    fn new(engine: PatchEngine) -> Arc<Self> {
        let pending: Arc<Mutex<Vec<StateChanged>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&pending);
        engine.on_state_changed(Arc::new(move |event: &StateChanged| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
        }));
        Arc::new(Self {
            engine: Mutex::new(engine),
            pending,
            listeners: CallbackRegistry::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PatchEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the engine lock, then notify listeners.
    fn with<R>(&self, f: impl FnOnce(&mut PatchEngine) -> R) -> R {
        let result = {
            let mut engine = self.lock();
            f(&mut engine)
        };
        self.flush();
        result
    }

    fn flush(&self) {
        let events = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        for event in &events {
            self.listeners.emit(event);
        }
    }
}

struct ActiveTransport {
    transport: Arc<dyn Transport>,
    subscription: SubscriptionId,
    outbound: Option<mpsc::UnboundedSender<PatchBatch>>,
    sender: Option<JoinHandle<()>>,
}

impl ActiveTransport {
    fn new(transport: Arc<dyn Transport>, subscription: SubscriptionId) -> Self {
        let (outbound, sender) = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let task = runtime.spawn(send_outbound(Arc::clone(&transport), rx));
                (Some(tx), Some(task))
            }
            Err(_) => {
                log::warn!("[SyncManager] no tokio runtime, outbound batches stay local");
                (None, None)
            }
        };
        Self {
            transport,
            subscription,
            outbound,
            sender,
        }
    }

    fn retire(self) {
        self.transport.unsubscribe(self.subscription);
        if let Some(sender) = self.sender {
            sender.abort();
        }
        self.transport.destroy();
    }
}

/// Sends queued batches one at a time, so the transport sees them in the
/// order they were applied.
async fn send_outbound(
    transport: Arc<dyn Transport>,
    mut rx: mpsc::UnboundedReceiver<PatchBatch>,
) {
    while let Some(batch) = rx.recv().await {
        match transport.send(&batch).await {
            Ok(Delivery::Sent) => log::debug!(
                "[SyncManager] sent {}:{} change {}",
                batch.entity_type,
                batch.entity_id,
                batch.change_number
            ),
            Ok(Delivery::Dropped) => {}
            Err(e) => log::warn!("[SyncManager] send failed: {}", e),
        }
    }
}

/// Explicit handle over one engine and its transport.
pub struct SyncManager {
    cell: Arc<EngineCell>,
    generator: Option<Arc<PatchGenerator>>,
    factory: Arc<dyn TransportFactory>,
    active: RwLock<Option<ActiveTransport>>,
}

impl SyncManager {
    /// An observing manager with no transport yet; call
    /// [`switch_transport`](Self::switch_transport) to connect.
    pub fn new(engine: PatchEngine, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            cell: EngineCell::new(engine),
            generator: None,
            factory,
            active: RwLock::new(None),
        }
    }

    /// Make this manager authoritative: registered entities are claimed on
    /// `generator` and [`mutate`](Self::mutate) becomes available.
    pub fn with_generator(mut self, generator: Arc<PatchGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn is_authoritative(&self) -> bool {
        self.generator.is_some()
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|a| Arc::clone(&a.transport))
    }

    fn attach(&self, key: &EntityKey) -> Result<()> {
        if let Some(generator) = &self.generator {
            generator.claim_authority(key)?;
        }
        if let Some(transport) = self.current_transport() {
            transport.track_entity(key)?;
        }
        Ok(())
    }

    // ==================== Entities ====================

    /// Seed a new entity and start syncing it.
    pub fn register_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        initial_state: Value,
        strategy: ConflictStrategy,
    ) -> Result<EntityKey> {
        let key = EntityKey::new(entity_type, entity_id);
        self.cell
            .with(|engine| engine.register_entity(key.clone(), initial_state, strategy))?;
        self.attach(&key)?;
        log::info!("[SyncManager] registered {}", key);
        Ok(key)
    }

    /// Load an entity from storage and start syncing it.
    pub fn restore_entity(&self, key: &EntityKey, strategy: ConflictStrategy) -> Result<RestoreSource> {
        let source = self
            .cell
            .with(|engine| engine.restore_entity(key.clone(), strategy))?;
        self.attach(key)?;
        Ok(source)
    }

    /// Stop syncing an entity and persist or discard it.
    pub fn close_entity(&self, key: &EntityKey, policy: RetainPolicy) -> Result<()> {
        self.cell.with(|engine| -> Result<()> {
            match policy {
                RetainPolicy::Persist => engine.persist_entity(key)?,
                RetainPolicy::Discard => engine.delete_stored(key)?,
            }
            engine.unregister_entity(key);
            Ok(())
        })?;
        if let Some(generator) = &self.generator {
            generator.release_authority(key);
        }
        log::info!("[SyncManager] closed {} ({:?})", key, policy);
        Ok(())
    }

    pub fn state(&self, key: &EntityKey) -> Option<Value> {
        self.cell.lock().state(key).cloned()
    }

    pub fn last_change_number(&self, key: &EntityKey) -> Option<u64> {
        self.cell.lock().last_change_number(key)
    }

    pub fn entity_keys(&self) -> Vec<EntityKey> {
        self.cell.lock().entity_keys()
    }

    // ==================== Patches ====================

    /// Apply a locally produced batch, then queue it for the active transport.
    ///
    /// Delivery is not awaited.
    pub fn ingest_local_patches(&self, batch: PatchBatch) -> Result<ApplyReport> {
        self.cell.with(|engine| -> Result<ApplyReport> {
            let report = engine.apply_batch(&batch)?;
            self.enqueue(batch);
            Ok(report)
        })
    }

    /// Generate a batch for `mutation` against the current state, apply it and
    /// send it. Requires a generator.
    pub fn mutate(
        &self,
        key: &EntityKey,
        mutation: &dyn Mutation,
        context: &MutationContext,
    ) -> Result<PatchBatch> {
        let generator = self
            .generator
            .as_ref()
            .ok_or_else(|| PatchSyncError::NotAuthoritative(key.to_string()))?;

        self.cell.with(|engine| -> Result<PatchBatch> {
            let state = engine
                .state(key)
                .ok_or_else(|| PatchSyncError::UnknownEntity(key.to_string()))?;
            let batch = generator.generate(key, state, mutation, context)?;
            engine.apply_batch(&batch)?;
            self.enqueue(batch.clone());
            Ok(batch)
        })
    }

    /// Must be called with the engine locked, so the queue order matches the
    /// order batches were applied in.
    fn enqueue(&self, batch: PatchBatch) {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        let Some(outbound) = active.as_ref().and_then(|a| a.outbound.as_ref()) else {
            log::debug!("[SyncManager] no transport, batch kept local");
            return;
        };
        if outbound.send(batch).is_err() {
            log::warn!("[SyncManager] outbound queue closed, batch not sent");
        }
    }

    // ==================== Subscriptions ====================

    /// Called once per entity per applied batch, with the new state.
    pub fn on_state_changed(&self, callback: Callback<StateChanged>) -> SubscriptionId {
        self.cell.listeners.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.cell.listeners.unsubscribe(id)
    }

    // ==================== Transport ====================

    /// Replace the active transport.
    ///
    /// The new transport is built, subscribed and told about every registered
    /// entity before it is swapped in; the old one is then destroyed exactly
    /// once. Entity state and watermarks are untouched.
    pub fn switch_transport(&self, kind: TransportKind) -> Result<()> {
        let transport = self.factory.create(kind)?;
        let subscription = transport.subscribe(inbound_handler(Arc::downgrade(&self.cell)));
        for key in self.entity_keys() {
            if let Err(e) = transport.track_entity(&key) {
                transport.destroy();
                return Err(e);
            }
        }

        let previous = self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(ActiveTransport::new(transport, subscription));

        match previous {
            Some(old) => {
                log::info!(
                    "[SyncManager] switched transport {} -> {}",
                    old.transport.kind(),
                    kind
                );
                old.retire();
            }
            None => log::info!("[SyncManager] using transport {}", kind),
        }
        Ok(())
    }

    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.current_transport().map(|t| t.kind())
    }

    pub fn transport_status(&self) -> Option<TransportStatus> {
        self.current_transport().map(|t| t.status())
    }

    pub fn transport_status_watch(&self) -> Option<watch::Receiver<TransportStatus>> {
        self.current_transport().map(|t| t.status_watch())
    }

    /// Destroy the transport and snapshot every entity.
    pub fn shutdown(&self) -> Result<()> {
        let previous = self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(old) = previous {
            old.retire();
        }

        let engine = self.cell.lock();
        for key in engine.entity_keys() {
            engine.persist_entity(&key)?;
        }
        log::info!("[SyncManager] shut down");
        Ok(())
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        let previous = self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(old) = previous {
            old.retire();
        }
    }
}

fn inbound_handler(cell: Weak<EngineCell>) -> MessageCallback {
    Arc::new(move |message: &TransportMessage| {
        let Some(cell) = cell.upgrade() else {
            return;
        };
        let key = message.entity_key();
        let result = match message {
            TransportMessage::Patches(batch) => cell
                .with(|engine| engine.apply_batch(batch))
                .map(|report| {
                    log::debug!(
                        "[SyncManager] inbound {}: applied {}, skipped {}, failed {}",
                        key,
                        report.applied(),
                        report.skipped(),
                        report.failed()
                    )
                }),
            TransportMessage::Snapshot {
                key,
                state,
                change_number,
            } => cell
                .with(|engine| engine.apply_snapshot(key, state.clone(), *change_number))
                .map(|_| ()),
        };
        match result {
            Ok(()) => {}
            // other entities share the channel
            Err(PatchSyncError::UnknownEntity(_)) => {
                log::trace!("[SyncManager] ignoring message for untracked {}", key)
            }
            Err(e) => log::warn!("[SyncManager] inbound message for {} failed: {}", key, e),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::patch::{Patch, PatchSource};
    use crate::storage::{MemoryStorage, PatchStorage};
    use crate::transport::BoxFuture;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport that records sends and counts destroy calls.
    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<PatchBatch>>,
        destroyed: AtomicUsize,
        callbacks: CallbackRegistry<TransportMessage>,
    }

    impl Transport for Recording {
        fn kind(&self) -> TransportKind {
            TransportKind::LocalBroadcast
        }
        fn send<'a>(&'a self, batch: &'a PatchBatch) -> BoxFuture<'a, Result<Delivery>> {
            self.sent.lock().unwrap().push(batch.clone());
            Box::pin(async { Ok(Delivery::Sent) })
        }
        fn subscribe(&self, callback: MessageCallback) -> SubscriptionId {
            self.callbacks.subscribe(callback)
        }
        fn unsubscribe(&self, id: SubscriptionId) -> bool {
            self.callbacks.unsubscribe(id)
        }
        fn status(&self) -> TransportStatus {
            TransportStatus::Connected
        }
        fn status_watch(&self) -> watch::Receiver<TransportStatus> {
            watch::channel(TransportStatus::Connected).1
        }
        fn destroy(&self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Factory(Arc<Recording>);

    impl TransportFactory for Factory {
        fn create(&self, _kind: TransportKind) -> Result<Arc<dyn Transport>> {
            Ok(self.0.clone())
        }
    }

    fn manager() -> (SyncManager, Arc<Recording>) {
        let recording = Arc::new(Recording::default());
        let manager = SyncManager::new(
            PatchEngine::new(EngineConfig::default()),
            Arc::new(Factory(recording.clone())),
        );
        (manager, recording)
    }

    #[test]
    fn test_mutate_requires_generator() {
        let (manager, _) = manager();
        let key = manager
            .register_entity("game", "1", json!({}), ConflictStrategy::default())
            .unwrap();
        let err = manager
            .mutate(&key, &vec![Patch::set("a", 1)], &MutationContext::default())
            .unwrap_err();
        assert!(matches!(err, PatchSyncError::NotAuthoritative(_)));
    }

    #[tokio::test]
    async fn test_mutate_applies_locally_then_sends() {
        let (manager, recording) = manager();
        let manager = manager.with_generator(Arc::new(PatchGenerator::new()));
        manager.switch_transport(TransportKind::LocalBroadcast).unwrap();
        let key = manager
            .register_entity("game", "1", json!({}), ConflictStrategy::default())
            .unwrap();

        let batch = manager
            .mutate(
                &key,
                &vec![Patch::set("board.cells[0]", "P1")],
                &MutationContext::default(),
            )
            .unwrap();
        assert_eq!(batch.change_number, 1);
        assert_eq!(manager.state(&key).unwrap()["board"]["cells"][0], "P1");

        for _ in 0..10 {
            if !recording.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(recording.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_listener_may_read_manager_state() {
        let (manager, _) = manager();
        let manager = Arc::new(manager);
        let key = manager
            .register_entity("game", "1", json!({}), ConflictStrategy::default())
            .unwrap();

        let seen = Arc::new(Mutex::new(None));
        let (m, s) = (Arc::downgrade(&manager), Arc::clone(&seen));
        manager.on_state_changed(Arc::new(move |event: &StateChanged| {
            if let Some(m) = m.upgrade() {
                *s.lock().unwrap() = m.last_change_number(&event.key);
            }
        }));

        manager
            .ingest_local_patches(PatchBatch::new(
                &key,
                vec![Patch::set("a", 1).with_change_number(3)],
                PatchSource::Local,
            ))
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_inbound_messages_are_applied() {
        let (manager, recording) = manager();
        manager.switch_transport(TransportKind::LocalBroadcast).unwrap();
        let key = manager
            .register_entity("game", "1", json!({}), ConflictStrategy::default())
            .unwrap();

        recording.callbacks.emit(&TransportMessage::Snapshot {
            key: key.clone(),
            state: json!({"turn": 4}),
            change_number: 4,
        });
        recording.callbacks.emit(&TransportMessage::Patches(PatchBatch::new(
            &key,
            vec![Patch::set("turn", 5).with_change_number(5)],
            PatchSource::Server,
        )));
        // untracked entities are ignored
        recording.callbacks.emit(&TransportMessage::Patches(PatchBatch::new(
            &EntityKey::new("game", "other"),
            vec![Patch::set("turn", 1).with_change_number(1)],
            PatchSource::Server,
        )));

        assert_eq!(manager.state(&key).unwrap(), json!({"turn": 5}));
        assert_eq!(manager.last_change_number(&key), Some(5));
    }

    #[test]
    fn test_close_entity_policies() {
        let storage = Arc::new(MemoryStorage::new());
        let engine = PatchEngine::with_storage(EngineConfig::default(), storage.clone());
        let manager = SyncManager::new(engine, Arc::new(Factory(Arc::new(Recording::default()))));

        let kept = manager
            .register_entity("game", "kept", json!({"a": 1}), ConflictStrategy::default())
            .unwrap();
        let gone = manager
            .register_entity("game", "gone", json!({"b": 2}), ConflictStrategy::default())
            .unwrap();
        manager.close_entity(&gone, RetainPolicy::Persist).unwrap();
        assert!(storage.load_snapshot("game:gone").unwrap().is_some());

        manager.close_entity(&kept, RetainPolicy::Discard).unwrap();
        assert!(storage.load_snapshot("game:kept").unwrap().is_none());
        assert!(manager.entity_keys().is_empty());
    }
}
