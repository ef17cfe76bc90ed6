//! Callback registry for state-change and transport subscriptions.
//!
//! A thread-safe registry of `Fn(&E)` callbacks keyed by [`SubscriptionId`].
//! The engine uses it for [`StateChanged`](crate::engine::StateChanged)
//! notifications and every transport uses it for inbound messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// A unique identifier for a subscription.
pub type SubscriptionId = u64;

/// Callback function type.
///
/// Callbacks run synchronously on the emitting thread and should not block.
pub type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Thread-safe registry for managing event subscriptions.
///
/// ```ignore
/// use patchsync_core::callback::CallbackRegistry;
/// use std::sync::Arc;
///
/// let registry: CallbackRegistry<String> = CallbackRegistry::new();
/// let id = registry.subscribe(Arc::new(|event| println!("{event}")));
/// registry.emit(&"hello".to_string());
/// registry.unsubscribe(id);
/// ```
pub struct CallbackRegistry<E> {
    callbacks: RwLock<HashMap<SubscriptionId, Callback<E>>>,
    next_id: AtomicU64,
}

impl<E> CallbackRegistry<E> {
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback. Returns an ID for [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, callback: Callback<E>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, callback);
        id
    }

    /// Returns `true` if the subscription was found and removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Invoke every registered callback with `event`.
    ///
    /// Callbacks are invoked in subscription order, outside the lock, so a
    /// callback may subscribe or unsubscribe. A panicking callback does not stop
    /// the others.
    pub fn emit(&self, event: &E) {
        let mut snapshot: Vec<(SubscriptionId, Callback<E>)> = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, cb)| (*id, Arc::clone(cb)))
            .collect();
        snapshot.sort_by_key(|(id, _)| *id);

        for (id, callback) in snapshot {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(event);
            }));
            if result.is_err() {
                log::warn!("[CallbackRegistry] subscriber {} panicked", id);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }

    pub fn clear(&self) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl<E> Default for CallbackRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for CallbackRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("subscriber_count", &self.subscriber_count())
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .finish()
    }
}
