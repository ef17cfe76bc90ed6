//! Same-host fan-out over named in-process channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::{
    BoxFuture, Delivery, EnvelopeSource, MessageCallback, StatusCell, Transport, TransportEnvelope,
    TransportKind, TransportMessage, TransportStatus,
};
use crate::callback::{CallbackRegistry, SubscriptionId};
use crate::error::{PatchSyncError, Result};
use crate::patch::PatchBatch;

const DEFAULT_CAPACITY: usize = 256;

/// One message on a hub channel.
#[derive(Debug, Clone)]
struct HubFrame {
    sender: u64,
    payload: Arc<str>,
}

/// Registry of named broadcast channels shared by every
/// [`LocalBroadcastTransport`] built from it.
///
/// Cloning the hub shares the channels. There is no process-wide hub; callers
/// pass the handle to whoever should be able to talk to each other.
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<HubFrame>>>>,
    next_instance: Arc<AtomicU64>,
    capacity: usize,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` is the per-channel backlog a slow instance may fall behind by
    /// before it starts losing messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_instance: Arc::new(AtomicU64::new(1)),
            capacity: capacity.max(1),
        }
    }

    fn channel(&self, name: &str) -> broadcast::Sender<HubFrame> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    fn next_instance_id(&self) -> u64 {
        self.next_instance.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish a raw payload on a channel as an anonymous sender.
    ///
    /// Every instance on the channel receives it. Returns the number of
    /// receivers.
    pub fn publish_raw(&self, channel: &str, payload: &str) -> usize {
        self.channel(channel)
            .send(HubFrame {
                sender: 0,
                payload: Arc::from(payload),
            })
            .unwrap_or(0)
    }

    /// Number of live instances listening on a channel.
    pub fn listener_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport over one [`BroadcastHub`] channel.
///
/// FIFO per channel. An instance never receives its own messages.
pub struct LocalBroadcastTransport {
    id: u64,
    channel: String,
    tx: broadcast::Sender<HubFrame>,
    callbacks: Arc<CallbackRegistry<TransportMessage>>,
    status: StatusCell,
    destroyed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl LocalBroadcastTransport {
    /// Join `channel` on `hub`. Must be called inside a tokio runtime.
    pub fn new(hub: &BroadcastHub, channel: &str) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PatchSyncError::Transport(format!("no tokio runtime: {}", e)))?;

        let id = hub.next_instance_id();
        let tx = hub.channel(channel);
        let rx = tx.subscribe();
        let callbacks = Arc::new(CallbackRegistry::new());

        let pump = runtime.spawn(pump(id, channel.to_string(), rx, Arc::clone(&callbacks)));
        log::debug!("[LocalBroadcast] instance {} joined '{}'", id, channel);

        Ok(Self {
            id,
            channel: channel.to_string(),
            tx,
            callbacks,
            status: StatusCell::new(TransportStatus::Connected),
            destroyed: AtomicBool::new(false),
            pump: Mutex::new(Some(pump)),
        })
    }

    pub fn instance_id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

async fn pump(
    id: u64,
    channel: String,
    mut rx: broadcast::Receiver<HubFrame>,
    callbacks: Arc<CallbackRegistry<TransportMessage>>,
) {
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if frame.sender == id {
                    continue;
                }
                match TransportEnvelope::decode(&frame.payload) {
                    Ok(envelope) => {
                        if let Some(message) = envelope.into_message() {
                            callbacks.emit(&message);
                        }
                    }
                    Err(e) => {
                        log::warn!("[LocalBroadcast] discarding frame on '{}': {}", channel, e);
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!(
                    "[LocalBroadcast] instance {} lagged on '{}', missed {} frames",
                    id,
                    channel,
                    missed
                );
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

impl Transport for LocalBroadcastTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LocalBroadcast
    }

    fn send<'a>(&'a self, batch: &'a PatchBatch) -> BoxFuture<'a, Result<Delivery>> {
        Box::pin(async move {
            if self.destroyed.load(Ordering::SeqCst) {
                return Err(PatchSyncError::TransportDestroyed);
            }
            let payload = TransportEnvelope::patches(batch, EnvelopeSource::Broadcast).encode()?;
            // our own receiver keeps the channel open, so this only fails once
            // every receiver is gone
            let _ = self.tx.send(HubFrame {
                sender: self.id,
                payload: Arc::from(payload),
            });
            Ok(Delivery::Sent)
        })
    }

    fn subscribe(&self, callback: MessageCallback) -> SubscriptionId {
        self.callbacks.subscribe(callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.callbacks.unsubscribe(id)
    }

    fn status(&self) -> TransportStatus {
        self.status.get()
    }

    fn status_watch(&self) -> watch::Receiver<TransportStatus> {
        self.status.subscribe()
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
        self.callbacks.clear();
        self.status.set(TransportStatus::Destroyed);
        log::debug!("[LocalBroadcast] instance {} left '{}'", self.id, self.channel);
    }
}

impl Drop for LocalBroadcastTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{EntityKey, Patch, PatchSource};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn batch(cn: u64) -> PatchBatch {
        PatchBatch::new(
            &EntityKey::new("game", "1"),
            vec![Patch::set("turn", cn).with_change_number(cn)],
            PatchSource::Local,
        )
    }

    fn collect(transport: &LocalBroadcastTransport) -> mpsc::UnboundedReceiver<TransportMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.subscribe(Arc::new(move |m: &TransportMessage| {
            let _ = tx.send(m.clone());
        }));
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<TransportMessage>) -> TransportMessage {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
            .expect("closed")
    }

    #[tokio::test]
    async fn test_fan_out_skips_sender() {
        let hub = BroadcastHub::new();
        let a = LocalBroadcastTransport::new(&hub, "game").unwrap();
        let b = LocalBroadcastTransport::new(&hub, "game").unwrap();
        let mut a_rx = collect(&a);
        let mut b_rx = collect(&b);

        assert_eq!(a.send(&batch(1)).await.unwrap(), Delivery::Sent);

        match next(&mut b_rx).await {
            TransportMessage::Patches(received) => {
                assert_eq!(received.change_number, 1);
                assert_eq!(received.source, PatchSource::Remote);
            }
            other => panic!("unexpected {:?}", other),
        }
        tokio::task::yield_now().await;
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fifo_per_channel() {
        let hub = BroadcastHub::new();
        let a = LocalBroadcastTransport::new(&hub, "game").unwrap();
        let b = LocalBroadcastTransport::new(&hub, "game").unwrap();
        let mut rx = collect(&b);

        for cn in 1..=5 {
            a.send(&batch(cn)).await.unwrap();
        }
        for cn in 1..=5 {
            match next(&mut rx).await {
                TransportMessage::Patches(received) => assert_eq!(received.change_number, cn),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let hub = BroadcastHub::new();
        let a = LocalBroadcastTransport::new(&hub, "one").unwrap();
        let b = LocalBroadcastTransport::new(&hub, "two").unwrap();
        let mut rx = collect(&b);

        a.send(&batch(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_discarded() {
        let hub = BroadcastHub::new();
        let a = LocalBroadcastTransport::new(&hub, "game").unwrap();
        let b = LocalBroadcastTransport::new(&hub, "game").unwrap();
        let mut rx = collect(&b);

        hub.publish_raw("game", "{garbage");
        a.send(&batch(2)).await.unwrap();

        match next(&mut rx).await {
            TransportMessage::Patches(received) => assert_eq!(received.change_number, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let hub = BroadcastHub::new();
        let a = LocalBroadcastTransport::new(&hub, "game").unwrap();
        let status = a.status_watch();

        a.destroy();
        a.destroy();

        assert_eq!(*status.borrow(), TransportStatus::Destroyed);
        assert!(matches!(
            a.send(&batch(1)).await,
            Err(PatchSyncError::TransportDestroyed)
        ));
    }

    #[test]
    fn test_requires_runtime() {
        let hub = BroadcastHub::new();
        assert!(LocalBroadcastTransport::new(&hub, "game").is_err());
    }
}
