//! Persistent bidirectional socket transport.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::supervisor::{FrameDecoder, Greeting, LinkShared, supervise};
use super::{
    BoxFuture, Delivery, EnvelopeSource, MessageCallback, ReconnectPolicy, Transport,
    TransportEnvelope, TransportKind, TransportMessage, TransportStatus,
};
use crate::callback::SubscriptionId;
use crate::error::{PatchSyncError, Result};
use crate::patch::{EntityKey, PatchBatch};

/// One established connection, as a pair of text-frame channels.
///
/// The link is considered closed when `incoming` yields `None`.
pub struct SocketLink {
    /// Frames to the remote side; `None` for receive-only links
    pub outgoing: Option<mpsc::UnboundedSender<String>>,
    /// Frames from the remote side
    pub incoming: mpsc::UnboundedReceiver<String>,
}

/// The far end of a [`SocketLink::pair`].
pub struct LinkPeer {
    /// Frames the transport sent
    pub sent: mpsc::UnboundedReceiver<String>,
    /// Deliver a frame to the transport. Dropping it closes the link.
    pub deliver: mpsc::UnboundedSender<String>,
}

impl SocketLink {
    /// An in-memory link and its far end.
    pub fn pair() -> (SocketLink, LinkPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            SocketLink {
                outgoing: Some(out_tx),
                incoming: in_rx,
            },
            LinkPeer {
                sent: out_rx,
                deliver: in_tx,
            },
        )
    }
}

/// Opens connections for the reconnect supervisor.
pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<SocketLink>>;
}

/// Socket transport with exponential-backoff reconnect.
///
/// Sends while disconnected are dropped. Once the reconnect budget is spent the
/// status becomes [`TransportStatus::Failed`] and every later send returns
/// [`PatchSyncError::TransportTerminated`].
pub struct WebSocketTransport {
    shared: Arc<LinkShared>,
    tracked: Arc<Mutex<BTreeSet<EntityKey>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Start connecting in the background. Must be called inside a tokio
    /// runtime.
    pub fn connect(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PatchSyncError::Transport(format!("no tokio runtime: {}", e)))?;

        let shared = Arc::new(LinkShared::new("WebSocketTransport"));
        let tracked: Arc<Mutex<BTreeSet<EntityKey>>> = Arc::new(Mutex::new(BTreeSet::new()));

        let decode: FrameDecoder = Arc::new(|text: &str| -> Result<Option<TransportMessage>> {
            Ok(TransportEnvelope::decode(text)?.into_message())
        });
        let greeting: Greeting = {
            let tracked = Arc::clone(&tracked);
            Arc::new(move || {
                tracked
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .filter_map(|key| TransportEnvelope::subscribe(key).encode().ok())
                    .collect()
            })
        };

        let task = runtime.spawn(supervise(
            connector,
            policy,
            Arc::clone(&shared),
            decode,
            Some(greeting),
        ));

        Ok(Self {
            shared,
            tracked,
            task: Mutex::new(Some(task)),
        })
    }
}

impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn send<'a>(&'a self, batch: &'a PatchBatch) -> BoxFuture<'a, Result<Delivery>> {
        Box::pin(async move {
            if self.shared.is_destroyed() {
                return Err(PatchSyncError::TransportDestroyed);
            }
            if let TransportStatus::Failed { attempts, .. } = self.shared.status.get() {
                return Err(PatchSyncError::TransportTerminated { attempts });
            }

            let Some(tx) = self.shared.outgoing() else {
                log::warn!(
                    "[WebSocketTransport] not connected, dropping batch for {}:{} (change {})",
                    batch.entity_type,
                    batch.entity_id,
                    batch.change_number
                );
                return Ok(Delivery::Dropped);
            };

            let frame = TransportEnvelope::patches(batch, EnvelopeSource::Socket).encode()?;
            if tx.send(frame).is_err() {
                log::warn!("[WebSocketTransport] connection closed while sending, batch dropped");
                return Ok(Delivery::Dropped);
            }
            Ok(Delivery::Sent)
        })
    }

    fn subscribe(&self, callback: MessageCallback) -> SubscriptionId {
        self.shared.callbacks.subscribe(callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.callbacks.unsubscribe(id)
    }

    fn track_entity(&self, key: &EntityKey) -> Result<()> {
        let added = self
            .tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        if added && let Some(tx) = self.shared.outgoing() {
            let _ = tx.send(TransportEnvelope::subscribe(key).encode()?);
        }
        Ok(())
    }

    fn status(&self) -> TransportStatus {
        self.shared.status.get()
    }

    fn status_watch(&self) -> watch::Receiver<TransportStatus> {
        self.shared.status.subscribe()
    }

    fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.shared.set_outgoing(None);
        self.shared.callbacks.clear();
        self.shared.status.set(TransportStatus::Destroyed);
        log::info!("[WebSocketTransport] destroyed");
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(feature = "native-transport")]
pub use native::TungsteniteConnector;

#[cfg(feature = "native-transport")]
mod native {
    use futures_util::{SinkExt, StreamExt};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    use super::{Connector, SocketLink};
    use crate::error::{PatchSyncError, Result};
    use crate::transport::BoxFuture;

    /// Connects with `tokio-tungstenite`.
    #[derive(Debug, Clone)]
    pub struct TungsteniteConnector {
        url: String,
    }

    impl TungsteniteConnector {
        pub fn new(url: &str) -> Result<Self> {
            let parsed = url::Url::parse(url)
                .map_err(|e| PatchSyncError::Transport(format!("invalid url '{}': {}", url, e)))?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                return Err(PatchSyncError::Transport(format!(
                    "expected a ws:// or wss:// url, got '{}'",
                    url
                )));
            }
            Ok(Self {
                url: url.to_string(),
            })
        }

        pub fn url(&self) -> &str {
            &self.url
        }
    }

    impl Connector for TungsteniteConnector {
        fn connect(&self) -> BoxFuture<'_, Result<SocketLink>> {
            Box::pin(async move {
                let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
                    .await
                    .map_err(|e| PatchSyncError::Transport(e.to_string()))?;
                let (mut write, mut read) = ws_stream.split();

                let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
                let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

                tokio::spawn(async move {
                    while let Some(text) = out_rx.recv().await {
                        if write.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    let _ = write.close().await;
                });

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => match msg {
                                Some(Ok(Message::Text(text))) => {
                                    if in_tx.send(text.as_str().to_string()).is_err() {
                                        break;
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Err(e)) => {
                                    log::warn!("[WebSocketTransport] read error: {}", e);
                                    break;
                                }
                                Some(Ok(_)) => {}
                            },
                            _ = in_tx.closed() => break,
                        }
                    }
                });

                Ok(SocketLink {
                    outgoing: Some(out_tx),
                    incoming: in_rx,
                })
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_rejects_non_websocket_urls() {
            assert!(TungsteniteConnector::new("ws://localhost:3030/ws").is_ok());
            assert!(TungsteniteConnector::new("http://localhost:3030").is_err());
            assert!(TungsteniteConnector::new("not a url").is_err());
        }
    }
}
