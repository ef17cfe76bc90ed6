//! Pluggable transports for patch batches.
//!
//! A [`Transport`] moves [`PatchBatch`]es between processes. Three
//! implementations ship with the crate:
//!
//! | Kind | Type | Inbound | Outbound |
//! |---|---|---|---|
//! | [`TransportKind::LocalBroadcast`] | [`LocalBroadcastTransport`] | named in-process channel | same channel |
//! | [`TransportKind::WebSocket`] | [`WebSocketTransport`] | socket | socket |
//! | [`TransportKind::ServerPush`] | [`ServerPushTransport`] | SSE stream | HTTP `POST` |
//!
//! Delivery is at-most-once: a send while disconnected is dropped with a
//! warning and reported as [`Delivery::Dropped`]. Networked transports reconnect
//! with exponential backoff up to [`ReconnectPolicy::max_attempts`], then settle
//! in the terminal [`TransportStatus::Failed`] state.

mod envelope;
mod local;
#[cfg(feature = "native-transport")]
mod push;
mod socket;
mod supervisor;

pub use envelope::{EnvelopeSource, PatchesBody, PushEvent, TransportEnvelope};
pub use local::{BroadcastHub, LocalBroadcastTransport};
#[cfg(feature = "native-transport")]
pub use push::{ServerPushTransport, SseDecoder, SseEvent};
#[cfg(feature = "native-transport")]
pub use socket::TungsteniteConnector;
pub use socket::{Connector, LinkPeer, SocketLink, WebSocketTransport};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::callback::{Callback, SubscriptionId};
use crate::error::{PatchSyncError, Result};
use crate::patch::{EntityKey, PatchBatch};

/// Boxed future type for object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback for inbound transport messages.
pub type MessageCallback = Callback<TransportMessage>;

/// Which transport implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    LocalBroadcast,
    WebSocket,
    ServerPush,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::LocalBroadcast => "local_broadcast",
            TransportKind::WebSocket => "web_socket",
            TransportKind::ServerPush => "server_push",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "local_broadcast" | "local" | "broadcast" => Ok(TransportKind::LocalBroadcast),
            "web_socket" | "websocket" | "socket" | "ws" => Ok(TransportKind::WebSocket),
            "server_push" | "push" | "sse" => Ok(TransportKind::ServerPush),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

/// Connection state, observable through [`Transport::status_watch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// Reconnect budget exhausted. Terminal.
    Failed { attempts: u32, message: String },
    /// `destroy()` was called. Terminal.
    Destroyed,
}

impl TransportStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, TransportStatus::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransportStatus::Failed { .. } | TransportStatus::Destroyed
        )
    }
}

/// Something delivered by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    Patches(PatchBatch),
    /// Full-state seed from the authority
    Snapshot {
        key: EntityKey,
        state: Value,
        change_number: u64,
    },
}

impl TransportMessage {
    pub fn entity_key(&self) -> EntityKey {
        match self {
            TransportMessage::Patches(batch) => batch.entity_key(),
            TransportMessage::Snapshot { key, .. } => key.clone(),
        }
    }
}

/// Outcome of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the underlying channel
    Sent,
    /// Not connected; discarded
    Dropped,
}

/// Contract every transport implements.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Send a batch to remote observers.
    fn send<'a>(&'a self, batch: &'a PatchBatch) -> BoxFuture<'a, Result<Delivery>>;

    /// Register a callback for inbound messages.
    fn subscribe(&self, callback: MessageCallback) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Start receiving messages for `key`, if the transport is entity-scoped.
    fn track_entity(&self, _key: &EntityKey) -> Result<()> {
        Ok(())
    }

    fn status(&self) -> TransportStatus;

    fn status_watch(&self) -> watch::Receiver<TransportStatus>;

    /// Release every resource. Idempotent; never panics.
    fn destroy(&self);
}

/// Reconnect backoff: attempt `n` waits `initial_delay * 2^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        Duration::from_millis(self.initial_delay_ms.saturating_mul(1u64 << exponent))
    }
}

/// Where networked transports connect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Local broadcast channel name
    pub channel: String,
    /// e.g. `ws://localhost:3030/ws`
    pub websocket_url: Option<String>,
    /// HTTP base for push + write, e.g. `http://localhost:3030`
    pub server_url: Option<String>,
    pub reconnect: ReconnectPolicy,
}

/// Builds transports by kind.
pub trait TransportFactory: Send + Sync {
    fn create(&self, kind: TransportKind) -> Result<Arc<dyn Transport>>;
}

/// Factory for the built-in transports.
#[derive(Debug, Clone)]
pub struct DefaultTransportFactory {
    hub: BroadcastHub,
    settings: TransportSettings,
}

impl DefaultTransportFactory {
    pub fn new(hub: BroadcastHub, settings: TransportSettings) -> Self {
        Self { hub, settings }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, kind: TransportKind) -> Result<Arc<dyn Transport>> {
        match kind {
            TransportKind::LocalBroadcast => Ok(Arc::new(LocalBroadcastTransport::new(
                &self.hub,
                &self.settings.channel,
            )?)),
            #[cfg(feature = "native-transport")]
            TransportKind::WebSocket => {
                let url = self.settings.websocket_url.as_deref().ok_or_else(|| {
                    PatchSyncError::Transport("no websocket url configured".to_string())
                })?;
                let connector = Arc::new(TungsteniteConnector::new(url)?);
                Ok(Arc::new(WebSocketTransport::connect(
                    connector,
                    self.settings.reconnect,
                )?))
            }
            #[cfg(feature = "native-transport")]
            TransportKind::ServerPush => {
                let base = self.settings.server_url.as_deref().ok_or_else(|| {
                    PatchSyncError::Transport("no server url configured".to_string())
                })?;
                Ok(Arc::new(ServerPushTransport::new(
                    base,
                    self.settings.reconnect,
                )?))
            }
            #[cfg(not(feature = "native-transport"))]
            other => Err(PatchSyncError::Transport(format!(
                "{} transport requires the native-transport feature",
                other
            ))),
        }
    }
}

/// Status holder backed by a watch channel. Once destroyed it stays destroyed.
#[derive(Debug)]
pub(crate) struct StatusCell {
    tx: watch::Sender<TransportStatus>,
}

impl StatusCell {
    pub(crate) fn new(initial: TransportStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub(crate) fn get(&self) -> TransportStatus {
        self.tx.borrow().clone()
    }

    pub(crate) fn set(&self, status: TransportStatus) {
        self.tx.send_if_modified(|current| {
            if *current == TransportStatus::Destroyed || *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<TransportStatus> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32]);
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = ReconnectPolicy {
            initial_delay_ms: u64::MAX / 2,
            max_attempts: 100,
        };
        assert_eq!(policy.delay_for(80), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TransportStatus::Reconnecting {
            attempt: 2,
            delay_ms: 4000,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"reconnecting","attempt":2,"delay_ms":4000}"#);
        assert!(TransportStatus::Destroyed.is_terminal());
        assert!(!TransportStatus::Disconnected.is_terminal());
    }

    #[test]
    fn test_status_cell_stays_destroyed() {
        let cell = StatusCell::new(TransportStatus::Connected);
        let rx = cell.subscribe();
        cell.set(TransportStatus::Destroyed);
        cell.set(TransportStatus::Connected);
        assert_eq!(cell.get(), TransportStatus::Destroyed);
        assert_eq!(*rx.borrow(), TransportStatus::Destroyed);
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("ws".parse::<TransportKind>().unwrap(), TransportKind::WebSocket);
        assert_eq!("sse".parse::<TransportKind>().unwrap(), TransportKind::ServerPush);
        assert_eq!(
            "local".parse::<TransportKind>().unwrap(),
            TransportKind::LocalBroadcast
        );
        assert!("pigeon".parse::<TransportKind>().is_err());
    }
}
