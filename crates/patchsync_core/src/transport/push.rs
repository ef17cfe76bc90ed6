//! Server-push inbound stream plus HTTP write path.
//!
//! Inbound patches arrive as Server-Sent Events on
//! `GET {base}/entities/{type}/{id}/events`; each event's data is a
//! [`PushEvent`]. The stream is receive-only, so outbound batches go through
//! `POST {base}/entities/{type}/{id}/patches` with a [`PatchesBody`].

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::supervisor::{FrameDecoder, LinkShared, supervise};
use super::{
    BoxFuture, Connector, Delivery, MessageCallback, PatchesBody, PushEvent, ReconnectPolicy,
    SocketLink, Transport, TransportKind, TransportMessage, TransportStatus,
};
use crate::callback::SubscriptionId;
use crate::error::{PatchSyncError, Result};
use crate::patch::{EntityKey, PatchBatch};

/// One dispatched Server-Sent Event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental `text/event-stream` parser.
///
/// Feed it arbitrary byte chunks; it returns every event completed by a blank
/// line. Multiple `data:` lines are joined with `\n`; comment lines (`:`) are
/// ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    pending: SseEvent,
    has_data: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let mut line: String = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            self.process_line(&line, &mut events);
        }
        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            if self.has_data {
                events.push(std::mem::take(&mut self.pending));
            } else {
                self.pending = SseEvent::default();
            }
            self.has_data = false;
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => {
                if self.has_data {
                    self.pending.data.push('\n');
                }
                self.pending.data.push_str(value);
                self.has_data = true;
            }
            "event" => self.pending.event = Some(value.to_string()),
            "id" => self.pending.id = Some(value.to_string()),
            _ => {}
        }
    }
}

fn entity_url(base: &str, key: &EntityKey, tail: &str) -> String {
    format!(
        "{}/entities/{}/{}/{}",
        base.trim_end_matches('/'),
        key.entity_type,
        key.entity_id,
        tail
    )
}

/// Opens the event stream for one entity.
struct SseConnector {
    client: reqwest::Client,
    url: String,
}

impl Connector for SseConnector {
    fn connect(&self) -> BoxFuture<'_, Result<SocketLink>> {
        Box::pin(async move {
            let response = self
                .client
                .get(&self.url)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .send()
                .await
                .map_err(|e| PatchSyncError::Transport(e.to_string()))?;
            if !response.status().is_success() {
                return Err(PatchSyncError::Transport(format!(
                    "GET {} returned {}",
                    self.url,
                    response.status()
                )));
            }

            let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
            let mut stream = Box::pin(response.bytes_stream());
            tokio::spawn(async move {
                let mut decoder = SseDecoder::new();
                loop {
                    tokio::select! {
                        chunk = stream.next() => match chunk {
                            Some(Ok(bytes)) => {
                                for event in decoder.feed(&bytes) {
                                    if in_tx.send(event.data).is_err() {
                                        return;
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                log::warn!("[ServerPushTransport] stream error: {}", e);
                                return;
                            }
                            None => return,
                        },
                        _ = in_tx.closed() => return,
                    }
                }
            });

            Ok(SocketLink {
                outgoing: None,
                incoming: in_rx,
            })
        })
    }
}

/// SSE inbound, `POST` outbound.
///
/// Each tracked entity gets its own stream and reconnect supervisor; they share
/// one status, which reflects the most recent change of any stream.
pub struct ServerPushTransport {
    base_url: String,
    client: reqwest::Client,
    policy: ReconnectPolicy,
    shared: Arc<LinkShared>,
    streams: Mutex<HashMap<EntityKey, JoinHandle<()>>>,
}

impl ServerPushTransport {
    /// No stream is opened until an entity is tracked.
    pub fn new(base_url: &str, policy: ReconnectPolicy) -> Result<Self> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| PatchSyncError::Transport(format!("invalid url '{}': {}", base_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(PatchSyncError::Transport(format!(
                "expected an http:// or https:// url, got '{}'",
                base_url
            )));
        }

        let shared = Arc::new(LinkShared::new("ServerPushTransport"));
        shared.status.set(TransportStatus::Disconnected);

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            policy,
            shared,
            streams: Mutex::new(HashMap::new()),
        })
    }

    pub fn events_url(&self, key: &EntityKey) -> String {
        entity_url(&self.base_url, key, "events")
    }

    pub fn patches_url(&self, key: &EntityKey) -> String {
        entity_url(&self.base_url, key, "patches")
    }
}

impl Transport for ServerPushTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ServerPush
    }

    fn send<'a>(&'a self, batch: &'a PatchBatch) -> BoxFuture<'a, Result<Delivery>> {
        Box::pin(async move {
            if self.shared.is_destroyed() {
                return Err(PatchSyncError::TransportDestroyed);
            }
            if let TransportStatus::Failed { attempts, .. } = self.shared.status.get() {
                return Err(PatchSyncError::TransportTerminated { attempts });
            }

            let url = self.patches_url(&batch.entity_key());
            let body = PatchesBody {
                patches: batch.patches.clone(),
            };
            let response = match self.client.post(&url).json(&body).send().await {
                Ok(response) => response,
                Err(e) => {
                    log::warn!("[ServerPushTransport] POST {} failed, batch dropped: {}", url, e);
                    return Ok(Delivery::Dropped);
                }
            };
            if !response.status().is_success() {
                return Err(PatchSyncError::Transport(format!(
                    "POST {} returned {}",
                    url,
                    response.status()
                )));
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
        if self.shared.is_destroyed() {
            return Err(PatchSyncError::TransportDestroyed);
        }
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        if streams.contains_key(key) {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PatchSyncError::Transport(format!("no tokio runtime: {}", e)))?;
        let connector = Arc::new(SseConnector {
            client: self.client.clone(),
            url: self.events_url(key),
        });
        let stream_key = key.clone();
        let decode: FrameDecoder = Arc::new(move |text: &str| -> Result<Option<TransportMessage>> {
            Ok(Some(PushEvent::decode(text)?.into_message(&stream_key)))
        });

        log::info!("[ServerPushTransport] streaming {}", key);
        self.shared.status.set(TransportStatus::Connecting);
        let task = runtime.spawn(supervise(
            connector,
            self.policy,
            Arc::clone(&self.shared),
            decode,
            None,
        ));
        streams.insert(key.clone(), task);
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
        for (_, task) in self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            task.abort();
        }
        self.shared.callbacks.clear();
        self.shared.status.set(TransportStatus::Destroyed);
        log::info!("[ServerPushTransport] destroyed");
    }
}

impl Drop for ServerPushTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_decoder_splits_events() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[1].data, "{\"b\":2}");
    }

    #[test]
    fn test_sse_decoder_handles_partial_chunks_and_crlf() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"event: patches\r\nda").is_empty());
        assert!(decoder.feed(b"ta: line one\r\ndata: line two\r\n").is_empty());
        let events = decoder.feed(b"\r\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("patches".into()),
                data: "line one\nline two".into(),
                id: None,
            }]
        );
    }

    #[test]
    fn test_sse_decoder_ignores_comments_and_empty_events() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b": keep-alive\n\nevent: ping\n\nid: 7\ndata:x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert_eq!(events[0].event, None);
    }

    #[test]
    fn test_urls() {
        let transport =
            ServerPushTransport::new("http://localhost:3030/", ReconnectPolicy::default()).unwrap();
        let key = EntityKey::new("board", "g1");
        assert_eq!(
            transport.events_url(&key),
            "http://localhost:3030/entities/board/g1/events"
        );
        assert_eq!(
            transport.patches_url(&key),
            "http://localhost:3030/entities/board/g1/patches"
        );
        assert!(ServerPushTransport::new("ws://x", ReconnectPolicy::default()).is_err());
    }

    #[tokio::test]
    async fn test_send_after_destroy() {
        let transport =
            ServerPushTransport::new("http://localhost:9", ReconnectPolicy::default()).unwrap();
        transport.destroy();
        transport.destroy();
        let batch = PatchBatch::new(
            &EntityKey::new("board", "g1"),
            Vec::new(),
            crate::patch::PatchSource::Local,
        );
        assert!(matches!(
            transport.send(&batch).await,
            Err(PatchSyncError::TransportDestroyed)
        ));
        assert_eq!(transport.status(), TransportStatus::Destroyed);
    }
}
