//! Connect/reconnect loop shared by the networked transports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use super::{Connector, ReconnectPolicy, StatusCell, TransportMessage, TransportStatus};
use crate::callback::CallbackRegistry;
use crate::error::Result;

/// Turns one inbound text frame into a message; `Ok(None)` for control frames.
pub(crate) type FrameDecoder = Arc<dyn Fn(&str) -> Result<Option<TransportMessage>> + Send + Sync>;

/// Frames to send right after every (re)connect.
pub(crate) type Greeting = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// State shared between a transport handle and its supervisor task.
pub(crate) struct LinkShared {
    pub(crate) tag: &'static str,
    pub(crate) callbacks: CallbackRegistry<TransportMessage>,
    pub(crate) status: StatusCell,
    pub(crate) destroyed: AtomicBool,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl LinkShared {
    pub(crate) fn new(tag: &'static str) -> Self {
        Self {
            tag,
            callbacks: CallbackRegistry::new(),
            status: StatusCell::new(TransportStatus::Connecting),
            destroyed: AtomicBool::new(false),
            outgoing: Mutex::new(None),
        }
    }

    /// Writer for the current connection, if any.
    pub(crate) fn outgoing(&self) -> Option<mpsc::UnboundedSender<String>> {
        self.outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_outgoing(&self, tx: Option<mpsc::UnboundedSender<String>>) {
        *self.outgoing.lock().unwrap_or_else(PoisonError::into_inner) = tx;
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// Keep a link up until destroyed or out of reconnect attempts.
///
/// Reconnect attempt `n` waits [`ReconnectPolicy::delay_for`]`(n)`; a
/// successful connection resets the count.
pub(crate) async fn supervise(
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    shared: Arc<LinkShared>,
    decode: FrameDecoder,
    greeting: Option<Greeting>,
) {
    let tag = shared.tag;
    let mut attempt: u32 = 0;

    loop {
        if shared.is_destroyed() {
            return;
        }

        match connector.connect().await {
            Ok(mut link) => {
                attempt = 0;
                shared.set_outgoing(link.outgoing.clone());
                shared.status.set(TransportStatus::Connected);
                log::info!("[{}] connected", tag);

                if let (Some(greeting), Some(tx)) = (&greeting, &link.outgoing) {
                    for frame in greeting() {
                        let _ = tx.send(frame);
                    }
                }

                while let Some(frame) = link.incoming.recv().await {
                    match decode(&frame) {
                        Ok(Some(message)) => shared.callbacks.emit(&message),
                        Ok(None) => {}
                        Err(e) => log::warn!("[{}] discarding inbound frame: {}", tag, e),
                    }
                }

                shared.set_outgoing(None);
                shared.status.set(TransportStatus::Disconnected);
                log::warn!("[{}] connection lost", tag);
            }
            Err(e) => {
                log::warn!("[{}] connect failed: {}", tag, e);
            }
        }

        if shared.is_destroyed() {
            return;
        }

        attempt += 1;
        if attempt > policy.max_attempts {
            log::error!(
                "[{}] giving up after {} reconnect attempts",
                tag,
                policy.max_attempts
            );
            shared.status.set(TransportStatus::Failed {
                attempts: policy.max_attempts,
                message: "Max reconnect attempts reached".to_string(),
            });
            return;
        }

        let delay = policy.delay_for(attempt);
        log::info!(
            "[{}] reconnecting in {}ms (attempt {})",
            tag,
            delay.as_millis(),
            attempt
        );
        shared.status.set(TransportStatus::Reconnecting {
            attempt,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        });
        tokio::time::sleep(delay).await;
    }
}
