//! Local Backend
//!
//! Adapter over the shared in-process [`LocalBroker`]. Connecting opens the
//! broker and starts a forwarding task that hands every message matching one
//! of this backend's patterns to the inbound callback.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashSet;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BackendAdapter, BackendError, BackendKind, InboundHandler, LinkEvent, LinkEventSender};
use crate::config::BrokerConfig;
use crate::local::{LocalBroker, LocalBrokerError};
use crate::message::Message;
use crate::topic;

impl From<LocalBrokerError> for BackendError {
    fn from(e: LocalBrokerError) -> Self {
        match e {
            LocalBrokerError::NotOpen => BackendError::NotConnected,
            LocalBrokerError::ShutDown => BackendError::Unavailable(e.to_string()),
        }
    }
}

struct Shared {
    epoch: AtomicU64,
    connected: AtomicBool,
    patterns: RwLock<AHashSet<String>>,
    inbound: RwLock<Option<InboundHandler>>,
    link_tx: RwLock<Option<LinkEventSender>>,
}

impl Shared {
    fn deliver(&self, message: Message) {
        let wanted = self
            .patterns
            .read()
            .iter()
            .any(|pattern| topic::matches(&message.topic, pattern));
        if !wanted {
            return;
        }

        let handler = self.inbound.read().clone();
        if let Some(handler) = handler {
            handler(message);
        }
    }
}

/// Backend over the in-process broker
pub struct LocalBackend {
    broker: Arc<LocalBroker>,
    shared: Arc<Shared>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl LocalBackend {
    pub fn new(broker: Arc<LocalBroker>) -> Self {
        Self {
            broker,
            shared: Arc::new(Shared {
                epoch: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                patterns: RwLock::new(AHashSet::new()),
                inbound: RwLock::new(None),
                link_tx: RwLock::new(None),
            }),
            forwarder: Mutex::new(None),
        }
    }

    fn stop_forwarder(&self) {
        if let Some(handle) = self.forwarder.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl BackendAdapter for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn set_inbound(&self, handler: InboundHandler) {
        *self.shared.inbound.write() = Some(handler);
    }

    fn set_link_events(&self, tx: LinkEventSender) {
        *self.shared.link_tx.write() = Some(tx);
    }

    async fn connect(&self, _config: &BrokerConfig) -> Result<(), BackendError> {
        self.stop_forwarder();
        self.broker.open()?;
        let mut rx = self.broker.subscribe()?;

        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.connected.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => shared.deliver(message),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Local backend: lagged, {} messages dropped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            if shared.epoch.load(Ordering::SeqCst) == epoch
                && shared.connected.swap(false, Ordering::SeqCst)
            {
                warn!("Local backend: broker closed");
                if let Some(tx) = shared.link_tx.read().as_ref() {
                    let _ = tx.send(LinkEvent::Lost {
                        kind: BackendKind::Local,
                        epoch,
                        reason: "local broker shut down".to_string(),
                    });
                }
            }
        });
        *self.forwarder.lock() = Some(handle);

        info!("Local backend: connected");
        Ok(())
    }

    async fn publish(&self, message: Message) -> Result<(), BackendError> {
        if !self.is_connected() {
            return Err(BackendError::NotConnected);
        }
        self.broker.publish(message)?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), BackendError> {
        if !self.is_connected() {
            return Err(BackendError::NotConnected);
        }
        self.shared.patterns.write().insert(pattern.to_string());
        debug!("Local backend: subscribed to '{}'", pattern);
        Ok(())
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), BackendError> {
        if !self.is_connected() {
            return Err(BackendError::NotConnected);
        }
        self.shared.patterns.write().remove(pattern);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BackendError> {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        let was_connected = self.shared.connected.swap(false, Ordering::SeqCst);
        self.stop_forwarder();
        self.shared.patterns.write().clear();
        if was_connected {
            info!("Local backend: disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        self.stop_forwarder();
    }
}
