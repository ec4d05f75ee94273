//! Broker Client
//!
//! One publish/subscribe interface over two backends. `connect()` tries the
//! remote broker within the failure budget and falls back to the in-process
//! broker. The subscription table belongs to the client, so it survives
//! backend switches and is replayed onto whichever backend becomes active.
//!
//! Locking:
//! - `connect_lock` makes connection attempts single-flight
//! - `active` is read-locked by publish/subscribe/unsubscribe and
//!   write-locked by backend switches
//! - the subscription table is replaced wholesale on every change, so
//!   dispatch iterates an immutable snapshot

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::backend::{
    BackendAdapter, BackendError, BackendKind, InboundHandler, LinkEvent, LocalBackend,
    RemoteBackend,
};
use crate::config::{BrokerConfig, Config};
use crate::failover::{FailoverConfig, FailureInfo, FailureTracker};
use crate::local::LocalBroker;
use crate::message::{Message, MessageCodec, Payload, PublishOptions};
use crate::topic;

mod error;

pub use error::ClientError;


/// Subscription callback: `(topic, decoded payload, raw message)`
///
/// Handlers run synchronously on the delivering backend's task; anything
/// that needs I/O should spawn its own task.
pub type MessageHandler = Arc<dyn Fn(&str, &Payload, &Message) + Send + Sync>;

type SubscriptionTable = AHashMap<String, MessageHandler>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Read-only snapshot for status polling
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub state: ConnectionState,
    pub connected: bool,
    pub backend_kind: BackendKind,
    /// Subscribed patterns, sorted
    pub subscriptions: Vec<String>,
    pub failure_info: FailureInfo,
}

struct ClientInner {
    broker_config: BrokerConfig,
    prefer_local: bool,
    remote: Arc<dyn BackendAdapter>,
    local: Arc<dyn BackendAdapter>,
    tracker: Mutex<FailureTracker>,
    state: RwLock<ConnectionState>,
    backend_kind: RwLock<BackendKind>,
    active: tokio::sync::RwLock<Option<Arc<dyn BackendAdapter>>>,
    subscriptions: RwLock<Arc<SubscriptionTable>>,
    connect_lock: tokio::sync::Mutex<()>,
    connecting: AtomicBool,
    /// Count of completed attempts and the last outcome, for callers that
    /// waited on one
    last_outcome: Mutex<(u64, Result<BackendKind, ClientError>)>,
    /// Bumped by `disconnect()`; attempts and reconnect loops started under
    /// an older generation give up
    generation: AtomicU64,
    link_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
}

impl ClientInner {
    fn dispatch(&self, message: Message) {
        let payload = MessageCodec::decode(&message.payload, message.content_type.as_deref());
        let table = self.subscriptions.read().clone();

        for (pattern, handler) in table.iter() {
            if !topic::matches(&message.topic, pattern) {
                continue;
            }

            let result = catch_unwind(AssertUnwindSafe(|| {
                handler(&message.topic, &payload, &message)
            }));
            if let Err(panic) = result {
                error!(
                    "Broker client: handler for '{}' panicked on '{}': {}",
                    pattern,
                    message.topic,
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    fn replace_subscriptions(&self, update: impl FnOnce(&mut SubscriptionTable)) {
        let mut table = self.subscriptions.write();
        let mut next = (**table).clone();
        update(&mut next);
        *table = Arc::new(next);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Clears the connecting flag on every exit path, including a dropped
/// `connect()` future
///
/// An attempt that ends while still `Connecting` never reached a backend,
/// so the state goes back to `Disconnected`.
struct ConnectingGuard<'a> {
    inner: &'a ClientInner,
}

impl<'a> ConnectingGuard<'a> {
    fn new(inner: &'a ClientInner) -> Self {
        inner.connecting.store(true, Ordering::SeqCst);
        Self { inner }
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.inner.connecting.store(false, Ordering::SeqCst);
        let mut state = self.inner.state.write();
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Disconnected;
        }
    }
}

/// Resilient pub/sub client
///
/// Cheap to clone; clones share the same connection and subscriptions.
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<ClientInner>,
}

impl BrokerClient {
    /// Client with a remote MQTT backend and a backend on `local_broker`
    pub fn new(config: &Config, local_broker: Arc<LocalBroker>) -> Self {
        Self::with_backends(
            config.broker.clone(),
            &config.failover,
            Arc::new(RemoteBackend::new()),
            Arc::new(LocalBackend::new(local_broker)),
        )
    }

    /// Client over caller-supplied backends
    pub fn with_backends(
        broker_config: BrokerConfig,
        failover: &FailoverConfig,
        remote: Arc<dyn BackendAdapter>,
        local: Arc<dyn BackendAdapter>,
    ) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();

        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let weak = weak.clone();
            let inbound: InboundHandler = Arc::new(move |message| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch(message);
                }
            });

            remote.set_inbound(inbound.clone());
            local.set_inbound(inbound);
            remote.set_link_events(link_tx.clone());
            local.set_link_events(link_tx);

            ClientInner {
                broker_config,
                prefer_local: failover.prefer_local,
                remote,
                local,
                tracker: Mutex::new(FailureTracker::new(failover)),
                state: RwLock::new(ConnectionState::Disconnected),
                backend_kind: RwLock::new(BackendKind::Unknown),
                active: tokio::sync::RwLock::new(None),
                subscriptions: RwLock::new(Arc::new(AHashMap::new())),
                connect_lock: tokio::sync::Mutex::new(()),
                connecting: AtomicBool::new(false),
                last_outcome: Mutex::new((0, Err(ClientError::NotConnected))),
                generation: AtomicU64::new(0),
                link_rx: Mutex::new(Some(link_rx)),
            }
        });

        Self { inner }
    }

    /// Connect, preferring the remote broker within the failure budget
    ///
    /// A caller arriving while another attempt is in flight waits for it and
    /// gets its outcome. If that attempt was dropped before finishing, the
    /// waiter runs its own. Returns the kind of backend now active.
    pub async fn connect(&self) -> Result<BackendKind, ClientError> {
        self.start_link_watcher();

        let completed = self.inner.last_outcome.lock().0;
        let _lock = match self.inner.connect_lock.try_lock() {
            Ok(lock) => lock,
            Err(_) => {
                debug!("Broker client: connect already in flight, waiting");
                let lock = self.inner.connect_lock.lock().await;
                {
                    let last = self.inner.last_outcome.lock();
                    if last.0 != completed {
                        return last.1.clone();
                    }
                }
                debug!("Broker client: in-flight connect was abandoned, retrying");
                lock
            }
        };
        let _flight = ConnectingGuard::new(&self.inner);

        let outcome = self.connect_once().await;
        {
            let mut last = self.inner.last_outcome.lock();
            last.0 += 1;
            last.1 = outcome.clone();
        }
        outcome
    }

    async fn connect_once(&self) -> Result<BackendKind, ClientError> {
        let inner = &self.inner;
        let generation = inner.generation.load(Ordering::SeqCst);

        if self.active_kind_if_connected().await == Some(BackendKind::Remote) {
            return Ok(BackendKind::Remote);
        }

        {
            let mut state = inner.state.write();
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
            }
        }

        if self.remote_allowed() {
            match inner.remote.connect(&inner.broker_config).await {
                Ok(()) => {
                    inner.tracker.lock().record_success();
                    self.activate(inner.remote.clone(), generation).await?;
                    return Ok(BackendKind::Remote);
                }
                Err(BackendError::Cancelled) => {
                    let _ = inner.remote.disconnect().await;
                    return Err(ClientError::Backend(BackendError::Cancelled));
                }
                Err(e) => {
                    inner.tracker.lock().record_failure();
                    let _ = inner.remote.disconnect().await;
                    warn!(
                        "Broker client: remote {} unavailable ({}), falling back to local",
                        inner.broker_config.endpoint, e
                    );
                }
            }
        }

        if !inner.is_current(generation) {
            return Err(ClientError::Backend(BackendError::Cancelled));
        }

        if self.active_kind_if_connected().await == Some(BackendKind::Local) {
            *inner.state.write() = ConnectionState::Connected;
            return Ok(BackendKind::Local);
        }

        match inner.local.connect(&inner.broker_config).await {
            Ok(()) => {
                self.activate(inner.local.clone(), generation).await?;
                Ok(BackendKind::Local)
            }
            Err(e) => {
                error!("Broker client: local backend failed: {}", e);
                if self.active_kind_if_connected().await.is_none() {
                    *inner.state.write() = ConnectionState::Disconnected;
                }
                Err(ClientError::from_connect(e))
            }
        }
    }

    /// Budget, preference and reachability checks for the remote
    fn remote_allowed(&self) -> bool {
        if self.inner.prefer_local {
            debug!("Broker client: local backend preferred, skipping remote");
            return false;
        }

        let mut tracker = self.inner.tracker.lock();
        if !tracker.should_attempt_remote() {
            debug!("Broker client: remote failure budget spent, skipping remote");
            return false;
        }
        if tracker.likely_unreachable(&self.inner.broker_config) {
            info!(
                "Broker client: remote {} looks unreachable, skipping it",
                self.inner.broker_config.endpoint
            );
            return false;
        }
        true
    }

    async fn active_kind_if_connected(&self) -> Option<BackendKind> {
        match self.inner.active.read().await.as_ref() {
            Some(backend) if backend.is_connected() => Some(backend.kind()),
            _ => None,
        }
    }

    /// Make `backend` the active one and replay the subscription table onto it
    async fn activate(
        &self,
        backend: Arc<dyn BackendAdapter>,
        generation: u64,
    ) -> Result<(), ClientError> {
        let inner = &self.inner;
        let mut active = inner.active.write().await;

        if !inner.is_current(generation) {
            let _ = backend.disconnect().await;
            return Err(ClientError::Backend(BackendError::Cancelled));
        }

        if let Some(previous) = active.take() {
            if previous.kind() != backend.kind() {
                debug!("Broker client: disconnecting previous {} backend", previous.kind());
                let _ = previous.disconnect().await;
            }
        }

        let table = inner.subscriptions.read().clone();
        for pattern in table.keys() {
            if let Err(e) = backend.subscribe(pattern).await {
                warn!(
                    "Broker client: replaying '{}' on {} backend failed: {}",
                    pattern,
                    backend.kind(),
                    e
                );
            }
        }

        let kind = backend.kind();
        *active = Some(backend);
        *inner.backend_kind.write() = kind;
        *inner.state.write() = ConnectionState::Connected;

        match kind {
            BackendKind::Local => warn!(
                "Broker client: connected to local backend ({} subscriptions replayed)",
                table.len()
            ),
            _ => info!(
                "Broker client: connected to {} backend ({} subscriptions replayed)",
                kind,
                table.len()
            ),
        }
        Ok(())
    }

    /// Publish to the active backend
    ///
    /// The content type defaults to the payload's own when not given.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
        options: PublishOptions,
    ) -> Result<(), ClientError> {
        let active = self.inner.active.read().await;
        let backend = match active.as_ref() {
            Some(backend) if backend.is_connected() => backend,
            _ => return Err(ClientError::NotConnected),
        };

        topic::validate_topic(topic).map_err(|e| ClientError::InvalidTopic(e.to_string()))?;

        let payload = payload.into();
        let content_type = options
            .content_type
            .or_else(|| payload.default_content_type().map(str::to_string));

        let message = Message {
            topic: topic.to_string(),
            payload: MessageCodec::encode(&payload),
            content_type,
            correlation_id: options.correlation_id,
        };

        backend.publish(message).await.map_err(ClientError::from)
    }

    /// Register `handler` for `pattern`, replacing any existing handler
    pub async fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<(), ClientError>
    where
        F: Fn(&str, &Payload, &Message) + Send + Sync + 'static,
    {
        let active = self.inner.active.read().await;
        let backend = match active.as_ref() {
            Some(backend) if backend.is_connected() => backend,
            _ => return Err(ClientError::NotConnected),
        };

        topic::validate_pattern(pattern).map_err(|e| ClientError::InvalidTopic(e.to_string()))?;

        let handler: MessageHandler = Arc::new(handler);
        let mut previous = None;
        self.inner.replace_subscriptions(|table| {
            previous = table.insert(pattern.to_string(), handler);
        });

        if let Err(e) = backend.subscribe(pattern).await {
            warn!("Broker client: subscribe to '{}' failed: {}", pattern, e);
            self.inner.replace_subscriptions(|table| match previous {
                Some(previous) => {
                    table.insert(pattern.to_string(), previous);
                }
                None => {
                    table.remove(pattern);
                }
            });
            return Err(e.into());
        }

        debug!("Broker client: subscribed to '{}'", pattern);
        Ok(())
    }

    /// Drop the handler for `pattern`; unknown patterns are a no-op
    pub async fn unsubscribe(&self, pattern: &str) -> Result<(), ClientError> {
        let active = self.inner.active.read().await;

        let mut removed = false;
        self.inner.replace_subscriptions(|table| {
            removed = table.remove(pattern).is_some();
        });
        if !removed {
            return Ok(());
        }

        match active.as_ref() {
            Some(backend) if backend.is_connected() => {
                backend.unsubscribe(pattern).await.map_err(ClientError::from)
            }
            _ => Ok(()),
        }
    }

    /// Disconnect everything and forget all subscriptions
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let inner = &self.inner;
        inner.generation.fetch_add(1, Ordering::SeqCst);

        // Cancels an in-flight remote attempt too
        let _ = inner.remote.disconnect().await;

        let previous = inner.active.write().await.take();
        if let Some(previous) = previous {
            if previous.kind() != BackendKind::Remote {
                let _ = previous.disconnect().await;
            }
        }

        inner.replace_subscriptions(|table| table.clear());
        *inner.state.write() = ConnectionState::Disconnected;
        inner.last_outcome.lock().1 = Err(ClientError::NotConnected);

        info!("Broker client: disconnected");
        Ok(())
    }

    /// Forget remote failures and connect again
    pub async fn retry_remote(&self) -> Result<BackendKind, ClientError> {
        info!("Broker client: retrying remote on request");
        self.inner.tracker.lock().reset();
        self.connect().await
    }

    pub fn status(&self) -> Status {
        let inner = &self.inner;
        let state = *inner.state.read();

        let mut subscriptions: Vec<String> =
            inner.subscriptions.read().keys().cloned().collect();
        subscriptions.sort();

        Status {
            state,
            connected: state == ConnectionState::Connected,
            backend_kind: *inner.backend_kind.read(),
            subscriptions,
            failure_info: inner.tracker.lock().info(),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state.read() == ConnectionState::Connected
    }

    /// Whether a connection attempt is in flight
    pub fn is_connecting(&self) -> bool {
        self.inner.connecting.load(Ordering::SeqCst)
    }

    /// Spawn the link event watcher on first use
    fn start_link_watcher(&self) {
        if let Some(rx) = self.inner.link_rx.lock().take() {
            tokio::spawn(watch_links(Arc::downgrade(&self.inner), rx));
        }
    }

    /// Reconnect supervisor for a lost link
    async fn handle_link_event(&self, event: LinkEvent) {
        let LinkEvent::Lost {
            kind,
            epoch,
            reason,
        } = event;
        let inner = &self.inner;
        let generation = inner.generation.load(Ordering::SeqCst);

        {
            let mut active = inner.active.write().await;
            match active.as_ref() {
                Some(backend) if backend.kind() == kind && backend.epoch() == epoch => {}
                _ => {
                    debug!(
                        "Broker client: ignoring stale link loss on {} backend (epoch {})",
                        kind, epoch
                    );
                    return;
                }
            }
            *active = None;
            *inner.state.write() = ConnectionState::Disconnected;
        }

        warn!("Broker client: {} link lost: {}", kind, reason);

        let retries = inner.broker_config.reconnect_retries;
        for attempt in 1..=retries {
            tokio::time::sleep(inner.broker_config.reconnect_interval).await;
            if !inner.is_current(generation) {
                debug!("Broker client: reconnect abandoned after disconnect");
                return;
            }

            match self.connect().await {
                Ok(kind) => {
                    info!(
                        "Broker client: reconnected to {} backend (attempt {}/{})",
                        kind, attempt, retries
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        "Broker client: reconnect attempt {}/{} failed: {}",
                        attempt, retries, e
                    );
                }
            }
        }

        if retries > 0 {
            error!("Broker client: giving up after {} reconnect attempts", retries);
        }
    }
}

async fn watch_links(client: Weak<ClientInner>, mut rx: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = client.upgrade() else {
            break;
        };
        BrokerClient { inner }.handle_link_event(event).await;
    }
}
