//! Backend Abstraction
//!
//! Uniform interface over the two places messages can travel through:
//! the remote MQTT broker and the in-process local broker. The client only
//! ever talks to a `dyn BackendAdapter`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::BrokerConfig;
use crate::message::Message;

pub mod local;
pub mod remote;

pub use local::LocalBackend;
pub use remote::RemoteBackend;

/// Error type for backend operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Operation requires an established session
    NotConnected,
    /// Deadline elapsed before the broker answered
    Timeout,
    /// Broker refused the operation (bad credentials, invalid filter, ...)
    Rejected(String),
    /// Backend cannot be used at all (malformed endpoint, broker shut down)
    Unavailable(String),
    /// Session dropped while the operation was in flight
    ConnectionLost(String),
    /// Attempt abandoned because `disconnect()` was called
    Cancelled,
    /// Wire-level failure
    Protocol(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::NotConnected => write!(f, "Not connected"),
            BackendError::Timeout => write!(f, "Operation timed out"),
            BackendError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            BackendError::Unavailable(msg) => write!(f, "Unavailable: {}", msg),
            BackendError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            BackendError::Cancelled => write!(f, "Connection attempt cancelled"),
            BackendError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

/// Which adapter is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Remote,
    Local,
    /// Nothing has connected yet
    #[default]
    Unknown,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Remote => write!(f, "remote"),
            BackendKind::Local => write!(f, "local"),
            BackendKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Callback through which a backend hands inbound messages to the client
pub type InboundHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Session-level events reported by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// An established session ended without `disconnect()` being called
    ///
    /// `epoch` is the backend's [`epoch`](BackendAdapter::epoch) for the
    /// session that ended.
    Lost {
        kind: BackendKind,
        epoch: u64,
        reason: String,
    },
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// Operations shared by the remote and local backends
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Install the inbound message callback (replaces any previous one)
    fn set_inbound(&self, handler: InboundHandler);

    /// Install the channel for link events
    fn set_link_events(&self, tx: LinkEventSender);

    /// Establish a session
    ///
    /// Enforces its own deadline and resolves exactly once per call.
    async fn connect(&self, config: &BrokerConfig) -> Result<(), BackendError>;

    /// Send a message; fails with `NotConnected` without a session
    async fn publish(&self, message: Message) -> Result<(), BackendError>;

    /// Register interest in a pattern
    async fn subscribe(&self, pattern: &str) -> Result<(), BackendError>;

    async fn unsubscribe(&self, pattern: &str) -> Result<(), BackendError>;

    /// Tear the session down; safe to call when already disconnected
    async fn disconnect(&self) -> Result<(), BackendError>;

    fn is_connected(&self) -> bool;

    /// Session generation, bumped by every `connect()` and `disconnect()`
    fn epoch(&self) -> u64;
}
