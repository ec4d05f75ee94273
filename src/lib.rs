//! Railbus - resilient publish/subscribe client
//!
//! Talks to a remote MQTT v5 broker when it can and falls back to an
//! in-process broker when it cannot. Subscriptions are owned by the client
//! and follow it across backend switches.

pub mod backend;
pub mod client;
pub mod codec;
pub mod config;
pub mod failover;
pub mod local;
pub mod message;
pub mod protocol;
pub mod topic;

pub use backend::{BackendAdapter, BackendError, BackendKind, LocalBackend, RemoteBackend};
pub use client::{BrokerClient, ClientError, ConnectionState, MessageHandler, Status};
pub use config::{BrokerConfig, Config};
pub use failover::{FailoverConfig, FailureInfo, FailureTracker};
pub use local::{LocalBroker, LocalConfig};
pub use message::{Message, MessageCodec, Payload, PublishOptions};
