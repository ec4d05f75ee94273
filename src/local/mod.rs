//! In-process fan-out broker
//!
//! A broadcast channel shared by every client in the process. Each subscriber
//! receives every message; pattern filtering happens on the receiving side.
//! A broker starts closed, is opened on first use and can be shut down once,
//! after which it stays unavailable.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::message::Message;

/// Local broker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Messages buffered per subscriber before the slowest one lags
    pub channel_capacity: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalBrokerError {
    /// `open()` has not been called yet
    NotOpen,
    /// `shutdown()` was called
    ShutDown,
}

impl fmt::Display for LocalBrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalBrokerError::NotOpen => write!(f, "local broker is not open"),
            LocalBrokerError::ShutDown => write!(f, "local broker has been shut down"),
        }
    }
}

impl std::error::Error for LocalBrokerError {}

enum State {
    Closed,
    Open(broadcast::Sender<Message>),
    ShutDown,
}

/// Shared in-process broker
pub struct LocalBroker {
    capacity: usize,
    state: RwLock<State>,
}

impl LocalBroker {
    pub fn new(config: &LocalConfig) -> Arc<Self> {
        Arc::new(Self {
            capacity: config.channel_capacity.max(1),
            state: RwLock::new(State::Closed),
        })
    }

    /// Make the broker ready; idempotent while open
    pub fn open(&self) -> Result<(), LocalBrokerError> {
        let mut state = self.state.write();
        match *state {
            State::Open(_) => Ok(()),
            State::ShutDown => Err(LocalBrokerError::ShutDown),
            State::Closed => {
                let (tx, _) = broadcast::channel(self.capacity);
                *state = State::Open(tx);
                info!("Local broker: open (capacity {})", self.capacity);
                Ok(())
            }
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.read(), State::Open(_))
    }

    /// Fan a message out to every receiver, returning how many got it
    pub fn publish(&self, message: Message) -> Result<usize, LocalBrokerError> {
        let state = self.state.read();
        match &*state {
            State::Open(tx) => {
                // No receivers is not an error for a pub/sub broker
                let delivered = tx.send(message).unwrap_or(0);
                debug!("Local broker: delivered to {} receivers", delivered);
                Ok(delivered)
            }
            State::Closed => Err(LocalBrokerError::NotOpen),
            State::ShutDown => Err(LocalBrokerError::ShutDown),
        }
    }

    /// Receiver for every message published from now on
    pub fn subscribe(&self) -> Result<broadcast::Receiver<Message>, LocalBrokerError> {
        match &*self.state.read() {
            State::Open(tx) => Ok(tx.subscribe()),
            State::Closed => Err(LocalBrokerError::NotOpen),
            State::ShutDown => Err(LocalBrokerError::ShutDown),
        }
    }

    /// Close the broker for good; existing receivers see the channel close
    pub fn shutdown(&self) {
        let mut state = self.state.write();
        if !matches!(*state, State::ShutDown) {
            *state = State::ShutDown;
            info!("Local broker: shut down");
        }
    }
}
