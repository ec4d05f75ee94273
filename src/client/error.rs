//! Client error type

use std::fmt;

use crate::backend::BackendError;

/// Errors surfaced by [`BrokerClient`](super::BrokerClient)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Publish/subscribe attempted without an active backend
    NotConnected,
    /// Remote attempt exceeded its deadline
    ConnectTimeout,
    /// Broker explicitly refused the session (e.g., bad credentials)
    ConnectRejected(String),
    /// Required backend cannot be used
    BackendUnavailable(String),
    /// Topic or pattern failed validation
    InvalidTopic(String),
    /// Operation failed on the active backend
    Backend(BackendError),
}

impl ClientError {
    /// Map a failed `connect()` on a backend
    pub(crate) fn from_connect(e: BackendError) -> Self {
        match e {
            BackendError::Timeout => ClientError::ConnectTimeout,
            BackendError::Rejected(reason) => ClientError::ConnectRejected(reason),
            BackendError::Unavailable(reason) => ClientError::BackendUnavailable(reason),
            other => ClientError::Backend(other),
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::NotConnected => write!(f, "Not connected"),
            ClientError::ConnectTimeout => write!(f, "Connect timed out"),
            ClientError::ConnectRejected(reason) => write!(f, "Connect rejected: {}", reason),
            ClientError::BackendUnavailable(reason) => {
                write!(f, "Backend unavailable: {}", reason)
            }
            ClientError::InvalidTopic(reason) => write!(f, "Invalid topic: {}", reason),
            ClientError::Backend(e) => write!(f, "Backend error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Backend(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BackendError> for ClientError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotConnected => ClientError::NotConnected,
            other => ClientError::Backend(other),
        }
    }
}
