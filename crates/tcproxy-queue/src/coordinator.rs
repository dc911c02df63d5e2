//! Coordinator interface used by the reclaimer

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tcproxy_core::{Credentials, TaskClaim, TcProxyError};
use thiserror::Error;

/// Result of a successful reclaim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reclaim {
    pub taken_until: DateTime<Utc>,
    pub credentials: Credentials,
}

/// Reclaim failures, split by whether another attempt can help
#[derive(Error, Debug)]
pub enum QueueError {
    /// Network error, timeout, 5xx or 429: retry on the next tick
    #[error("transient queue failure: {0}")]
    Transient(String),

    /// The run can no longer be reclaimed (resolved, cancelled, unknown)
    #[error("queue refused reclaim ({status}): {message}")]
    Permanent { status: u16, message: String },

    /// The queue answered 2xx with a body we could not read
    #[error("invalid queue response: {0}")]
    Decode(String),

    #[error("request signing failed: {0}")]
    Signing(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Decode(_))
    }

    /// Classify an HTTP status the queue returned
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status >= 500 || status == 429 {
            Self::Transient(format!("HTTP {}: {}", status, message))
        } else {
            Self::Permanent { status, message }
        }
    }
}

impl From<QueueError> for TcProxyError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Permanent { .. } => TcProxyError::ClaimInvalid(err.to_string()),
            QueueError::Signing(msg) => TcProxyError::Signing(msg),
            other => TcProxyError::Queue(other.to_string()),
        }
    }
}

/// The party that hands out and extends task claims
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Extend `claim`, authenticating with the claim's current credentials
    async fn reclaim(&self, claim: &TaskClaim) -> Result<Reclaim, QueueError>;
}
