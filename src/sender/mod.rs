// src/sender/mod.rs
pub mod endpoint;
pub mod http;
pub mod retry;

pub use endpoint::EndpointCache;
pub use http::{EndpointSource, HttpSender, HttpSenderConfig};
pub use retry::{parse_retry_after, Backoff, RetryBudget, RetryPolicy, Transient};

use crate::entry::LogEntry;
use std::fmt;
use std::time::Duration;

/// Errors that can occur when delivering a batch or resolving its destination
#[derive(Debug, Clone, PartialEq)]
pub enum SendError {
    Timeout,
    Http {
        status: u16,
        endpoint: String,
        /// Parsed `Retry-After` of the response, if it had one
        retry_after: Option<Duration>,
    },
    Network(String),
    Serialize(String),
    NoEndpoint,
    Discovery(String),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Timeout => write!(f, "request timed out"),
            SendError::Http {
                status, endpoint, ..
            } => {
                write!(f, "HTTP {} from {}", status, endpoint)
            }
            SendError::Network(msg) => write!(f, "network error: {}", msg),
            SendError::Serialize(msg) => write!(f, "serialization error: {}", msg),
            SendError::NoEndpoint => write!(f, "no collector endpoint configured"),
            SendError::Discovery(msg) => write!(f, "endpoint discovery failed: {}", msg),
        }
    }
}

impl std::error::Error for SendError {}

impl Transient for SendError {
    fn is_transient(&self) -> bool {
        match self {
            SendError::Timeout => true,
            SendError::Http { status, .. } => matches!(status, 429 | 502..=504),
            SendError::Network(_) => true,
            SendError::Serialize(_) | SendError::NoEndpoint => false,
            SendError::Discovery(_) => true,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            SendError::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SendError::Timeout
        } else {
            SendError::Network(e.to_string())
        }
    }
}

/// Performs one network exchange per batch, plus endpoint discovery.
///
/// Implementations own their timeout and retry policy; the queue only sees
/// the final outcome.
#[async_trait::async_trait]
pub trait LogSender: Send + Sync {
    async fn send(&self, entries: &[LogEntry]) -> Result<(), SendError>;

    /// Resolve (and cache) the collector URL. Idempotent.
    async fn resolve_endpoint(&self) -> Result<String, SendError>;
}
