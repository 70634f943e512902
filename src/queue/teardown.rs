//! Synchronous transports used while draining.
//!
//! A teardown transport must not depend on the async runtime still being
//! scheduled: the process may be about to exit.

use bytes::Bytes;
use std::fmt;
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Upper bound for beacon payloads, mirroring what user agents accept.
pub const BEACON_MAX_BYTES: usize = 64 * 1024;

pub const BLOCKING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum TeardownError {
    TooLarge { size: usize, limit: usize },
    Http { status: u16 },
    Network(String),
    Spawn(String),
    Panicked(String),
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownError::TooLarge { size, limit } => {
                write!(f, "payload of {} bytes exceeds limit of {}", size, limit)
            }
            TeardownError::Http { status } => write!(f, "HTTP {}", status),
            TeardownError::Network(msg) => write!(f, "network error: {}", msg),
            TeardownError::Spawn(msg) => write!(f, "failed to spawn sender thread: {}", msg),
            TeardownError::Panicked(msg) => write!(f, "transport panicked: {}", msg),
        }
    }
}

impl std::error::Error for TeardownError {}

/// One best-effort delivery primitive tried during draining
pub trait TeardownTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver `payload` (a JSON array of entries) to `endpoint` without
    /// awaiting anything.
    fn transmit(&self, endpoint: &str, payload: &Bytes) -> Result<(), TeardownError>;
}

/// Fire-and-forget: hands the payload to a detached thread and returns.
///
/// Success only means the request was queued, like a browser beacon.
#[derive(Clone, Debug)]
pub struct BeaconTransport {
    token: Option<String>,
    timeout: Duration,
    max_bytes: usize,
}

impl Default for BeaconTransport {
    fn default() -> Self {
        Self {
            token: None,
            timeout: BLOCKING_TIMEOUT,
            max_bytes: BEACON_MAX_BYTES,
        }
    }
}

impl BeaconTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

impl TeardownTransport for BeaconTransport {
    fn name(&self) -> &str {
        "beacon"
    }

    fn transmit(&self, endpoint: &str, payload: &Bytes) -> Result<(), TeardownError> {
        if payload.len() > self.max_bytes {
            return Err(TeardownError::TooLarge {
                size: payload.len(),
                limit: self.max_bytes,
            });
        }
        let endpoint = endpoint.to_string();
        let payload = payload.clone();
        let token = self.token.clone();
        let timeout = self.timeout;
        thread::Builder::new()
            .name("logship-beacon".to_string())
            .spawn(move || {
                if let Err(e) = post_blocking(&endpoint, payload, token.as_deref(), timeout) {
                    debug!(error = %e, "beacon delivery failed");
                }
            })
            .map(|_| ())
            .map_err(|e| TeardownError::Spawn(e.to_string()))
    }
}

/// Blocking POST that waits for the collector's answer.
#[derive(Clone, Debug)]
pub struct BlockingHttpTransport {
    token: Option<String>,
    timeout: Duration,
}

impl Default for BlockingHttpTransport {
    fn default() -> Self {
        Self {
            token: None,
            timeout: BLOCKING_TIMEOUT,
        }
    }
}

impl BlockingHttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl TeardownTransport for BlockingHttpTransport {
    fn name(&self) -> &str {
        "blocking-http"
    }

    fn transmit(&self, endpoint: &str, payload: &Bytes) -> Result<(), TeardownError> {
        // reqwest's blocking client refuses to run inside a tokio context, so
        // it lives on a scoped helper thread.
        thread::scope(|scope| {
            let handle = scope.spawn(|| {
                post_blocking(
                    endpoint,
                    payload.clone(),
                    self.token.as_deref(),
                    self.timeout,
                )
            });
            handle
                .join()
                .unwrap_or_else(|panic| Err(TeardownError::Panicked(panic_message(&*panic))))
        })
    }
}

/// POST a JSON payload with reqwest's blocking client.
pub fn post_blocking(
    endpoint: &str,
    payload: Bytes,
    token: Option<&str>,
    timeout: Duration,
) -> Result<(), TeardownError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| TeardownError::Network(e.to_string()))?;
    let mut request = client
        .post(endpoint)
        .header("Content-Type", "application/json")
        .body(payload.to_vec());
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = request
        .send()
        .map_err(|e| TeardownError::Network(e.to_string()))?;
    let status = response.status().as_u16();
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(TeardownError::Http { status })
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
