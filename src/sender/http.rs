use super::endpoint::EndpointCache;
use super::retry::{parse_retry_after, RetryBudget, RetryPolicy};
use super::{LogSender, SendError};
use crate::entry::{encode_batch, LogEntry};
use bytes::Bytes;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client;
use serde::Deserialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the collector URL comes from
#[derive(Clone, Debug, PartialEq)]
pub enum EndpointSource {
    /// Use this URL as-is
    Fixed(String),
    /// GET this URL; the response body is `{"endpoint": "<url>"}`
    Discovery(String),
}

#[derive(Clone, Debug)]
pub struct HttpSenderConfig {
    pub endpoint: EndpointSource,
    pub token: Option<String>,
    pub gzip: bool,
    pub timeout: Duration,
    /// Shared by discovery and the upload of one batch
    pub retry: RetryPolicy,
}

impl HttpSenderConfig {
    pub fn new(endpoint: EndpointSource) -> Self {
        Self {
            endpoint,
            token: None,
            gzip: false,
            timeout: SEND_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Deserialize)]
struct DiscoveryResponse {
    endpoint: String,
}

/// Delivers batches to an HTTP collector as a JSON array
pub struct HttpSender {
    client: Client,
    config: HttpSenderConfig,
    cache: Arc<EndpointCache>,
}

impl HttpSender {
    /// Create a new sender writing resolved endpoints into `cache`.
    /// Returns an error if the HTTP client fails to build (e.g., TLS configuration issues).
    pub fn new(config: HttpSenderConfig, cache: Arc<EndpointCache>) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            config,
            cache,
        })
    }

    pub fn endpoint_cache(&self) -> Arc<EndpointCache> {
        Arc::clone(&self.cache)
    }

    async fn discover(
        &self,
        discovery_url: &str,
        budget: &mut RetryBudget<'_>,
    ) -> Result<String, SendError> {
        budget
            .run(|| async {
                let mut request = self.client.get(discovery_url);
                if let Some(token) = &self.config.token {
                    request = request.bearer_auth(token);
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| SendError::Discovery(e.to_string()))?;

                let status = response.status().as_u16();
                if !(200..300).contains(&status) {
                    return Err(SendError::Discovery(format!(
                        "HTTP {} from {}",
                        status, discovery_url
                    )));
                }

                let body: DiscoveryResponse = response
                    .json()
                    .await
                    .map_err(|e| SendError::Discovery(format!("invalid discovery response: {}", e)))?;
                if body.endpoint.is_empty() {
                    return Err(SendError::NoEndpoint);
                }
                Ok(body.endpoint)
            })
            .await
    }

    fn encode(&self, entries: &[LogEntry]) -> Result<Bytes, SendError> {
        let json = encode_batch(entries).map_err(|e| SendError::Serialize(e.to_string()))?;
        if self.config.gzip {
            gzip(&json).map(Bytes::from)
        } else {
            Ok(Bytes::from(json))
        }
    }

    async fn post(
        &self,
        endpoint: &str,
        body: Bytes,
        budget: &mut RetryBudget<'_>,
    ) -> Result<(), SendError> {
        budget
            .run(|| async {
                let mut request = self
                    .client
                    .post(endpoint)
                    .header("Content-Type", "application/json")
                    .body(body.clone());
                if self.config.gzip {
                    request = request.header("Content-Encoding", "gzip");
                }
                if let Some(token) = &self.config.token {
                    request = request.bearer_auth(token);
                }

                let response = request.send().await?;
                let status = response.status().as_u16();
                if !(200..300).contains(&status) {
                    let retry_after = retry_after(response.headers());
                    let resp_body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "(failed to read body)".to_string());
                    error!(
                        endpoint,
                        status,
                        response_body = %resp_body,
                        "collector returned error status"
                    );
                    return Err(SendError::Http {
                        status,
                        endpoint: endpoint.to_string(),
                        retry_after,
                    });
                }
                Ok(())
            })
            .await
    }

    async fn resolve_within(&self, budget: &mut RetryBudget<'_>) -> Result<String, SendError> {
        if let Some(url) = self.cache.get_if_fresh() {
            return Ok(url);
        }
        let resolved = match &self.config.endpoint {
            EndpointSource::Fixed(url) if url.is_empty() => Err(SendError::NoEndpoint),
            EndpointSource::Fixed(url) => Ok(url.clone()),
            EndpointSource::Discovery(discovery_url) => self.discover(discovery_url, budget).await,
        };
        match resolved {
            Ok(url) => {
                self.cache.store(url.clone());
                Ok(url)
            }
            Err(e) => match self.cache.get() {
                Some(stale) => {
                    warn!(error = %e, endpoint = %stale, "endpoint refresh failed, using stale value");
                    Ok(stale)
                }
                None => Err(e),
            },
        }
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    parse_retry_after(value, Utc::now())
}

#[async_trait::async_trait]
impl LogSender for HttpSender {
    #[tracing::instrument(name = "log_send", skip(self, entries), fields(entry_count = entries.len()))]
    async fn send(&self, entries: &[LogEntry]) -> Result<(), SendError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut budget = self.config.retry.budget();
        let endpoint = self.resolve_within(&mut budget).await?;
        let body = self.encode(entries)?;
        debug!(endpoint = %endpoint, bytes = body.len(), "sending batch");
        self.post(&endpoint, body, &mut budget).await
    }

    async fn resolve_endpoint(&self) -> Result<String, SendError> {
        self.resolve_within(&mut self.config.retry.budget()).await
    }
}

/// Gzip a payload with the default compression level
pub fn gzip(data: &[u8]) -> Result<Vec<u8>, SendError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| SendError::Serialize(format!("gzip failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| SendError::Serialize(format!("gzip failed: {}", e)))
}
