#![allow(dead_code)] // Test helpers appear unused when compiled independently

use axum::{
    body::Bytes,
    extract::State,
    http::{header::RETRY_AFTER, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use flate2::read::GzDecoder;
use reqwest::Client;
use serde_json::Value;
use std::future::Future;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

const WAIT_ATTEMPTS: usize = 50;
const WAIT_DELAY: Duration = Duration::from_millis(100);

/// Headers of one ingest request, as seen by the collector
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub authorization: Option<String>,
    pub content_encoding: Option<String>,
    pub content_type: Option<String>,
    pub entries: usize,
}

#[derive(Clone, Default)]
pub struct CollectorState {
    events: Arc<Mutex<Vec<Value>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    failures_left: Arc<AtomicUsize>,
    throttled_left: Arc<AtomicUsize>,
    discoveries: Arc<AtomicUsize>,
    base_url: Arc<Mutex<String>>,
}

impl CollectorState {
    /// Answer the next `n` ingest requests with 503
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Answer the next `n` ingest requests with 429 and `Retry-After: 1`
    pub fn throttle_next(&self, n: usize) {
        self.throttled_left.store(n, Ordering::SeqCst);
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().await.clone()
    }

    pub fn discovery_count(&self) -> usize {
        self.discoveries.load(Ordering::SeqCst)
    }
}

pub struct MockCollector {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    pub state: CollectorState,
}

impl MockCollector {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

/// Find an available TCP port
pub async fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Best-effort check for whether binding to loopback is permitted in the current sandbox.
pub async fn can_bind_loopback() -> bool {
    match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true, // treat other errors as non-fatal for skipping
    }
}

/// Spawn the mock collector, return (handle, base URL).
///
/// Routes: `POST /ingest` (JSON array, optionally gzip), `GET /discover`
/// (`{"endpoint": "<base>/ingest"}`), `GET /events`, `POST /reset`,
/// `GET /health`.
pub async fn spawn_mock_collector(port: u16) -> (MockCollector, String) {
    let state = CollectorState::default();
    let base_url = format!("http://127.0.0.1:{}", port);
    *state.base_url.lock().await = base_url.clone();

    let app = Router::new()
        .route("/ingest", post(ingest))
        .route("/discover", get(discover))
        .route("/events", get(events))
        .route("/reset", post(reset))
        .route("/health", get(health))
        .with_state(state.clone());

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("failed to bind mock collector listener");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(err) = server.await {
            eprintln!("mock collector server error: {}", err);
        }
    });

    (
        MockCollector {
            shutdown_tx,
            handle,
            state,
        },
        base_url,
    )
}

/// Wait for a server to respond to /health
pub async fn wait_for_health(client: &Client, base_url: &str) {
    poll_until(|| async {
        client
            .get(format!("{}/health", base_url))
            .send()
            .await
            .ok()
            .map(|_| ())
    })
    .await
    .unwrap_or_else(|| panic!("timed out waiting for {} to be healthy", base_url));
}

/// Poll /events until we have at least `min_count` entries
pub async fn wait_for_events(client: &Client, base_url: &str, min_count: usize) -> Vec<Value> {
    poll_until(|| async {
        match client.get(format!("{}/events", base_url)).send().await.ok() {
            Some(resp) => match resp.json::<Vec<Value>>().await.ok() {
                Some(events) if events.len() >= min_count => Some(events),
                _ => None,
            },
            None => None,
        }
    })
    .await
    .unwrap_or_else(|| panic!("timed out waiting for {} events at {}", min_count, base_url))
}

/// Current entries without waiting
pub async fn current_events(client: &Client, base_url: &str) -> Vec<Value> {
    client
        .get(format!("{}/events", base_url))
        .send()
        .await
        .expect("failed to query events")
        .json()
        .await
        .expect("events were not JSON")
}

/// Reset the mock collector's event store
pub async fn reset_events(client: &Client, base_url: &str) {
    client
        .post(format!("{}/reset", base_url))
        .send()
        .await
        .expect("failed to reset events");
}

pub async fn poll_until<T, F, Fut>(mut f: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..WAIT_ATTEMPTS {
        if let Some(result) = f().await {
            return Some(result);
        }
        tokio::time::sleep(WAIT_DELAY).await;
    }
    None
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn ingest(
    State(state): State<CollectorState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, StatusCode> {
    let throttled = state
        .throttled_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if throttled {
        return Ok((StatusCode::TOO_MANY_REQUESTS, [(RETRY_AFTER, "1")]).into_response());
    }

    let failing = state
        .failures_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let content_encoding = header(&headers, "content-encoding");
    let raw = if content_encoding.as_deref() == Some("gzip") {
        let mut decoded = Vec::new();
        GzDecoder::new(&body[..])
            .read_to_end(&mut decoded)
            .map_err(|_| StatusCode::BAD_REQUEST)?;
        decoded
    } else {
        body.to_vec()
    };
    let batch: Vec<Value> = serde_json::from_slice(&raw).map_err(|_| StatusCode::BAD_REQUEST)?;

    state.requests.lock().await.push(RecordedRequest {
        authorization: header(&headers, "authorization"),
        content_encoding,
        content_type: header(&headers, "content-type"),
        entries: batch.len(),
    });
    state.events.lock().await.extend(batch);

    Ok(Json(serde_json::json!({ "status": "ok" })).into_response())
}

async fn discover(State(state): State<CollectorState>) -> Json<Value> {
    state.discoveries.fetch_add(1, Ordering::SeqCst);
    let base = state.base_url.lock().await.clone();
    Json(serde_json::json!({ "endpoint": format!("{}/ingest", base) }))
}

async fn events(State(state): State<CollectorState>) -> Json<Vec<Value>> {
    let events = state.events.lock().await;
    Json(events.clone())
}

async fn reset(State(state): State<CollectorState>) -> Json<Value> {
    state.events.lock().await.clear();
    state.requests.lock().await.clear();
    Json(serde_json::json!({ "status": "ok" }))
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
