//! Batching delivery queue.
//!
//! Entries accumulate in a FIFO buffer and leave it only through a flush
//! attempt or the synchronous drain path. At most one flush is in flight:
//! the flag is checked and set under the state lock before the send await.

pub mod teardown;

pub use teardown::{BeaconTransport, BlockingHttpTransport, TeardownError, TeardownTransport};

use crate::entry::{encode_batch, LogEntry};
use crate::host::{classify_host, HostIndicators, HostProfile};
use crate::sender::{EndpointCache, LogSender, SendError};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq)]
pub struct QueueConfig {
    /// Buffer length that triggers a background flush (Persistent hosts)
    pub batch_size: usize,
    /// Period of the auto-flush timer (Persistent hosts)
    pub flush_interval: Duration,
    /// How many entries of a failed batch go back to the front of the buffer
    pub requeue_limit: usize,
    pub drain_attempts: u32,
    pub drain_retry_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval: Duration::from_secs(5),
            requeue_limit: 3,
            drain_attempts: 3,
            drain_retry_delay: Duration::from_millis(100),
        }
    }
}

/// Terminal failure to deliver a batch
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryError {
    Send(SendError),
    /// Entries were still buffered after the last drain attempt
    DrainExhausted { pending: usize },
    Closed,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Send(e) => write!(f, "delivery failed: {}", e),
            DeliveryError::DrainExhausted { pending } => {
                write!(f, "gave up draining with {} entries pending", pending)
            }
            DeliveryError::Closed => write!(f, "queue is closed"),
        }
    }
}

impl std::error::Error for DeliveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeliveryError::Send(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SendError> for DeliveryError {
    fn from(e: SendError) -> Self {
        DeliveryError::Send(e)
    }
}

/// Called once per failed attempt with the full batch that failed.
pub type ErrorCallback = Arc<dyn Fn(&DeliveryError, &[LogEntry]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Sent(usize),
    /// Nothing buffered
    Empty,
    /// Another flush owns the in-flight slot
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePhase {
    Idle,
    Flushing,
    Draining,
    Closed,
}

/// What the drain path did with the buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Empty,
    Transmitted { transport: String, count: usize },
    /// Handed to an ordinary async send that may not finish before exit
    Deferred { count: usize },
    Dropped { count: usize },
}

#[derive(Default)]
struct QueueState {
    buffer: VecDeque<LogEntry>,
    in_flight: bool,
    /// The threshold was reached while a flush was in flight
    flush_requested: bool,
    draining: bool,
    closed: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    idle: Notify,
    sender: Arc<dyn LogSender>,
    host_profile: HostProfile,
    config: QueueConfig,
    on_error: Option<ErrorCallback>,
    endpoint_cache: Option<Arc<EndpointCache>>,
    transports: Vec<Box<dyn TeardownTransport>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Clears the in-flight flag even if the flush future is dropped mid-send.
struct InFlightGuard<'a> {
    shared: &'a Shared,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock().in_flight = false;
        self.shared.idle.notify_waiters();
    }
}

struct DrainingGuard<'a> {
    shared: &'a Shared,
}

impl Drop for DrainingGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock().draining = false;
    }
}

impl Shared {
    // The state stays consistent across a panic in a callback, so a
    // poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn threshold(&self) -> usize {
        match self.host_profile {
            HostProfile::Ephemeral => 1,
            HostProfile::Persistent => self.config.batch_size.max(1),
        }
    }

    fn report(&self, error: &DeliveryError, batch: &[LogEntry]) {
        warn!(error = %error, entries = batch.len(), "log delivery failed");
        if let Some(callback) = &self.on_error {
            callback(error, batch);
        }
    }

    async fn flush(self: &Arc<Self>) -> Result<FlushOutcome, DeliveryError> {
        let batch: Vec<LogEntry> = {
            let mut state = self.lock();
            if state.in_flight {
                return Ok(FlushOutcome::InFlight);
            }
            if state.buffer.is_empty() {
                return Ok(FlushOutcome::Empty);
            }
            state.in_flight = true;
            state.buffer.drain(..).collect()
        };

        let result = {
            let _guard = InFlightGuard { shared: self };
            debug!(entries = batch.len(), "flushing batch");
            match self.sender.send(&batch).await {
                Ok(()) => Ok(FlushOutcome::Sent(batch.len())),
                Err(e) => {
                    self.requeue(&batch);
                    let error = DeliveryError::Send(e);
                    self.report(&error, &batch);
                    Err(error)
                }
            }
        };
        self.resume_requested_flush();
        result
    }

    /// Entries that reached the threshold during a flush did not start one
    /// of their own; start it now that the slot is free.
    fn resume_requested_flush(self: &Arc<Self>) {
        let should_flush = {
            let mut state = self.lock();
            if state.in_flight || !state.flush_requested {
                return;
            }
            state.flush_requested = false;
            !state.closed && state.buffer.len() >= self.threshold()
        };
        if should_flush {
            debug!("resuming flush requested while in flight");
            self.spawn_flush();
        }
    }

    fn requeue(&self, batch: &[LogEntry]) {
        if self.host_profile != HostProfile::Persistent {
            return;
        }
        let mut state = self.lock();
        if state.closed {
            return;
        }
        let keep = batch.len().min(self.config.requeue_limit);
        for entry in batch[..keep].iter().rev() {
            state.buffer.push_front(entry.clone());
        }
        debug!(
            requeued = keep,
            dropped = batch.len() - keep,
            "requeued head of failed batch"
        );
    }

    fn spawn_flush(self: &Arc<Self>) {
        match Handle::try_current() {
            Ok(handle) => {
                let shared = Arc::clone(self);
                handle.spawn(async move {
                    // Failures were already reported through the callback
                    let _ = shared.flush().await;
                });
            }
            Err(_) => debug!("no async runtime, batch stays buffered"),
        }
    }

    fn start_timer(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("no async runtime, periodic flush disabled");
                return None;
            }
        };
        let period = self.config.flush_interval;
        let weak: Weak<Shared> = Arc::downgrade(self);
        Some(handle.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let _ = shared.flush().await;
            }
        }))
    }

    fn stop_timer(&self) {
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(timer) = timer {
            timer.abort();
        }
    }

    fn transmit_batch(&self, batch: Vec<LogEntry>) -> DrainOutcome {
        let count = batch.len();
        let endpoint = self.endpoint_cache.as_ref().and_then(|cache| cache.get());

        if let Some(endpoint) = endpoint.filter(|_| !self.transports.is_empty()) {
            match encode_batch(&batch) {
                Ok(json) => {
                    let payload = Bytes::from(json);
                    for transport in &self.transports {
                        let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
                            transport.transmit(&endpoint, &payload)
                        }));
                        match attempt {
                            Ok(Ok(())) => {
                                debug!(transport = transport.name(), count, "drained batch");
                                return DrainOutcome::Transmitted {
                                    transport: transport.name().to_string(),
                                    count,
                                };
                            }
                            Ok(Err(e)) => {
                                debug!(transport = transport.name(), error = %e, "teardown transport failed")
                            }
                            Err(panic) => debug!(
                                transport = transport.name(),
                                panic = %teardown::panic_message(&*panic),
                                "teardown transport panicked"
                            ),
                        }
                    }
                }
                Err(e) => debug!(error = %e, "could not encode drained batch"),
            }
        }

        match Handle::try_current() {
            Ok(handle) => {
                let sender = Arc::clone(&self.sender);
                handle.spawn(async move {
                    if let Err(e) = sender.send(&batch).await {
                        debug!(error = %e, "deferred teardown send failed");
                    }
                });
                DrainOutcome::Deferred { count }
            }
            Err(_) => {
                warn!(count, "no teardown path available, dropping entries");
                DrainOutcome::Dropped { count }
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.stop_timer();
    }
}

/// Handle to a delivery queue; clones share the same buffer.
#[derive(Clone)]
pub struct DeliveryQueue {
    shared: Arc<Shared>,
}

pub struct DeliveryQueueBuilder {
    sender: Arc<dyn LogSender>,
    host_profile: Option<HostProfile>,
    config: QueueConfig,
    on_error: Option<ErrorCallback>,
    endpoint_cache: Option<Arc<EndpointCache>>,
    transports: Vec<Box<dyn TeardownTransport>>,
}

impl DeliveryQueueBuilder {
    /// Skip environment classification
    pub fn host_profile(mut self, profile: HostProfile) -> Self {
        self.host_profile = Some(profile);
        self
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn on_error(
        mut self,
        callback: impl Fn(&DeliveryError, &[LogEntry]) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Cache the drain path reads the last resolved endpoint from
    pub fn endpoint_cache(mut self, cache: Arc<EndpointCache>) -> Self {
        self.endpoint_cache = Some(cache);
        self
    }

    /// Append a transport; draining tries them in registration order.
    pub fn teardown_transport(mut self, transport: impl TeardownTransport + 'static) -> Self {
        self.transports.push(Box::new(transport));
        self
    }

    /// Build the queue. Persistent queues start their flush timer on the
    /// current tokio runtime, if any.
    pub fn build(self) -> DeliveryQueue {
        let host_profile = self
            .host_profile
            .unwrap_or_else(|| classify_host(&HostIndicators::from_env()));
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            idle: Notify::new(),
            sender: self.sender,
            host_profile,
            config: self.config,
            on_error: self.on_error,
            endpoint_cache: self.endpoint_cache,
            transports: self.transports,
            timer: Mutex::new(None),
        });
        if host_profile == HostProfile::Persistent {
            let timer = shared.start_timer();
            *shared
                .timer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = timer;
        }
        debug!(host_profile = %host_profile, "delivery queue created");
        DeliveryQueue { shared }
    }
}

impl DeliveryQueue {
    pub fn builder(sender: Arc<dyn LogSender>) -> DeliveryQueueBuilder {
        DeliveryQueueBuilder {
            sender,
            host_profile: None,
            config: QueueConfig::default(),
            on_error: None,
            endpoint_cache: None,
            transports: Vec::new(),
        }
    }

    /// Append an entry. Reaching the threshold starts a background flush
    /// whose failures only surface through the error callback.
    pub fn add(&self, entry: LogEntry) {
        let should_flush = {
            let mut state = self.shared.lock();
            if state.closed {
                warn!("queue is closed, dropping log entry");
                return;
            }
            state.buffer.push_back(entry);
            if state.buffer.len() < self.shared.threshold() {
                false
            } else if state.in_flight {
                state.flush_requested = true;
                false
            } else {
                true
            }
        };
        if should_flush {
            self.shared.spawn_flush();
        }
    }

    /// Append an entry and flush, waiting out any flush already in flight.
    pub async fn add_and_wait(&self, entry: LogEntry) -> Result<FlushOutcome, DeliveryError> {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(DeliveryError::Closed);
            }
            state.buffer.push_back(entry);
        }
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.shared.flush().await? {
                FlushOutcome::InFlight => notified.await,
                outcome => return Ok(outcome),
            }
        }
    }

    /// Send everything buffered as one batch.
    ///
    /// On failure a Persistent queue puts the first `requeue_limit` entries
    /// back at the front of the buffer; the callback sees the whole batch.
    pub async fn flush(&self) -> Result<FlushOutcome, DeliveryError> {
        self.shared.flush().await
    }

    /// Flush up to `drain_attempts` times, pausing between attempts, until
    /// the buffer is empty. Exhaustion is reported through the callback.
    pub async fn flush_and_wait_until_drained(&self) {
        let attempts = self.shared.config.drain_attempts.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.shared.config.drain_retry_delay).await;
            }
            match self.shared.flush().await {
                Ok(FlushOutcome::Empty) => return,
                Ok(FlushOutcome::Sent(_)) | Err(_) if self.pending_count() == 0 => return,
                _ => {}
            }
        }

        let pending: Vec<LogEntry> = self.shared.lock().buffer.iter().cloned().collect();
        if !pending.is_empty() {
            self.shared.report(
                &DeliveryError::DrainExhausted {
                    pending: pending.len(),
                },
                &pending,
            );
        }
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    pub fn host_profile(&self) -> HostProfile {
        self.shared.host_profile
    }

    pub fn phase(&self) -> QueuePhase {
        let state = self.shared.lock();
        if state.closed {
            QueuePhase::Closed
        } else if state.draining {
            QueuePhase::Draining
        } else if state.in_flight {
            QueuePhase::Flushing
        } else {
            QueuePhase::Idle
        }
    }

    /// Whether the periodic flush timer is installed and running
    pub fn auto_flush_active(&self) -> bool {
        self.shared
            .timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    /// Resolve the collector endpoint ahead of time so that draining has
    /// one to target.
    pub async fn resolve_endpoint(&self) -> Result<String, SendError> {
        self.shared.sender.resolve_endpoint().await
    }

    /// Synchronous teardown path. Never panics and never blocks on the
    /// async runtime.
    ///
    /// Detaches the whole buffer and tries each teardown transport in order
    /// against the last known endpoint. If none succeeds the batch goes to
    /// an ordinary async send, or is dropped when no runtime is available.
    pub fn drain(&self) -> DrainOutcome {
        let batch: Vec<LogEntry> = {
            let mut state = self.shared.lock();
            if state.draining || state.buffer.is_empty() {
                return DrainOutcome::Empty;
            }
            state.draining = true;
            state.buffer.drain(..).collect()
        };
        let _guard = DrainingGuard {
            shared: &self.shared,
        };
        self.shared.transmit_batch(batch)
    }

    /// Stop the timer, close the queue and make one final drain attempt.
    ///
    /// A closed queue never requeues, so this performs at most one send.
    /// Later `add` calls are dropped.
    pub async fn destroy(&self) {
        self.shared.stop_timer();
        {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.flush_and_wait_until_drained().await;
        debug!("delivery queue destroyed");
    }
}
