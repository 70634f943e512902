//! Forwards process teardown notifications to [`DeliveryQueue::drain`].

use crate::queue::{DeliveryQueue, DrainOutcome};
use std::fmt;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownEvent {
    /// Ctrl-C / SIGINT
    Interrupt,
    /// SIGTERM, as sent by container and function platforms
    Terminate,
    /// Embedder-reported shutdown (e.g. a host lifecycle hook)
    Shutdown,
    /// The host is about to freeze the process; it may never resume
    Suspend,
}

impl TeardownEvent {
    /// Conventional exit status for signal-driven events
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            TeardownEvent::Interrupt => Some(130),
            TeardownEvent::Terminate => Some(143),
            TeardownEvent::Shutdown | TeardownEvent::Suspend => None,
        }
    }
}

impl fmt::Display for TeardownEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TeardownEvent::Interrupt => "interrupt",
            TeardownEvent::Terminate => "terminate",
            TeardownEvent::Shutdown => "shutdown",
            TeardownEvent::Suspend => "suspend",
        };
        f.write_str(name)
    }
}

/// Each event drains the queue exactly once.
#[derive(Clone)]
pub struct TeardownBridge {
    queue: DeliveryQueue,
    exit_after_signal: bool,
}

impl TeardownBridge {
    pub fn new(queue: DeliveryQueue) -> Self {
        Self {
            queue,
            exit_after_signal: false,
        }
    }

    /// Exit the process with the conventional status after draining on a
    /// signal. Installing a handler suppresses the default exit otherwise.
    pub fn exit_after_signal(mut self, exit: bool) -> Self {
        self.exit_after_signal = exit;
        self
    }

    pub fn notify(&self, event: TeardownEvent) -> DrainOutcome {
        let outcome = self.queue.drain();
        info!(event = %event, outcome = ?outcome, "drained log queue on teardown");
        outcome
    }

    fn handle(&self, event: TeardownEvent) {
        self.notify(event);
        if self.exit_after_signal {
            if let Some(code) = event.exit_code() {
                std::process::exit(code);
            }
        }
    }

    /// Listen for ctrl-c (and SIGTERM on unix) on the current runtime.
    pub fn install(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.listen().await })
    }

    #[cfg(unix)]
    async fn listen(self) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                None
            }
        };
        loop {
            let event = tokio::select! {
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => TeardownEvent::Interrupt,
                    Err(e) => {
                        warn!(error = %e, "failed to listen for Ctrl+C");
                        return;
                    }
                },
                Some(()) = recv_terminate(&mut terminate) => TeardownEvent::Terminate,
            };
            self.handle(event);
        }
    }

    #[cfg(not(unix))]
    async fn listen(self) {
        loop {
            match tokio::signal::ctrl_c().await {
                Ok(()) => self.handle(TeardownEvent::Interrupt),
                Err(e) => {
                    warn!(error = %e, "failed to listen for Ctrl+C");
                    return;
                }
            }
        }
    }
}

#[cfg(unix)]
async fn recv_terminate(stream: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match stream {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

/// Drains the queue when dropped, covering early returns and unwinding.
pub struct DrainGuard {
    queue: Option<DeliveryQueue>,
}

impl DrainGuard {
    pub fn new(queue: DeliveryQueue) -> Self {
        Self { queue: Some(queue) }
    }

    /// Drop without draining
    pub fn disarm(mut self) {
        self.queue = None;
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.drain();
        }
    }
}
