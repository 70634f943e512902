//! Retry policy for collector traffic.
//!
//! One [`RetryBudget`] covers a whole delivery: endpoint discovery and the
//! batch POST draw attempts from the same pool, so a slow discovery leaves
//! fewer tries for the upload instead of doubling the worst-case latency.
//! A collector that answers with `Retry-After` sets the pause itself, up to
//! [`RetryPolicy::max_retry_after`].

use chrono::{DateTime, Utc};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Debug, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^retry` plus up to half of that again as jitter, never above `cap`
    Exponential { base: Duration, cap: Duration },
}

impl Backoff {
    /// Pause before retry number `retry` (0 for the first retry)
    pub fn pause(&self, retry: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential { base, cap } => {
                let base_ms = base.as_millis() as u64;
                let grown = base_ms.saturating_mul(2_u64.saturating_pow(retry));
                let jitter = match grown / 2 {
                    0 => 0,
                    spread => rand::thread_rng().gen_range(0..=spread),
                };
                Duration::from_millis(grown.saturating_add(jitter)).min(*cap)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total tries per delivery, discovery included. Zero behaves like one.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Longest server-requested pause that is honored; longer hints are clamped
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(200),
                cap: Duration::from_secs(2),
            },
            max_retry_after: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(delay),
            ..Self::default()
        }
    }

    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn with_max_retry_after(mut self, limit: Duration) -> Self {
        self.max_retry_after = limit;
        self
    }

    pub fn budget(&self) -> RetryBudget<'_> {
        RetryBudget {
            policy: self,
            used: 0,
        }
    }
}

/// Errors that know whether trying again can help
pub trait Transient {
    fn is_transient(&self) -> bool;

    /// Pause the remote side asked for, if any
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Attempts left for one delivery
pub struct RetryBudget<'a> {
    policy: &'a RetryPolicy,
    used: u32,
}

impl RetryBudget<'_> {
    pub fn attempts_used(&self) -> u32 {
        self.used
    }

    fn exhausted(&self) -> bool {
        self.used >= self.policy.max_attempts.max(1)
    }

    fn pause_for<E: Transient>(&self, error: &E) -> Duration {
        match error.retry_after() {
            Some(hint) => hint.min(self.policy.max_retry_after),
            None => self.policy.backoff.pause(self.used.saturating_sub(1)),
        }
    }

    /// Run `operation` until it succeeds, fails permanently or the budget
    /// runs out. Each call spends at least one attempt, even on an exhausted
    /// budget, so the caller always sees a real outcome.
    pub async fn run<F, Fut, T, E>(&mut self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + std::fmt::Display,
    {
        loop {
            self.used += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && !self.exhausted() => {
                    let pause = self.pause_for(&e);
                    debug!(
                        attempt = self.used,
                        max = self.policy.max_attempts,
                        pause_ms = pause.as_millis() as u64,
                        error = %e,
                        "collector request failed, retrying"
                    );
                    tokio::time::sleep(pause).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP-date.
/// Dates in the past mean "now".
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some(
        (at.with_timezone(&Utc) - now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}
