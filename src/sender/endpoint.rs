//! Shared cache for the resolved collector URL.
//!
//! The sender writes it after every successful resolution; the queue only
//! reads it, mostly from the teardown path where no further resolution is
//! possible.

use std::sync::Mutex;
use std::time::Duration;

/// Default TTL before the sender re-resolves the endpoint (5 minutes).
pub const DEFAULT_ENDPOINT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct CachedEndpoint {
    url: String,
    /// Last refresh timestamp in milliseconds since epoch.
    refreshed_ms: u64,
}

/// Last resolved endpoint with a TTL.
#[derive(Debug)]
pub struct EndpointCache {
    inner: Mutex<Option<CachedEndpoint>>,
    ttl_ms: u64,
}

impl Default for EndpointCache {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT_TTL)
    }
}

impl EndpointCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(None),
            ttl_ms: ttl.as_millis() as u64,
        }
    }

    /// Last stored URL, even if stale.
    pub fn get(&self) -> Option<String> {
        self.lock().as_ref().map(|cached| cached.url.clone())
    }

    /// Stored URL only while it is younger than the TTL.
    pub fn get_if_fresh(&self) -> Option<String> {
        self.get_if_fresh_at(current_time_ms())
    }

    pub fn store(&self, url: impl Into<String>) {
        self.store_at(url, current_time_ms());
    }

    fn get_if_fresh_at(&self, now_ms: u64) -> Option<String> {
        let guard = self.lock();
        guard
            .as_ref()
            .filter(|cached| self.is_fresh(cached, now_ms))
            .map(|cached| cached.url.clone())
    }

    fn store_at(&self, url: impl Into<String>, now_ms: u64) {
        *self.lock() = Some(CachedEndpoint {
            url: url.into(),
            refreshed_ms: now_ms,
        });
    }

    /// Check whether the cached value is fresh at `now_ms`.
    pub fn is_fresh_at(&self, now_ms: u64) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|cached| self.is_fresh(cached, now_ms))
    }

    fn is_fresh(&self, cached: &CachedEndpoint, now_ms: u64) -> bool {
        now_ms.saturating_sub(cached.refreshed_ms) < self.ttl_ms
    }

    // A poisoned lock still holds a usable URL.
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<CachedEndpoint>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Get current time in milliseconds since epoch.
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cache_has_nothing() {
        let cache = EndpointCache::default();
        assert!(cache.get().is_none());
        assert!(cache.get_if_fresh().is_none());
        assert!(!cache.is_fresh_at(current_time_ms()));
    }

    #[test]
    fn fresh_immediately_after_store() {
        let cache = EndpointCache::default();
        cache.store("https://collector.example.com/ingest");
        assert_eq!(
            cache.get_if_fresh().as_deref(),
            Some("https://collector.example.com/ingest")
        );
    }

    #[test]
    fn stale_value_is_still_returned_by_get() {
        let cache = EndpointCache::new(Duration::from_secs(60));
        cache.store_at("https://old.example.com", 1_000);

        let later = 1_000 + 61_000;
        assert!(!cache.is_fresh_at(later));
        assert!(cache.get_if_fresh_at(later).is_none());
        assert_eq!(cache.get().as_deref(), Some("https://old.example.com"));
    }

    #[test]
    fn ttl_boundary_is_exclusive() {
        let cache = EndpointCache::new(Duration::from_millis(500));
        cache.store_at("u", 10_000);
        assert!(cache.is_fresh_at(10_499));
        assert!(!cache.is_fresh_at(10_500));
    }

    #[test]
    fn store_replaces_previous_value() {
        let cache = EndpointCache::default();
        cache.store("https://a.example.com");
        cache.store("https://b.example.com");
        assert_eq!(cache.get().as_deref(), Some("https://b.example.com"));
    }
}
