use crate::config::ShipperConfig;
use crate::entry::{generate_trace_id, Level, LogEntry};
use crate::host::{classify_host, HostIndicators};
use crate::queue::{
    BeaconTransport, BlockingHttpTransport, DeliveryError, DeliveryQueue, FlushOutcome,
};
use crate::sender::{EndpointCache, HttpSender};
use crate::serialize::{serialize, SerializeOptions};
use crate::value::Value;
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;

/// Application-facing logging handle.
///
/// Metadata is serialized at the call site, so later mutation of the value
/// does not change what gets shipped.
#[derive(Clone)]
pub struct Logger {
    queue: DeliveryQueue,
    source: String,
    min_level: Level,
    trace_id: Option<String>,
    options: SerializeOptions,
}

impl Logger {
    pub fn new(queue: DeliveryQueue, source: impl Into<String>) -> Self {
        Self {
            queue,
            source: source.into(),
            min_level: Level::Debug,
            trace_id: None,
            options: SerializeOptions::default().with_non_enumerable(true),
        }
    }

    /// Wire the full stack (HTTP sender, endpoint cache, teardown
    /// transports, queue) from configuration. Must run inside a tokio
    /// runtime for the periodic flush to start.
    pub fn from_config(config: &ShipperConfig) -> Result<Self> {
        let cache = Arc::new(EndpointCache::new(config.endpoint_ttl()));
        let sender = HttpSender::new(config.sender_config()?, Arc::clone(&cache))
            .map_err(anyhow::Error::msg)?;

        let host_profile = config
            .host_profile
            .unwrap_or_else(|| classify_host(&HostIndicators::from_env()));
        let mut builder = DeliveryQueue::builder(Arc::new(sender))
            .host_profile(host_profile)
            .config(config.queue_config())
            .endpoint_cache(cache);
        if config.teardown_beacon {
            builder =
                builder.teardown_transport(BeaconTransport::new().with_token(config.token.clone()));
        }
        let queue = builder
            .teardown_transport(BlockingHttpTransport::new().with_token(config.token.clone()))
            .build();

        Ok(Self::new(queue, config.source.clone())
            .with_min_level(config.min_level)
            .with_serialize_options(
                SerializeOptions::default()
                    .with_non_enumerable(true)
                    .with_max_depth(config.max_depth),
            ))
    }

    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }

    pub fn with_serialize_options(mut self, options: SerializeOptions) -> Self {
        self.options = options;
        self
    }

    /// Child logger sharing the queue, stamping every entry with `trace_id`
    pub fn with_trace_id(&self, trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
            ..self.clone()
        }
    }

    pub fn with_new_trace(&self) -> Self {
        self.with_trace_id(generate_trace_id())
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    pub fn min_level(&self) -> Level {
        self.min_level
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub fn enabled(&self, level: Level) -> bool {
        level >= self.min_level
    }

    fn entry(&self, level: Level, message: String, metadata: Option<&Value>) -> LogEntry {
        let mut entry = LogEntry::new(level, message, self.source.clone());
        if let Some(trace_id) = &self.trace_id {
            entry = entry.with_trace_id(trace_id.clone());
        }
        if let Some(value) = metadata {
            entry = entry.with_metadata(serialize(value, &self.options));
        }
        entry
    }

    pub fn log(&self, level: Level, message: impl Into<String>, metadata: Option<&Value>) {
        if self.enabled(level) {
            self.queue.add(self.entry(level, message.into(), metadata));
        }
    }

    pub fn debug(&self, message: impl Into<String>, metadata: Option<&Value>) {
        self.log(Level::Debug, message, metadata);
    }

    pub fn info(&self, message: impl Into<String>, metadata: Option<&Value>) {
        self.log(Level::Info, message, metadata);
    }

    pub fn warn(&self, message: impl Into<String>, metadata: Option<&Value>) {
        self.log(Level::Warn, message, metadata);
    }

    pub fn error(&self, message: impl Into<String>, metadata: Option<&Value>) {
        self.log(Level::Error, message, metadata);
    }

    /// Log and flush immediately, returning the flush outcome. A filtered
    /// level yields `FlushOutcome::Empty` without touching the queue.
    // Serializes before the returned future exists so it stays `Send`.
    pub fn log_and_wait(
        &self,
        level: Level,
        message: impl Into<String>,
        metadata: Option<&Value>,
    ) -> impl Future<Output = Result<FlushOutcome, DeliveryError>> + Send + '_ {
        let entry = self
            .enabled(level)
            .then(|| self.entry(level, message.into(), metadata));
        async move {
            match entry {
                Some(entry) => self.queue.add_and_wait(entry).await,
                None => Ok(FlushOutcome::Empty),
            }
        }
    }

    /// Stop background flushing and make one final delivery attempt.
    pub async fn shutdown(&self) {
        self.queue.destroy().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostProfile;
    use crate::queue::QueueConfig;
    use crate::sender::{LogSender, SendError};
    use crate::serialize::SerializedNode;
    use crate::value::{Property, Record};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingSender {
        entries: Mutex<Vec<LogEntry>>,
    }

    #[async_trait::async_trait]
    impl LogSender for CapturingSender {
        async fn send(&self, entries: &[LogEntry]) -> Result<(), SendError> {
            self.entries.lock().unwrap().extend_from_slice(entries);
            Ok(())
        }

        async fn resolve_endpoint(&self) -> Result<String, SendError> {
            Ok("http://capture.test".into())
        }
    }

    fn logger() -> (Logger, Arc<CapturingSender>) {
        let sender = Arc::new(CapturingSender::default());
        let queue = DeliveryQueue::builder(sender.clone())
            .host_profile(HostProfile::Persistent)
            .config(QueueConfig {
                batch_size: 100,
                ..QueueConfig::default()
            })
            .build();
        (Logger::new(queue, "api"), sender)
    }

    #[tokio::test]
    async fn level_methods_stamp_level_and_source() {
        let (logger, sender) = logger();
        logger.debug("d", None);
        logger.info("i", None);
        logger.warn("w", None);
        logger.error("e", None);
        assert_eq!(logger.queue().pending_count(), 4);

        logger.queue().flush().await.unwrap();
        let entries = sender.entries.lock().unwrap();
        let levels: Vec<Level> = entries.iter().map(|e| e.level).collect();
        assert_eq!(levels, Level::all());
        assert!(entries.iter().all(|e| e.source == "api"));
    }

    #[tokio::test]
    async fn entries_below_min_level_are_discarded() {
        let (logger, sender) = logger();
        let logger = logger.with_min_level(Level::Warn);
        logger.info("quiet", None);
        logger.warn("loud", None);
        assert_eq!(logger.queue().pending_count(), 1);

        assert_eq!(
            logger.log_and_wait(Level::Debug, "nope", None).await,
            Ok(FlushOutcome::Empty)
        );
        logger.queue().flush().await.unwrap();
        let entries = sender.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "loud");
        assert_eq!(entries[0].level, Level::Warn);
        assert_eq!(entries[0].source, "api");
    }

    #[tokio::test]
    async fn metadata_is_captured_at_call_time() {
        let (logger, sender) = logger();
        let meta = Value::record([("attempt", 1)]);
        logger.info("retrying", Some(&meta));
        meta.as_object().unwrap().set("attempt", 2);

        logger.queue().flush().await.unwrap();
        let entries = sender.entries.lock().unwrap();
        let node = entries[0].metadata.as_ref().unwrap();
        assert_eq!(node.get("attempt"), Some(&SerializedNode::Number(1.0)));
    }

    #[tokio::test]
    async fn metadata_includes_non_enumerable_properties() {
        let (logger, sender) = logger();
        let mut record = Record::new();
        record.set("visible", 1);
        record.define("hidden", Property::hidden(Value::from("shh")));
        logger.info("ctx", Some(&record.into_value()));

        logger.queue().flush().await.unwrap();
        let entries = sender.entries.lock().unwrap();
        let node = entries[0].metadata.as_ref().unwrap();
        assert!(node.get("visible").is_some());
        assert_eq!(node.get("hidden"), Some(&SerializedNode::String("shh".into())));
    }

    #[tokio::test]
    async fn trace_ids_propagate_to_children() {
        let (logger, sender) = logger();
        let traced = logger.with_new_trace();
        let id = traced.trace_id().unwrap().to_string();
        assert_eq!(id.len(), 32);
        assert!(logger.trace_id().is_none());

        traced.info("in request", None);
        logger.info("outside", None);
        let outcome = traced.log_and_wait(Level::Error, "failed", None).await;
        assert_eq!(outcome, Ok(FlushOutcome::Sent(3)));

        let entries = sender.entries.lock().unwrap();
        assert_eq!(entries[0].trace_id.as_deref(), Some(id.as_str()));
        assert_eq!(entries[1].trace_id, None);
        assert_eq!(entries[2].trace_id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn from_config_requires_endpoint() {
        let err = Logger::from_config(&ShipperConfig::default()).err().unwrap();
        assert!(err.to_string().contains("No collector endpoint"));
    }

    #[tokio::test]
    async fn from_config_applies_settings() {
        let config = ShipperConfig {
            endpoint: Some("http://127.0.0.1:9/ingest".into()),
            source: "billing".into(),
            min_level: Level::Warn,
            host_profile: Some(HostProfile::Ephemeral),
            ..ShipperConfig::default()
        };
        let logger = Logger::from_config(&config).unwrap();
        assert_eq!(logger.source(), "billing");
        assert_eq!(logger.min_level(), Level::Warn);
        assert_eq!(logger.queue().host_profile(), HostProfile::Ephemeral);
        assert!(!logger.queue().auto_flush_active());
    }
}
