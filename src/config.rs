use crate::entry::Level;
use crate::host::HostProfile;
use crate::queue::QueueConfig;
use crate::sender::{EndpointSource, HttpSenderConfig};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILENAME: &str = "logship.toml";

/// Shipper settings, read from TOML and then overridden by `LOGSHIP_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShipperConfig {
    pub endpoint: Option<String>,
    pub discovery_url: Option<String>,
    pub token: Option<String>,
    pub source: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub requeue_limit: usize,
    pub max_depth: usize,
    pub min_level: Level,
    pub gzip: bool,
    /// Forces a host profile instead of detecting it
    pub host_profile: Option<HostProfile>,
    pub endpoint_ttl_secs: u64,
    /// Try a fire-and-forget beacon before the blocking send when draining
    pub teardown_beacon: bool,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        let queue = QueueConfig::default();
        Self {
            endpoint: None,
            discovery_url: None,
            token: None,
            source: "logship".to_string(),
            batch_size: queue.batch_size,
            flush_interval_ms: queue.flush_interval.as_millis() as u64,
            requeue_limit: queue.requeue_limit,
            max_depth: crate::serialize::DEFAULT_MAX_DEPTH,
            min_level: Level::Info,
            gzip: false,
            host_profile: None,
            endpoint_ttl_secs: crate::sender::endpoint::DEFAULT_ENDPOINT_TTL.as_secs(),
            teardown_beacon: false,
        }
    }
}

impl ShipperConfig {
    /// Load from `path`, or from the first default location that exists,
    /// then apply the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => load_config_from_path(path)?,
            None => match default_config_paths().into_iter().find(|p| p.is_file()) {
                Some(found) => load_config_from_path(found)?,
                None => Self::default(),
            },
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write {}", path.as_ref().display()))?;
        Ok(())
    }

    /// Override fields from `LOGSHIP_*` variables
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(v) = var("LOGSHIP_ENDPOINT") {
            self.endpoint = Some(v);
        }
        if let Some(v) = var("LOGSHIP_DISCOVERY_URL") {
            self.discovery_url = Some(v);
        }
        if let Some(v) = var("LOGSHIP_TOKEN") {
            self.token = Some(v);
        }
        if let Some(v) = var("LOGSHIP_SOURCE") {
            self.source = v;
        }
        if let Some(v) = var("LOGSHIP_BATCH_SIZE") {
            self.batch_size = v
                .parse()
                .with_context(|| format!("LOGSHIP_BATCH_SIZE is not a number: {}", v))?;
        }
        if let Some(v) = var("LOGSHIP_FLUSH_INTERVAL_MS") {
            self.flush_interval_ms = v
                .parse()
                .with_context(|| format!("LOGSHIP_FLUSH_INTERVAL_MS is not a number: {}", v))?;
        }
        if let Some(v) = var("LOGSHIP_MIN_LEVEL") {
            self.min_level = v.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(v) = var("LOGSHIP_GZIP") {
            self.gzip = parse_bool(&v)
                .with_context(|| format!("LOGSHIP_GZIP is not a boolean: {}", v))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.flush_interval_ms == 0 {
            bail!("flush_interval_ms must be greater than 0");
        }
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            requeue_limit: self.requeue_limit,
            ..QueueConfig::default()
        }
    }

    /// A fixed endpoint wins over discovery.
    pub fn endpoint_source(&self) -> Result<EndpointSource> {
        match (&self.endpoint, &self.discovery_url) {
            (Some(url), _) => Ok(EndpointSource::Fixed(url.clone())),
            (None, Some(url)) => Ok(EndpointSource::Discovery(url.clone())),
            (None, None) => bail!(
                "No collector endpoint configured. Set `endpoint` or `discovery_url` in {}, or LOGSHIP_ENDPOINT.",
                CONFIG_FILENAME
            ),
        }
    }

    pub fn sender_config(&self) -> Result<HttpSenderConfig> {
        let mut config = HttpSenderConfig::new(self.endpoint_source()?).with_gzip(self.gzip);
        if let Some(token) = &self.token {
            config = config.with_token(token.clone());
        }
        Ok(config)
    }

    pub fn endpoint_ttl(&self) -> Duration {
        Duration::from_secs(self.endpoint_ttl_secs)
    }
}

pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<ShipperConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
    let config: ShipperConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.as_ref().display()))?;
    Ok(config)
}

/// `./logship.toml`, then `<config dir>/logship/config.toml`
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILENAME)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("logship").join("config.toml"));
    }
    paths
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got '{}'", other),
    }
}
