mod pipe;
mod send;

pub use pipe::{execute_pipe, parse_line, ParsedLine};
pub use send::execute_send;

use crate::cli::Cli;
use crate::config::ShipperConfig;
use crate::logger::Logger;
use anyhow::Result;
use tracing::warn;

/// Load config and apply global CLI overrides
pub fn resolve_config(cli: &Cli) -> Result<ShipperConfig> {
    let mut config = ShipperConfig::load(cli.config.as_deref())?;
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = Some(endpoint.clone());
    }
    if let Some(source) = &cli.source {
        config.source = source.clone();
    }
    Ok(config)
}

/// Build a logger and resolve its endpoint up front, so that a teardown
/// before the first flush still has somewhere to send.
pub async fn connect(config: &ShipperConfig) -> Result<Logger> {
    let logger = Logger::from_config(config)?;
    if let Err(e) = logger.queue().resolve_endpoint().await {
        warn!(error = %e, "could not resolve collector endpoint yet");
    }
    Ok(logger)
}
