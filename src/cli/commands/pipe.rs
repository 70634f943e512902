use anyhow::Result;
use serde_json::{Map, Value as JsonValue};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use super::connect;
use crate::bridge::{DrainGuard, TeardownBridge};
use crate::cli::PipeArgs;
use crate::config::ShipperConfig;
use crate::entry::Level;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub level: Level,
    pub message: String,
    pub metadata: Option<JsonValue>,
}

/// Turn one input line into entry parts. Blank lines yield `None`.
///
/// In JSON mode an object line contributes `level` and `message` (or `msg`)
/// and the remaining fields become metadata; anything else is plain text.
pub fn parse_line(line: &str, default_level: Level, json: bool) -> Option<ParsedLine> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.trim().is_empty() {
        return None;
    }
    let plain = || ParsedLine {
        level: default_level,
        message: trimmed.to_string(),
        metadata: None,
    };
    if !json {
        return Some(plain());
    }

    let mut object: Map<String, JsonValue> = match serde_json::from_str(trimmed) {
        Ok(JsonValue::Object(object)) => object,
        _ => return Some(plain()),
    };
    let level = match object.remove("level") {
        Some(JsonValue::String(s)) => s.parse().unwrap_or(default_level),
        _ => default_level,
    };
    let message = match object.remove("message").or_else(|| object.remove("msg")) {
        Some(JsonValue::String(s)) => s,
        Some(other) => other.to_string(),
        None => trimmed.to_string(),
    };
    let metadata = (!object.is_empty()).then(|| JsonValue::Object(object));
    Some(ParsedLine {
        level,
        message,
        metadata,
    })
}

pub async fn execute_pipe(config: ShipperConfig, args: PipeArgs) -> Result<()> {
    let logger = connect(&config).await?;
    TeardownBridge::new(logger.queue().clone())
        .exit_after_signal(true)
        .install();
    // Covers early returns from a broken stdin
    let guard = DrainGuard::new(logger.queue().clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut count = 0usize;
    while let Some(line) = lines.next_line().await? {
        if let Some(parsed) = parse_line(&line, args.level, args.json) {
            let metadata = parsed.metadata.map(Value::from);
            logger.log(parsed.level, parsed.message, metadata.as_ref());
            count += 1;
        }
        if args.tee {
            println!("{}", line);
        }
    }

    guard.disarm();
    logger.shutdown().await;
    info!(entries = count, "stdin closed, queue flushed");
    Ok(())
}
