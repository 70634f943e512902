use anyhow::{Context, Result};

use super::connect;
use crate::cli::SendArgs;
use crate::config::ShipperConfig;
use crate::queue::FlushOutcome;
use crate::value::Value;

pub async fn execute_send(config: ShipperConfig, args: SendArgs) -> Result<()> {
    let meta: Option<serde_json::Value> = args
        .meta
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .context("--meta is not valid JSON")?;

    let logger = connect(&config).await?;
    let logger = match args.trace_id.as_deref() {
        Some("") => logger.with_new_trace(),
        Some(id) => logger.with_trace_id(id),
        None => logger,
    };

    let outcome = {
        let meta = meta.map(Value::from);
        logger.log_and_wait(args.level, args.message, meta.as_ref())
    }
    .await;
    logger.shutdown().await;

    match outcome.context("Failed to deliver log entry")? {
        FlushOutcome::Sent(n) => eprintln!("Sent {} entr{}", n, if n == 1 { "y" } else { "ies" }),
        FlushOutcome::Empty => eprintln!(
            "Entry below minimum level {}, nothing sent",
            logger.min_level()
        ),
        FlushOutcome::InFlight => eprintln!("Entry queued behind an in-flight batch"),
    }
    if let Some(trace_id) = logger.trace_id() {
        eprintln!("Trace id: {}", trace_id);
    }
    Ok(())
}
