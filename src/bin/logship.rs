use clap::Parser;
use logship::cli::{commands, Cli, Commands};
use logship::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = commands::resolve_config(&cli)?;
    match cli.command {
        Commands::Send(args) => commands::execute_send(config, args).await?,
        Commands::Pipe(args) => commands::execute_pipe(config, args).await?,
    }

    Ok(())
}
