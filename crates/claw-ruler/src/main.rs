//! claw-ruler - Clawbernetes rule evaluation daemon
//!
//! Evaluates alerting and recording rules against a metrics datasource,
//! forwards alerts to Alertmanager and writes recorded series to remote
//! storage.

use clap::Parser;
use claw_ruler::app;
use claw_ruler::cli::{Cli, Commands, LogFormat};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::from_default_env()
        .add_directive("claw_ruler=info".parse()?)
        .add_directive("claw_rules=info".parse()?);
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
    }

    match cli.command {
        Commands::Run(args) => app::run(args).await?,
        Commands::Replay(args) => app::replay(args).await?,
        Commands::Check { rules } => app::check(&rules)?,
    }

    Ok(())
}
