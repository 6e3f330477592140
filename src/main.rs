//! Sandbox orchestrator daemon entry point.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cmd;

#[derive(Parser)]
#[command(name = "sandboxd")]
#[command(about = "Sandbox orchestrator control plane")]
#[command(version)]
struct Cli {
    /// Enable debug logging, overriding MATRX_LOG_LEVEL.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sandbox_daemon={log_level}").into()),
        )
        .init();

    info!("starting sandbox orchestrator v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = cmd::root::run().await {
        error!("daemon error: {e}");
        std::process::exit(1);
    }

    Ok(())
}
