//! policyserve binary.
//!
//! Entry point for serving a policy checkpoint over the tensor RPC protocol,
//! fronting it with the JSON gateway, and talking to either from the command line.

use anyhow::{Context, Result};
use clap::Parser;
use policyserve_core::{
    cli::{
        self,
        commands::{Commands, LoggingArgs},
    },
    config::{ConfigArgs, Settings},
};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = cli::init_logging(&cli.logging)?;

    info!("policyserve {} starting up", env!("CARGO_PKG_VERSION"));
    let settings = Settings::load(&cli.config).context("Failed to load configuration")?;

    match cli.command {
        Commands::Serve(cmd) => cli::handle_serve(settings, cmd).await,
        Commands::Gateway(cmd) => cli::handle_gateway(settings, cmd).await,
        Commands::Predict(cmd) => cli::handle_predict(settings, cmd).await,
        Commands::Check(cmd) => cli::handle_check(settings, cmd).await,
        Commands::Bridge(cmd) => cli::handle_bridge(settings, cmd).await,
        Commands::Config => cli::handle_config(&settings),
    }
}
