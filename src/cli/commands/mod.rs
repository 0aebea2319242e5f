pub mod client;
pub mod server;

pub use client::{BridgeCommand, CheckCommand, PredictCommand};
pub use server::{GatewayCommand, ServeCommand};

use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Serve a checkpoint over the tensor RPC protocol
    Serve(ServeCommand),
    /// Run the JSON gateway in front of a tensor RPC server
    Gateway(GatewayCommand),
    /// Run one observation through the configured backend
    Predict(PredictCommand),
    /// Build the configured backend and report its health
    Check(CheckCommand),
    /// Answer joint states with target commands over JSON lines on stdin/stdout
    Bridge(BridgeCommand),
    /// Print the resolved configuration
    Config,
}

/// Logging options shared by every subcommand.
#[derive(Debug, Clone, Default, Args)]
pub struct LoggingArgs {
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Tracing filter directives, e.g. "policyserve_core=debug,tower_http=info"
    #[arg(long, global = true, env = "POLICYSERVE_LOG")]
    pub log_filter: Option<String>,

    /// Also write logs to `policyserve.log` in this directory
    #[arg(long, global = true, value_name = "DIR")]
    pub log_file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn get_effective_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
