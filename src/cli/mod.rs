//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Serving a checkpoint and fronting it with the JSON gateway
//! - One-shot predictions and backend checks
//! - The stdin/stdout robot bridge

pub mod commands;
pub mod handlers;

pub use handlers::{
    handle_bridge, handle_check, handle_config, handle_gateway, handle_predict, handle_serve,
};

use anyhow::{Context, Result};
use commands::LoggingArgs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

/// Install the global subscriber. Console output goes to stderr so that
/// subcommands can use stdout for data. The returned guard must be held for
/// the lifetime of the process when a log file is configured.
pub fn init_logging(args: &LoggingArgs) -> Result<Option<WorkerGuard>> {
    let level = args.get_effective_level();
    let directives = args
        .log_filter
        .clone()
        .unwrap_or_else(|| format!("policyserve_core={0},policyserve={0}", level));
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .parse_lossy(directives);

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true);

    let (file_layer, guard) = match &args.log_file {
        Some(dir) => {
            let appender = RollingFileAppender::new(Rotation::NEVER, dir, "policyserve.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .compact();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;
    Ok(guard)
}
