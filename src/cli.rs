//! Command-line surface.

use std::path::PathBuf;

use clap::Parser;

/// Modbus/TCP counter-acquisition core for ADAM-6000-series data loggers.
#[derive(Debug, Parser)]
#[command(name = "adam-counter-core", version, about)]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long)]
    pub config: PathBuf,

    /// Validate the configuration and exit without starting any worker.
    #[arg(long)]
    pub dry_run: bool,

    /// Force every device onto a simulated transport instead of real
    /// Modbus/TCP sockets, regardless of what the configuration says.
    #[arg(long)]
    pub demo_mode: bool,
}
