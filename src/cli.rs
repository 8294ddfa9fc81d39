use clap::Parser;
use std::path::PathBuf;

/// Command-line interface for the usage dashboard backend.
#[derive(Debug, Parser)]
#[command(author, version, about = "Realtime Claude usage analytics server", long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file (defaults to ./usage-dashboard.toml if present).
    #[arg(long, value_name = "FILE")]
    pub config_path: Option<PathBuf>,
    /// Skip populating the usage cache at startup.
    #[arg(long)]
    pub no_warm: bool,
}
