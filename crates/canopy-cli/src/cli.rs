//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// canopy - carve a repository into parallel containerized workspaces
#[derive(Parser, Debug)]
#[command(name = "canopy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, env = "CANOPY_DEBUG")]
    pub debug: bool,

    /// Configuration file (defaults to ~/.canopy/config.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "4710")]
        port: u16,
    },
    /// Run host diagnostics and exit
    Doctor,
}
