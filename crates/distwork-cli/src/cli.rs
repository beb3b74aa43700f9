//! Command-line interface definitions and parsing

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an echo worker until Ctrl-C
    Run(RunArgs),
    /// Print the effective configuration as TOML
    Config,
}

/// Flags of `distwork run`; each one overrides the configuration file
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Worker identity
    #[arg(short, long)]
    pub identity: Option<String>,

    /// Broker endpoint to dial (tcp://host:port)
    #[arg(short, long)]
    pub broker: Option<String>,

    /// Endpoint to listen on for the left neighbour
    #[arg(short, long)]
    pub left: Option<String>,

    /// Endpoint of the right neighbour to dial
    #[arg(short, long)]
    pub right: Option<String>,

    /// Heartbeat interval in milliseconds
    #[arg(long)]
    pub heartbeat_ms: Option<u64>,
}
