//! distwork CLI library
//!
//! Components of the `distwork` binary: argument parsing, layered
//! configuration and the echo worker it runs.

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use app::EchoApp;
pub use cli::{Cli, Commands};
pub use config::{AppConfig, PeersConfig};
pub use error::{CliError, Result};
