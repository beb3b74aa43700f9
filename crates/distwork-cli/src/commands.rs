//! Command handlers for the distwork CLI

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::app::EchoApp;
use crate::cli::{Cli, Commands, RunArgs};
use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: AppConfig) -> Result<()> {
        match cli.command {
            Commands::Run(args) => Self::handle_run_command(config, args).await,
            Commands::Config => Self::handle_config_command(&config),
        }
    }

    /// Run the echo worker until Ctrl-C, then print its stats as JSON
    async fn handle_run_command(mut config: AppConfig, args: RunArgs) -> Result<()> {
        config.apply_overrides(&args)?;

        let stop = Arc::new(AtomicBool::new(false));
        let signal_flag = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, stopping worker");
                signal_flag.store(true, Ordering::SeqCst);
            }
        });

        let echo = tokio::task::spawn_blocking(move || {
            let mut app = EchoApp::new(&config)?;
            app.start()?;
            app.run(&stop)
        });
        let stats = echo
            .await
            .map_err(|e| CliError::EchoLoop(e.to_string()))??;

        println!("{}", serde_json::to_string_pretty(&stats)?);
        Ok(())
    }

    /// Print the effective configuration
    fn handle_config_command(config: &AppConfig) -> Result<()> {
        print!("{}", config.to_toml_string()?);
        Ok(())
    }
}
