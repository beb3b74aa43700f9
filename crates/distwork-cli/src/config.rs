//! distwork CLI Configuration Management
//!
//! Configuration is layered with the priority order:
//! command line flags > configuration file (TOML) > defaults.

use std::path::Path;

use distwork_core::WorkerConfig;
use serde::{Deserialize, Serialize};

use crate::cli::RunArgs;
use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the echo worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Worker identity, heartbeat, pipe and link settings
    pub worker: WorkerConfig,

    /// Peers to register before starting
    pub peers: PeersConfig,
}

/// Endpoints of the peers the worker talks to; absent peers are not registered
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersConfig {
    /// Broker endpoint to dial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,

    /// Endpoint the left-neighbour link listens on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left: Option<String>,

    /// Right-neighbour endpoint to dial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right: Option<String>,
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CliError::Config(format!(
                "Failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config = Self::from_toml(&text)?;
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `run` flags on top of the loaded values
    pub fn apply_overrides(&mut self, args: &RunArgs) -> Result<()> {
        if let Some(identity) = &args.identity {
            self.worker.identity = identity.clone();
        }
        if let Some(interval_ms) = args.heartbeat_ms {
            self.worker.heartbeat.interval_ms = interval_ms;
        }
        if args.broker.is_some() {
            self.peers.broker = args.broker.clone();
        }
        if args.left.is_some() {
            self.peers.left = args.left.clone();
        }
        if args.right.is_some() {
            self.peers.right = args.right.clone();
        }
        self.validate()
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        self.worker.validate().map_err(CliError::Config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [worker]
            identity = "stage-2"

            [peers]
            broker = "tcp://127.0.0.1:5555"
            "#,
        )
        .unwrap();

        assert_eq!(config.worker.identity, "stage-2");
        assert_eq!(config.worker.heartbeat.interval_ms, 2500);
        assert_eq!(config.peers.broker.as_deref(), Some("tcp://127.0.0.1:5555"));
        assert!(config.peers.left.is_none());
    }

    #[test]
    fn test_flags_override_file_values() {
        let mut config = AppConfig::from_toml(
            r#"
            [worker]
            identity = "from-file"

            [peers]
            right = "tcp://127.0.0.1:6000"
            "#,
        )
        .unwrap();

        config
            .apply_overrides(&RunArgs {
                identity: Some("from-flag".into()),
                heartbeat_ms: Some(100),
                left: Some("tcp://0.0.0.0:6001".into()),
                ..RunArgs::default()
            })
            .unwrap();

        assert_eq!(config.worker.identity, "from-flag");
        assert_eq!(config.worker.heartbeat.interval_ms, 100);
        assert_eq!(config.peers.right.as_deref(), Some("tcp://127.0.0.1:6000"));
        assert_eq!(config.peers.left.as_deref(), Some("tcp://0.0.0.0:6001"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let empty_identity = AppConfig::from_toml("[worker]\nidentity = \"\"\n");
        assert!(matches!(empty_identity, Err(CliError::Config(_))));

        let mut config = AppConfig::default();
        let zero_heartbeat = config.apply_overrides(&RunArgs {
            heartbeat_ms: Some(0),
            ..RunArgs::default()
        });
        assert!(zero_heartbeat.is_err());

        assert!(matches!(
            AppConfig::from_toml("worker = 3"),
            Err(CliError::TomlParsing(_))
        ));
    }

    #[test]
    fn test_printed_config_reloads() {
        let mut config = AppConfig::default();
        config.peers.broker = Some("tcp://broker:5555".into());
        let text = config.to_toml_string().unwrap();
        assert_eq!(AppConfig::from_toml(&text).unwrap(), config);
    }
}
