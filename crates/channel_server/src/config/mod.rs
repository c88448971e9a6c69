//! Configuration module for the channel server.
//!
//! Handles command-line arguments, TOML configuration parsing, and the
//! runtime [`ShardConfig`] consumed by the server core.

pub mod args;
pub mod settings;

pub use args::Args;
pub use settings::{Config, LoggingSettings, ServerSettings, ShardConfig, StageSettings};

use anyhow::{Context, Result};

/// Load configuration from file or create default configuration
///
/// Attempts to load configuration from the specified file. If the file does
/// not exist, a default configuration file is written and the defaults are
/// returned. Runs before logging is initialized (the `[logging]` section
/// configures it), so failures are reported through the returned error only.
///
/// # Arguments
/// * `args` - Command line arguments containing the config file path
///
/// # Errors
/// * Returns error if file I/O operations fail
/// * Returns error if TOML parsing fails
pub async fn load_config(args: &Args) -> Result<Config> {
    if args.config.exists() {
        let config_str = tokio::fs::read_to_string(&args.config).await?;
        toml::de::from_str::<Config>(&config_str)
            .with_context(|| format!("Failed to parse config file {}", args.config.display()))
    } else {
        let default_config = Config::default();
        let config_str = toml::to_string_pretty(&default_config)?;
        tokio::fs::write(&args.config, config_str).await?;

        Ok(default_config)
    }
}
