//! Command-line argument parsing
//!
//! Defines the command-line interface for the channel server using the clap
//! crate. Arguments override settings from the configuration file.

use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments for the channel server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    ///
    /// Path to the TOML configuration file. If the file doesn't exist,
    /// a default configuration will be created.
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Shard listen address
    ///
    /// Override the listen address from the configuration file.
    /// Format: "IP:PORT" (port 0 lets the OS pick one)
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Shard name
    ///
    /// Override the shard name from the configuration file.
    #[arg(short, long)]
    pub name: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: PathBuf::from("config.toml"),
            listen: None,
            name: None,
            debug: false,
        }
    }
}

impl Args {
    /// Applies command-line overrides onto a parsed configuration.
    pub fn apply_overrides(&self, config: &mut super::Config) {
        if let Some(listen) = &self.listen {
            config.server.listen_addr = listen.clone();
        }
        if let Some(name) = &self.name {
            config.server.name = name.clone();
        }
    }
}
