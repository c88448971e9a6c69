//! Configuration settings structures
//!
//! Defines the TOML-backed configuration tree and the runtime [`ShardConfig`]
//! handed to the server core.

use crate::stage::StageId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration structure
///
/// Root configuration object, serialized to/from TOML.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Shard-specific settings
    pub server: ServerSettings,
    /// Stage lifecycle settings
    pub stages: StageSettings,
    /// Optional logging configuration
    pub logging: Option<LoggingSettings>,
}

/// Shard configuration settings
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerSettings {
    /// Network address to bind the shard's listener to.
    ///
    /// Format: "IP:PORT"; port 0 is valid and lets the OS assign a free
    /// port (used by the tests).
    pub listen_addr: String,

    /// Shard name used in logs and registry snapshots
    pub name: String,

    /// Publicly reachable address advertised through the registry.
    /// Defaults to the listen address when empty.
    pub public_addr: String,

    /// Ordinal of this shard within its world, drives the season rotation
    pub ordinal: u8,

    /// Seconds of silence before the idle reaper logs a session out.
    ///
    /// The observed deployments disagree on the exact constant, so it is
    /// configurable rather than hard-coded.
    pub idle_timeout_secs: u64,

    /// Idle-reaper tick interval in seconds
    pub reaper_interval_secs: u64,

    /// Capacity of the acceptor-to-registrar hand-off queue
    pub handoff_capacity: usize,

    /// Capacity of each session's outbound send queue
    pub send_queue_capacity: usize,
}

/// Stage lifecycle settings
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StageSettings {
    /// Capacity assigned to stages created implicitly on first entry
    pub default_max_players: u16,

    /// Stage the "back" operation falls through to on an empty history stack
    pub home_stage_id: String,

    /// Poll attempts before a binary wait gives up with an empty result
    pub binary_wait_retries: u32,

    /// Milliseconds between binary-wait poll attempts
    pub binary_wait_interval_ms: u64,
}

/// Logging system configuration
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LoggingSettings {
    /// Logging level filter: "trace", "debug", "info", "warn", "error"
    pub level: String,

    /// Enable JSON-formatted log output
    pub json_format: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                listen_addr: "127.0.0.1:54001".to_string(),
                name: "channel-1".to_string(),
                public_addr: String::new(),
                ordinal: 0,
                idle_timeout_secs: 30,
                reaper_interval_secs: 10,
                handoff_capacity: 64,
                send_queue_capacity: 64,
            },
            stages: StageSettings {
                default_max_players: 127,
                home_stage_id: "sl1Ns200p0a0u0".to_string(),
                binary_wait_retries: 10,
                binary_wait_interval_ms: 500,
            },
            logging: Some(LoggingSettings { level: "info".to_string(), json_format: false }),
        }
    }
}

/// Runtime configuration consumed by the server core.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Address the listener binds; port 0 is valid (OS-assigned)
    pub bind_address: SocketAddr,
    /// Shard name used in logs and snapshots
    pub name: String,
    /// Address advertised through the registry
    pub public_addr: String,
    /// Ordinal within the world, drives the season rotation
    pub ordinal: u8,
    /// Idle timeout before the reaper logs a session out
    pub idle_timeout: Duration,
    /// Reaper tick interval
    pub reaper_interval: Duration,
    /// Acceptor hand-off queue capacity
    pub handoff_capacity: usize,
    /// Per-session send queue capacity
    pub send_queue_capacity: usize,
    /// Capacity for implicitly created stages
    pub default_max_players: u16,
    /// Fallback stage for the "back" operation
    pub home_stage_id: StageId,
    /// Binary-wait retry budget
    pub binary_wait_retries: u32,
    /// Binary-wait poll interval
    pub binary_wait_interval: Duration,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Config::default().to_shard_config().expect("default config is valid")
    }
}

impl Config {
    /// Builds the runtime shard configuration from the parsed file.
    pub fn to_shard_config(&self) -> anyhow::Result<ShardConfig> {
        let bind_address: SocketAddr = self.server.listen_addr.parse()?;
        let public_addr = if self.server.public_addr.is_empty() {
            self.server.listen_addr.clone()
        } else {
            self.server.public_addr.clone()
        };
        Ok(ShardConfig {
            bind_address,
            name: self.server.name.clone(),
            public_addr,
            ordinal: self.server.ordinal,
            idle_timeout: Duration::from_secs(self.server.idle_timeout_secs),
            reaper_interval: Duration::from_secs(self.server.reaper_interval_secs),
            handoff_capacity: self.server.handoff_capacity.max(1),
            send_queue_capacity: self.server.send_queue_capacity.max(1),
            default_max_players: self.stages.default_max_players,
            home_stage_id: StageId(self.stages.home_stage_id.clone()),
            binary_wait_retries: self.stages.binary_wait_retries,
            binary_wait_interval: Duration::from_millis(self.stages.binary_wait_interval_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, "127.0.0.1:54001");
        assert_eq!(config.server.idle_timeout_secs, 30);
        assert_eq!(config.server.reaper_interval_secs, 10);
        assert_eq!(config.stages.default_max_players, 127);
        assert!(config.logging.is_some());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.server.listen_addr, deserialized.server.listen_addr);
        assert_eq!(config.server.name, deserialized.server.name);
        assert_eq!(config.stages.home_stage_id, deserialized.stages.home_stage_id);
    }

    #[test]
    fn test_shard_config_conversion() {
        let mut config = Config::default();
        config.server.listen_addr = "0.0.0.0:0".to_string();
        let shard = config.to_shard_config().unwrap();
        assert_eq!(shard.bind_address.port(), 0);
        assert_eq!(shard.public_addr, "0.0.0.0:0");
        assert_eq!(shard.idle_timeout, Duration::from_secs(30));
        assert_eq!(shard.home_stage_id, StageId::from("sl1Ns200p0a0u0"));
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
[server]
listen_addr = "127.0.0.1:54002"
name = "channel-2"
public_addr = "203.0.113.5:54002"
ordinal = 1
idle_timeout_secs = 45
reaper_interval_secs = 5
handoff_capacity = 32
send_queue_capacity = 128

[stages]
default_max_players = 64
home_stage_id = "sl1Ns200p0a0u0"
binary_wait_retries = 20
binary_wait_interval_ms = 250

[logging]
level = "debug"
json_format = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.name, "channel-2");
        assert_eq!(config.server.idle_timeout_secs, 45);
        let shard = config.to_shard_config().unwrap();
        assert_eq!(shard.public_addr, "203.0.113.5:54002");
        assert_eq!(shard.binary_wait_retries, 20);
    }
}
