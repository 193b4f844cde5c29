//! Server configuration module
//!
//! Handles loading and parsing of server configuration from files and environment variables.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::broadcast::AreaConfig;
use crate::crypto::PacketKeys;
use crate::protocol::obfuscation::ObfuscationMode;
use crate::protocol::version::{PacketVersion, MIN_SUPPORTED_VERSION};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Server name used in logs
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Address the zone listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Zone listener port (TCP)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client protocol version (date-coded, e.g. 20101124)
    #[serde(default = "default_packet_version")]
    pub packet_version: u32,

    /// Opcode obfuscation mode
    #[serde(default)]
    pub obfuscation: ObfuscationMode,

    /// Opcode obfuscation keys
    #[serde(default = "default_packet_keys")]
    pub packet_keys: [u32; 3],

    /// Radius of area broadcasts, in cells
    #[serde(default = "default_area_size")]
    pub area_size: i16,

    /// Radius of chat broadcasts, in cells
    #[serde(default = "default_chat_area_size")]
    pub chat_area_size: i16,

    /// Radius of broadcasts around dead entities, in cells
    #[serde(default = "default_dead_area_size")]
    pub dead_area_size: i16,

    /// Simulation tick rate in milliseconds
    #[serde(default = "default_tick_rate")]
    pub tick_rate_ms: u64,

    /// Maximum number of connected sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Where newly connected characters are placed
    #[serde(default)]
    pub spawn: SpawnPoint,
}

/// Placement of freshly connected characters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnPoint {
    #[serde(default = "default_spawn_map")]
    pub map: u16,
    #[serde(default = "default_spawn_coord")]
    pub x: i16,
    #[serde(default = "default_spawn_coord")]
    pub y: i16,
}

// Default value functions
fn default_server_name() -> String {
    "Zone".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5121
}

fn default_packet_version() -> u32 {
    20101124
}

fn default_packet_keys() -> [u32; 3] {
    [0x053D5CED, 0x3DED6DED, 0x6DED6DED]
}

fn default_area_size() -> i16 {
    14
}

fn default_chat_area_size() -> i16 {
    9
}

fn default_dead_area_size() -> i16 {
    32
}

fn default_tick_rate() -> u64 {
    50
}

fn default_max_sessions() -> usize {
    1024
}

fn default_spawn_map() -> u16 {
    1
}

fn default_spawn_coord() -> i16 {
    150
}

impl Default for SpawnPoint {
    fn default() -> Self {
        Self {
            map: default_spawn_map(),
            x: default_spawn_coord(),
            y: default_spawn_coord(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/zone.toml"),
            server_name: default_server_name(),
            bind_address: default_bind_address(),
            port: default_port(),
            packet_version: default_packet_version(),
            obfuscation: ObfuscationMode::default(),
            packet_keys: default_packet_keys(),
            area_size: default_area_size(),
            chat_area_size: default_chat_area_size(),
            dead_area_size: default_dead_area_size(),
            tick_rate_ms: default_tick_rate(),
            max_sessions: default_max_sessions(),
            spawn: SpawnPoint::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        let config_path = env::var("ZONE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/zone.toml"));

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

            Self::from_toml(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config.config_path = config_path;

        // Override with environment variables
        config.apply_env_overrides();

        config.validate()?;

        Ok(config)
    }

    /// Parse a configuration document without touching the environment
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("ZONE_SERVER_NAME") {
            self.server_name = val;
        }
        if let Ok(val) = env::var("ZONE_BIND_ADDRESS") {
            self.bind_address = val;
        }
        if let Ok(val) = env::var("ZONE_PORT") {
            if let Ok(port) = val.parse() {
                self.port = port;
            }
        }
        if let Ok(val) = env::var("ZONE_PACKET_VERSION") {
            if let Ok(version) = val.parse() {
                self.packet_version = version;
            }
        }
        if let Ok(val) = env::var("ZONE_OBFUSCATION") {
            match val.parse() {
                Ok(mode) => self.obfuscation = mode,
                Err(e) => tracing::warn!("Ignoring ZONE_OBFUSCATION: {}", e),
            }
        }
        if let Ok(val) = env::var("ZONE_MAX_SESSIONS") {
            if let Ok(max) = val.parse() {
                self.max_sessions = max;
            }
        }
        if let Ok(val) = env::var("ZONE_TICK_RATE_MS") {
            if let Ok(rate) = val.parse() {
                self.tick_rate_ms = rate;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.area_size <= 0 || self.chat_area_size <= 0 || self.dead_area_size <= 0 {
            anyhow::bail!("Broadcast radii must be positive");
        }

        if self.dead_area_size < self.area_size {
            anyhow::bail!("dead_area_size must not be smaller than area_size");
        }

        if self.tick_rate_ms < 10 || self.tick_rate_ms > 1000 {
            anyhow::bail!("Tick rate must be between 10ms and 1000ms");
        }

        if self.max_sessions == 0 {
            anyhow::bail!("max_sessions must be at least 1");
        }

        if self.packet_version < MIN_SUPPORTED_VERSION.0 {
            anyhow::bail!(
                "Packet version {} is older than the oldest supported client ({})",
                self.packet_version,
                MIN_SUPPORTED_VERSION.0
            );
        }

        if self.obfuscation != ObfuscationMode::Disabled && self.packet_keys.iter().all(|k| *k == 0)
        {
            anyhow::bail!("Opcode obfuscation requires non-zero packet keys");
        }

        Ok(())
    }

    /// Client protocol version as a typed value
    pub fn version(&self) -> PacketVersion {
        PacketVersion(self.packet_version)
    }

    /// Opcode obfuscation keys
    pub fn keys(&self) -> PacketKeys {
        PacketKeys::new(
            self.packet_keys[0],
            self.packet_keys[1],
            self.packet_keys[2],
        )
    }

    /// Broadcast radii
    pub fn areas(&self) -> AreaConfig {
        AreaConfig {
            area_size: self.area_size,
            chat_area_size: self.chat_area_size,
            dead_area_size: self.dead_area_size,
        }
    }

    /// Address the listener binds to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.server_name, "Zone");
        assert_eq!(config.port, 5121);
        assert_eq!(config.area_size, 14);
        assert_eq!(config.chat_area_size, 9);
        assert_eq!(config.dead_area_size, 32);
        assert_eq!(config.tick_rate_ms, 50);
        assert_eq!(config.obfuscation, ObfuscationMode::Disabled);
    }

    #[test]
    fn test_parse_toml() {
        let config = ServerConfig::from_toml(
            r#"
            port = 6900
            packet_version = 20091103
            obfuscation = "auto"
            area_size = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 6900);
        assert_eq!(config.packet_version, 20091103);
        assert_eq!(config.obfuscation, ObfuscationMode::Auto);
        assert_eq!(config.area_size, 10);
        assert_eq!(config.dead_area_size, 32);
        assert_eq!(config.listen_addr(), "0.0.0.0:6900");
    }

    #[test]
    fn test_validation() {
        let mut config = ServerConfig::default();
        assert!(config.validate().is_ok());

        config.area_size = 0;
        assert!(config.validate().is_err());
        config.area_size = 40;
        assert!(config.validate().is_err());
        config.area_size = 14;

        config.tick_rate_ms = 5;
        assert!(config.validate().is_err());
        config.tick_rate_ms = 50;

        config.obfuscation = ObfuscationMode::Always;
        config.packet_keys = [0, 0, 0];
        assert!(config.validate().is_err());
        config.packet_keys = default_packet_keys();
        assert!(config.validate().is_ok());

        config.packet_version = 20040101;
        assert!(config.validate().is_err());
    }
}
