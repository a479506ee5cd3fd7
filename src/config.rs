//! Configuration for the SFU
//!
//! Loaded from a TOML file; every field has a default so a partial file is
//! enough to boot a development instance.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Media engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// RPC server configuration
    #[serde(default)]
    pub rpc: RpcConfig,

    /// TURN credential configuration
    #[serde(default)]
    pub turn: TurnConfig,
}

/// Media engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Public IP advertised as the host candidate
    #[serde(default = "default_address")]
    pub address: String,

    /// Network interface the ICE agent is restricted to
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Lower bound of the ephemeral UDP port range
    #[serde(default = "default_port_min")]
    pub port_min: u16,

    /// Upper bound of the ephemeral UDP port range
    #[serde(default = "default_port_max")]
    pub port_max: u16,

    /// Log filter applied when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_interface() -> String {
    "lo".to_string()
}

fn default_port_min() -> u16 {
    10000
}

fn default_port_max() -> u16 {
    20000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            interface: default_interface(),
            port_min: default_port_min(),
            port_max: default_port_max(),
            log_level: default_log_level(),
        }
    }
}

/// RPC server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// HTTP bind port
    #[serde(default = "default_rpc_port")]
    pub port: u16,
}

fn default_rpc_port() -> u16 {
    7000
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            port: default_rpc_port(),
        }
    }
}

/// TURN credential configuration (coturn static-auth-secret scheme)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// TURN server URL handed to clients, e.g. "turn:turn.example.com:3478"
    #[serde(default)]
    pub host: String,

    /// Shared secret, must match the relay's static-auth-secret
    #[serde(default)]
    pub secret: String,

    /// Credential lifetime in seconds
    #[serde(default = "default_turn_ttl")]
    pub ttl_seconds: u64,
}

fn default_turn_ttl() -> u64 {
    86400
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            secret: String::new(),
            ttl_seconds: default_turn_ttl(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            rpc: RpcConfig::default(),
            turn: TurnConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from the file if it exists, defaults otherwise
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.rpc.port, 7000);
        assert_eq!(config.engine.port_min, 10000);
        assert_eq!(config.engine.port_max, 20000);
        assert_eq!(config.turn.ttl_seconds, 86400);
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[engine]
address = "203.0.113.7"
interface = "eth0"
port_min = 30000
port_max = 40000

[rpc]
port = 7001

[turn]
host = "turn:turn.example.com:3478"
secret = "shared-secret"
ttl_seconds = 3600
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.engine.address, "203.0.113.7");
        assert_eq!(config.engine.interface, "eth0");
        assert_eq!(config.engine.port_min, 30000);
        assert_eq!(config.rpc.port, 7001);
        assert_eq!(config.turn.host, "turn:turn.example.com:3478");
        assert_eq!(config.turn.ttl_seconds, 3600);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str("[rpc]\nport = 9000\n").unwrap();
        assert_eq!(config.rpc.port, 9000);
        assert_eq!(config.engine.interface, "lo");
        assert_eq!(config.turn.ttl_seconds, 86400);
    }
}
