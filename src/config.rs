//! # Configuration Management
//!
//! Centralized configuration for the relay mesh library.
//!
//! This module provides structured configuration for hosts and joiners,
//! including port layout, identity seeding, lobby timing, and trust options.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides
//!
//! ## Port Layout
//! All ports are derived from `base_port` and a peer's wire id:
//! the rendezvous listener binds `base_port`, mesh listeners bind
//! `base_port + (id - init_id)`, and direct side-channel acceptors bind
//! `base_port - 2 - (id - init_id)`. Validation keeps these ranges from
//! colliding for the configured member limit.

use crate::error::{MeshError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default rendezvous port.
pub const DEFAULT_BASE_PORT: u16 = 25994;

/// Default seed for suggested wire ids. The host takes this id; the first
/// joiner is suggested the next one up.
pub const DEFAULT_INIT_ID: i32 = 1337;

/// Default lobby countdown, in seconds.
pub const DEFAULT_COUNTDOWN_SECS: u32 = 5;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct MeshConfig {
    /// Network identity and port layout
    #[serde(default)]
    pub network: NetworkConfig,

    /// Lobby negotiation settings
    #[serde(default)]
    pub lobby: LobbyConfig,

    /// Mesh establishment settings
    #[serde(default)]
    pub mesh: MeshSetupConfig,

    /// Trust policy settings
    #[serde(default)]
    pub trust: TrustConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MeshConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| MeshError::Config(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| MeshError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| MeshError::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("RELAY_MESH_BASE_PORT") {
            if let Ok(val) = port.parse::<u16>() {
                config.network.base_port = val;
            }
        }

        if let Ok(id) = std::env::var("RELAY_MESH_INIT_ID") {
            if let Ok(val) = id.parse::<i32>() {
                config.network.init_id = val;
            }
        }

        if let Ok(secs) = std::env::var("RELAY_MESH_COUNTDOWN_SECS") {
            if let Ok(val) = secs.parse::<u32>() {
                config.lobby.countdown_secs = val;
            }
        }

        if let Ok(timeout) = std::env::var("RELAY_MESH_CONNECT_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.lobby.connect_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(fallback) = std::env::var("RELAY_MESH_ADDRESS_FALLBACK") {
            if let Ok(val) = fallback.parse::<bool>() {
                config.trust.accept_address_fallback = val;
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| MeshError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| MeshError::Config(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.network.validate(self.lobby.max_members));
        errors.extend(self.lobby.validate());
        errors.extend(self.mesh.validate());
        errors.extend(self.logging.validate());

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(MeshError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Network identity and port layout
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Address listeners bind to
    pub bind_addr: IpAddr,

    /// Address announced to other peers in topology handoff
    pub advertise_addr: IpAddr,

    /// Rendezvous port; mesh and direct ports are derived from it
    pub base_port: u16,

    /// Seed for suggested wire ids; the host claims this id
    pub init_id: i32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            advertise_addr: IpAddr::from([127, 0, 0, 1]),
            base_port: DEFAULT_BASE_PORT,
            init_id: DEFAULT_INIT_ID,
        }
    }
}

impl NetworkConfig {
    /// Validate network configuration
    pub fn validate(&self, max_members: usize) -> Vec<String> {
        let mut errors = Vec::new();

        if self.base_port < 1024 {
            errors.push(format!(
                "Base port too low: {} (ports below 1024 are privileged)",
                self.base_port
            ));
        }

        // Mesh ports grow upward from base_port, direct ports grow downward
        // from base_port - 2. Both ranges must stay within u16.
        let members = max_members as i32;
        if i32::from(self.base_port) + members > i32::from(u16::MAX) {
            errors.push(format!(
                "Mesh port range overflows: base_port {} with {} members",
                self.base_port, max_members
            ));
        }
        if i32::from(self.base_port) - 2 - members < 1024 {
            errors.push(format!(
                "Direct port range underflows: base_port {} with {} members",
                self.base_port, max_members
            ));
        }

        if self.init_id <= 0 {
            errors.push(format!(
                "init_id must be positive (got {})",
                self.init_id
            ));
        } else if self.init_id == i32::MAX {
            errors.push("init_id collides with the reserved sentinel id".to_string());
        }

        errors
    }
}

/// Lobby negotiation settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LobbyConfig {
    /// Countdown length once every member is ready, in seconds
    pub countdown_secs: u32,

    /// Timeout for a joiner's rendezvous connection attempt
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Maximum number of lobby members, local peer included
    pub max_members: usize,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            countdown_secs: DEFAULT_COUNTDOWN_SECS,
            connect_timeout: Duration::from_secs(5),
            max_members: 32,
        }
    }
}

impl LobbyConfig {
    /// Validate lobby configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.countdown_secs > 3600 {
            errors.push(format!(
                "Countdown too long: {}s (maximum: 1 hour)",
                self.countdown_secs
            ));
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Connect timeout too long (maximum: 300s)".to_string());
        }

        if self.max_members < 2 {
            errors.push("Max members must be at least 2".to_string());
        } else if self.max_members > 1024 {
            errors.push(format!(
                "Max members very high: {} (the relay tree is meant for tens of peers)",
                self.max_members
            ));
        }

        errors
    }
}

/// Mesh establishment settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MeshSetupConfig {
    /// Total time allowed for the full connection matrix to form
    #[serde(with = "duration_serde")]
    pub establish_timeout: Duration,

    /// Delay between connection attempts to peers that are not listening yet
    #[serde(with = "duration_serde")]
    pub poll_interval: Duration,
}

impl Default for MeshSetupConfig {
    fn default() -> Self {
        Self {
            establish_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl MeshSetupConfig {
    /// Validate mesh establishment configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.establish_timeout.as_millis() < 100 {
            errors.push("Establish timeout too short (minimum: 100ms)".to_string());
        } else if self.establish_timeout.as_secs() > 300 {
            errors.push("Establish timeout too long (maximum: 300s)".to_string());
        }

        if self.poll_interval.as_millis() < 1 {
            errors.push("Poll interval too short (minimum: 1ms)".to_string());
        } else if self.poll_interval > self.establish_timeout {
            errors.push("Poll interval cannot exceed the establish timeout".to_string());
        }

        errors
    }
}

/// Trust policy settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TrustConfig {
    /// Accept inbound side-channel connections whose announced id does not
    /// match the expected peer at that address, matching by address instead.
    /// Useful behind NAT where several peers share an address. Off by default.
    #[serde(default)]
    pub accept_address_fallback: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("relay-mesh"),
            log_level: Level::INFO,
            log_to_console: true,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
