//! Configuration parsing and management.
//!
//! The daemon reads a single TOML file. Every field has a default, so an
//! empty file (or no file at all) yields a working regtest server on
//! `127.0.0.1:8888` with durable saves disabled.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::ReferencePolicy;
use crate::types::Network;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Compiler settings.
    #[serde(default)]
    pub compiler: CompilerConfig,

    /// Durable contract store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Export signing.
    #[serde(default)]
    pub auth: AuthConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The TOML is invalid or names an unknown key
    /// - `max_message_bytes` is zero
    /// - `auth.key_hex` is not hex or is shorter than 16 bytes
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_message_bytes == 0 {
            return Err(ConfigError::Validation(
                "server.max_message_bytes must be positive".to_string(),
            ));
        }
        if self.server.idle_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "server.idle_timeout_secs must be positive".to_string(),
            ));
        }
        self.auth.key()?;
        Ok(())
    }
}

/// Listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the websocket and HTTP endpoints listen on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Seconds a connection may stay silent before it is closed.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Largest accepted client frame.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl ServerConfig {
    /// Idle timeout as a duration.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8888))
}

const fn default_idle_timeout_secs() -> u64 {
    300
}

const fn default_max_message_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

/// Compiler configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompilerConfig {
    /// Network addresses are encoded for.
    #[serde(default)]
    pub network: Network,

    /// Handling of contract references to addresses a session never
    /// compiled.
    #[serde(default)]
    pub reference_policy: ReferencePolicy,
}

/// Durable store configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Root directory for saved contracts. Saves are disabled when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Export signing configuration.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Hex-encoded HMAC key. A random key is generated per process when
    /// unset, so signed exports do not survive a restart. Never written
    /// back out by [`DaemonConfig::to_toml`].
    #[serde(default, skip_serializing)]
    pub key_hex: Option<String>,
}

impl AuthConfig {
    /// Shortest accepted key, in bytes.
    pub const MIN_KEY_LEN: usize = 16;

    /// Decodes the configured key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the key is not hex or is too
    /// short.
    pub fn key(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        let Some(text) = &self.key_hex else {
            return Ok(None);
        };
        let key = hex::decode(text.trim())
            .map_err(|e| ConfigError::Validation(format!("auth.key_hex is not hex: {e}")))?;
        if key.len() < Self::MIN_KEY_LEN {
            return Err(ConfigError::Validation(format!(
                "auth.key_hex must decode to at least {} bytes, got {}",
                Self::MIN_KEY_LEN,
                key.len()
            )));
        }
        Ok(Some(key))
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("key_hex", &self.key_hex.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
