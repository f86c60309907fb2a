//! Configuration system for flowtap
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation

use crate::intercept::InterceptSpec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete flowtap configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowtapConfig {
    /// Redirector settings
    pub redirector: RedirectorSettings,

    /// Privileged helper settings
    pub helper: HelperSettings,

    /// Tunnel channel settings
    pub tunnel: TunnelSettings,
}

/// Redirector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectorSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,

    /// Intercept specification active right after start
    pub intercept: String,
}

impl Default for RedirectorSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            intercept: "none".to_string(),
        }
    }
}

/// When `start` considers the tunnel provisioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningMode {
    /// Wait for the helper to report the tunnel ready before `start` returns
    #[default]
    Synchronous,

    /// Return after the handshake; the tunnel may come up later
    Eventual,
}

impl std::str::FromStr for ProvisioningMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "synchronous" | "sync" => Ok(ProvisioningMode::Synchronous),
            "eventual" => Ok(ProvisioningMode::Eventual),
            other => Err(ConfigError::ValidationError(format!(
                "Invalid provisioning mode: {}. Must be one of: [\"synchronous\", \"eventual\"]",
                other
            ))),
        }
    }
}

/// Privileged helper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperSettings {
    /// Helper executable; launched with the tunnel socket path as last argument
    pub program: Option<String>,

    /// Extra arguments placed before the socket path
    pub args: Vec<String>,

    /// Directory for the tunnel socket (defaults to the system temp dir)
    pub socket_dir: Option<String>,

    /// How long to wait for the helper to connect and complete the handshake
    pub handshake_timeout_ms: u64,

    /// Provisioning contract
    pub provisioning: ProvisioningMode,

    /// How long synchronous provisioning may take
    pub ready_timeout_ms: u64,

    /// How long to wait for the helper process to exit on shutdown
    pub shutdown_timeout_ms: u64,
}

impl Default for HelperSettings {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            socket_dir: None,
            handshake_timeout_ms: 10_000,
            provisioning: ProvisioningMode::Synchronous,
            ready_timeout_ms: 15_000,
            shutdown_timeout_ms: 2_000,
        }
    }
}

impl HelperSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Tunnel channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// Frames queued for the writer before senders wait
    pub outbound_capacity: usize,

    /// Decoded frames queued for the dispatcher before the reader stops
    pub inbound_capacity: usize,

    /// Longest accepted encoded frame, in bytes
    pub max_frame_len: usize,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            inbound_capacity: 256,
            max_frame_len: 1024 * 1024,
        }
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. FLOWTAP_CONFIG environment variable
    /// 3. <config dir>/flowtap/config.toml
    /// 4. /etc/flowtap/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<FlowtapConfig> {
        let mut config = match self.find_config_file() {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                self.load_from_file(&path)?
            }
            None => {
                debug!("No config file found, using defaults");
                FlowtapConfig::default()
            }
        };

        self.apply_env_overrides(&mut config)?;
        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("FLOWTAP_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("FLOWTAP_CONFIG path does not exist: {}", env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/flowtap/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(&self, path: &Path) -> ConfigResult<FlowtapConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: FlowtapConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut FlowtapConfig) -> ConfigResult<()> {
        if let Ok(val) = std::env::var("FLOWTAP_LOG_LEVEL") {
            config.redirector.log_level = val;
        }
        if let Ok(val) = std::env::var("FLOWTAP_INTERCEPT") {
            config.redirector.intercept = val;
        }
        if let Ok(val) = std::env::var("FLOWTAP_HELPER") {
            config.helper.program = Some(val);
        }
        if let Ok(val) = std::env::var("FLOWTAP_SOCKET_DIR") {
            config.helper.socket_dir = Some(val);
        }
        if let Ok(val) = std::env::var("FLOWTAP_PROVISIONING") {
            config.helper.provisioning = val.parse()?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self, config: &FlowtapConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.redirector.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.redirector.log_level, valid_levels
            )));
        }

        if let Err(e) = InterceptSpec::parse(&config.redirector.intercept) {
            return Err(ConfigError::ValidationError(e.to_string()));
        }

        if config.helper.handshake_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Handshake timeout cannot be 0".to_string(),
            ));
        }
        if config.helper.provisioning == ProvisioningMode::Synchronous
            && config.helper.ready_timeout_ms == 0
        {
            return Err(ConfigError::ValidationError(
                "Ready timeout cannot be 0 with synchronous provisioning".to_string(),
            ));
        }

        if config.tunnel.outbound_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "Outbound capacity cannot be 0".to_string(),
            ));
        }
        if config.tunnel.inbound_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "Inbound capacity cannot be 0".to_string(),
            ));
        }
        if config.tunnel.max_frame_len < 1024 {
            return Err(ConfigError::ValidationError(format!(
                "Max frame length too small: {} (minimum 1024)",
                config.tunnel.max_frame_len
            )));
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, config: &FlowtapConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        ::dirs::config_dir().map(|d| d.join("flowtap").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
