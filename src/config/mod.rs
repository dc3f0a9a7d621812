//! # Configuration Management Module
//!
//! TOML configuration for the relay, loaded once at startup.
//!
//! ## Configuration Structure
//!
//! - [`RelayConfig`] - Hop limit, retry and expiry policy, queue pacing, companion list bounds
//! - [`MeshtasticConfig`] - Gateway radio serial port and mesh channel
//! - [`CompanionConfig`] - Serial port the companion process is attached to
//! - [`StorageConfig`] - Location of the mail database
//! - [`LoggingConfig`] - Log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshmail::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     println!("Hop limit: {}", config.relay.hop_limit);
//!     println!("Serial Port: {}", config.meshtastic.port);
//!
//!     // Create default configuration
//!     Config::create_default("config.toml").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [relay]
//! hop_limit = 7
//! retry_interval_secs = 300
//! expiry_secs = 21600
//!
//! [meshtastic]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! channel = 0
//!
//! [companion]
//! enabled = true
//! port = "/dev/ttyACM0"
//! baud_rate = 115200
//!
//! [storage]
//! data_dir = "./data"
//!
//! [logging]
//! level = "info"
//! file = "meshmail.log"
//! ```
//!
//! Every section and key is optional; missing values fall back to the defaults above.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Meshtastic firmware refuses hop limits above this.
pub const MAX_HOP_LIMIT: u32 = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Maximum number of relays a mail may pass through.
    pub hop_limit: u32,
    /// Seconds to wait after a transmission before trying again.
    pub retry_interval_secs: u64,
    /// Seconds after origination at which undelivered mail is abandoned.
    pub expiry_secs: u64,
    /// Queue processor sleep when there is nothing to send (ms).
    pub idle_poll_ms: u64,
    /// Gap between consecutive transmissions within one batch (ms).
    pub send_pacing_ms: u64,
    pub inbox_list_default: usize,
    pub inbox_list_max: usize,
    /// Largest encoded mesh frame the radio accepts.
    pub max_payload_bytes: usize,
    /// Interval for periodic relay stats logging (0 disables).
    pub stats_interval_secs: u64,
    pub shutdown_timeout_ms: u64,
    pub identity_attempts: u32,
    pub identity_retry_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            hop_limit: MAX_HOP_LIMIT,
            retry_interval_secs: 300,
            expiry_secs: 6 * 60 * 60,
            idle_poll_ms: 1000,
            send_pacing_ms: 1000,
            inbox_list_default: 50,
            inbox_list_max: 200,
            max_payload_bytes: 230,
            stats_interval_secs: 300,
            shutdown_timeout_ms: 5000,
            identity_attempts: 5,
            identity_retry_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshtasticConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Channel index used for every mesh transmission.
    pub channel: u8,
}

impl Default for MeshtasticConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            channel: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    pub enabled: bool,
    pub port: String,
    pub baud_rate: u32,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 115200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
        }
    }
}

impl StorageConfig {
    /// Sled database directory.
    pub fn mail_db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("mailstore")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshmail.log".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub meshtastic: MeshtasticConfig,
    #[serde(default)]
    pub companion: CompanionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config
            .validate()
            .map_err(|e| anyhow!("Invalid config file {}: {}", path, e))?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let relay = &self.relay;
        if relay.hop_limit == 0 || relay.hop_limit > MAX_HOP_LIMIT {
            return Err(anyhow!(
                "relay.hop_limit must be between 1 and {} (got {})",
                MAX_HOP_LIMIT,
                relay.hop_limit
            ));
        }
        if relay.retry_interval_secs == 0 {
            return Err(anyhow!("relay.retry_interval_secs must be positive"));
        }
        if relay.expiry_secs <= relay.retry_interval_secs {
            return Err(anyhow!(
                "relay.expiry_secs ({}) must exceed relay.retry_interval_secs ({})",
                relay.expiry_secs,
                relay.retry_interval_secs
            ));
        }
        if relay.max_payload_bytes == 0 {
            return Err(anyhow!("relay.max_payload_bytes must be positive"));
        }
        if relay.inbox_list_default == 0 || relay.inbox_list_default > relay.inbox_list_max {
            return Err(anyhow!(
                "relay.inbox_list_default must be between 1 and relay.inbox_list_max ({})",
                relay.inbox_list_max
            ));
        }
        Ok(())
    }

    /// Runtime view of the relay policy.
    pub fn relay_settings(&self) -> RelaySettings {
        let relay = &self.relay;
        RelaySettings {
            hop_limit: relay.hop_limit,
            retry_interval: Duration::from_secs(relay.retry_interval_secs),
            expiry_window: Duration::from_secs(relay.expiry_secs),
            idle_poll: Duration::from_millis(relay.idle_poll_ms),
            send_pacing: Duration::from_millis(relay.send_pacing_ms),
            inbox_list_default: relay.inbox_list_default,
            inbox_list_max: relay.inbox_list_max,
            max_payload_bytes: relay.max_payload_bytes,
            stats_interval: Duration::from_secs(relay.stats_interval_secs),
            shutdown_timeout: Duration::from_millis(relay.shutdown_timeout_ms),
            identity_attempts: relay.identity_attempts,
            identity_retry: Duration::from_millis(relay.identity_retry_ms),
            channel: self.meshtastic.channel,
        }
    }
}

/// Relay policy handed to the engine, queue processor and companion channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub hop_limit: u32,
    pub retry_interval: Duration,
    pub expiry_window: Duration,
    pub idle_poll: Duration,
    pub send_pacing: Duration,
    pub inbox_list_default: usize,
    pub inbox_list_max: usize,
    pub max_payload_bytes: usize,
    /// Zero disables periodic stats.
    pub stats_interval: Duration,
    pub shutdown_timeout: Duration,
    pub identity_attempts: u32,
    pub identity_retry: Duration,
    pub channel: u8,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Config::default().relay_settings()
    }
}

impl RelaySettings {
    /// Clamp a companion supplied list limit: absent or non-positive means the default,
    /// anything above the maximum is capped.
    pub fn inbox_limit(&self, requested: Option<i64>) -> usize {
        match requested {
            Some(n) if n > 0 => (n as u64).min(self.inbox_list_max as u64) as usize,
            _ => self.inbox_list_default,
        }
    }
}
