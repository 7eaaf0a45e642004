//! Channel configuration
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! no file at all) yields a working TCP-simulation setup.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use urlcast_shared::defaults;

/// Which transport backend carries the frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Use real RFCOMM Bluetooth (requires BlueZ)
    Rfcomm,
    /// Use TCP simulation (for development)
    #[default]
    Tcp,
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub mode: TransportMode,
    /// RFCOMM channel number
    pub channel: u8,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            channel: defaults::RFCOMM_CHANNEL,
        }
    }
}

/// Reconnect backoff parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub factor: u32,
    pub cap_ms: u64,
    /// Full jitter: wait a uniform random time in `[0, delay]`
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: defaults::BACKOFF_BASE_MS,
            factor: defaults::BACKOFF_FACTOR,
            cap_ms: defaults::BACKOFF_CAP_MS,
            jitter: true,
        }
    }
}

/// Configuration for one delivery channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Target device address (MAC for RFCOMM, `host:port` for TCP)
    pub endpoint: String,
    pub max_payload_bytes: usize,
    /// `None` means unbounded
    pub queue_capacity: Option<usize>,
    /// Events buffered for a slow or absent reader before new ones are dropped
    pub event_capacity: usize,
    pub heartbeat_interval_ms: u64,
    pub auto_reconnect: bool,
    pub io_timeout_ms: u64,
    pub backoff: BackoffConfig,
    pub transport: TransportConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: defaults::TCP_SIMULATION_ADDR.into(),
            max_payload_bytes: defaults::MAX_PAYLOAD_BYTES,
            queue_capacity: None,
            event_capacity: defaults::EVENT_CHANNEL_CAPACITY,
            heartbeat_interval_ms: defaults::HEARTBEAT_INTERVAL_MS,
            auto_reconnect: true,
            io_timeout_ms: defaults::IO_TIMEOUT_MS,
            backoff: BackoffConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl ChannelConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Load from `path` if it exists, otherwise use defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the channel cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            bail!("endpoint must not be empty");
        }
        if self.max_payload_bytes > u32::MAX as usize {
            bail!(
                "max_payload_bytes {} does not fit the 4-byte length prefix",
                self.max_payload_bytes
            );
        }
        if self.heartbeat_interval_ms == 0 {
            bail!("heartbeat_interval_ms must be greater than zero");
        }
        if self.event_capacity == 0 {
            bail!("event_capacity must be greater than zero");
        }
        if self.io_timeout_ms == 0 {
            bail!("io_timeout_ms must be greater than zero");
        }
        if self.backoff.factor < 1 {
            bail!("backoff.factor must be at least 1");
        }
        if self.backoff.cap_ms < self.backoff.base_ms {
            bail!(
                "backoff.cap_ms ({}) is below backoff.base_ms ({})",
                self.backoff.cap_ms,
                self.backoff.base_ms
            );
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChannelConfig::default();
        assert_eq!(config.max_payload_bytes, 65535);
        assert_eq!(config.queue_capacity, None);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.io_timeout(), Duration::from_secs(5));
        assert!(config.auto_reconnect);
        assert_eq!(config.backoff.base_ms, 1000);
        assert_eq!(config.backoff.factor, 2);
        assert_eq!(config.backoff.cap_ms, 30_000);
        assert_eq!(config.event_capacity, 1024);
        assert!(config.backoff.jitter);
        assert_eq!(config.transport.mode, TransportMode::Tcp);
        config.validate().expect("defaults should be valid");
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = ChannelConfig::from_toml_str("").unwrap();
        assert_eq!(config.endpoint, defaults::TCP_SIMULATION_ADDR);
    }

    #[test]
    fn test_parse_rfcomm_config() {
        let config = ChannelConfig::from_toml_str(
            r#"
            endpoint = "00:11:22:33:44:55"
            queue_capacity = 2
            auto_reconnect = false

            [backoff]
            jitter = false

            [transport]
            mode = "rfcomm"
            channel = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoint, "00:11:22:33:44:55");
        assert_eq!(config.queue_capacity, Some(2));
        assert!(!config.auto_reconnect);
        assert!(!config.backoff.jitter);
        assert_eq!(config.backoff.base_ms, defaults::BACKOFF_BASE_MS);
        assert_eq!(config.transport.mode, TransportMode::Rfcomm);
        assert_eq!(config.transport.channel, 3);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(ChannelConfig::from_toml_str("endpoint = \"\"").is_err());
        assert!(ChannelConfig::from_toml_str("heartbeat_interval_ms = 0").is_err());
        assert!(ChannelConfig::from_toml_str("io_timeout_ms = 0").is_err());
        assert!(ChannelConfig::from_toml_str("event_capacity = 0").is_err());
        assert!(ChannelConfig::from_toml_str("[backoff]\nfactor = 0").is_err());
        assert!(ChannelConfig::from_toml_str("[backoff]\nbase_ms = 5000\ncap_ms = 10").is_err());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(ChannelConfig::from_toml_str("[transport]\nmode = \"carrier-pigeon\"").is_err());
    }
}
