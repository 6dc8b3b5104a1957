//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `host.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - NetworkConfig: UDP ports, receive timeout, stale device timeout.
//!     - WebConfig: where the dashboard is served.
//!     - MarketConfig: BTC price / block height sources and refresh rate.
//!     - FirmwareConfig: release lookup and refresh rate.
//!     - LoggingConfig: default log level (RUST_LOG overrides it).
//!
//! ==============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;

use crate::firmware::DEFAULT_RELEASE_URL;
use crate::lifecycle::IngestConfig;
use crate::market::{DEFAULT_BLOCK_HEIGHT_URL, DEFAULT_PRICE_URL};

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HostConfig {
    pub network: NetworkConfig,
    pub web: WebConfig,
    pub market: MarketConfig,
    pub firmware: FirmwareConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_ip: IpAddr,
    /// status port; config = base + 1, command = base + 2
    pub base_port: u16,
    pub recv_timeout_ms: u64,
    pub stale_timeout_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub stop_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WebConfig {
    pub bind_ip: IpAddr,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MarketConfig {
    pub enabled: bool,
    pub update_seconds: u64,
    pub price_url: String,
    pub block_height_url: String,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FirmwareConfig {
    pub enabled: bool,
    pub release_url: String,
    pub update_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

/// where the active configuration came from
#[derive(Debug, Clone)]
pub enum ConfigOrigin {
    File(PathBuf),
    /// a candidate file existed but could not be used
    Fallback { path: PathBuf, error: String },
    Defaults,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            base_port: 12345,
            recv_timeout_ms: 100,
            stale_timeout_seconds: 300,
            sweep_interval_seconds: 10,
            stop_timeout_seconds: 5,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 7877,
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            update_seconds: 1800,
            price_url: DEFAULT_PRICE_URL.to_string(),
            block_height_url: DEFAULT_BLOCK_HEIGHT_URL.to_string(),
            request_timeout_seconds: 10,
        }
    }
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            release_url: DEFAULT_RELEASE_URL.to_string(),
            update_seconds: 6 * 3600,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl NetworkConfig {
    pub fn status_port(&self) -> u16 {
        self.base_port
    }

    pub fn config_port(&self) -> u16 {
        self.base_port.saturating_add(1)
    }

    pub fn command_port(&self) -> u16 {
        self.base_port.saturating_add(2)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            bind_ip: self.bind_ip,
            status_port: self.status_port(),
            config_port: self.config_port(),
            recv_timeout: Duration::from_millis(self.recv_timeout_ms),
            stop_timeout: Duration::from_secs(self.stop_timeout_seconds),
        }
    }
}

impl WebConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config {}: {}", path.display(), e))?;

        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback
    pub fn load_or_default() -> (Self, ConfigOrigin) {
        let paths = [
            PathBuf::from("config").join("host.toml"),
            PathBuf::from("..").join("config").join("host.toml"),
        ];

        for path in paths {
            if path.exists() {
                return match Self::load(&path) {
                    Ok(config) => (config, ConfigOrigin::File(path)),
                    Err(e) => (
                        Self::default(),
                        ConfigOrigin::Fallback {
                            path,
                            error: format!("{e:#}"),
                        },
                    ),
                };
            }
        }

        (Self::default(), ConfigOrigin::Defaults)
    }

    /// explicit path if given, otherwise the usual search
    pub fn resolve(path: Option<&Path>) -> anyhow::Result<(Self, ConfigOrigin)> {
        match path {
            Some(path) => Ok((Self::load(path)?, ConfigOrigin::File(path.to_path_buf()))),
            None => Ok(Self::load_or_default()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.network.base_port.checked_add(2).is_none() {
            bail!(
                "base_port {} leaves no room for the config and command ports",
                self.network.base_port
            );
        }
        if self.network.recv_timeout_ms == 0 {
            bail!("recv_timeout_ms must be greater than zero");
        }
        Ok(())
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        let net = &self.network;
        tracing::info!(
            status_port = net.status_port(),
            config_port = net.config_port(),
            command_port = net.command_port(),
            stale_timeout_s = net.stale_timeout_seconds,
            "network configuration"
        );
        tracing::info!(web = %self.web.addr(), log_level = %self.logging.level, "web configuration");
        tracing::info!(
            market = self.market.enabled,
            market_interval_s = self.market.update_seconds,
            firmware = self.firmware.enabled,
            "poller configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.network.status_port(), 12345);
        assert_eq!(config.network.config_port(), 12346);
        assert_eq!(config.network.command_port(), 12347);
        assert_eq!(config.web.port, 7877);
        assert_eq!(config.market.update_seconds, 1800);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: HostConfig = toml::from_str(
            r#"
            [network]
            base_port = 20000

            [market]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.network.config_port(), 20001);
        assert_eq!(config.network.stale_timeout_seconds, 300);
        assert!(!config.market.enabled);
        assert_eq!(config.market.price_url, DEFAULT_PRICE_URL);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_ingest_config_from_network() {
        let network = NetworkConfig {
            recv_timeout_ms: 250,
            ..NetworkConfig::default()
        };
        let ingest = network.ingest_config();
        assert_eq!(ingest.status_port, 12345);
        assert_eq!(ingest.config_port, 12346);
        assert_eq!(ingest.recv_timeout, Duration::from_millis(250));
        assert_eq!(ingest.stop_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[web]\nport = 8080\n[logging]\nlevel = \"debug\"").unwrap();

        let config = HostConfig::load(file.path()).unwrap();
        assert_eq!(config.web.port, 8080);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_load_rejects_overflowing_port() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[network]\nbase_port = 65535").unwrap();

        let err = HostConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("base_port"));
    }

    #[test]
    fn test_resolve_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(HostConfig::resolve(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
