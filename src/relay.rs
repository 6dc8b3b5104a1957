//! ==============================================================================
//! relay.rs - one-shot config exchanges with a single device
//! ==============================================================================
//!
//! purpose:
//!     the pull/push side of device configuration. not part of the continuous
//!     ingestion path: every call opens its own ephemeral socket.
//!     - get_device_config: last blob the device broadcast on the config port
//!     - request_config_from_device: ask, wait up to 2s for one reply
//!     - send_config_to_device: fire the config 3 times against packet loss
//!
//! relationships:
//!     - used by: web.rs (config endpoints)
//!     - reads: registry.rs
//!     - uses: codec.rs (reply decoding)
//!
//! ==============================================================================

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::UdpSocket;
use tracing::{error, info, warn};

use crate::codec::{self, Record, MAX_DATAGRAM_SIZE};
use crate::error::RelayError;
use crate::registry::DeviceRegistry;

pub const DEFAULT_COMMAND_PORT: u16 = 12347;

#[derive(Clone)]
pub struct ConfigRelay {
    registry: Arc<DeviceRegistry>,
    command_port: u16,
    reply_timeout: Duration,
    send_repeats: usize,
    repeat_interval: Duration,
}

impl ConfigRelay {
    pub fn new(registry: Arc<DeviceRegistry>, command_port: u16) -> Self {
        Self {
            registry,
            command_port,
            reply_timeout: Duration::from_secs(2),
            send_repeats: 3,
            repeat_interval: Duration::from_millis(100),
        }
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    /// stored configuration, as last broadcast by the device
    pub fn get_device_config(&self, address: &str) -> Option<Record> {
        self.registry.device_config(address)
    }

    /// ask a device for its configuration and wait for one reply
    pub async fn request_config_from_device(&self, ip: IpAddr) -> Result<Record, RelayError> {
        let target = SocketAddr::new(ip, self.command_port);
        let socket = UdpSocket::bind(unspecified_for(ip)).await?;

        let request = serde_json::to_vec(&json!({"command": "get_config"}))?;
        socket.send_to(&request, target).await?;

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let reply = async {
            loop {
                let (len, from) = socket.recv_from(&mut buf).await?;
                if from.ip() == ip {
                    return Ok::<usize, std::io::Error>(len);
                }
                warn!(%ip, %from, "ignoring config reply from another host");
            }
        };
        let len = match tokio::time::timeout(self.reply_timeout, reply).await {
            Ok(Ok(len)) => len,
            Ok(Err(e)) => {
                error!(%ip, "error requesting config: {e}");
                return Err(e.into());
            }
            Err(_) => {
                warn!(%ip, "timeout requesting config");
                return Err(RelayError::Timeout(self.reply_timeout));
            }
        };

        let config = codec::decode(&buf[..len])?;
        info!(%ip, "configuration received");
        Ok(config)
    }

    /// push a configuration; delivery is best effort
    pub async fn send_config_to_device(&self, ip: IpAddr, config: &Record) -> Result<(), RelayError> {
        let target = SocketAddr::new(ip, self.command_port);
        let data = serde_json::to_vec(config)?;
        let socket = UdpSocket::bind(unspecified_for(ip)).await?;

        for attempt in 0..self.send_repeats {
            if attempt > 0 {
                tokio::time::sleep(self.repeat_interval).await;
            }
            socket.send_to(&data, target).await.map_err(|e| {
                error!(%ip, "error sending config: {e}");
                e
            })?;
        }

        info!(%ip, repeats = self.send_repeats, "configuration sent");
        Ok(())
    }
}

/// ephemeral bind address in the same family as `ip`
fn unspecified_for(ip: IpAddr) -> SocketAddr {
    match ip {
        IpAddr::V4(v4) if v4.is_loopback() => SocketAddr::from(([127, 0, 0, 1], 0)),
        IpAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        IpAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PacketKind;
    use chrono::Utc;

    fn registry() -> Arc<DeviceRegistry> {
        Arc::new(DeviceRegistry::new(Duration::from_secs(300), Duration::from_secs(10)))
    }

    #[test]
    fn test_get_device_config_reads_registry() {
        let reg = registry();
        let mut blob = Record::new();
        blob.insert("WiFiSSID".into(), json!("farm"));
        reg.merge("10.0.0.5".parse().unwrap(), blob, PacketKind::Config, Utc::now())
            .unwrap();

        let relay = ConfigRelay::new(reg, DEFAULT_COMMAND_PORT);
        assert_eq!(relay.get_device_config("10.0.0.5").unwrap()["WiFiSSID"], "farm");
        assert!(relay.get_device_config("10.0.0.6").is_none());
    }

    #[tokio::test]
    async fn test_request_times_out_without_reply() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let relay = ConfigRelay::new(registry(), port).with_reply_timeout(Duration::from_millis(50));
        let err = relay
            .request_config_from_device("127.0.0.1".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Timeout(_)));
    }

    #[test]
    fn test_unspecified_matches_family() {
        assert!(unspecified_for("10.0.0.1".parse().unwrap()).is_ipv4());
        assert!(unspecified_for("::1".parse().unwrap()).is_ipv6());
        assert!(unspecified_for("127.0.0.1".parse().unwrap()).ip().is_loopback());
    }
}
