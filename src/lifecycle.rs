//! ==============================================================================
//! lifecycle.rs - start/stop orchestration for the ingestion side
//! ==============================================================================
//!
//! purpose:
//!     owns the one registry and the udp listeners that feed it.
//!     - start(): bind every socket first, then spawn every listener.
//!       if any bind fails nothing is started (no half-bound system).
//!       a second start() on a running controller does nothing.
//!     - stop(): signal all listeners, wait for each with a bounded timeout,
//!       then release the sockets. a slow listener is logged and aborted.
//!
//! relationships:
//!     - used by: main.rs
//!     - creates: listener.rs instances
//!     - shares: registry.rs (Arc handed to listeners, web and relay)
//!
//! ==============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{error, info, warn};

use crate::domain::PacketKind;
use crate::error::ListenerError;
use crate::listener::{IngestionListener, DEFAULT_RECV_TIMEOUT};
use crate::registry::DeviceRegistry;

/// where and how the listeners run
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub bind_ip: IpAddr,
    pub status_port: u16,
    pub config_port: u16,
    pub recv_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            status_port: 12345,
            config_port: 12346,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

pub struct LifecycleController {
    config: IngestConfig,
    registry: Arc<DeviceRegistry>,
    listeners: Vec<IngestionListener>,
}

impl LifecycleController {
    pub fn new(config: IngestConfig, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            config,
            registry,
            listeners: Vec::new(),
        }
    }

    /// the process-wide registry
    pub fn registry(&self) -> Arc<DeviceRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn is_running(&self) -> bool {
        !self.listeners.is_empty()
    }

    /// actual bound address of each running listener
    pub fn local_addrs(&self) -> Vec<(PacketKind, SocketAddr)> {
        self.listeners
            .iter()
            .map(|l| (l.kind(), l.local_addr()))
            .collect()
    }

    pub fn local_addr(&self, kind: PacketKind) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|l| l.kind() == kind)
            .map(|l| l.local_addr())
    }

    /// bind all sockets, then start all listeners
    pub async fn start(&mut self) -> Result<(), ListenerError> {
        if self.is_running() {
            info!("ingestion already running, start ignored");
            return Ok(());
        }

        let ports = [
            (PacketKind::Status, self.config.status_port),
            (PacketKind::Config, self.config.config_port),
        ];

        // bind everything before starting anything; on error the sockets
        // bound so far are dropped here
        let mut sockets = Vec::with_capacity(ports.len());
        for (kind, port) in ports {
            let addr = SocketAddr::new(self.config.bind_ip, port);
            let socket = UdpSocket::bind(addr).await.map_err(|source| {
                error!(%kind, %addr, "error binding socket: {source}");
                ListenerError::BindFailure { kind, addr, source }
            })?;
            sockets.push((kind, socket));
        }

        let mut listeners = Vec::with_capacity(sockets.len());
        for (kind, socket) in sockets {
            let listener = IngestionListener::from_socket(kind, socket, Arc::clone(&self.registry))?
                .with_recv_timeout(self.config.recv_timeout);
            listeners.push(listener);
        }
        for listener in &mut listeners {
            listener.start()?;
        }

        for (kind, addr) in listeners.iter().map(|l| (l.kind(), l.local_addr())) {
            info!(%kind, %addr, "listening for device updates");
        }
        self.listeners = listeners;
        Ok(())
    }

    /// stop every listener; sockets are released when this returns
    pub async fn stop(&mut self) {
        if self.listeners.is_empty() {
            return;
        }

        let timeout = self.config.stop_timeout;
        for listener in &mut self.listeners {
            if !listener.stop(timeout).await {
                warn!(kind = %listener.kind(), ?timeout, "listener was aborted after stop timeout");
            }
        }
        self.listeners.clear();
        info!("ingestion stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> IngestConfig {
        IngestConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            status_port: 0,
            config_port: 0,
            recv_timeout: Duration::from_millis(20),
            stop_timeout: Duration::from_secs(5),
        }
    }

    fn registry() -> Arc<DeviceRegistry> {
        Arc::new(DeviceRegistry::new(Duration::from_secs(300), Duration::from_secs(10)))
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let mut controller = LifecycleController::new(loopback_config(), registry());
        controller.start().await.unwrap();
        let first = controller.local_addrs();
        assert_eq!(first.len(), 2);

        controller.start().await.unwrap();
        assert_eq!(controller.local_addrs(), first);

        controller.stop().await;
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn test_bind_failure_starts_nothing() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config = loopback_config();
        config.config_port = taken.local_addr().unwrap().port();

        let mut controller = LifecycleController::new(config, registry());
        let err = controller.start().await.unwrap_err();
        assert!(matches!(err, ListenerError::BindFailure { kind: PacketKind::Config, .. }));
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn test_stop_releases_ports() {
        let mut controller = LifecycleController::new(loopback_config(), registry());
        controller.start().await.unwrap();
        let addrs = controller.local_addrs();
        controller.stop().await;

        for (_, addr) in addrs {
            UdpSocket::bind(addr).await.expect("port still bound after stop");
        }
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let mut controller = LifecycleController::new(loopback_config(), registry());
        controller.stop().await;
        assert!(!controller.is_running());
    }
}
