//! ==============================================================================
//! listener.rs - udp ingestion loop
//! ==============================================================================
//!
//! purpose:
//!     one listener per udp port (status, config). each one waits a bounded
//!     time for a datagram, decodes it and merges it into the registry.
//!     a bad packet is logged and dropped; it never ends the loop.
//!
//! state machine:
//!
//! ```text
//! Created -> Bound -> Running -> Stopping -> Stopped
//!
//!     - bind failure never reaches Bound (the constructor returns an error)
//!     - stop is cooperative: the flag is checked once per receive timeout,
//!       so shutdown waits at most one timeout interval
//!     - the socket is owned by the receive task and closed when it exits
//! ```
//!
//! relationships:
//!     - created by: lifecycle.rs (sockets bound there and handed in)
//!     - uses: codec.rs, registry.rs, managed.rs
//!
//! ==============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{self, MAX_DATAGRAM_SIZE};
use crate::domain::{MergeOutcome, PacketKind};
use crate::error::{DecodeError, ListenerError, MergeError};
use crate::managed::{ManagedTask, StopFlag};
use crate::registry::DeviceRegistry;

/// default wait for readability before re-checking the stop flag
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Bound,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// why a datagram did not make it into the registry
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Merge(#[from] MergeError),
}

pub struct IngestionListener {
    kind: PacketKind,
    local_addr: SocketAddr,
    recv_timeout: Duration,
    registry: Arc<DeviceRegistry>,
    socket: Option<UdpSocket>,
    state: Arc<Mutex<ListenerState>>,
    task: Option<ManagedTask>,
}

impl IngestionListener {
    /// bind a fresh socket on `addr`
    pub async fn bind(
        kind: PacketKind,
        addr: SocketAddr,
        registry: Arc<DeviceRegistry>,
    ) -> Result<Self, ListenerError> {
        let socket = UdpSocket::bind(addr).await.map_err(|source| {
            error!(%kind, %addr, "error binding socket: {source}");
            ListenerError::BindFailure { kind, addr, source }
        })?;
        Self::from_socket(kind, socket, registry)
    }

    /// wrap a socket that was already bound by the caller
    pub fn from_socket(
        kind: PacketKind,
        socket: UdpSocket,
        registry: Arc<DeviceRegistry>,
    ) -> Result<Self, ListenerError> {
        let state = Arc::new(Mutex::new(ListenerState::Created));
        let local_addr = socket
            .local_addr()
            .map_err(|e| ListenerError::InvalidAddress(e.to_string()))?;
        *state.lock() = ListenerState::Bound;

        Ok(Self {
            kind,
            local_addr,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            registry,
            socket: Some(socket),
            state,
            task: None,
        })
    }

    pub fn with_recv_timeout(mut self, recv_timeout: Duration) -> Self {
        self.recv_timeout = recv_timeout;
        self
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock()
    }

    /// spawn the receive loop; Bound -> Running
    pub fn start(&mut self) -> Result<(), ListenerError> {
        let socket = self.socket.take().ok_or(ListenerError::NotBound(self.kind))?;

        let kind = self.kind;
        let registry = Arc::clone(&self.registry);
        let state = Arc::clone(&self.state);
        let recv_timeout = self.recv_timeout;

        *self.state.lock() = ListenerState::Running;
        info!(%kind, addr = %self.local_addr, "starting UDP listener...");

        self.task = Some(ManagedTask::spawn(format!("{kind}-listener"), move |stop| async move {
            receive_loop(kind, socket, &registry, &stop, recv_timeout).await;
            *state.lock() = ListenerState::Stopped;
        }));
        Ok(())
    }

    /// signal the loop and wait up to `timeout` for it to exit
    ///
    /// returns false if the loop had to be aborted. the socket is closed
    /// either way once this returns.
    pub async fn stop(&mut self, timeout: Duration) -> bool {
        let Some(mut task) = self.task.take() else {
            // never started: just release the socket
            self.socket = None;
            *self.state.lock() = ListenerState::Stopped;
            return true;
        };

        *self.state.lock() = ListenerState::Stopping;
        let clean = task.stop(timeout).await;
        if !clean {
            warn!(kind = %self.kind, "listener did not stop within timeout");
        }
        *self.state.lock() = ListenerState::Stopped;
        clean
    }
}

async fn receive_loop(
    kind: PacketKind,
    socket: UdpSocket,
    registry: &DeviceRegistry,
    stop: &StopFlag,
    recv_timeout: Duration,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    while !stop.is_stopped() {
        match tokio::time::timeout(recv_timeout, socket.recv_from(&mut buf)).await {
            Err(_) => {
                trace!(%kind, "receive timeout (no data received)");
            }
            Ok(Ok((len, src))) => {
                // result is logged inside
                let _ = ingest_datagram(kind, registry, &buf[..len], src);
            }
            Ok(Err(e)) => {
                warn!(%kind, "socket error: {e}");
                // some errors repeat on every call; pause so the loop cannot spin
                tokio::time::sleep(error_backoff(recv_timeout)).await;
            }
        }
    }

    debug!(%kind, "listener loop exited, closing socket");
    drop(socket);
}

/// pause after a failed receive, never longer than one receive cycle
fn error_backoff(recv_timeout: Duration) -> Duration {
    recv_timeout.clamp(Duration::from_millis(1), Duration::from_millis(100))
}

/// decode one datagram and merge it, logging anything that goes wrong
pub fn ingest_datagram(
    kind: PacketKind,
    registry: &DeviceRegistry,
    payload: &[u8],
    src: SocketAddr,
) -> Result<MergeOutcome, IngestError> {
    let record = match codec::decode(payload) {
        Ok(record) => record,
        Err(e) => {
            match &e {
                DecodeError::Truncated { .. } => warn!(%kind, %src, "dropping truncated packet: {e}"),
                DecodeError::Malformed { .. } => warn!(%kind, %src, "dropping malformed packet: {e}"),
            }
            return Err(e.into());
        }
    };

    registry
        .merge(src.ip(), record, kind, Utc::now())
        .map_err(|e| {
            error!(%kind, %src, "error merging device packet: {e}");
            e.into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn registry() -> Arc<DeviceRegistry> {
        Arc::new(DeviceRegistry::new(Duration::from_secs(300), Duration::from_secs(10)))
    }

    fn src() -> SocketAddr {
        "192.168.1.9:40000".parse().unwrap()
    }

    #[test]
    fn test_error_backoff_bounded_by_cycle() {
        assert_eq!(error_backoff(Duration::from_millis(20)), Duration::from_millis(20));
        assert_eq!(error_backoff(Duration::from_secs(2)), Duration::from_millis(100));
        // a zero timeout still pauses instead of spinning
        assert_eq!(error_backoff(Duration::ZERO), Duration::from_millis(1));
    }

    #[test]
    fn test_ingest_merges_valid_packet() {
        let reg = registry();
        let outcome = ingest_datagram(PacketKind::Status, &reg, br#"{"HashRate":"1KH/s"}"#, src()).unwrap();
        assert_eq!(outcome, MergeOutcome::Created);
        assert_eq!(reg.get("192.168.1.9").unwrap().fields["HashRate"], "1KH/s");
    }

    #[test]
    #[traced_test]
    fn test_ingest_drops_random_bytes() {
        let reg = registry();
        let err = ingest_datagram(PacketKind::Status, &reg, b"Xq9vB2mK7pL0sD4fG1hJ", src()).unwrap_err();
        assert!(matches!(err, IngestError::Decode(DecodeError::Malformed { .. })));
        assert!(reg.is_empty());
        assert!(logs_contain("dropping malformed packet"));
    }

    #[test]
    #[traced_test]
    fn test_ingest_drops_truncated_packet() {
        let reg = registry();
        let err = ingest_datagram(PacketKind::Config, &reg, br#"{"ip":"10.0.0.5","Vers"#, src()).unwrap_err();
        assert!(matches!(err, IngestError::Decode(DecodeError::Truncated { .. })));
        assert_eq!(reg.len(), 0);
        assert!(logs_contain("dropping truncated packet"));
    }

    #[test]
    #[traced_test]
    fn test_ingest_logs_merge_failure() {
        let reg = registry();
        let err = ingest_datagram(PacketKind::Status, &reg, br#"{"ip":[1,2]}"#, src()).unwrap_err();
        assert!(matches!(err, IngestError::Merge(_)));
        assert!(logs_contain("error merging device packet"));
    }

    #[tokio::test]
    async fn test_listener_state_machine() {
        let reg = registry();
        let mut listener = IngestionListener::bind(PacketKind::Status, "127.0.0.1:0".parse().unwrap(), reg)
            .await
            .unwrap();
        assert_eq!(listener.state(), ListenerState::Bound);

        listener.start().unwrap();
        assert_eq!(listener.state(), ListenerState::Running);
        assert!(matches!(listener.start(), Err(ListenerError::NotBound(PacketKind::Status))));

        assert!(listener.stop(Duration::from_secs(5)).await);
        assert_eq!(listener.state(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_listener_receives_over_udp() {
        let reg = registry();
        let mut listener = IngestionListener::bind(PacketKind::Status, "127.0.0.1:0".parse().unwrap(), Arc::clone(&reg))
            .await
            .unwrap()
            .with_recv_timeout(Duration::from_millis(20));
        let addr = listener.local_addr();
        listener.start().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"not json at all", addr).await.unwrap();
        sender
            .send_to(br#"{"ip":"10.0.0.5","HashRate":"12.5MH/s"}"#, addr)
            .await
            .unwrap();

        let mut found = false;
        for _ in 0..100 {
            if reg.get("10.0.0.5").is_some() {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(found, "packet never reached the registry");
        assert_eq!(reg.len(), 1);

        assert!(listener.stop(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let err = IngestionListener::bind(PacketKind::Config, addr, registry()).await.err().unwrap();
        assert!(matches!(err, ListenerError::BindFailure { kind: PacketKind::Config, .. }));
    }
}
