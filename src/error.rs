//! ==============================================================================
//! error.rs - error types for the monitor
//! ==============================================================================
//!
//! nothing on the ingestion path escapes to the web layer: listeners log
//! these and keep going. only [`ListenerError::BindFailure`] aborts startup.
//!
//! ==============================================================================

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::domain::PacketKind;

/// A datagram that could not be turned into a record.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The payload looks like a JSON object that was cut short.
    #[error("truncated packet ({len} bytes, tail {tail:?})")]
    Truncated { len: usize, tail: String },

    /// The payload is not a JSON object.
    #[error("malformed packet ({len} bytes): {reason}; head {head:?}, tail {tail:?}")]
    Malformed {
        len: usize,
        reason: String,
        head: String,
        tail: String,
    },
}

/// A decoded record that the registry refused.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// The self-reported `ip` field is present but is not a string.
    #[error("self-reported ip is not a string: {0}")]
    InvalidAddress(serde_json::Value),
}

/// Listener setup / lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind {kind} socket on {addr}: {source}")]
    BindFailure {
        kind: PacketKind,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("{0} listener has no socket to run on")]
    NotBound(PacketKind),

    #[error("invalid listener address: {0}")]
    InvalidAddress(String),
}

/// One-shot UDP exchanges with a single device.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("bad reply: {0}")]
    Decode(#[from] DecodeError),

    #[error("failed to encode config: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response format: {0}")]
    UnexpectedFormat(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FirmwareError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to retrieve the latest release, status code {0}")]
    Status(u16),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FormatError {
    #[error("invalid hashrate format: `{0}`")]
    InvalidHashrate(String),

    #[error("invalid unit in hashrate: `{0}`")]
    InvalidUnit(String),

    #[error("string does not match the expected time pattern: `{0}`")]
    InvalidTime(String),
}
