//! ==============================================================================
//! domain.rs - device records and packet kinds
//! ==============================================================================
//!
//! purpose:
//!     the plain data the registry stores and the web layer renders,
//!     plus the rule deciding which incoming values may overwrite stored ones.
//!
//! relationships:
//!     - used by: registry.rs, listener.rs, web.rs
//!
//! ==============================================================================

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::Record;

/// which udp port a packet arrived on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketKind {
    /// telemetry: hashrate, shares, temperature, ...
    Status,
    /// configuration: firmware version, board type, wifi settings
    Config,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketKind::Status => f.write_str("status"),
            PacketKind::Config => f.write_str("config"),
        }
    }
}

/// one entry per reporting device
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// registry key: the self-reported ip, or the udp source ip
    pub address: String,

    /// last meaningful value seen for each field
    pub fields: Record,

    /// arrival time of the most recent accepted packet
    pub last_update: DateTime<Utc>,

    /// last full blob received on the config port
    pub configuration: Option<Record>,
}

impl DeviceRecord {
    pub fn new(address: String, arrival: DateTime<Utc>) -> Self {
        Self {
            address,
            fields: Record::new(),
            last_update: arrival,
            configuration: None,
        }
    }

    /// field value as display text, if present
    pub fn field_text(&self, key: &str) -> Option<String> {
        self.fields.get(key).map(value_text)
    }

    /// packet kind inferred from which fields are populated
    pub fn inferred_kind(&self) -> PacketKind {
        if self.fields.contains_key("HashRate") || self.fields.contains_key("Share") {
            PacketKind::Status
        } else {
            PacketKind::Config
        }
    }
}

/// what a merge did to the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    Created,
    Updated,
}

/// whether a value may overwrite a stored one
///
/// `0` and `""` count as absent, so an idle device reporting zero hashrate
/// keeps showing its previous rate. Known precision loss, kept for
/// compatibility with the devices' partial packets.
pub fn is_meaningful(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(_) => true,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// render a json value without quotes around strings
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
