//! ==============================================================================
//! registry.rs - the authoritative device directory
//! ==============================================================================
//!
//! purpose:
//!     one process-wide map from device address to device record.
//!     every listener merges into it, the web layer only ever sees copies.
//!
//! locking:
//!     a single mutex guards the map. the critical section is one
//!     merge-and-store, one eviction pass, or one copy - never a receive loop.
//!     no other lock is taken while it is held.
//!
//! merge policy:
//!     field by field, an incoming value overwrites the stored one only when it
//!     is meaningful (see domain::is_meaningful). last_update is refreshed on
//!     every accepted packet. records are never replaced wholesale.
//!
//! relationships:
//!     - written by: listener.rs
//!     - read by: web.rs, relay.rs
//!     - owned by: lifecycle.rs (constructed once, shared via Arc)
//!
//! ==============================================================================

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use crate::codec::Record;
use crate::domain::{is_meaningful, DeviceRecord, MergeOutcome, PacketKind};
use crate::error::MergeError;
use crate::managed::UpdateGate;

/// format of the `UpdateTime` field in the miner map
pub const UPDATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// a record plus the monotonic time it was last heard from
struct Tracked {
    record: DeviceRecord,
    seen: Instant,
}

pub struct DeviceRegistry {
    devices: Mutex<BTreeMap<String, Tracked>>,
    stale_timeout: Duration,
    sweep_gate: Mutex<UpdateGate>,
}

impl DeviceRegistry {
    /// `stale_timeout`: silence after which a device is dropped.
    /// `sweep_interval`: minimum spacing of the sweeps done inside `snapshot`.
    pub fn new(stale_timeout: Duration, sweep_interval: Duration) -> Self {
        Self {
            devices: Mutex::new(BTreeMap::new()),
            stale_timeout,
            sweep_gate: Mutex::new(UpdateGate::new(sweep_interval)),
        }
    }

    /// merge one decoded packet into the device it belongs to
    ///
    /// the device is keyed by its self-reported `ip` when that is a non-empty
    /// string, else by the udp source address. trusting the payload lets a
    /// device behind NAT keep its identity, but it also lets any sender claim
    /// any address.
    pub fn merge(
        &self,
        source: IpAddr,
        record: Record,
        kind: PacketKind,
        arrival: DateTime<Utc>,
    ) -> Result<MergeOutcome, MergeError> {
        let address = resolve_address(source, &record)?;
        let seen = monotonic_arrival(arrival);

        let mut devices = self.devices.lock();
        let outcome = if devices.contains_key(&address) {
            MergeOutcome::Updated
        } else {
            MergeOutcome::Created
        };
        let tracked = devices.entry(address.clone()).or_insert_with(|| Tracked {
            record: DeviceRecord::new(address.clone(), arrival),
            seen,
        });
        tracked.seen = tracked.seen.max(seen);
        let device = &mut tracked.record;

        if kind == PacketKind::Config {
            device.configuration = Some(record.clone());
        }
        for (key, value) in record {
            if is_meaningful(&value) {
                device.fields.insert(key, value);
            }
        }
        device.fields.insert("ip".to_string(), Value::String(address.clone()));

        if arrival > device.last_update {
            device.last_update = arrival;
        }
        drop(devices);

        debug!(%address, %kind, ?outcome, "merged device packet");
        Ok(outcome)
    }

    /// sorted deep copy of every live device
    ///
    /// stale devices are removed from the map when the sweep gate is due and
    /// left out of the copy in any case.
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        let now = Instant::now();
        if self.sweep_gate.lock().needs_update_at(now) {
            self.evict_stale(now, self.stale_timeout);
        }
        self.devices
            .lock()
            .values()
            .filter(|t| now.saturating_duration_since(t.seen) <= self.stale_timeout)
            .map(|t| t.record.clone())
            .collect()
    }

    /// drop every device silent for longer than `timeout`; returns how many
    pub fn evict_stale(&self, now: Instant, timeout: Duration) -> usize {
        let mut devices = self.devices.lock();

        let stale: Vec<String> = devices
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.seen) > timeout)
            .map(|(address, _)| address.clone())
            .collect();
        for address in &stale {
            devices.remove(address);
        }
        drop(devices);

        for address in &stale {
            info!(%address, "removed offline device");
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "stale device sweep finished");
        }
        stale.len()
    }

    /// copy of a single device
    pub fn get(&self, address: &str) -> Option<DeviceRecord> {
        self.devices.lock().get(address).map(|t| t.record.clone())
    }

    /// last configuration blob received from a device
    pub fn device_config(&self, address: &str) -> Option<Record> {
        self.devices
            .lock()
            .get(address)
            .and_then(|t| t.record.configuration.clone())
    }

    /// address -> fields, with `UpdateTime` filled in from the last update
    pub fn miner_map(&self) -> BTreeMap<String, Record> {
        self.snapshot()
            .into_iter()
            .map(|device| {
                let mut fields = device.fields;
                let local = device.last_update.with_timezone(&chrono::Local);
                fields.insert(
                    "UpdateTime".to_string(),
                    Value::String(local.format(UPDATE_TIME_FORMAT).to_string()),
                );
                (device.address, fields)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }
}

/// monotonic instant matching `arrival`
///
/// only the packet's age comes from the wall clock, so a clock step between
/// two packets does not age the devices already stored.
fn monotonic_arrival(arrival: DateTime<Utc>) -> Instant {
    let now = Instant::now();
    let age = Utc::now()
        .signed_duration_since(arrival)
        .to_std()
        .unwrap_or(Duration::ZERO);
    now.checked_sub(age).unwrap_or(now)
}

/// registry key for a packet
fn resolve_address(source: IpAddr, record: &Record) -> Result<String, MergeError> {
    match record.get("ip") {
        Some(Value::String(ip)) if !ip.trim().is_empty() => Ok(ip.trim().to_string()),
        None | Some(Value::Null) | Some(Value::String(_)) => Ok(source.to_string()),
        Some(other) => Err(MergeError::InvalidAddress(other.clone())),
    }
}
