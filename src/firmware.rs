//! ==============================================================================
//! firmware.rs - latest firmware release lookup
//! ==============================================================================
//!
//! device versions carry suffixes like `v1.1.03i`, so freshness is plain
//! string equality rather than a semver comparison.
//!
//! relationships:
//!     - spawned by: main.rs
//!     - read by: web.rs (version annotation)
//!
//! ==============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::error::FirmwareError;
use crate::managed::{ManagedTask, UpdateGate};

pub const DEFAULT_RELEASE_URL: &str = "https://api.github.com/repos/NMminer1024/NMMiner/releases/latest";

const UNKNOWN_VERSION: &str = "Unknown version";

pub type SharedRelease = Arc<RwLock<Option<String>>>;

/// tag name of the latest release
pub async fn fetch_latest_version(http: &reqwest::Client, url: &str) -> Result<String, FirmwareError> {
    let response = http
        .get(url)
        .header(reqwest::header::ACCEPT, "application/vnd.github.v3+json")
        .send()
        .await?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(FirmwareError::Status(status.as_u16()));
    }

    let body: Value = response.json().await?;
    Ok(tag_name(&body))
}

fn tag_name(body: &Value) -> String {
    body.get("tag_name")
        .and_then(Value::as_str)
        .unwrap_or(UNKNOWN_VERSION)
        .to_string()
}

pub fn is_latest(installed: &str, latest: &str) -> bool {
    installed == latest
}

/// installed version, with `*` appended when a different release is known
pub fn annotate_version(installed: &str, latest: Option<&str>) -> String {
    match latest {
        Some(latest) if !is_latest(installed, latest) => format!("{installed}*"),
        _ => installed.to_string(),
    }
}

/// re-check the latest release every `interval` until stopped
pub fn spawn_release_poller(
    http: reqwest::Client,
    url: String,
    shared: SharedRelease,
    interval: Duration,
) -> ManagedTask {
    ManagedTask::spawn("firmware-release", move |stop| async move {
        let mut gate = UpdateGate::new(interval);
        while !stop.is_stopped() {
            if !gate.needs_update() {
                stop.sleep(Duration::from_secs(1)).await;
                continue;
            }
            match fetch_latest_version(&http, &url).await {
                Ok(version) => {
                    info!(%version, "latest NMMiner release");
                    *shared.write().await = Some(version);
                }
                Err(e) => error!("error fetching latest release: {e}"),
            }
        }
    })
}
