//! ==============================================================================
//! web.rs - fleet dashboard and config endpoints
//! ==============================================================================
//!
//! purpose:
//!     read side of the monitor. everything here works on registry snapshots,
//!     so a slow browser never holds the registry lock.
//!
//! routes:
//!     GET  /                         html fleet table
//!     GET  /web_monitor              same
//!     GET  /api                      fleet view as json
//!     GET  /api/miners               raw fields per device, with UpdateTime
//!     GET  /api/devices/:ip/config   stored config (?refresh=true asks the device)
//!     POST /api/devices/:ip/config   push a config object to the device
//!
//! relationships:
//!     - reads: registry.rs, market.rs, firmware.rs (shared state)
//!     - uses: relay.rs (config pull/push), format.rs (display strings)
//!
//! ==============================================================================

use std::collections::BTreeMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::codec::Record;
use crate::domain::{value_text, DeviceRecord, PacketKind};
use crate::error::RelayError;
use crate::firmware::{annotate_version, SharedRelease};
use crate::format::{display_uptime, elapsed_since, format_hashrate, format_share, parse_hashrate};
use crate::market::{MarketSnapshot, SharedMarket};
use crate::registry::DeviceRegistry;
use crate::relay::ConfigRelay;

// ==============================================================================
// shared state
// ==============================================================================

#[derive(Clone)]
pub struct WebState {
    pub registry: Arc<DeviceRegistry>,
    pub relay: ConfigRelay,
    pub market: SharedMarket,
    pub latest_release: SharedRelease,
}

/// one table row, already formatted for display
#[derive(Clone, Debug, Serialize)]
pub struct MinerRow {
    pub ip: String,
    /// which kind of packet the populated fields look like
    pub kind: PacketKind,
    pub board_type: String,
    pub hashrate: String,
    pub shares: String,
    pub net_diff: String,
    pub best_diff: String,
    pub valid: String,
    pub temp: String,
    pub rssi: String,
    pub free_heap: String,
    pub version: String,
    pub uptime: String,
    pub last_seen: String,
    pub last_diff: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct FleetView {
    pub miners: Vec<MinerRow>,
    pub total_hashrate: String,
    pub latest_version: Option<String>,
    pub market: MarketSnapshot,
}

// ==============================================================================
// view building
// ==============================================================================

fn text_or(device: &DeviceRecord, key: &str, default: &str) -> String {
    device
        .field_text(key)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// numeric field rounded to `decimals`; non-numeric values pass through
fn rounded(device: &DeviceRecord, key: &str, decimals: usize) -> String {
    match device.fields.get(key) {
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) => format!("{f:.decimals$}"),
            None => n.to_string(),
        },
        Some(other) => value_text(other),
        None => format!("{:.decimals$}", 0.0),
    }
}

pub fn build_row(device: &DeviceRecord, latest: Option<&str>, now: DateTime<Utc>) -> MinerRow {
    let version = text_or(device, "Version", "Unknown");
    MinerRow {
        ip: device.address.clone(),
        kind: device.inferred_kind(),
        board_type: text_or(device, "BoardType", "Unknown"),
        hashrate: text_or(device, "HashRate", "0"),
        shares: format_share(&text_or(device, "Share", "0/0")),
        net_diff: text_or(device, "NetDiff", "0"),
        best_diff: text_or(device, "BestDiff", "0"),
        valid: text_or(device, "Valid", "0"),
        temp: rounded(device, "Temp", 1),
        rssi: text_or(device, "RSSI", "0"),
        free_heap: rounded(device, "FreeHeap", 2),
        version: annotate_version(&version, latest),
        uptime: display_uptime(&text_or(device, "Uptime", "0")),
        last_seen: elapsed_since(device.last_update, now),
        last_diff: text_or(device, "LastDiff", "0"),
    }
}

/// sum of every parseable `HashRate`, in H/s
pub fn total_hashrate(devices: &[DeviceRecord]) -> f64 {
    devices
        .iter()
        .filter_map(|d| d.field_text("HashRate"))
        .filter(|s| !s.is_empty())
        .filter_map(|s| match parse_hashrate(&s) {
            Ok(h) => Some(h),
            Err(e) => {
                debug!("skipping hashrate in total: {e}");
                None
            }
        })
        .sum()
}

pub fn build_view(devices: &[DeviceRecord], latest: Option<String>, market: MarketSnapshot, now: DateTime<Utc>) -> FleetView {
    FleetView {
        miners: devices
            .iter()
            .map(|d| build_row(d, latest.as_deref(), now))
            .collect(),
        total_hashrate: format_hashrate(total_hashrate(devices)),
        latest_version: latest,
        market,
    }
}

async fn current_view(state: &WebState) -> FleetView {
    let devices = state.registry.snapshot();
    let latest = state.latest_release.read().await.clone();
    let market = state.market.read().await.clone();
    build_view(&devices, latest, market, Utc::now())
}

/// escape html special characters to prevent xss
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
     .replace('<', "&lt;")
     .replace('>', "&gt;")
     .replace('"', "&quot;")
}

pub fn render_dashboard(view: &FleetView) -> String {
    let mut rows = String::new();
    for m in &view.miners {
        let kind = m.kind.to_string();
        let cells = [
            &m.ip, &kind, &m.board_type, &m.hashrate, &m.shares, &m.net_diff, &m.best_diff, &m.valid,
            &m.temp, &m.rssi, &m.free_heap, &m.version, &m.uptime, &m.last_seen, &m.last_diff,
        ];
        rows.push_str("<tr>");
        for cell in cells {
            rows.push_str(&format!("<td>{}</td>", html_escape(cell)));
        }
        rows.push_str("</tr>\n");
    }

    let latest = view.latest_version.as_deref().unwrap_or("Unknown");
    let market = &view.market;

    format!(
        r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<meta http-equiv="refresh" content="10">
<title>NMMiner Monitor</title>
</head>
<body style="font-family: system-ui; padding: 2rem; background: #1a1a2e; color: #eee;">
    <h1>NMMiner Monitor</h1>
    <p>Devices: {count} | Total hashrate: {total} | Latest firmware: {latest}</p>
    <p>BTC price: ${price:.2} ({source}) | Block reward: {reward} BTC (${reward_value:.2})</p>
    <table style="border-collapse: collapse; width: 100%;">
    <tr><th>IP</th><th>Kind</th><th>Board</th><th>Hashrate</th><th>Shares</th><th>NetDiff</th><th>BestDiff</th><th>Valid</th><th>Temp</th><th>RSSI</th><th>FreeHeap</th><th>Version</th><th>Uptime</th><th>Last seen</th><th>LastDiff</th></tr>
{rows}    </table>
    <p style="color: #888;">* firmware differs from the latest release</p>
</body>
</html>"#,
        count = view.miners.len(),
        total = html_escape(&view.total_hashrate),
        latest = html_escape(latest),
        price = market.btc_price,
        source = html_escape(&market.price_source),
        reward = market.block_reward,
        reward_value = market.block_reward_value,
        rows = rows,
    )
}

// ==============================================================================
// web server
// ==============================================================================

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/", get(dashboard_handler))
        .route("/web_monitor", get(dashboard_handler))
        .route("/api", get(api_handler))
        .route("/api/miners", get(miners_handler))
        .route(
            "/api/devices/:ip/config",
            get(get_config_handler).post(post_config_handler),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server<F>(addr: SocketAddr, state: WebState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "dashboard listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn dashboard_handler(State(state): State<WebState>) -> Html<String> {
    Html(render_dashboard(&current_view(&state).await))
}

/// json api endpoint for programmatic access
async fn api_handler(State(state): State<WebState>) -> Json<FleetView> {
    Json(current_view(&state).await)
}

async fn miners_handler(State(state): State<WebState>) -> Json<BTreeMap<String, Record>> {
    Json(state.registry.miner_map())
}

#[derive(Deserialize)]
struct ConfigQuery {
    #[serde(default)]
    refresh: bool,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"status": "error", "message": message.into()}))).into_response()
}

fn parse_ip(ip: &str) -> Result<IpAddr, Response> {
    ip.parse()
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, format!("invalid ip address: {ip}")))
}

async fn get_config_handler(
    State(state): State<WebState>,
    Path(ip): Path<String>,
    Query(query): Query<ConfigQuery>,
) -> Response {
    if !query.refresh {
        return match state.relay.get_device_config(&ip) {
            Some(config) => Json(Value::Object(config)).into_response(),
            None => error_response(StatusCode::NOT_FOUND, format!("no configuration known for {ip}")),
        };
    }

    let addr = match parse_ip(&ip) {
        Ok(addr) => addr,
        Err(response) => return response,
    };
    match state.relay.request_config_from_device(addr).await {
        Ok(config) => Json(Value::Object(config)).into_response(),
        Err(e @ RelayError::Timeout(_)) => error_response(StatusCode::GATEWAY_TIMEOUT, e.to_string()),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

async fn post_config_handler(
    State(state): State<WebState>,
    Path(ip): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let addr = match parse_ip(&ip) {
        Ok(addr) => addr,
        Err(response) => return response,
    };
    let Value::Object(config) = body else {
        return error_response(StatusCode::BAD_REQUEST, "config must be a JSON object");
    };

    match state.relay.send_config_to_device(addr, &config).await {
        Ok(()) => Json(json!({"status": "ok", "ip": ip})).into_response(),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::UPDATE_TIME_FORMAT;
    use std::time::Duration;

    fn device(fields: Value, last_update: DateTime<Utc>) -> DeviceRecord {
        let Value::Object(fields) = fields else { panic!("not an object") };
        let address = fields["ip"].as_str().unwrap().to_string();
        DeviceRecord {
            address,
            fields,
            last_update,
            configuration: None,
        }
    }

    #[test]
    fn test_build_row_formats_fields() {
        let now = Utc::now();
        let d = device(
            json!({
                "ip": "10.0.0.5",
                "BoardType": "NMAxe",
                "HashRate": "12.5MH/s",
                "Share": "1/200/0.5%",
                "Temp": 41.56,
                "FreeHeap": 123.456,
                "RSSI": -61,
                "Version": "v1.1.03i",
                "Uptime": "000d 01:02:03 000d 05:00:00",
            }),
            now - chrono::Duration::seconds(42),
        );

        let row = build_row(&d, Some("v1.2.0"), now);
        assert_eq!(row.ip, "10.0.0.5");
        assert_eq!(row.kind, PacketKind::Status);
        assert_eq!(row.board_type, "NMAxe");
        assert_eq!(row.shares, "1/200 (0.5%)");
        assert_eq!(row.temp, "41.6");
        assert_eq!(row.free_heap, "123.46");
        assert_eq!(row.rssi, "-61");
        assert_eq!(row.version, "v1.1.03i*");
        assert_eq!(row.uptime, "1h2m");
        assert_eq!(row.last_seen, "42s");
        assert_eq!(row.net_diff, "0");
    }

    #[test]
    fn test_build_row_defaults() {
        let now = Utc::now();
        let row = build_row(&device(json!({"ip": "10.0.0.9"}), now), None, now);
        assert_eq!(row.kind, PacketKind::Config);
        assert_eq!(row.board_type, "Unknown");
        assert_eq!(row.version, "Unknown");
        assert_eq!(row.temp, "0.0");
        assert_eq!(row.hashrate, "0");
    }

    #[test]
    fn test_total_hashrate_skips_garbage() {
        let now = Utc::now();
        let devices = vec![
            device(json!({"ip": "10.0.0.1", "HashRate": "1.5MH/s"}), now),
            device(json!({"ip": "10.0.0.2", "HashRate": "500KH/s"}), now),
            device(json!({"ip": "10.0.0.3", "HashRate": "lots"}), now),
            device(json!({"ip": "10.0.0.4"}), now),
        ];
        assert_eq!(total_hashrate(&devices), 2.0e6);
        assert_eq!(build_view(&devices, None, MarketSnapshot::default(), now).total_hashrate, "2.00MH/s");
    }

    #[test]
    fn test_render_escapes_device_text() {
        let now = Utc::now();
        let devices = vec![device(json!({"ip": "10.0.0.1", "BoardType": "<script>x</script>"}), now)];
        let html = render_dashboard(&build_view(&devices, Some("v1.2.0".into()), MarketSnapshot::default(), now));
        assert!(html.contains("&lt;script&gt;x&lt;/script&gt;"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("Latest firmware: v1.2.0"));
    }

    #[tokio::test]
    async fn test_current_view_reads_registry() {
        let registry = Arc::new(DeviceRegistry::new(Duration::from_secs(300), Duration::from_secs(10)));
        let mut packet = Record::new();
        packet.insert("HashRate".into(), json!("1KH/s"));
        registry
            .merge("192.168.1.9".parse().unwrap(), packet, PacketKind::Status, Utc::now())
            .unwrap();

        let state = WebState {
            registry: Arc::clone(&registry),
            relay: ConfigRelay::new(Arc::clone(&registry), 12347),
            market: SharedMarket::default(),
            latest_release: SharedRelease::default(),
        };
        let view = current_view(&state).await;
        assert_eq!(view.miners.len(), 1);
        assert_eq!(view.miners[0].ip, "192.168.1.9");
        assert_eq!(view.total_hashrate, "1.00KH/s");

        let Json(miners) = miners_handler(State(state)).await;
        let fields = &miners["192.168.1.9"];
        assert_eq!(fields["HashRate"], "1KH/s");
        let update_time = fields["UpdateTime"].as_str().unwrap();
        assert!(chrono::NaiveDateTime::parse_from_str(update_time, UPDATE_TIME_FORMAT).is_ok());
    }
}
