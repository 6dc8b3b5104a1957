//! ==============================================================================
//! main.rs - nm-monitor entry point
//! ==============================================================================
//!
//! purpose:
//!     wires the pieces together: config, logging, the shared device registry,
//!     the two udp listeners, the background pollers and the dashboard.
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                        nm-monitor                            │
//!     │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────┐  │
//!     │  │ status :12345│  │ config :12346│  │ pollers (btc, fw)  │  │
//!     │  └──────┬───────┘  └──────┬───────┘  └─────────┬──────────┘  │
//!     │         └────────┬────────┘                    │             │
//!     │            ┌─────┴─────┐                 ┌─────┴─────┐       │
//!     │            │ registry  │ <── web ──>     │  shared   │       │
//!     │            └───────────┘   (:7877)       │  market   │       │
//!     │                              │           └───────────┘       │
//!     │                         relay :12347                         │
//!     └──────────────────────────────────────────────────────────────┘
//!
//! ==============================================================================

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use nm_monitor::config::{ConfigOrigin, HostConfig};
use nm_monitor::firmware::{spawn_release_poller, SharedRelease};
use nm_monitor::lifecycle::LifecycleController;
use nm_monitor::logging::init_logging;
use nm_monitor::managed::ManagedTask;
use nm_monitor::market::{spawn_market_poller, MarketClient, SharedMarket, USER_AGENT};
use nm_monitor::registry::DeviceRegistry;
use nm_monitor::relay::ConfigRelay;
use nm_monitor::web::{run_server, WebState};

const POLLER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "nm-monitor", version, about = "Aggregates UDP telemetry from NMMiner devices")]
struct Cli {
    /// Path to host.toml (default: config/host.toml, then ../config/host.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Status port; the config and command ports follow it
    #[arg(short, long)]
    port: Option<u16>,

    /// Dashboard port
    #[arg(long)]
    web_port: Option<u16>,

    /// Log level or filter directive (RUST_LOG still wins)
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut HostConfig) {
        if let Some(port) = self.port {
            config.network.base_port = port;
        }
        if let Some(port) = self.web_port {
            config.web.port = port;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

/// address other machines on the lan would use to reach us
fn local_ip() -> Option<IpAddr> {
    // connecting a udp socket sends nothing; it only picks the outbound route
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

fn dashboard_url(addr: SocketAddr) -> String {
    let ip = if addr.ip().is_unspecified() {
        local_ip().unwrap_or(addr.ip())
    } else {
        addr.ip()
    };
    format!("http://{}/", SocketAddr::new(ip, addr.port()))
}

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // startup banner
    println!("===========================================================");
    println!("  NMMiner Monitor {}", env!("CARGO_PKG_VERSION"));
    println!("  UDP telemetry aggregator for NMMiner devices");
    println!("===========================================================");

    // step 1: load configuration
    let (mut config, origin) = HostConfig::resolve(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    // step 2: logging, then report what step 1 found
    init_logging(&config.logging.level)?;
    match &origin {
        ConfigOrigin::File(path) => info!(path = %path.display(), "loaded configuration"),
        ConfigOrigin::Fallback { path, error } => {
            warn!(path = %path.display(), "config file unusable, using defaults: {error}")
        }
        ConfigOrigin::Defaults => info!("no config file found, using defaults"),
    }
    config.log_summary();

    // step 3: shared registry and udp ingestion
    let registry = Arc::new(DeviceRegistry::new(
        config.network.stale_timeout(),
        config.network.sweep_interval(),
    ));
    let mut controller = LifecycleController::new(config.network.ingest_config(), Arc::clone(&registry));
    if let Err(e) = controller.start().await {
        error!("Fatal: failed to start udp listeners: {e}");
        return Err(e.into());
    }

    // step 4: background pollers
    let market = SharedMarket::default();
    let latest_release = SharedRelease::default();
    let mut pollers: Vec<ManagedTask> = Vec::new();

    if config.market.enabled {
        let client = MarketClient::new(
            config.market.price_url.clone(),
            config.market.block_height_url.clone(),
            Duration::from_secs(config.market.request_timeout_seconds),
        )?;
        pollers.push(spawn_market_poller(
            client,
            Arc::clone(&market),
            Duration::from_secs(config.market.update_seconds),
        ));
    }

    if config.firmware.enabled {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.market.request_timeout_seconds))
            .build()?;
        pollers.push(spawn_release_poller(
            http,
            config.firmware.release_url.clone(),
            Arc::clone(&latest_release),
            Duration::from_secs(config.firmware.update_seconds),
        ));
    }

    // step 5: web server until ctrl-c
    let state = WebState {
        registry: Arc::clone(&registry),
        relay: ConfigRelay::new(Arc::clone(&registry), config.network.command_port()),
        market,
        latest_release,
    };
    let web_addr = config.web.addr();
    info!(url = %dashboard_url(web_addr), "dashboard live");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("error waiting for ctrl-c: {e}");
        }
        info!("shutdown requested");
    };
    let served = run_server(web_addr, state, shutdown).await;
    if let Err(e) = &served {
        error!("web server error: {e:#}");
    }

    // step 6: orderly teardown
    for mut poller in pollers {
        if !poller.stop(POLLER_STOP_TIMEOUT).await {
            warn!(task = poller.name(), "poller did not stop in time, aborted");
        }
    }
    controller.stop().await;
    info!(devices = registry.len(), "monitor stopped");

    served
}
