//! ==============================================================================
//! market.rs - btc price and block reward poller
//! ==============================================================================
//!
//! purpose:
//!     fetches the btc price and the current block height, derives the block
//!     reward and its usd value, and keeps the last good result for the
//!     dashboard. a failed fetch keeps the previous numbers.
//!
//! relationships:
//!     - used by: main.rs (spawns the poller)
//!     - read by: web.rs (through the shared snapshot)
//!     - uses: managed.rs (UpdateGate + ManagedTask)
//!
//! ==============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::error::MarketError;
use crate::managed::{ManagedTask, UpdateGate};

pub const DEFAULT_PRICE_URL: &str =
    "https://api.coingecko.com/api/v3/simple/price?ids=bitcoin&vs_currencies=usd";
pub const DEFAULT_BLOCK_HEIGHT_URL: &str = "https://blockchain.info/q/getblockcount";

pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const HALVING_INTERVAL: u64 = 210_000;
const INITIAL_REWARD: f64 = 50.0;

/// last known market numbers
#[derive(Clone, Debug, Default, Serialize)]
pub struct MarketSnapshot {
    pub btc_price: f64,
    pub block_reward: f64,
    pub block_reward_value: f64,
    pub price_source: String,
    pub updated_at: Option<DateTime<Utc>>,
}

pub type SharedMarket = Arc<RwLock<MarketSnapshot>>;

/// block subsidy in btc at `height`
pub fn block_reward_for_height(height: u64) -> f64 {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= 64 {
        return 0.0;
    }
    INITIAL_REWARD / 2f64.powi(halvings as i32)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `{"bitcoin": {"usd": 12345.678}}` -> 12345.68
pub fn parse_price(body: &Value) -> Result<f64, MarketError> {
    body.get("bitcoin")
        .and_then(|b| b.get("usd"))
        .and_then(Value::as_f64)
        .map(round2)
        .ok_or_else(|| MarketError::UnexpectedFormat(format!("no bitcoin.usd in {body}")))
}

pub fn parse_block_height(body: &str) -> Result<u64, MarketError> {
    body.trim()
        .parse()
        .map_err(|_| MarketError::UnexpectedFormat(format!("block height {:?}", body.trim())))
}

#[derive(Clone)]
pub struct MarketClient {
    http: reqwest::Client,
    price_url: String,
    block_height_url: String,
}

impl MarketClient {
    pub fn new(
        price_url: impl Into<String>,
        block_height_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, MarketError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            price_url: price_url.into(),
            block_height_url: block_height_url.into(),
        })
    }

    pub async fn fetch(&self) -> Result<MarketSnapshot, MarketError> {
        let price_body: Value = self
            .http
            .get(&self.price_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let btc_price = parse_price(&price_body)?;

        let height_body = self
            .http
            .get(&self.block_height_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let block_reward = block_reward_for_height(parse_block_height(&height_body)?);

        Ok(MarketSnapshot {
            btc_price,
            block_reward,
            block_reward_value: round2(block_reward * btc_price),
            price_source: "CoinGecko".to_string(),
            updated_at: Some(Utc::now()),
        })
    }
}

/// refresh `shared` every `interval` until stopped
pub fn spawn_market_poller(client: MarketClient, shared: SharedMarket, interval: Duration) -> ManagedTask {
    ManagedTask::spawn("btc-info", move |stop| async move {
        let mut gate = UpdateGate::new(interval);
        while !stop.is_stopped() {
            if !gate.needs_update() {
                stop.sleep(Duration::from_secs(1)).await;
                continue;
            }
            match client.fetch().await {
                Ok(snapshot) => {
                    info!(
                        btc_price = snapshot.btc_price,
                        block_reward = snapshot.block_reward,
                        reward_value = snapshot.block_reward_value,
                        "market data updated"
                    );
                    *shared.write().await = snapshot;
                }
                Err(e) => error!("error fetching market data: {e}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_block_reward_halvings() {
        assert_eq!(block_reward_for_height(0), 50.0);
        assert_eq!(block_reward_for_height(209_999), 50.0);
        assert_eq!(block_reward_for_height(210_000), 25.0);
        assert_eq!(block_reward_for_height(840_000), 3.125);
        assert_eq!(block_reward_for_height(64 * 210_000), 0.0);
    }

    #[test]
    fn test_parse_price() {
        assert_eq!(parse_price(&json!({"bitcoin": {"usd": 64123.456}})).unwrap(), 64123.46);
        assert!(matches!(
            parse_price(&json!({"ethereum": {"usd": 1}})),
            Err(MarketError::UnexpectedFormat(_))
        ));
    }

    #[test]
    fn test_parse_block_height() {
        assert_eq!(parse_block_height("880123\n").unwrap(), 880_123);
        assert!(parse_block_height("<html>").is_err());
    }

    #[tokio::test]
    async fn test_poller_keeps_default_on_failure() {
        // nothing listens on port 9 of loopback; every fetch fails fast
        let client = MarketClient::new(
            "http://127.0.0.1:9/price",
            "http://127.0.0.1:9/height",
            Duration::from_millis(200),
        )
        .unwrap();
        let shared = SharedMarket::default();
        let mut task = spawn_market_poller(client, Arc::clone(&shared), Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(task.stop(Duration::from_secs(5)).await);
        assert!(shared.read().await.updated_at.is_none());
    }
}
