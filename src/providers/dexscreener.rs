//! DexScreener pair lookup client (DEX aggregator, last in every order).
//!
//! Returns one entry per trading pair; the deepest pool by liquidity is the
//! one whose quote we trust. Also the only provider in the set that reports
//! pair-creation time, which the dead-token rules care about.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{check_status, PriceProvider};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Chain, PriceSnapshot};

const DEFAULT_BASE_URL: &str = "https://api.dexscreener.com";

pub struct DexScreenerApi {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct TokensResponse {
    #[serde(default)]
    pairs: Option<Vec<Pair>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pair {
    chain_id: String,
    price_usd: Option<String>,
    #[serde(default)]
    fdv: Option<f64>,
    #[serde(default)]
    market_cap: Option<f64>,
    #[serde(default)]
    volume: Option<PairVolume>,
    #[serde(default)]
    price_change: Option<PairChange>,
    #[serde(default)]
    liquidity: Option<PairLiquidity>,
    /// Milliseconds since epoch.
    #[serde(default)]
    pair_created_at: Option<i64>,
    base_token: Option<BaseToken>,
}

#[derive(Debug, Deserialize)]
struct PairVolume {
    #[serde(default)]
    h24: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PairChange {
    #[serde(default)]
    h24: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PairLiquidity {
    #[serde(default)]
    usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BaseToken {
    #[serde(default)]
    symbol: Option<String>,
}

impl DexScreenerApi {
    pub fn new(base_url: Option<String>, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent("callwatch/0.1")
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }

    fn chain_matches(chain: Chain, chain_id: &str) -> bool {
        match chain {
            Chain::Evm => chain_id != "solana",
            Chain::Solana => chain_id == "solana",
            Chain::Unknown => true,
        }
    }
}

#[async_trait]
impl PriceProvider for DexScreenerApi {
    fn tag(&self) -> &'static str {
        "dexscreener"
    }

    fn rate_limit_per_minute(&self) -> u32 {
        300
    }

    async fn current_price(&self, address: &str, chain: Chain) -> PipelineResult<PriceSnapshot> {
        let url = format!("{}/latest/dex/tokens/{}", self.base_url, address);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(PipelineError::from_http)?;
        check_status(&response)?;

        let body: TokensResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::TransientNetwork(format!("bad pairs body: {e}")))?;

        let pairs = body.pairs.unwrap_or_default();
        let best = pairs
            .into_iter()
            .filter(|p| Self::chain_matches(chain, &p.chain_id))
            .filter(|p| p.price_usd.is_some())
            .max_by(|a, b| {
                let la = a.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
                let lb = b.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
                la.total_cmp(&lb)
            })
            .ok_or(PipelineError::ProviderEmpty)?;

        let price: f64 = best
            .price_usd
            .as_deref()
            .and_then(|s| s.parse().ok())
            .filter(|p: &f64| *p > 0.0)
            .ok_or(PipelineError::ProviderEmpty)?;

        let mut snap = PriceSnapshot::new(price, self.tag());
        snap.market_cap = best.market_cap.or(best.fdv);
        snap.volume_24h = best.volume.as_ref().and_then(|v| v.h24);
        snap.price_change_24h = best.price_change.as_ref().and_then(|c| c.h24);
        snap.liquidity_usd = best.liquidity.as_ref().and_then(|l| l.usd);
        snap.pair_created_at = best.pair_created_at.map(|ms| ms / 1000);
        snap.symbol = best.base_token.and_then(|t| t.symbol);
        debug!(address, price, "dexscreener price");
        Ok(snap)
    }
}
