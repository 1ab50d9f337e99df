//! GeckoTerminal token endpoint client.
//!
//! Second general provider: indexes DEX pools directly, so it prices tokens
//! CoinGecko has not listed, and reports FDV/market cap and total supply.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{check_status, flexible_f64, PriceProvider};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Chain, PriceSnapshot};

const DEFAULT_BASE_URL: &str = "https://api.geckoterminal.com/api/v2";

pub struct GeckoTerminalApi {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    data: Option<TokenData>,
}

#[derive(Debug, Deserialize)]
struct TokenData {
    attributes: TokenAttributes,
}

#[derive(Debug, Deserialize)]
struct TokenAttributes {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    price_usd: Option<serde_json::Value>,
    #[serde(default)]
    market_cap_usd: Option<serde_json::Value>,
    #[serde(default)]
    fdv_usd: Option<serde_json::Value>,
    #[serde(default)]
    total_supply: Option<serde_json::Value>,
    #[serde(default)]
    volume_usd: Option<VolumeUsd>,
}

#[derive(Debug, Deserialize)]
struct VolumeUsd {
    #[serde(default)]
    h24: Option<serde_json::Value>,
}

impl GeckoTerminalApi {
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

    fn network(chain: Chain) -> Option<&'static str> {
        match chain {
            Chain::Evm => Some("eth"),
            Chain::Solana => Some("solana"),
            Chain::Unknown => None,
        }
    }
}

#[async_trait]
impl PriceProvider for GeckoTerminalApi {
    fn tag(&self) -> &'static str {
        "geckoterminal"
    }

    fn rate_limit_per_minute(&self) -> u32 {
        30
    }

    async fn current_price(&self, address: &str, chain: Chain) -> PipelineResult<PriceSnapshot> {
        let network = Self::network(chain).ok_or(PipelineError::ProviderEmpty)?;
        let url = format!("{}/networks/{}/tokens/{}", self.base_url, network, address);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(PipelineError::from_http)?;
        check_status(&response)?;

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::TransientNetwork(format!("bad token body: {e}")))?;
        let attrs = body.data.ok_or(PipelineError::ProviderEmpty)?.attributes;

        let price = attrs
            .price_usd
            .as_ref()
            .and_then(flexible_f64)
            .filter(|p| *p > 0.0)
            .ok_or(PipelineError::ProviderEmpty)?;

        let mut snap = PriceSnapshot::new(price, self.tag());
        snap.symbol = attrs.symbol;
        snap.market_cap = attrs
            .market_cap_usd
            .as_ref()
            .and_then(flexible_f64)
            .or_else(|| attrs.fdv_usd.as_ref().and_then(flexible_f64));
        snap.total_supply = attrs.total_supply.as_ref().and_then(flexible_f64);
        snap.volume_24h = attrs
            .volume_usd
            .as_ref()
            .and_then(|v| v.h24.as_ref())
            .and_then(flexible_f64);
        debug!(address, price, "geckoterminal price");
        Ok(snap)
    }
}
