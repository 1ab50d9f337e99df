//! CoinGecko client: current price by contract plus the primary historical
//! surface (point-in-time, daily OHLC, lifetime ATH/ATL).
//!
//! Historical endpoints are keyed by CoinGecko coin id, not ticker; ids are
//! resolved through `/search` once per symbol and memoized for the process
//! lifetime.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{check_status, HistoricalProvider, LifetimeExtremes, PriceProvider};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Chain, OhlcCandle, PriceSnapshot, Timeframe};

const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";

pub struct CoinGeckoApi {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    /// symbol (upper) -> coin id, resolved lazily.
    id_cache: RwLock<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct ContractPriceEntry {
    usd: Option<f64>,
    usd_market_cap: Option<f64>,
    usd_24h_vol: Option<f64>,
    usd_24h_change: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    coins: Vec<SearchCoin>,
}

#[derive(Debug, Deserialize)]
struct SearchCoin {
    id: String,
    symbol: String,
}

#[derive(Debug, Deserialize)]
struct MarketChartResponse {
    /// `[timestamp_ms, price]` pairs; timestamps arrive as JSON numbers.
    #[serde(default)]
    prices: Vec<(f64, f64)>,
}

#[derive(Debug, Deserialize)]
struct CoinResponse {
    market_data: Option<CoinMarketData>,
}

#[derive(Debug, Deserialize)]
struct CoinMarketData {
    ath: Option<HashMap<String, f64>>,
    ath_date: Option<HashMap<String, String>>,
    atl: Option<HashMap<String, f64>>,
    atl_date: Option<HashMap<String, String>>,
}

impl CoinGeckoApi {
    pub fn new(
        base_url: Option<String>,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent("callwatch/0.1")
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            id_cache: RwLock::new(HashMap::new()),
        })
    }

    fn platform(chain: Chain) -> Option<&'static str> {
        match chain {
            Chain::Evm => Some("ethereum"),
            Chain::Solana => Some("solana"),
            Chain::Unknown => None,
        }
    }

    fn request(&self, url: String) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(key) = self.api_key.as_deref() {
            req = req.header("x-cg-demo-api-key", key);
        }
        req
    }

    async fn coin_id(&self, symbol: &str) -> PipelineResult<String> {
        let upper = symbol.to_uppercase();
        if let Some(id) = self.id_cache.read().get(&upper) {
            return Ok(id.clone());
        }

        let url = format!("{}/search", self.base_url);
        let response = self
            .request(url)
            .query(&[("query", symbol)])
            .send()
            .await
            .map_err(PipelineError::from_http)?;
        check_status(&response)?;
        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::TransientNetwork(format!("bad search body: {e}")))?;

        let id = body
            .coins
            .iter()
            .find(|c| c.symbol.eq_ignore_ascii_case(symbol))
            .or_else(|| body.coins.first())
            .map(|c| c.id.clone())
            .ok_or(PipelineError::ProviderEmpty)?;

        self.id_cache.write().insert(upper, id.clone());
        Ok(id)
    }

    fn parse_iso_ts(raw: &str) -> Option<i64> {
        chrono::DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.timestamp())
    }
}

#[async_trait]
impl PriceProvider for CoinGeckoApi {
    fn tag(&self) -> &'static str {
        "coingecko"
    }

    fn rate_limit_per_minute(&self) -> u32 {
        30
    }

    async fn current_price(&self, address: &str, chain: Chain) -> PipelineResult<PriceSnapshot> {
        let platform = Self::platform(chain).ok_or(PipelineError::ProviderEmpty)?;
        let url = format!("{}/simple/token_price/{}", self.base_url, platform);
        let response = self
            .request(url)
            .query(&[
                ("contract_addresses", address),
                ("vs_currencies", "usd"),
                ("include_market_cap", "true"),
                ("include_24hr_vol", "true"),
                ("include_24hr_change", "true"),
            ])
            .send()
            .await
            .map_err(PipelineError::from_http)?;
        check_status(&response)?;

        let body: HashMap<String, ContractPriceEntry> = response
            .json()
            .await
            .map_err(|e| PipelineError::TransientNetwork(format!("bad price body: {e}")))?;

        // CoinGecko lowercases contract keys in the response.
        let entry = body
            .get(&address.to_lowercase())
            .or_else(|| body.get(address))
            .ok_or(PipelineError::ProviderEmpty)?;
        let price = entry.usd.filter(|p| *p > 0.0).ok_or(PipelineError::ProviderEmpty)?;

        let mut snap = PriceSnapshot::new(price, PriceProvider::tag(self));
        snap.market_cap = entry.usd_market_cap;
        snap.volume_24h = entry.usd_24h_vol;
        snap.price_change_24h = entry.usd_24h_change;
        debug!(address, price, "coingecko price");
        Ok(snap)
    }
}

#[async_trait]
impl HistoricalProvider for CoinGeckoApi {
    fn tag(&self) -> &'static str {
        "coingecko"
    }

    fn rate_limit_per_minute(&self) -> u32 {
        30
    }

    async fn price_at(&self, symbol: &str, unix_ts: i64) -> PipelineResult<f64> {
        let id = self.coin_id(symbol).await?;
        // A two-hour window around the target; the granularity CoinGecko
        // returns for short ranges is 5-minutely to hourly.
        let url = format!("{}/coins/{}/market_chart/range", self.base_url, id);
        let response = self
            .request(url)
            .query(&[
                ("vs_currency", "usd".to_string()),
                ("from", (unix_ts - 3_600).to_string()),
                ("to", (unix_ts + 3_600).to_string()),
            ])
            .send()
            .await
            .map_err(PipelineError::from_http)?;
        check_status(&response)?;
        let body: MarketChartResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::TransientNetwork(format!("bad chart body: {e}")))?;

        body.prices
            .iter()
            .min_by(|(a_ms, _), (b_ms, _)| {
                let da = (a_ms / 1000.0 - unix_ts as f64).abs();
                let db = (b_ms / 1000.0 - unix_ts as f64).abs();
                da.total_cmp(&db)
            })
            .map(|(_, price)| *price)
            .filter(|p| *p > 0.0)
            .ok_or(PipelineError::ProviderEmpty)
    }

    async fn daily_ohlc(
        &self,
        symbol: &str,
        start_ts: i64,
        days: i64,
    ) -> PipelineResult<Vec<OhlcCandle>> {
        let id = self.coin_id(symbol).await?;
        let url = format!("{}/coins/{}/ohlc", self.base_url, id);
        // The OHLC endpoint counts back from now; request enough days to
        // cover the window and trim client-side.
        let now = Utc::now().timestamp();
        let span_days = ((now - start_ts) / 86_400 + 1).clamp(1, 365);
        let response = self
            .request(url)
            .query(&[
                ("vs_currency", "usd".to_string()),
                ("days", span_days.to_string()),
            ])
            .send()
            .await
            .map_err(PipelineError::from_http)?;
        check_status(&response)?;

        // Shape: [[ts_ms, open, high, low, close], ...]
        let rows: Vec<Vec<f64>> = response
            .json()
            .await
            .map_err(|e| PipelineError::TransientNetwork(format!("bad ohlc body: {e}")))?;

        let end_ts = start_ts + days * 86_400;
        let candles: Vec<OhlcCandle> = rows
            .iter()
            .filter(|row| row.len() >= 5)
            .map(|row| OhlcCandle {
                timestamp: (row[0] / 1000.0) as i64,
                open: row[1],
                high: row[2],
                low: row[3],
                close: row[4],
                timeframe: Timeframe::Day,
            })
            .filter(|c| c.timestamp >= start_ts && c.timestamp <= end_ts && c.is_well_formed())
            .collect();

        if candles.is_empty() {
            return Err(PipelineError::ProviderEmpty);
        }
        Ok(candles)
    }

    async fn lifetime_extremes(&self, symbol: &str) -> PipelineResult<LifetimeExtremes> {
        let id = self.coin_id(symbol).await?;
        let url = format!("{}/coins/{}", self.base_url, id);
        let response = self
            .request(url)
            .query(&[
                ("localization", "false"),
                ("tickers", "false"),
                ("community_data", "false"),
                ("developer_data", "false"),
            ])
            .send()
            .await
            .map_err(PipelineError::from_http)?;
        check_status(&response)?;
        let body: CoinResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::TransientNetwork(format!("bad coin body: {e}")))?;

        let md = body.market_data.ok_or(PipelineError::ProviderEmpty)?;
        let ath = md
            .ath
            .as_ref()
            .and_then(|m| m.get("usd"))
            .copied()
            .ok_or(PipelineError::ProviderEmpty)?;
        let atl = md
            .atl
            .as_ref()
            .and_then(|m| m.get("usd"))
            .copied()
            .ok_or(PipelineError::ProviderEmpty)?;
        let ath_ts = md
            .ath_date
            .as_ref()
            .and_then(|m| m.get("usd"))
            .and_then(|s| Self::parse_iso_ts(s))
            .unwrap_or(0);
        let atl_ts = md
            .atl_date
            .as_ref()
            .and_then(|m| m.get("usd"))
            .and_then(|s| Self::parse_iso_ts(s))
            .unwrap_or(0);

        Ok(LifetimeExtremes { ath, ath_ts, atl, atl_ts })
    }
}
