//! CryptoCompare historical client (secondary, symbol-keyed).
//!
//! Fallback for the historical retriever when CoinGecko returns empty or
//! errors. Point-in-time uses `pricehistorical`; candles and lifetime
//! extremes come from `histoday`.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{check_status, HistoricalProvider, LifetimeExtremes};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{OhlcCandle, Timeframe};

const DEFAULT_BASE_URL: &str = "https://min-api.cryptocompare.com";

pub struct CryptoCompareApi {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoDayResponse {
    #[serde(rename = "Response")]
    response: Option<String>,
    #[serde(rename = "Data")]
    data: Option<HistoDayData>,
}

#[derive(Debug, Deserialize)]
struct HistoDayData {
    #[serde(rename = "Data", default)]
    data: Vec<HistoDayBar>,
}

#[derive(Debug, Deserialize)]
struct HistoDayBar {
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

impl CryptoCompareApi {
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
        })
    }

    fn request(&self, url: String) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(key) = self.api_key.as_deref() {
            req = req.header("authorization", format!("Apikey {key}"));
        }
        req
    }

    async fn histoday(
        &self,
        symbol: &str,
        to_ts: Option<i64>,
        limit: i64,
        all_data: bool,
    ) -> PipelineResult<Vec<HistoDayBar>> {
        let url = format!("{}/data/v2/histoday", self.base_url);
        let mut query: Vec<(&str, String)> = vec![
            ("fsym", symbol.to_uppercase()),
            ("tsym", "USD".to_string()),
            ("limit", limit.clamp(1, 2000).to_string()),
        ];
        if let Some(to_ts) = to_ts {
            query.push(("toTs", to_ts.to_string()));
        }
        if all_data {
            query.push(("allData", "true".to_string()));
        }

        let response = self
            .request(url)
            .query(&query)
            .send()
            .await
            .map_err(PipelineError::from_http)?;
        check_status(&response)?;

        let body: HistoDayResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::TransientNetwork(format!("bad histoday body: {e}")))?;

        if body.response.as_deref() == Some("Error") {
            return Err(PipelineError::ProviderEmpty);
        }
        let bars = body.data.map(|d| d.data).unwrap_or_default();
        if bars.is_empty() {
            return Err(PipelineError::ProviderEmpty);
        }
        Ok(bars)
    }
}

#[async_trait]
impl HistoricalProvider for CryptoCompareApi {
    fn tag(&self) -> &'static str {
        "cryptocompare"
    }

    fn rate_limit_per_minute(&self) -> u32 {
        80
    }

    async fn price_at(&self, symbol: &str, unix_ts: i64) -> PipelineResult<f64> {
        let url = format!("{}/data/pricehistorical", self.base_url);
        let response = self
            .request(url)
            .query(&[
                ("fsym", symbol.to_uppercase()),
                ("tsyms", "USD".to_string()),
                ("ts", unix_ts.to_string()),
            ])
            .send()
            .await
            .map_err(PipelineError::from_http)?;
        check_status(&response)?;

        let body: HashMap<String, HashMap<String, f64>> = response
            .json()
            .await
            .map_err(|e| PipelineError::TransientNetwork(format!("bad historical body: {e}")))?;

        let price = body
            .get(&symbol.to_uppercase())
            .and_then(|m| m.get("USD"))
            .copied()
            .filter(|p| *p > 0.0)
            .ok_or(PipelineError::ProviderEmpty)?;
        debug!(symbol, unix_ts, price, "cryptocompare point-in-time price");
        Ok(price)
    }

    async fn daily_ohlc(
        &self,
        symbol: &str,
        start_ts: i64,
        days: i64,
    ) -> PipelineResult<Vec<OhlcCandle>> {
        let end_ts = start_ts + days * 86_400;
        let bars = self.histoday(symbol, Some(end_ts), days, false).await?;

        let candles: Vec<OhlcCandle> = bars
            .into_iter()
            .map(|b| OhlcCandle {
                open: b.open,
                high: b.high,
                low: b.low,
                close: b.close,
                timestamp: b.time,
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
        let bars = self.histoday(symbol, None, 2000, true).await?;

        let mut best: Option<LifetimeExtremes> = None;
        for bar in bars.iter().filter(|b| b.high > 0.0) {
            let extremes = best.get_or_insert(LifetimeExtremes {
                ath: bar.high,
                ath_ts: bar.time,
                atl: bar.low,
                atl_ts: bar.time,
            });
            if bar.high > extremes.ath {
                extremes.ath = bar.high;
                extremes.ath_ts = bar.time;
            }
            if bar.low > 0.0 && bar.low < extremes.atl {
                extremes.atl = bar.low;
                extremes.atl_ts = bar.time;
            }
        }
        best.ok_or(PipelineError::ProviderEmpty)
    }
}
