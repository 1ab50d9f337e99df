//! Market-data provider clients.
//!
//! Each provider is a thin reqwest client that normalizes its own response
//! shape into the crate's `PriceSnapshot` / `OhlcCandle` types. Providers
//! are identified only by their string tag; the engine owns ordering,
//! rate limiting, retries, and failover.

pub mod coingecko;
pub mod cryptocompare;
pub mod dexscreener;
pub mod geckoterminal;
pub mod jupiter;

use async_trait::async_trait;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{Chain, OhlcCandle, PriceSnapshot};

pub use coingecko::CoinGeckoApi;
pub use cryptocompare::CryptoCompareApi;
pub use dexscreener::DexScreenerApi;
pub use geckoterminal::GeckoTerminalApi;
pub use jupiter::JupiterPriceApi;

/// Current-price-by-address surface.
#[async_trait]
pub trait PriceProvider: Send + Sync {
    /// Stable string tag stamped onto every snapshot this provider emits.
    fn tag(&self) -> &'static str;

    /// Advertised request ceiling, requests per minute.
    fn rate_limit_per_minute(&self) -> u32;

    async fn current_price(&self, address: &str, chain: Chain) -> PipelineResult<PriceSnapshot>;
}

/// Lifetime high/low for one symbol.
#[derive(Debug, Clone, Copy)]
pub struct LifetimeExtremes {
    pub ath: f64,
    pub ath_ts: i64,
    pub atl: f64,
    pub atl_ts: i64,
}

/// Point-in-time and OHLC history surface.
#[async_trait]
pub trait HistoricalProvider: Send + Sync {
    fn tag(&self) -> &'static str;

    fn rate_limit_per_minute(&self) -> u32;

    /// Price of `symbol` at (or nearest to) `unix_ts`.
    async fn price_at(&self, symbol: &str, unix_ts: i64) -> PipelineResult<f64>;

    /// Daily OHLC candles covering `[start_ts, start_ts + days]`.
    async fn daily_ohlc(&self, symbol: &str, start_ts: i64, days: i64)
        -> PipelineResult<Vec<OhlcCandle>>;

    /// Lifetime ATH/ATL for the symbol.
    async fn lifetime_extremes(&self, symbol: &str) -> PipelineResult<LifetimeExtremes>;
}

/// Shared helper: map an HTTP response status to the error taxonomy before
/// body parsing. 404s and other client errors mean the provider does not
/// know the token; 5xx and 429 are transient.
pub(crate) fn check_status(response: &reqwest::Response) -> PipelineResult<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    if status.as_u16() == 429 || status.is_server_error() {
        return Err(PipelineError::TransientNetwork(format!("http {}", status)));
    }
    Err(PipelineError::ProviderEmpty)
}

/// Parse a numeric field providers ship as either a JSON number or string.
pub(crate) fn flexible_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flexible_f64_handles_numbers_and_strings() {
        assert_eq!(flexible_f64(&serde_json::json!(1.5)), Some(1.5));
        assert_eq!(flexible_f64(&serde_json::json!("2.25")), Some(2.25));
        assert_eq!(flexible_f64(&serde_json::json!(null)), None);
        assert_eq!(flexible_f64(&serde_json::json!("nope")), None);
    }
}
