//! Historical price retrieval: point-in-time entry prices, forward ATH
//! windows, and checkpoint multipliers.
//!
//! Entry prices walk a bucket ladder (exact, +/-1h, +/-6h, +/-24h, current
//! fallback) and record which rung answered. Window results are immutable
//! and cached on disk forever. Every lookup fails over from the primary
//! historical provider to the secondary when the primary errors or comes
//! back empty.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{Checkpoint, EntryPriceSource, OhlcCandle};
use crate::pricing::cache::TtlCache;
use crate::pricing::rate_limiter::RateLimiterRegistry;
use crate::providers::{HistoricalProvider, LifetimeExtremes};
use crate::shutdown::ShutdownToken;

/// Bucket rungs tried after the exact timestamp, in seconds.
const BUCKET_RUNGS: [(i64, EntryPriceSource); 3] = [
    (3_600, EntryPriceSource::BucketHour),
    (6 * 3_600, EntryPriceSource::BucketSixHours),
    (24 * 3_600, EntryPriceSource::BucketDay),
];

const MEMO_CAPACITY: usize = 8192;
const BUCKET_BURST: u32 = 3;

/// Result of a forward-looking ATH window fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AthWindow {
    pub ath_price: f64,
    /// Close time of the ATH candle, unix seconds.
    pub ath_timestamp: i64,
    /// Whole-day offset of the ATH from the window start.
    pub days_to_ath: i64,
    pub candles: Vec<OhlcCandle>,
    /// Returned candles / expected candles, in [0, 1].
    pub completeness: f64,
}

/// Persistent, never-expiring cache of window results keyed by
/// `(symbol, start_bucket, window_days)`.
struct WindowDiskCache {
    path: PathBuf,
    entries: RwLock<HashMap<String, AthWindow>>,
}

impl WindowDiskCache {
    fn load(path: PathBuf) -> anyhow::Result<Self> {
        let entries = crate::fsutil::load_json_or(&path, HashMap::new)?;
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    fn key(symbol: &str, start_bucket: i64, window_days: i64) -> String {
        format!("{}:{}:{}", symbol.to_uppercase(), start_bucket, window_days)
    }

    fn get(&self, key: &str) -> Option<AthWindow> {
        self.entries.read().get(key).cloned()
    }

    fn insert(&self, key: String, window: AthWindow) -> anyhow::Result<()> {
        {
            self.entries.write().insert(key, window);
        }
        let snapshot = self.entries.read().clone();
        crate::fsutil::save_json_pretty(&self.path, &snapshot)
    }
}

pub struct HistoricalPriceService {
    primary: Arc<dyn HistoricalProvider>,
    secondary: Arc<dyn HistoricalProvider>,
    limiter: RateLimiterRegistry,
    /// (symbol, bucketed ts) -> price. Historical prices are immutable, so
    /// entries never expire.
    point_memo: TtlCache<(String, i64), f64>,
    disk: WindowDiskCache,
}

impl HistoricalPriceService {
    pub fn new(
        primary: Arc<dyn HistoricalProvider>,
        secondary: Arc<dyn HistoricalProvider>,
        cache_path: PathBuf,
        shutdown: ShutdownToken,
    ) -> anyhow::Result<Self> {
        let mut limiter = RateLimiterRegistry::new();
        for provider in [&primary, &secondary] {
            limiter.register(
                provider.tag(),
                provider.rate_limit_per_minute(),
                BUCKET_BURST,
                shutdown.clone(),
            );
        }
        Ok(Self {
            primary,
            secondary,
            limiter,
            point_memo: TtlCache::new(MEMO_CAPACITY, None),
            disk: WindowDiskCache::load(cache_path)?,
        })
    }

    async fn point_price_with_failover(&self, symbol: &str, ts: i64) -> PipelineResult<f64> {
        let memo_key = (symbol.to_uppercase(), ts);
        if let Some(price) = self.point_memo.get(&memo_key) {
            return Ok(price);
        }

        self.limiter.acquire(self.primary.tag()).await?;
        let primary = self.primary.price_at(symbol, ts).await;
        let price = match primary {
            Ok(price) => price,
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(err) => {
                debug!(symbol, ts, %err, "primary historical provider failed, trying secondary");
                self.limiter.acquire(self.secondary.tag()).await?;
                self.secondary.price_at(symbol, ts).await?
            }
        };

        self.point_memo.insert(memo_key, price);
        Ok(price)
    }

    /// Entry price for `symbol` at `t`, walking the bucket ladder. The
    /// first rung to answer wins; `current_price` backs the final rung.
    pub async fn entry_price_at(
        &self,
        symbol: &str,
        t: i64,
        current_price: Option<f64>,
    ) -> PipelineResult<(f64, EntryPriceSource)> {
        match self.point_price_with_failover(symbol, t).await {
            Ok(price) => return Ok((price, EntryPriceSource::Exact)),
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(_) => {}
        }

        for (bucket, source) in BUCKET_RUNGS {
            let bucketed = t - t.rem_euclid(bucket);
            match self.point_price_with_failover(symbol, bucketed).await {
                Ok(price) => return Ok((price, source)),
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(_) => {}
            }
        }

        match current_price.filter(|p| *p > 0.0) {
            Some(price) => {
                warn!(symbol, t, "all historical rungs empty, falling back to current price");
                Ok((price, EntryPriceSource::CurrentFallback))
            }
            None => Err(PipelineError::ProviderEmpty),
        }
    }

    /// Forward-looking ATH over `[t_entry, t_entry + window_days]`.
    pub async fn forward_ath_window(
        &self,
        symbol: &str,
        t_entry: i64,
        window_days: i64,
    ) -> PipelineResult<AthWindow> {
        let start_bucket = t_entry - t_entry.rem_euclid(86_400);
        let key = WindowDiskCache::key(symbol, start_bucket, window_days);
        if let Some(cached) = self.disk.get(&key) {
            metrics::counter!("callwatch_ath_window_cache_hits", 1);
            return Ok(cached);
        }

        self.limiter.acquire(self.primary.tag()).await?;
        let candles = match self.primary.daily_ohlc(symbol, t_entry, window_days).await {
            Ok(candles) => candles,
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(err) => {
                debug!(symbol, %err, "primary OHLC failed, trying secondary");
                self.limiter.acquire(self.secondary.tag()).await?;
                self.secondary.daily_ohlc(symbol, t_entry, window_days).await?
            }
        };

        let window = Self::summarize_window(t_entry, window_days, candles)?;
        if let Err(err) = self.disk.insert(key, window.clone()) {
            warn!(%err, "failed to persist ATH window cache");
        }
        Ok(window)
    }

    fn summarize_window(
        t_entry: i64,
        window_days: i64,
        candles: Vec<OhlcCandle>,
    ) -> PipelineResult<AthWindow> {
        let best = candles
            .iter()
            .max_by(|a, b| a.high.total_cmp(&b.high))
            .copied()
            .ok_or(PipelineError::ProviderEmpty)?;

        let completeness =
            (candles.len() as f64 / window_days.max(1) as f64).clamp(0.0, 1.0);
        Ok(AthWindow {
            ath_price: best.high,
            ath_timestamp: best.timestamp,
            days_to_ath: ((best.timestamp - t_entry).max(0)) / 86_400,
            candles,
            completeness,
        })
    }

    /// Lifetime ATH/ATL for the symbol, with failover.
    pub async fn lifetime_extremes(&self, symbol: &str) -> PipelineResult<LifetimeExtremes> {
        self.limiter.acquire(self.primary.tag()).await?;
        match self.primary.lifetime_extremes(symbol).await {
            Ok(extremes) => Ok(extremes),
            Err(PipelineError::Cancelled) => Err(PipelineError::Cancelled),
            Err(err) => {
                debug!(symbol, %err, "primary extremes failed, trying secondary");
                self.limiter.acquire(self.secondary.tag()).await?;
                self.secondary.lifetime_extremes(symbol).await
            }
        }
    }

    /// Per-checkpoint multipliers from a candle window: for each offset,
    /// the candle closing nearest at-or-before the checkpoint instant.
    pub fn checkpoint_multipliers(
        entry_price: f64,
        entry_t: i64,
        candles: &[OhlcCandle],
        checkpoints: &[Checkpoint],
    ) -> BTreeMap<Checkpoint, f64> {
        let mut out = BTreeMap::new();
        if entry_price <= 0.0 {
            return out;
        }
        for cp in checkpoints {
            let instant = entry_t + cp.offset_secs();
            let candle = candles
                .iter()
                .filter(|c| c.timestamp <= instant)
                .max_by_key(|c| c.timestamp);
            if let Some(candle) = candle {
                out.insert(*cp, candle.close / entry_price);
            }
        }
        out
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Timeframe;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn candle(ts: i64, high: f64, close: f64) -> OhlcCandle {
        OhlcCandle {
            open: close,
            high,
            low: close.min(high) * 0.5,
            close,
            timestamp: ts,
            timeframe: Timeframe::Day,
        }
    }

    struct FakeHistory {
        tag: &'static str,
        point_price: Option<f64>,
        candles: Vec<OhlcCandle>,
        point_calls: AtomicU32,
        ohlc_calls: AtomicU32,
        /// Timestamps for which point lookups answer; empty = answer all.
        only_ts: Vec<i64>,
    }

    impl FakeHistory {
        fn new(tag: &'static str, point_price: Option<f64>, candles: Vec<OhlcCandle>) -> Arc<Self> {
            Arc::new(Self {
                tag,
                point_price,
                candles,
                point_calls: AtomicU32::new(0),
                ohlc_calls: AtomicU32::new(0),
                only_ts: Vec::new(),
            })
        }

        fn answering_only(tag: &'static str, price: f64, only_ts: Vec<i64>) -> Arc<Self> {
            Arc::new(Self {
                tag,
                point_price: Some(price),
                candles: Vec::new(),
                point_calls: AtomicU32::new(0),
                ohlc_calls: AtomicU32::new(0),
                only_ts,
            })
        }
    }

    #[async_trait]
    impl HistoricalProvider for FakeHistory {
        fn tag(&self) -> &'static str {
            self.tag
        }

        fn rate_limit_per_minute(&self) -> u32 {
            6000
        }

        async fn price_at(&self, _symbol: &str, unix_ts: i64) -> PipelineResult<f64> {
            self.point_calls.fetch_add(1, Ordering::SeqCst);
            if !self.only_ts.is_empty() && !self.only_ts.contains(&unix_ts) {
                return Err(PipelineError::ProviderEmpty);
            }
            self.point_price.ok_or(PipelineError::ProviderEmpty)
        }

        async fn daily_ohlc(
            &self,
            _symbol: &str,
            _start_ts: i64,
            _days: i64,
        ) -> PipelineResult<Vec<OhlcCandle>> {
            self.ohlc_calls.fetch_add(1, Ordering::SeqCst);
            if self.candles.is_empty() {
                return Err(PipelineError::ProviderEmpty);
            }
            Ok(self.candles.clone())
        }

        async fn lifetime_extremes(&self, _symbol: &str) -> PipelineResult<LifetimeExtremes> {
            Err(PipelineError::ProviderEmpty)
        }
    }

    fn service(
        primary: Arc<FakeHistory>,
        secondary: Arc<FakeHistory>,
        dir: &tempfile::TempDir,
    ) -> HistoricalPriceService {
        HistoricalPriceService::new(
            primary,
            secondary,
            dir.path().join("historical_prices.json"),
            ShutdownToken::detached(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn exact_rung_wins_when_primary_answers() {
        let dir = tempfile::tempdir().unwrap();
        let primary = FakeHistory::new("p", Some(1.25), vec![]);
        let secondary = FakeHistory::new("s", Some(9.0), vec![]);
        let svc = service(primary, secondary.clone(), &dir);

        let (price, source) = svc.entry_price_at("PEPE", 1_700_000_123, None).await.unwrap();
        assert_eq!(price, 1.25);
        assert_eq!(source, EntryPriceSource::Exact);
        assert_eq!(secondary.point_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ladder_descends_to_hour_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let t = 1_700_003_999i64;
        let hour_bucket = t - t.rem_euclid(3_600);
        let primary = FakeHistory::answering_only("p", 0.5, vec![hour_bucket]);
        // Secondary never answers anything, forcing the ladder to stay on
        // the primary's buckets.
        let secondary = FakeHistory::new("s", None, vec![]);
        let svc = service(primary, secondary, &dir);

        let (price, source) = svc.entry_price_at("PEPE", t, None).await.unwrap();
        assert_eq!(price, 0.5);
        assert_eq!(source, EntryPriceSource::BucketHour);
    }

    #[tokio::test]
    async fn current_fallback_is_last_resort() {
        let dir = tempfile::tempdir().unwrap();
        let primary = FakeHistory::new("p", None, vec![]);
        let secondary = FakeHistory::new("s", None, vec![]);
        let svc = service(primary, secondary, &dir);

        let (price, source) = svc.entry_price_at("PEPE", 1_700_000_000, Some(0.01)).await.unwrap();
        assert_eq!(price, 0.01);
        assert_eq!(source, EntryPriceSource::CurrentFallback);

        let err = svc.entry_price_at("PEPE", 1_700_000_000, None).await;
        assert!(matches!(err, Err(PipelineError::ProviderEmpty)));
    }

    #[tokio::test]
    async fn ath_window_failover_and_disk_cache() {
        let dir = tempfile::tempdir().unwrap();
        let t_entry = 1_700_000_000i64;
        let candles = vec![
            candle(t_entry + 86_400, 2.0, 1.8),
            candle(t_entry + 2 * 86_400, 5.0, 4.0),
            candle(t_entry + 3 * 86_400, 3.0, 2.5),
        ];
        let primary = FakeHistory::new("p", None, vec![]);
        let secondary = FakeHistory::new("s", None, candles);
        let svc = service(primary.clone(), secondary.clone(), &dir);

        let window = svc.forward_ath_window("PEPE", t_entry, 30).await.unwrap();
        assert_eq!(window.ath_price, 5.0);
        assert_eq!(window.ath_timestamp, t_entry + 2 * 86_400);
        assert_eq!(window.days_to_ath, 2);
        assert!((window.completeness - 0.1).abs() < 1e-9);
        assert_eq!(primary.ohlc_calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary.ohlc_calls.load(Ordering::SeqCst), 1);

        // Second call is served from disk.
        let again = svc.forward_ath_window("PEPE", t_entry, 30).await.unwrap();
        assert_eq!(again.ath_price, 5.0);
        assert_eq!(secondary.ohlc_calls.load(Ordering::SeqCst), 1);

        // And survives a process restart.
        let svc2 = service(
            FakeHistory::new("p", None, vec![]),
            FakeHistory::new("s", None, vec![]),
            &dir,
        );
        let persisted = svc2.forward_ath_window("PEPE", t_entry, 30).await.unwrap();
        assert_eq!(persisted.ath_price, 5.0);
    }

    #[test]
    fn checkpoint_multipliers_pick_nearest_at_or_before() {
        let entry_t = 1_700_000_000i64;
        let candles = vec![
            candle(entry_t + 86_400, 2.0, 2.0),
            candle(entry_t + 2 * 86_400, 4.0, 3.0),
            candle(entry_t + 10 * 86_400, 8.0, 6.0),
        ];
        let out = HistoricalPriceService::checkpoint_multipliers(
            2.0,
            entry_t,
            &candles,
            &Checkpoint::ALL,
        );
        // Nothing closes at or before the 1h/4h checkpoints.
        assert!(!out.contains_key(&Checkpoint::H1));
        assert!(!out.contains_key(&Checkpoint::H4));
        assert_eq!(out[&Checkpoint::H24], 1.0);
        assert_eq!(out[&Checkpoint::D3], 1.5);
        assert_eq!(out[&Checkpoint::D7], 1.5);
        assert_eq!(out[&Checkpoint::D30], 3.0);
    }
}
