//! Core data model for the call-tracking pipeline.
//!
//! Message events flow in from the chat transport, get classified into
//! processed messages, and every surviving token mention becomes a tracked
//! signal outcome. Everything here is plain data; behavior lives in the
//! component modules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which chain an extracted address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    Evm,
    Solana,
    Unknown,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Evm => "evm",
            Chain::Solana => "solana",
            Chain::Unknown => "unknown",
        }
    }
}

/// Sentiment label produced by the analyzer collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

impl SentimentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Neutral => "neutral",
            SentimentLabel::Negative => "negative",
        }
    }
}

/// Sentiment verdict: label plus signed score in [-1, 1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Sentiment {
    pub label: SentimentLabel,
    pub score: f64,
}

impl Sentiment {
    pub fn neutral() -> Self {
        Self {
            label: SentimentLabel::Neutral,
            score: 0.0,
        }
    }
}

/// A raw message event as delivered by the chat transport. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub channel_id: String,
    pub channel_name: String,
    /// Stable within a channel; monotonically increasing for Telegram-style
    /// transports.
    pub message_id: i64,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub forwards: u32,
    pub views: u32,
    pub replies: u32,
    pub reactions: u32,
}

/// A message event after classification by the message processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedMessage {
    pub event: MessageEvent,
    pub crypto_relevant: bool,
    /// Raw mentions: tickers (upper-cased, prefix stripped) and
    /// address-shaped strings, in order of appearance.
    pub mentions: Vec<String>,
    pub sentiment: Sentiment,
    /// Normalized engagement score in [0, 100].
    pub engagement_score: f64,
    /// Weighted confidence in [0, 1].
    pub confidence: f64,
    pub high_confidence: bool,
}

/// An extracted, chain-classified token address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenAddress {
    pub literal: String,
    pub chain: Chain,
    pub valid: bool,
    pub ticker: Option<String>,
    pub snapshot: Option<PriceSnapshot>,
}

impl TokenAddress {
    pub fn new(literal: impl Into<String>, chain: Chain, valid: bool) -> Self {
        Self {
            literal: literal.into(),
            chain,
            valid,
            ticker: None,
            snapshot: None,
        }
    }

    pub fn with_ticker(mut self, ticker: impl Into<String>) -> Self {
        self.ticker = Some(ticker.into());
        self
    }
}

/// A normalized current-price observation from one provider.
///
/// Exactly one provider tag per snapshot; `price_usd > 0` whenever a
/// snapshot exists at all (the engine returns `None` instead of a zero
/// price).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub price_usd: f64,
    pub market_cap: Option<f64>,
    pub volume_24h: Option<f64>,
    pub price_change_24h: Option<f64>,
    pub liquidity_usd: Option<f64>,
    /// Unix seconds the trading pair was created, when the provider knows.
    pub pair_created_at: Option<i64>,
    pub total_supply: Option<f64>,
    pub symbol: Option<String>,
    pub provider: String,
    pub observed_at: DateTime<Utc>,
}

impl PriceSnapshot {
    pub fn new(price_usd: f64, provider: impl Into<String>) -> Self {
        Self {
            price_usd,
            market_cap: None,
            volume_24h: None,
            price_change_24h: None,
            liquidity_usd: None,
            pair_created_at: None,
            total_supply: None,
            symbol: None,
            provider: provider.into(),
            observed_at: Utc::now(),
        }
    }
}

/// OHLC candle timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeframe {
    Hour,
    Day,
}

/// A single OHLC candle. Invariant: low <= min(open, close) <=
/// max(open, close) <= high, and high >= 0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OhlcCandle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Candle close time, unix seconds.
    pub timestamp: i64,
    pub timeframe: Timeframe,
}

impl OhlcCandle {
    /// Structural sanity check used before candles are cached or consumed.
    pub fn is_well_formed(&self) -> bool {
        let body_lo = self.open.min(self.close);
        let body_hi = self.open.max(self.close);
        self.high >= 0.0 && self.low <= body_lo && body_hi <= self.high
    }
}

/// Which rung of the historical ladder produced an entry price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryPriceSource {
    Exact,
    BucketHour,
    BucketSixHours,
    BucketDay,
    CurrentFallback,
}

impl EntryPriceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryPriceSource::Exact => "exact",
            EntryPriceSource::BucketHour => "bucket_1h",
            EntryPriceSource::BucketSixHours => "bucket_6h",
            EntryPriceSource::BucketDay => "bucket_24h",
            EntryPriceSource::CurrentFallback => "current_fallback",
        }
    }
}

/// Fixed checkpoint offsets from signal entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    H1,
    H4,
    H24,
    D3,
    D7,
    D30,
}

impl Checkpoint {
    pub const ALL: [Checkpoint; 6] = [
        Checkpoint::H1,
        Checkpoint::H4,
        Checkpoint::H24,
        Checkpoint::D3,
        Checkpoint::D7,
        Checkpoint::D30,
    ];

    /// Offset from entry, in seconds.
    pub fn offset_secs(&self) -> i64 {
        match self {
            Checkpoint::H1 => 3_600,
            Checkpoint::H4 => 4 * 3_600,
            Checkpoint::H24 => 24 * 3_600,
            Checkpoint::D3 => 3 * 86_400,
            Checkpoint::D7 => 7 * 86_400,
            Checkpoint::D30 => 30 * 86_400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Checkpoint::H1 => "1h",
            Checkpoint::H4 => "4h",
            Checkpoint::H24 => "24h",
            Checkpoint::D3 => "3d",
            Checkpoint::D7 => "7d",
            Checkpoint::D30 => "30d",
        }
    }
}

/// Why a token was declared dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadReason {
    /// Supply below 1000 wei-equivalent units at the time of the call.
    NoSupply,
    /// Tiny supply on an old contract that still exposes a reserves accessor.
    DeadLp,
    /// No transfers and older than the protection window.
    Stale,
}

impl DeadReason {
    /// Multiplier assigned to an outcome that completes dead.
    pub fn completion_multiplier(&self) -> f64 {
        match self {
            DeadReason::NoSupply => 0.0,
            DeadReason::DeadLp => 0.2,
            DeadReason::Stale => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeadReason::NoSupply => "no_supply",
            DeadReason::DeadLp => "dead_lp",
            DeadReason::Stale => "stale",
        }
    }
}

/// Persistent blacklist entry for a dead token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadTokenEntry {
    pub address: String,
    pub chain: Chain,
    pub reason: DeadReason,
    pub supply: Option<String>,
    pub holders: Option<u64>,
    pub transfers: Option<u64>,
    pub detected_at: DateTime<Utc>,
}

/// Tracked-signal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    InProgress,
    Completed,
    InsufficientData,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::InProgress => "in_progress",
            SignalStatus::Completed => "completed",
            SignalStatus::InsufficientData => "insufficient_data",
        }
    }
}

/// One tracked opportunity: (channel, address, ordinal).
///
/// Invariants: `entry_price > 0` unless status is insufficient_data;
/// `ath_price >= entry_price`; `ath_time >= entry_time`; ordinals strictly
/// increase per (channel, address) as signals archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalOutcome {
    pub channel_id: String,
    pub channel_name: String,
    pub address: String,
    pub chain: Chain,
    pub symbol: Option<String>,
    pub first_message_id: i64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_source: EntryPriceSource,
    /// 1-based; 1 + count of archived signals for this (channel, address).
    pub signal_ordinal: u32,
    /// Ordinals of archived prior signals for the same pair.
    pub previous_signals: Vec<u32>,
    pub current_price: f64,
    pub ath_price: f64,
    pub ath_time: DateTime<Utc>,
    pub ath_multiplier: f64,
    pub current_multiplier: f64,
    /// Per-checkpoint multipliers; absent until reached and priceable.
    #[serde(default)]
    pub checkpoints: BTreeMap<Checkpoint, f64>,
    pub dead: Option<DeadReason>,
    pub status: SignalStatus,
    pub completion_cause: Option<String>,
    pub is_winner: bool,
}

impl SignalOutcome {
    /// Composite key used by the active store.
    pub fn key(channel_id: &str, address: &str) -> String {
        format!("{}:{}", channel_id, address.to_lowercase())
    }
}

/// Per-channel aggregate standing. Always recomputable from the completed
/// store; never source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelReputation {
    pub channel_id: String,
    pub channel_name: String,
    pub total_signals: u64,
    pub winners: u64,
    pub losers: u64,
    pub neutrals: u64,
    pub dead: u64,
    pub avg_ath_multiplier: f64,
    pub avg_final_multiplier: f64,
    /// Mean hours from entry to ATH, over winners.
    pub mean_time_to_ath_hours: f64,
    pub win_rate: f64,
    /// Composite score in [0, 1]; monotone in win-rate and avg multiplier.
    pub reputation_score: f64,
    pub updated_at: DateTime<Utc>,
}

/// Resumable bootstrap checkpoint for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeProgress {
    pub channel_id: String,
    pub last_processed_id: i64,
    pub total_processed: u64,
    pub complete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candle_well_formed_accepts_normal_shape() {
        let c = OhlcCandle {
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            timestamp: 0,
            timeframe: Timeframe::Day,
        };
        assert!(c.is_well_formed());
    }

    #[test]
    fn candle_well_formed_rejects_inverted_range() {
        let c = OhlcCandle {
            open: 1.0,
            high: 0.9,
            low: 0.5,
            close: 1.5,
            timestamp: 0,
            timeframe: Timeframe::Day,
        };
        assert!(!c.is_well_formed());
    }

    #[test]
    fn checkpoint_offsets_are_strictly_increasing() {
        let mut prev = 0;
        for cp in Checkpoint::ALL {
            assert!(cp.offset_secs() > prev);
            prev = cp.offset_secs();
        }
    }

    #[test]
    fn outcome_key_is_case_insensitive_on_address() {
        assert_eq!(
            SignalOutcome::key("c1", "0xABCdef"),
            SignalOutcome::key("c1", "0xabcDEF")
        );
    }

    #[test]
    fn dead_lp_completes_at_point_two() {
        assert_eq!(DeadReason::DeadLp.completion_multiplier(), 0.2);
        assert_eq!(DeadReason::NoSupply.completion_multiplier(), 0.0);
        assert_eq!(DeadReason::Stale.completion_multiplier(), 0.0);
    }
}
