//! Table schemas and row builders for the normalized output tables.
//!
//! Column orders are fixed; every writer (file and sheet mirror) consumes
//! the same rows.

use chrono::{DateTime, Utc};

use crate::models::{Chain, PriceSnapshot, ProcessedMessage, SignalOutcome};
use crate::providers::LifetimeExtremes;

/// Message text is truncated to this many characters in the MESSAGES table.
const MESSAGE_TEXT_MAX: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Messages,
    TokenPrices,
    Performance,
    Historical,
}

impl Table {
    pub const ALL: [Table; 4] = [
        Table::Messages,
        Table::TokenPrices,
        Table::Performance,
        Table::Historical,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            Table::Messages => "messages.csv",
            Table::TokenPrices => "token_prices.csv",
            Table::Performance => "performance.csv",
            Table::Historical => "historical.csv",
        }
    }

    /// Sheet tab name for the mirror sink.
    pub fn sheet_name(&self) -> &'static str {
        match self {
            Table::Messages => "Messages",
            Table::TokenPrices => "TokenPrices",
            Table::Performance => "Performance",
            Table::Historical => "Historical",
        }
    }

    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Table::Messages => &[
                "message_id",
                "timestamp",
                "channel_name",
                "message_text",
                "engagement_score",
                "crypto_mentions",
                "sentiment",
                "confidence",
            ],
            Table::TokenPrices => &[
                "address",
                "chain",
                "symbol",
                "price_usd",
                "market_cap",
                "volume_24h",
                "price_change_24h",
                "liquidity_usd",
                "pair_created_at",
            ],
            Table::Performance => &[
                "address",
                "chain",
                "first_message_id",
                "start_price",
                "start_time",
                "ath_since_mention",
                "ath_time",
                "ath_multiplier",
                "current_multiplier",
                "days_tracked",
            ],
            Table::Historical => &[
                "address",
                "chain",
                "all_time_ath",
                "all_time_ath_date",
                "distance_from_ath",
                "all_time_atl",
                "all_time_atl_date",
                "distance_from_atl",
            ],
        }
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map(|v| format!("{v}")).unwrap_or_default()
}

fn truncated(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    text.chars().take(max).collect()
}

/// MESSAGES row, 8 columns.
pub fn message_row(message: &ProcessedMessage) -> Vec<String> {
    vec![
        message.event.message_id.to_string(),
        message.event.timestamp.to_rfc3339(),
        message.event.channel_name.clone(),
        truncated(&message.event.text, MESSAGE_TEXT_MAX),
        format!("{:.2}", message.engagement_score),
        message.mentions.join(","),
        message.sentiment.label.as_str().to_string(),
        format!("{:.4}", message.confidence),
    ]
}

/// TOKEN_PRICES row, 9 columns, keyed by address.
pub fn token_price_row(address: &str, chain: Chain, snapshot: &PriceSnapshot) -> Vec<String> {
    vec![
        address.to_string(),
        chain.as_str().to_string(),
        snapshot.symbol.clone().unwrap_or_default(),
        format!("{}", snapshot.price_usd),
        fmt_opt(snapshot.market_cap),
        fmt_opt(snapshot.volume_24h),
        fmt_opt(snapshot.price_change_24h),
        fmt_opt(snapshot.liquidity_usd),
        snapshot
            .pair_created_at
            .map(|ts| ts.to_string())
            .unwrap_or_default(),
    ]
}

/// PERFORMANCE row, 10 columns, keyed by address.
pub fn performance_row(outcome: &SignalOutcome, now: DateTime<Utc>) -> Vec<String> {
    let days_tracked = now
        .signed_duration_since(outcome.entry_time)
        .num_days()
        .max(0);
    vec![
        outcome.address.clone(),
        outcome.chain.as_str().to_string(),
        outcome.first_message_id.to_string(),
        format!("{}", outcome.entry_price),
        outcome.entry_time.to_rfc3339(),
        format!("{}", outcome.ath_price),
        outcome.ath_time.to_rfc3339(),
        format!("{:.4}", outcome.ath_multiplier),
        format!("{:.4}", outcome.current_multiplier),
        days_tracked.to_string(),
    ]
}

/// HISTORICAL row, 8 columns, keyed by address. Distances are percentages
/// relative to the current price.
pub fn historical_row(
    address: &str,
    chain: Chain,
    extremes: &LifetimeExtremes,
    current_price: f64,
) -> Vec<String> {
    let distance_from_ath = if extremes.ath > 0.0 {
        (current_price - extremes.ath) / extremes.ath * 100.0
    } else {
        0.0
    };
    let distance_from_atl = if extremes.atl > 0.0 {
        (current_price - extremes.atl) / extremes.atl * 100.0
    } else {
        0.0
    };
    let date = |ts: i64| {
        chrono::DateTime::from_timestamp(ts, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default()
    };
    vec![
        address.to_string(),
        chain.as_str().to_string(),
        format!("{}", extremes.ath),
        date(extremes.ath_ts),
        format!("{:.2}", distance_from_ath),
        format!("{}", extremes.atl),
        date(extremes.atl_ts),
        format!("{:.2}", distance_from_atl),
    ]
}
