//! Major-token whitelist and the candidate filter.
//!
//! The registry canonicalizes major tickers to their real contract
//! addresses and rejects scam lookalikes and pure market commentary before
//! any provider call is spent on them.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{Chain, TokenAddress};

/// Verbs that turn a ticker mention into an actionable call.
const ACTION_VERBS: [&str; 12] = [
    "buy", "bought", "sell", "long", "short", "entry", "ape", "aped", "accumulate",
    "load", "grab", "dca",
];

/// Hosts whose presence marks a message as chart-linked, not commentary.
const CHART_HOSTS: [&str; 4] = [
    "dexscreener.com",
    "dextools.io",
    "birdeye.so",
    "geckoterminal.com",
];

lazy_static! {
    static ref ADDRESS_SHAPED_RE: Regex = Regex::new(
        r"(0x[0-9a-fA-F]{40})|(\b[1-9A-HJ-NP-Za-km-z]{32,44}\b)"
    )
    .expect("static regex");
}

/// Floor constraints for non-major candidates.
const MIN_MARKET_CAP_USD: f64 = 10_000.0;

/// One whitelisted major token.
#[derive(Debug, Clone)]
pub struct MajorToken {
    pub ticker: &'static str,
    pub addresses: HashMap<Chain, &'static str>,
    pub min_price: f64,
    pub min_market_cap: f64,
    pub stablecoin: bool,
}

/// Why a candidate was dropped by the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Prose-only mention; the coordinator must abort before any external
    /// call.
    Commentary,
    /// Non-canonical address posing as a major token.
    Imposter,
    NoPrice,
    LowMarketCap,
    NoSupply,
    /// Canonical major failed its floor constraints (price, market cap, or
    /// stablecoin band).
    FloorViolation,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Commentary => "commentary",
            DropReason::Imposter => "imposter",
            DropReason::NoPrice => "no_price",
            DropReason::LowMarketCap => "low_market_cap",
            DropReason::NoSupply => "no_supply",
            DropReason::FloorViolation => "floor_violation",
        }
    }
}

/// Result of one filter pass.
#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    pub kept: Vec<TokenAddress>,
    pub dropped: Vec<(TokenAddress, DropReason)>,
}

pub struct TokenRegistry {
    majors: HashMap<String, MajorToken>,
}

impl TokenRegistry {
    pub fn with_defaults() -> Self {
        let mut majors = HashMap::new();
        let defs: [(&'static str, &[(Chain, &'static str)], f64, f64, bool); 6] = [
            (
                "ETH",
                &[(Chain::Evm, "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2")],
                100.0,
                1e9,
                false,
            ),
            (
                "BTC",
                &[(Chain::Evm, "0x2260FAC5E5542a773Aa44fBCfeDf7C193bc2C599")],
                1000.0,
                1e9,
                false,
            ),
            (
                "SOL",
                &[(Chain::Solana, "So11111111111111111111111111111111111111112")],
                1.0,
                1e8,
                false,
            ),
            (
                "USDC",
                &[
                    (Chain::Evm, "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
                    (Chain::Solana, "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v"),
                ],
                0.0,
                1e8,
                true,
            ),
            (
                "USDT",
                &[
                    (Chain::Evm, "0xdAC17F958D2ee523a2206206994597C13D831ec7"),
                    (Chain::Solana, "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB"),
                ],
                0.0,
                1e8,
                true,
            ),
            (
                // BEP-20 wrapped representation.
                "BNB",
                &[(Chain::Evm, "0xbb4CdB9CBd36B01bD1cBaEBF2De08d9173bc095c")],
                10.0,
                1e9,
                false,
            ),
        ];
        for (ticker, addrs, min_price, min_mcap, stable) in defs {
            majors.insert(
                ticker.to_string(),
                MajorToken {
                    ticker,
                    addresses: addrs.iter().copied().collect(),
                    min_price,
                    min_market_cap: min_mcap,
                    stablecoin: stable,
                },
            );
        }
        Self { majors }
    }

    pub fn is_major(&self, symbol: &str) -> bool {
        self.majors.contains_key(&symbol.to_uppercase())
    }

    /// All registry tickers, for the mention regex.
    pub fn tickers(&self) -> Vec<&str> {
        self.majors.values().map(|m| m.ticker).collect()
    }

    /// Canonical addresses for a major symbol, one per chain.
    pub fn resolve(&self, symbol: &str) -> Vec<TokenAddress> {
        let Some(major) = self.majors.get(&symbol.to_uppercase()) else {
            return Vec::new();
        };
        major
            .addresses
            .iter()
            .map(|(chain, addr)| {
                TokenAddress::new(*addr, *chain, true).with_ticker(major.ticker)
            })
            .collect()
    }

    fn is_canonical(&self, symbol: &str, candidate: &TokenAddress) -> bool {
        self.majors
            .get(&symbol.to_uppercase())
            .and_then(|m| m.addresses.get(&candidate.chain))
            .map(|addr| addr.eq_ignore_ascii_case(&candidate.literal))
            .unwrap_or(false)
    }

    /// Heuristic: the symbol appears only in a prose context. No address in
    /// the text, no actionable verb, no chart link.
    pub fn is_market_commentary(&self, message_text: &str) -> bool {
        if ADDRESS_SHAPED_RE.is_match(message_text) {
            return false;
        }
        let lower = message_text.to_lowercase();
        if CHART_HOSTS.iter().any(|h| lower.contains(h)) {
            return false;
        }
        !lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|w| ACTION_VERBS.contains(&w))
    }

    /// Filter candidates for one symbol mention.
    ///
    /// Commentary short-circuits the whole message. Major tickers keep only
    /// the canonical address (lookalikes are imposters). Non-majors must
    /// clear the price, market-cap, and supply floors using the snapshot
    /// already attached to the candidate.
    pub fn filter(
        &self,
        symbol: Option<&str>,
        candidates: &[TokenAddress],
        message_text: &str,
    ) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();

        if self.is_market_commentary(message_text) {
            outcome.dropped = candidates
                .iter()
                .cloned()
                .map(|c| (c, DropReason::Commentary))
                .collect();
            return outcome;
        }

        let major = symbol
            .map(|s| s.to_uppercase())
            .filter(|s| self.majors.contains_key(s));

        for candidate in candidates {
            if let Some(ref sym) = major {
                if self.is_canonical(sym, candidate) {
                    let canonical = self.majors[sym].addresses[&candidate.chain];
                    let mut kept = candidate.clone();
                    kept.literal = canonical.to_string();
                    kept.ticker = Some(sym.clone());
                    if self.passes_major_floors(sym, &kept) {
                        outcome.kept.push(kept);
                    } else {
                        outcome.dropped.push((kept, DropReason::FloorViolation));
                    }
                } else {
                    debug!(symbol = %sym, address = %candidate.literal, "imposter candidate dropped");
                    outcome
                        .dropped
                        .push((candidate.clone(), DropReason::Imposter));
                }
                continue;
            }

            match self.check_floors(candidate) {
                None => outcome.kept.push(candidate.clone()),
                Some(reason) => outcome.dropped.push((candidate.clone(), reason)),
            }
        }
        outcome
    }

    fn passes_major_floors(&self, symbol: &str, candidate: &TokenAddress) -> bool {
        let Some(major) = self.majors.get(symbol) else {
            return false;
        };
        let Some(snap) = candidate.snapshot.as_ref() else {
            // No snapshot yet; floors are checked again once priced.
            return true;
        };
        if snap.price_usd < major.min_price {
            return false;
        }
        if let Some(mcap) = snap.market_cap {
            if mcap < major.min_market_cap {
                return false;
            }
        }
        if major.stablecoin && !(0.95..=1.05).contains(&snap.price_usd) {
            return false;
        }
        true
    }

    fn check_floors(&self, candidate: &TokenAddress) -> Option<DropReason> {
        let Some(snap) = candidate.snapshot.as_ref() else {
            return Some(DropReason::NoPrice);
        };
        if snap.price_usd <= 0.0 {
            return Some(DropReason::NoPrice);
        }
        let mcap = snap.market_cap.unwrap_or(0.0);
        if mcap < MIN_MARKET_CAP_USD {
            return Some(DropReason::LowMarketCap);
        }
        let supply = snap
            .total_supply
            .unwrap_or_else(|| if snap.price_usd > 0.0 { mcap / snap.price_usd } else { 0.0 });
        if supply <= 0.0 {
            return Some(DropReason::NoSupply);
        }
        None
    }
}
