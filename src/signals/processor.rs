//! Message classification: mention extraction, sentiment, engagement, and
//! confidence.
//!
//! Deterministic and free of I/O. Same inputs, same outputs; every external
//! concern (pricing, history) happens downstream in the coordinator.

use regex::Regex;

use crate::config::ProcessorConfig;
use crate::models::{MessageEvent, ProcessedMessage, Sentiment};
use crate::sentiment::SentimentAnalyzer;
use crate::tokens::TokenRegistry;

use lazy_static::lazy_static;
use std::sync::Arc;

lazy_static! {
    static ref ADDRESS_RE: Regex = Regex::new(
        r"(0x[0-9a-fA-F]{40})|(\b[1-9A-HJ-NP-Za-km-z]{32,44}\b)"
    )
    .expect("static regex");
    static ref CASHTAG_RE: Regex =
        Regex::new(r"[$#]([A-Za-z][A-Za-z0-9]{1,9})\b").expect("static regex");
}

pub struct MessageProcessor {
    config: ProcessorConfig,
    analyzer: Arc<dyn SentimentAnalyzer>,
    /// Bare (unprefixed) registry tickers, word-bounded.
    ticker_re: Regex,
    /// Upper-cased registry tickers; the cashtag branch only accepts these
    /// (plus the configured ambiguous tickers, which require the prefix).
    registry_tickers: Vec<String>,
}

impl MessageProcessor {
    pub fn new(
        config: ProcessorConfig,
        registry: &TokenRegistry,
        analyzer: Arc<dyn SentimentAnalyzer>,
    ) -> Self {
        let mut tickers = registry.tickers();
        tickers.sort_unstable();
        let pattern = format!(r"(?i)\b({})\b", tickers.join("|"));
        let ticker_re = Regex::new(&pattern).expect("ticker pattern from fixed alphabet");
        let registry_tickers = tickers.iter().map(|t| t.to_uppercase()).collect();
        Self {
            config,
            analyzer,
            ticker_re,
            registry_tickers,
        }
    }

    /// Classify one message event. Messages shorter than the configured
    /// minimum produce no mentions at all.
    pub fn process(&self, event: MessageEvent) -> ProcessedMessage {
        let mentions = if event.text.len() < self.config.min_message_length {
            Vec::new()
        } else {
            self.extract_mentions(&event.text)
        };

        let sentiment = self.analyzer.analyze(&event.text);
        let engagement_score = self.engagement_score(&event);
        let crypto_relevant = !mentions.is_empty();
        let confidence =
            self.confidence(engagement_score, crypto_relevant, sentiment, event.text.len());

        ProcessedMessage {
            high_confidence: confidence >= self.config.confidence_threshold,
            event,
            crypto_relevant,
            mentions,
            sentiment,
            engagement_score,
            confidence,
        }
    }

    /// Tickers from the registry plus address-shaped strings, in order of
    /// appearance. Ambiguous tickers need a `$`/`#` prefix; a bare
    /// occurrence is prose, not a mention. A prefixed token that is not a
    /// known ticker is hype, not a mention.
    fn extract_mentions(&self, text: &str) -> Vec<String> {
        let mut hits: Vec<(usize, String)> = Vec::new();

        for m in ADDRESS_RE.find_iter(text) {
            hits.push((m.start(), m.as_str().to_string()));
        }
        for cap in CASHTAG_RE.captures_iter(text) {
            if let Some(m) = cap.get(1) {
                let upper = m.as_str().to_uppercase();
                if !self.is_known_ticker(&upper) {
                    continue;
                }
                hits.push((m.start() - 1, upper));
            }
        }
        for m in self.ticker_re.find_iter(text) {
            let upper = m.as_str().to_uppercase();
            if self.is_ambiguous(&upper) {
                continue;
            }
            // Skip when already captured as a cashtag at this position.
            let prefixed = m.start() > 0
                && matches!(text.as_bytes()[m.start() - 1], b'$' | b'#');
            if prefixed {
                continue;
            }
            hits.push((m.start(), upper));
        }

        hits.sort_by_key(|(pos, _)| *pos);

        let mut seen: Vec<String> = Vec::new();
        let mut mentions = Vec::new();
        for (_, mention) in hits {
            let folded = mention.to_lowercase();
            if seen.iter().any(|s| *s == folded) {
                continue;
            }
            seen.push(folded);
            mentions.push(mention);
        }
        mentions
    }

    fn is_ambiguous(&self, upper: &str) -> bool {
        self.config
            .ambiguous_tickers
            .iter()
            .any(|t| t.eq_ignore_ascii_case(upper))
    }

    /// Registry tickers plus the configured ambiguous tickers make up the
    /// recognized ticker universe.
    fn is_known_ticker(&self, upper: &str) -> bool {
        self.registry_tickers.iter().any(|t| t == upper) || self.is_ambiguous(upper)
    }

    /// Importance Coefficient, linearly normalized to [0, 100].
    fn engagement_score(&self, event: &MessageEvent) -> f64 {
        let ic = f64::from(event.forwards)
            + 2.0 * f64::from(event.reactions)
            + 0.5 * f64::from(event.replies);
        (100.0 * ic / self.config.ic_max).min(100.0)
    }

    fn confidence(
        &self,
        engagement_score: f64,
        crypto_relevant: bool,
        sentiment: Sentiment,
        length: usize,
    ) -> f64 {
        let relevance = if crypto_relevant { 1.0 } else { 0.0 };
        let length_factor = (length as f64 / 200.0).clamp(0.0, 1.0);
        let confidence = 0.40 * engagement_score / 100.0
            + 0.30 * relevance
            + 0.20 * sentiment.score.abs()
            + 0.10 * length_factor;
        confidence.clamp(0.0, 1.0)
    }
}
