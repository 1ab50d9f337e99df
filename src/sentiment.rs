//! Sentiment analyzer collaborator.
//!
//! The pipeline only consumes the (label, score) contract; the default
//! implementation is a deterministic keyword lexicon so the system runs
//! without an external model. Swap in a real analyzer via injection.

use crate::models::{Sentiment, SentimentLabel};

pub trait SentimentAnalyzer: Send + Sync {
    /// Deterministic and stateless: same text, same verdict.
    fn analyze(&self, text: &str) -> Sentiment;
}

const POSITIVE_WORDS: [&str; 18] = [
    "moon", "pump", "bullish", "gem", "gains", "win", "winner", "rocket", "breakout",
    "up", "surge", "rally", "strong", "buy", "accumulate", "golden", "huge", "early",
];

const NEGATIVE_WORDS: [&str; 16] = [
    "dump", "rug", "scam", "bearish", "crash", "down", "loss", "rekt", "exit",
    "sell", "avoid", "dead", "bleed", "drop", "weak", "fud",
];

/// Keyword-lexicon scorer: signed word balance normalized by total hits.
pub struct LexiconSentiment;

impl SentimentAnalyzer for LexiconSentiment {
    fn analyze(&self, text: &str) -> Sentiment {
        let mut positive = 0i32;
        let mut negative = 0i32;
        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
        {
            if POSITIVE_WORDS.contains(&word) {
                positive += 1;
            } else if NEGATIVE_WORDS.contains(&word) {
                negative += 1;
            }
        }

        let total = positive + negative;
        if total == 0 {
            return Sentiment::neutral();
        }
        let score = f64::from(positive - negative) / f64::from(total);
        let label = if score > 0.2 {
            SentimentLabel::Positive
        } else if score < -0.2 {
            SentimentLabel::Negative
        } else {
            SentimentLabel::Neutral
        };
        Sentiment { label, score }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_plain_text_are_neutral() {
        let s = LexiconSentiment.analyze("the meeting is at noon");
        assert_eq!(s.label, SentimentLabel::Neutral);
        assert_eq!(s.score, 0.0);
    }

    #[test]
    fn pumped_message_is_positive() {
        let s = LexiconSentiment.analyze("this gem is going to moon, huge gains");
        assert_eq!(s.label, SentimentLabel::Positive);
        assert!(s.score > 0.5);
        assert!(s.score <= 1.0);
    }

    #[test]
    fn rug_warning_is_negative() {
        let s = LexiconSentiment.analyze("avoid this scam, clear rug setup, you will get rekt");
        assert_eq!(s.label, SentimentLabel::Negative);
        assert!(s.score < -0.5);
        assert!(s.score >= -1.0);
    }

    #[test]
    fn analyzer_is_deterministic() {
        let text = "pump pump dump";
        let a = LexiconSentiment.analyze(text);
        let b = LexiconSentiment.analyze(text);
        assert_eq!(a.label, b.label);
        assert_eq!(a.score, b.score);
    }
}
