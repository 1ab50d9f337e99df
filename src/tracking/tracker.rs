//! Per-signal state machine: open, live updates, checkpoints, completion.
//!
//! A signal is keyed (channel, address, ordinal). An active prior signal
//! blocks a new one; a completed prior signal permits a fresh start with
//! the next ordinal. All I/O lives in the store; the tracker itself never
//! retries anything.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::models::{
    Chain, Checkpoint, EntryPriceSource, SignalOutcome, SignalStatus,
};
use crate::pricing::historical::AthWindow;
use crate::pricing::HistoricalPriceService;
use crate::tracking::store::TrackingStore;

/// A completed signal whose ATH multiplier clears this is a winner.
pub const WINNER_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub channel_id: String,
    pub channel_name: String,
    pub address: String,
    pub chain: Chain,
    pub symbol: Option<String>,
    pub message_id: i64,
    /// None or non-positive lands the signal in insufficient_data.
    pub entry_price: Option<f64>,
    pub entry_time: DateTime<Utc>,
    pub entry_source: EntryPriceSource,
}

#[derive(Debug, Clone)]
pub enum OpenResult {
    Opened(SignalOutcome),
    /// An active signal for this pair already exists; open is a no-op.
    AlreadyActive,
    /// Entry price unknown; terminal, never tracked.
    InsufficientData,
}

pub struct OutcomeTracker {
    store: Arc<TrackingStore>,
    window_days: i64,
}

impl OutcomeTracker {
    pub fn new(store: Arc<TrackingStore>, window_days: i64) -> Self {
        Self { store, window_days }
    }

    pub fn store(&self) -> &Arc<TrackingStore> {
        &self.store
    }

    pub fn window_days(&self) -> i64 {
        self.window_days
    }

    /// Open a signal. Idempotent while a prior signal for the pair is
    /// active; a fully archived history allows a fresh start with
    /// `ordinal = 1 + count_in_history`.
    pub fn open(&self, req: OpenRequest) -> anyhow::Result<OpenResult> {
        if self.store.get_active(&req.channel_id, &req.address).is_some() {
            return Ok(OpenResult::AlreadyActive);
        }

        let previous_signals = self.store.history_ordinals(&req.channel_id, &req.address);
        let signal_ordinal = 1 + previous_signals.len() as u32;

        let entry_price = req.entry_price.filter(|p| *p > 0.0);
        let Some(entry_price) = entry_price else {
            let outcome = SignalOutcome {
                channel_id: req.channel_id,
                channel_name: req.channel_name,
                address: req.address,
                chain: req.chain,
                symbol: req.symbol,
                first_message_id: req.message_id,
                entry_price: 0.0,
                entry_time: req.entry_time,
                entry_source: req.entry_source,
                signal_ordinal,
                previous_signals,
                current_price: 0.0,
                ath_price: 0.0,
                ath_time: req.entry_time,
                ath_multiplier: 0.0,
                current_multiplier: 0.0,
                checkpoints: Default::default(),
                dead: None,
                status: SignalStatus::InsufficientData,
                completion_cause: Some("entry_price_unavailable".to_string()),
                is_winner: false,
            };
            self.store.record_terminal(outcome)?;
            return Ok(OpenResult::InsufficientData);
        };

        let outcome = SignalOutcome {
            channel_id: req.channel_id.clone(),
            channel_name: req.channel_name,
            address: req.address.clone(),
            chain: req.chain,
            symbol: req.symbol,
            first_message_id: req.message_id,
            entry_price,
            entry_time: req.entry_time,
            entry_source: req.entry_source,
            signal_ordinal,
            previous_signals,
            current_price: entry_price,
            ath_price: entry_price,
            ath_time: req.entry_time,
            ath_multiplier: 1.0,
            current_multiplier: 1.0,
            checkpoints: Default::default(),
            dead: None,
            status: SignalStatus::InProgress,
            completion_cause: None,
            is_winner: false,
        };

        if !self.store.insert_active_if_absent(outcome.clone())? {
            return Ok(OpenResult::AlreadyActive);
        }
        info!(
            channel = %req.channel_id,
            address = %req.address,
            ordinal = signal_ordinal,
            "signal opened"
        );
        metrics::counter!("callwatch_signals_opened", 1);
        Ok(OpenResult::Opened(outcome))
    }

    /// Fold a fresh price observation into the outcome; advances ATH when
    /// the price makes a new high.
    pub fn update_price(
        &self,
        channel_id: &str,
        address: &str,
        price: f64,
        t: DateTime<Utc>,
    ) -> anyhow::Result<Option<SignalOutcome>> {
        if price <= 0.0 {
            return Ok(None);
        }
        self.store.update_active(channel_id, address, |o| {
            o.current_price = price;
            o.current_multiplier = price / o.entry_price;
            if price > o.ath_price {
                o.ath_price = price;
                o.ath_time = t;
                o.ath_multiplier = price / o.entry_price;
            }
            // A live observation at a just-crossed checkpoint fills slots a
            // candle window has not covered yet.
            for cp in Self::reached_checkpoints(t, o.entry_time) {
                o.checkpoints.entry(cp).or_insert(o.current_multiplier);
            }
        })
    }

    /// Checkpoints whose offset has elapsed by `now`.
    pub fn reached_checkpoints(now: DateTime<Utc>, entry_t: DateTime<Utc>) -> Vec<Checkpoint> {
        let elapsed = now.signed_duration_since(entry_t).num_seconds();
        Checkpoint::ALL
            .into_iter()
            .filter(|cp| cp.offset_secs() <= elapsed)
            .collect()
    }

    /// Fold a historical ATH window into the outcome: raises the ATH if the
    /// window saw a higher high, and backfills reached checkpoints from
    /// candle closes.
    pub fn apply_ath_window(
        &self,
        channel_id: &str,
        address: &str,
        window: &AthWindow,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<SignalOutcome>> {
        self.store.update_active(channel_id, address, |o| {
            if window.ath_price > o.ath_price {
                o.ath_price = window.ath_price;
                o.ath_multiplier = window.ath_price / o.entry_price;
                if let Some(ts) = chrono::DateTime::from_timestamp(window.ath_timestamp, 0) {
                    o.ath_time = ts;
                }
            }
            let reached = Self::reached_checkpoints(now, o.entry_time);
            let filled = HistoricalPriceService::checkpoint_multipliers(
                o.entry_price,
                o.entry_time.timestamp(),
                &window.candles,
                &reached,
            );
            for (cp, multiplier) in filled {
                o.checkpoints.insert(cp, multiplier);
            }
        })
    }

    /// Complete a signal: winner iff the ATH multiplier doubled, then move
    /// it to the archive atomically.
    pub fn complete(
        &self,
        channel_id: &str,
        address: &str,
        cause: &str,
    ) -> anyhow::Result<Option<SignalOutcome>> {
        self.store.update_active(channel_id, address, |o| {
            o.status = SignalStatus::Completed;
            o.completion_cause = Some(cause.to_string());
            o.is_winner = o.ath_multiplier >= WINNER_MULTIPLIER;
        })?;
        let archived = self.store.archive(channel_id, address)?;
        if let Some(outcome) = archived.as_ref() {
            info!(
                channel = %channel_id,
                address = %address,
                ordinal = outcome.signal_ordinal,
                winner = outcome.is_winner,
                ath_multiplier = outcome.ath_multiplier,
                cause,
                "signal completed"
            );
            metrics::counter!("callwatch_signals_completed", 1);
        }
        Ok(archived)
    }

    /// Dead tokens complete immediately with the category multiplier as
    /// their final standing.
    pub fn mark_dead(
        &self,
        channel_id: &str,
        address: &str,
        reason: crate::models::DeadReason,
    ) -> anyhow::Result<Option<SignalOutcome>> {
        self.store.update_active(channel_id, address, |o| {
            let multiplier = reason.completion_multiplier();
            o.dead = Some(reason);
            o.current_multiplier = multiplier;
            o.status = SignalStatus::Completed;
            o.completion_cause = Some(format!("dead_token:{}", reason.as_str()));
            o.is_winner = false;
        })?;
        self.store.archive(channel_id, address)
    }

    /// Whether the tracking window has elapsed for an outcome.
    pub fn window_elapsed(&self, outcome: &SignalOutcome, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(outcome.entry_time).num_days() >= self.window_days
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeadReason, Timeframe};
    use chrono::Duration as ChronoDuration;

    fn tracker(dir: &tempfile::TempDir) -> OutcomeTracker {
        OutcomeTracker::new(Arc::new(TrackingStore::load(dir.path()).unwrap()), 7)
    }

    fn request(channel: &str, address: &str, price: Option<f64>) -> OpenRequest {
        OpenRequest {
            channel_id: channel.to_string(),
            channel_name: channel.to_string(),
            address: address.to_string(),
            chain: Chain::Evm,
            symbol: Some("TEST".to_string()),
            message_id: 42,
            entry_price: price,
            entry_time: Utc::now(),
            entry_source: EntryPriceSource::Exact,
        }
    }

    #[test]
    fn open_is_idempotent_while_active() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(&dir);

        let first = t.open(request("c1", "0xAAA", Some(1.0))).unwrap();
        assert!(matches!(first, OpenResult::Opened(ref o) if o.signal_ordinal == 1));
        let second = t.open(request("c1", "0xAAA", Some(2.0))).unwrap();
        assert!(matches!(second, OpenResult::AlreadyActive));
    }

    #[test]
    fn unknown_entry_price_is_terminal_insufficient_data() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(&dir);

        let result = t.open(request("c1", "0xAAA", None)).unwrap();
        assert!(matches!(result, OpenResult::InsufficientData));
        assert_eq!(t.store().active_count(), 0);
        let archived = t.store().completed_snapshot();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].status, SignalStatus::InsufficientData);
    }

    #[test]
    fn fresh_start_increments_ordinal_and_records_history() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(&dir);

        t.open(request("c1", "0xAAA", Some(1.0))).unwrap();
        t.complete("c1", "0xAAA", "window_elapsed").unwrap().unwrap();

        let reopened = t.open(request("c1", "0xAAA", Some(5.0))).unwrap();
        let OpenResult::Opened(outcome) = reopened else {
            panic!("expected fresh start");
        };
        assert_eq!(outcome.signal_ordinal, 2);
        assert_eq!(outcome.previous_signals, vec![1]);
        assert_eq!(outcome.ath_multiplier, 1.0);
        // Ordinal-1 archive row untouched.
        assert_eq!(t.store().history_ordinals("c1", "0xAAA"), vec![1]);
    }

    #[test]
    fn update_price_advances_ath_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(&dir);
        t.open(request("c1", "0xAAA", Some(2.0))).unwrap();

        let now = Utc::now();
        let up = t.update_price("c1", "0xAAA", 5.0, now).unwrap().unwrap();
        assert_eq!(up.ath_price, 5.0);
        assert_eq!(up.ath_multiplier, 2.5);

        let down = t.update_price("c1", "0xAAA", 3.0, now).unwrap().unwrap();
        assert_eq!(down.current_multiplier, 1.5);
        // ATH holds.
        assert_eq!(down.ath_price, 5.0);
        assert!(down.ath_price >= down.entry_price);
    }

    #[test]
    fn completion_sets_winner_flag_from_ath_multiplier() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(&dir);
        t.open(request("c1", "0xWIN", Some(1.0))).unwrap();
        t.update_price("c1", "0xWIN", 2.5, Utc::now()).unwrap();
        let won = t.complete("c1", "0xWIN", "window_elapsed").unwrap().unwrap();
        assert!(won.is_winner);

        t.open(request("c1", "0xLOSE", Some(1.0))).unwrap();
        t.update_price("c1", "0xLOSE", 1.5, Utc::now()).unwrap();
        let lost = t.complete("c1", "0xLOSE", "window_elapsed").unwrap().unwrap();
        assert!(!lost.is_winner);
        assert_eq!(lost.status, SignalStatus::Completed);
    }

    #[test]
    fn dead_lp_completes_at_category_multiplier() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(&dir);
        t.open(request("c1", "0xDEAD", Some(1.0))).unwrap();

        let outcome = t.mark_dead("c1", "0xDEAD", DeadReason::DeadLp).unwrap().unwrap();
        assert_eq!(outcome.current_multiplier, 0.2);
        assert_eq!(outcome.dead, Some(DeadReason::DeadLp));
        assert!(!outcome.is_winner);
        assert_eq!(t.store().active_count(), 0);
    }

    #[test]
    fn reached_checkpoints_respect_elapsed_time() {
        let entry = Utc::now() - ChronoDuration::hours(5);
        let reached = OutcomeTracker::reached_checkpoints(Utc::now(), entry);
        assert_eq!(reached, vec![Checkpoint::H1, Checkpoint::H4]);
    }

    #[test]
    fn ath_window_backfills_reached_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(&dir);

        let entry_time = Utc::now() - ChronoDuration::days(10);
        let mut req = request("c1", "0xAAA", Some(2.0));
        req.entry_time = entry_time;
        t.open(req).unwrap();

        let entry_ts = entry_time.timestamp();
        let candles = vec![
            crate::models::OhlcCandle {
                open: 2.0,
                high: 9.0,
                low: 1.5,
                close: 8.0,
                timestamp: entry_ts + 2 * 86_400,
                timeframe: Timeframe::Day,
            },
        ];
        let window = AthWindow {
            ath_price: 9.0,
            ath_timestamp: entry_ts + 2 * 86_400,
            days_to_ath: 2,
            candles,
            completeness: 1.0 / 30.0,
        };

        let updated = t
            .apply_ath_window("c1", "0xAAA", &window, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(updated.ath_price, 9.0);
        assert_eq!(updated.ath_multiplier, 4.5);
        // 3d/7d checkpoints see the day-2 close at 8.0 -> 4.0x.
        assert_eq!(updated.checkpoints[&Checkpoint::D3], 4.0);
        assert_eq!(updated.checkpoints[&Checkpoint::D7], 4.0);
        assert!(!updated.checkpoints.contains_key(&Checkpoint::D30));
    }
}
