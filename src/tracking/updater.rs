//! Periodic sweep over the active store: refresh prices, advance ATHs,
//! settle elapsed windows, and keep the PERFORMANCE table current.
//!
//! Also owns the restart rule: checkpoints crossed while the process was
//! down are re-evaluated against the wall clock before the first sweep.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::output::{tables, Table, TableWriter};
use crate::pricing::{HistoricalPriceService, PriceEngine};
use crate::reputation::ReputationEngine;
use crate::shutdown::ShutdownToken;
use crate::tokens::DeadTokenBlacklist;
use crate::tracking::{OutcomeTracker, TrackingStore};

pub struct OutcomeUpdater {
    tracker: Arc<OutcomeTracker>,
    blacklist: Arc<DeadTokenBlacklist>,
    engine: Arc<PriceEngine>,
    historical: Arc<HistoricalPriceService>,
    writer: Arc<TableWriter>,
    reputation: Arc<ReputationEngine>,
    interval: Duration,
    ath_timeout: Duration,
    forward_ath_days: i64,
    shutdown: ShutdownToken,
}

impl OutcomeUpdater {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tracker: Arc<OutcomeTracker>,
        blacklist: Arc<DeadTokenBlacklist>,
        engine: Arc<PriceEngine>,
        historical: Arc<HistoricalPriceService>,
        writer: Arc<TableWriter>,
        reputation: Arc<ReputationEngine>,
        interval: Duration,
        ath_timeout: Duration,
        forward_ath_days: i64,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            tracker,
            blacklist,
            engine,
            historical,
            writer,
            reputation,
            interval,
            ath_timeout,
            forward_ath_days,
            shutdown,
        }
    }

    /// Restart rule: fill any checkpoint that was crossed while the
    /// process was down, using the best price currently on record.
    pub fn resync_checkpoints(store: &TrackingStore) -> anyhow::Result<usize> {
        let now = Utc::now();
        let mut resynced = 0usize;
        for outcome in store.active_snapshot() {
            let reached = OutcomeTracker::reached_checkpoints(now, outcome.entry_time);
            let missing: Vec<_> = reached
                .into_iter()
                .filter(|cp| !outcome.checkpoints.contains_key(cp))
                .collect();
            if missing.is_empty() {
                continue;
            }
            store.update_active(&outcome.channel_id, &outcome.address, |o| {
                for cp in missing {
                    o.checkpoints.insert(cp, o.current_multiplier);
                }
            })?;
            resynced += 1;
        }
        if resynced > 0 {
            info!(outcomes = resynced, "checkpoints re-evaluated after restart");
        }
        Ok(resynced)
    }

    /// Run until shutdown, sweeping on the configured interval.
    pub async fn run(&self) {
        loop {
            tokio::select! {
                _ = sleep(self.interval) => {}
                _ = self.shutdown.cancelled() => {
                    info!("outcome updater exiting");
                    return;
                }
            }
            match self.sweep().await {
                Ok(updated) => debug!(updated, "outcome sweep finished"),
                Err(PipelineError::Cancelled) => return,
                Err(err) => warn!(%err, "outcome sweep failed"),
            }
            self.engine.purge_cache();
        }
    }

    /// One pass over every active outcome.
    pub async fn sweep(&self) -> PipelineResult<usize> {
        let now = Utc::now();
        let active = self.tracker.store().active_snapshot();
        let mut updated = 0usize;

        for outcome in active {
            if self.shutdown.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let channel_id = outcome.channel_id.clone();
            let address = outcome.address.clone();

            // Tokens blacklisted since the signal opened settle at their
            // category multiplier without another provider call.
            if let Some(reason) = self.blacklist.reason_for(&address) {
                self.tracker
                    .mark_dead(&channel_id, &address, reason)
                    .map_err(fatal)?;
                self.refresh_reputation().map_err(fatal)?;
                updated += 1;
                continue;
            }

            if let Some(snapshot) = self.engine.get_price(&address, outcome.chain).await? {
                self.tracker
                    .update_price(&channel_id, &address, snapshot.price_usd, now)
                    .map_err(fatal)?;
            }

            if self.tracker.window_elapsed(&outcome, now) {
                if let Some(symbol) = outcome.symbol.as_deref() {
                    self.try_ath_backfill(&channel_id, &address, symbol, &outcome, now)
                        .await?;
                }
                self.tracker
                    .complete(&channel_id, &address, "window_elapsed")
                    .map_err(fatal)?;
                self.refresh_reputation().map_err(fatal)?;
            }

            if let Some(current) = self
                .tracker
                .store()
                .get_active(&channel_id, &address)
                .or_else(|| {
                    self.tracker
                        .store()
                        .completed_snapshot()
                        .into_iter()
                        .filter(|o| {
                            o.channel_id == channel_id
                                && o.address.eq_ignore_ascii_case(&address)
                        })
                        .max_by_key(|o| o.signal_ordinal)
                })
            {
                self.writer
                    .upsert(
                        Table::Performance,
                        &address,
                        &tables::performance_row(&current, now),
                    )
                    .await
                    .map_err(fatal)?;
            }
            updated += 1;
        }
        Ok(updated)
    }

    async fn try_ath_backfill(
        &self,
        channel_id: &str,
        address: &str,
        symbol: &str,
        outcome: &crate::models::SignalOutcome,
        now: chrono::DateTime<Utc>,
    ) -> PipelineResult<()> {
        match timeout(
            self.ath_timeout,
            self.historical.forward_ath_window(
                symbol,
                outcome.entry_time.timestamp(),
                self.forward_ath_days,
            ),
        )
        .await
        {
            Ok(Ok(window)) => {
                self.tracker
                    .apply_ath_window(channel_id, address, &window, now)
                    .map_err(fatal)?;
            }
            Ok(Err(PipelineError::Cancelled)) => return Err(PipelineError::Cancelled),
            Ok(Err(err)) => debug!(symbol, %err, "ATH backfill unavailable at completion"),
            Err(_) => warn!(symbol, "ATH backfill timed out at completion"),
        }
        Ok(())
    }

    fn refresh_reputation(&self) -> anyhow::Result<()> {
        let completed = self.tracker.store().completed_snapshot();
        self.reputation.recompute_and_persist(&completed)?;
        Ok(())
    }
}

fn fatal(err: anyhow::Error) -> PipelineError {
    PipelineError::Fatal(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chain, Checkpoint, EntryPriceSource};
    use crate::tracking::OpenRequest;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn resync_fills_checkpoints_crossed_while_down() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TrackingStore::load(dir.path()).unwrap());
        let tracker = OutcomeTracker::new(store.clone(), 7);

        // Entered 26 hours ago; 1h/4h/24h all crossed.
        tracker
            .open(OpenRequest {
                channel_id: "c1".to_string(),
                channel_name: "c1".to_string(),
                address: "0xAAA".to_string(),
                chain: Chain::Evm,
                symbol: None,
                message_id: 1,
                entry_price: Some(1.0),
                entry_time: Utc::now() - ChronoDuration::hours(26),
                entry_source: EntryPriceSource::Exact,
            })
            .unwrap();

        let resynced = OutcomeUpdater::resync_checkpoints(&store).unwrap();
        assert_eq!(resynced, 1);
        let outcome = store.get_active("c1", "0xAAA").unwrap();
        assert!(outcome.checkpoints.contains_key(&Checkpoint::H1));
        assert!(outcome.checkpoints.contains_key(&Checkpoint::H4));
        assert!(outcome.checkpoints.contains_key(&Checkpoint::H24));
        assert!(!outcome.checkpoints.contains_key(&Checkpoint::D3));

        // Already filled: second resync is a no-op.
        assert_eq!(OutcomeUpdater::resync_checkpoints(&store).unwrap(), 0);
    }
}
