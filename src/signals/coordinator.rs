//! Per-message orchestration: filter, price, track, persist.
//!
//! Ordering inside one message: commentary short-circuit before address
//! extraction (and before any external call), blacklist consult before
//! pricing, then bounded-parallel per-address work where a failure on one
//! address never cancels the others.

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::TimeoutConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    EntryPriceSource, ProcessedMessage, SignalOutcome, TokenAddress,
};
use crate::output::{tables, Table, TableWriter};
use crate::pricing::{HistoricalPriceService, PriceEngine};
use crate::queue::EnvelopeHandler;
use crate::reputation::ReputationEngine;
use crate::tokens::{extractor, DeadTokenDetector, DeadVerdict, TokenRegistry};
use crate::tracking::{OpenRequest, OpenResult, OutcomeTracker};

/// A message older than this fetches its entry price from history instead
/// of trusting the current quote.
const HISTORICAL_ENTRY_AGE_SECS: i64 = 3_600;

pub struct SignalCoordinator {
    registry: Arc<TokenRegistry>,
    detector: Arc<DeadTokenDetector>,
    engine: Arc<PriceEngine>,
    historical: Arc<HistoricalPriceService>,
    tracker: Arc<OutcomeTracker>,
    writer: Arc<TableWriter>,
    reputation: Arc<ReputationEngine>,
    timeouts: TimeoutConfig,
    forward_ath_days: i64,
    parallelism: usize,
}

impl SignalCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<TokenRegistry>,
        detector: Arc<DeadTokenDetector>,
        engine: Arc<PriceEngine>,
        historical: Arc<HistoricalPriceService>,
        tracker: Arc<OutcomeTracker>,
        writer: Arc<TableWriter>,
        reputation: Arc<ReputationEngine>,
        timeouts: TimeoutConfig,
        forward_ath_days: i64,
        parallelism: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            detector,
            engine,
            historical,
            tracker,
            writer,
            reputation,
            timeouts,
            forward_ath_days,
            parallelism: parallelism.max(1),
        })
    }

    pub async fn process_message(&self, message: &ProcessedMessage) -> PipelineResult<()> {
        if !message.crypto_relevant {
            return Ok(());
        }

        // Commentary aborts before extraction and before any external call.
        if self.registry.is_market_commentary(&message.event.text) {
            debug!(
                channel = %message.event.channel_id,
                message_id = message.event.message_id,
                "commentary, no signal"
            );
            return Ok(());
        }

        let mut candidates: Vec<TokenAddress> = extractor::extract(&message.mentions)
            .into_iter()
            .filter(|a| a.valid)
            .collect();

        // Ticker known but no address pasted: resolve through the registry.
        let symbol_hint = message
            .mentions
            .iter()
            .find(|m| self.registry.is_major(m))
            .cloned();
        if candidates.is_empty() {
            if let Some(symbol) = symbol_hint.as_deref() {
                candidates = self.registry.resolve(symbol);
            }
        }
        if candidates.is_empty() {
            return Ok(());
        }

        // Blacklisted addresses cost zero provider calls.
        let survivors: Vec<TokenAddress> = candidates
            .into_iter()
            .filter(|c| {
                if self.detector.blacklist().contains(&c.literal) {
                    info!(address = %c.literal, "blacklisted token skipped");
                    false
                } else {
                    true
                }
            })
            .collect();
        if survivors.is_empty() {
            return Ok(());
        }

        self.writer
            .append(Table::Messages, &tables::message_row(message))
            .await
            .map_err(fatal)?;

        // Per-address work under the parallelism cap, each isolated.
        let results: Vec<PipelineResult<()>> = stream::iter(survivors)
            .map(|candidate| self.process_address(message, candidate, symbol_hint.clone()))
            .buffer_unordered(self.parallelism)
            .collect()
            .await;
        for result in results {
            match result {
                Ok(()) => {}
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                // Already logged at the failure site; one bad address must
                // not take down its siblings.
                Err(_) => {}
            }
        }
        Ok(())
    }

    async fn process_address(
        &self,
        message: &ProcessedMessage,
        mut candidate: TokenAddress,
        symbol_hint: Option<String>,
    ) -> PipelineResult<()> {
        let address = candidate.literal.clone();
        let chain = candidate.chain;
        let channel_id = message.event.channel_id.clone();

        let Some(snapshot) = self.engine.get_price(&address, chain).await? else {
            debug!(address, "no provider priced this token, skipping");
            return Ok(());
        };

        candidate.snapshot = Some(snapshot.clone());
        let filter_symbol = symbol_hint.as_deref().or(candidate.ticker.as_deref());
        let filtered = self.registry.filter(
            filter_symbol,
            std::slice::from_ref(&candidate),
            &message.event.text,
        );
        let Some(kept) = filtered.kept.into_iter().next() else {
            if let Some((dropped, reason)) = filtered.dropped.first() {
                debug!(
                    address = %dropped.literal,
                    reason = reason.as_str(),
                    "candidate filtered"
                );
            }
            return Ok(());
        };
        let address = kept.literal.clone();

        // Symbol for the historical surfaces: canonical ticker, then the
        // message-level hint, then whatever the provider reported.
        let symbol = kept
            .ticker
            .clone()
            .or_else(|| symbol_hint.clone())
            .or_else(|| snapshot.symbol.clone());

        match self.detector.classify(&address, chain).await? {
            DeadVerdict::Dead(reason) => {
                if self
                    .tracker
                    .mark_dead(&channel_id, &address, reason)
                    .map_err(fatal)?
                    .is_some()
                {
                    self.refresh_reputation().map_err(fatal)?;
                }
                return Ok(());
            }
            DeadVerdict::Alive => {}
        }

        let now = Utc::now();
        let message_age_secs = now
            .signed_duration_since(message.event.timestamp)
            .num_seconds();
        let entry_ts = message.event.timestamp.timestamp();

        let (entry_price, entry_source) = if message_age_secs > HISTORICAL_ENTRY_AGE_SECS {
            match symbol.as_deref() {
                Some(symbol) => {
                    self.entry_price_with_timeout(symbol, entry_ts, snapshot.price_usd)
                        .await?
                }
                None => (snapshot.price_usd, EntryPriceSource::CurrentFallback),
            }
        } else {
            (snapshot.price_usd, EntryPriceSource::Exact)
        };

        let open_result = self
            .tracker
            .open(OpenRequest {
                channel_id: channel_id.clone(),
                channel_name: message.event.channel_name.clone(),
                address: address.clone(),
                chain,
                symbol: symbol.clone(),
                message_id: message.event.message_id,
                entry_price: Some(entry_price),
                entry_time: message.event.timestamp,
                entry_source,
            })
            .map_err(fatal)?;
        if matches!(open_result, OpenResult::InsufficientData) {
            return Ok(());
        }

        self.tracker
            .update_price(&channel_id, &address, snapshot.price_usd, now)
            .map_err(fatal)?;

        // Old signals opportunistically backfill their ATH window.
        let signal_age_days = (now.timestamp() - entry_ts) / 86_400;
        if signal_age_days >= self.tracker.window_days() {
            if let Some(symbol) = symbol.as_deref() {
                self.backfill_ath_window(&channel_id, &address, symbol, entry_ts, now)
                    .await?;
            }
        }

        // Window elapsed: settle the signal and refresh standings.
        if let Some(outcome) = self.tracker.store().get_active(&channel_id, &address) {
            if self.tracker.window_elapsed(&outcome, now) {
                self.tracker
                    .complete(&channel_id, &address, "window_elapsed")
                    .map_err(fatal)?;
                self.refresh_reputation().map_err(fatal)?;
            }
        }

        self.persist_rows(&address, chain, &snapshot, &channel_id, symbol.as_deref())
            .await?;
        Ok(())
    }

    async fn entry_price_with_timeout(
        &self,
        symbol: &str,
        entry_ts: i64,
        current_price: f64,
    ) -> PipelineResult<(f64, EntryPriceSource)> {
        match timeout(
            self.timeouts.entry_price,
            self.historical.entry_price_at(symbol, entry_ts, Some(current_price)),
        )
        .await
        {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(PipelineError::Cancelled)) => Err(PipelineError::Cancelled),
            Ok(Err(err)) => {
                debug!(symbol, %err, "historical entry price unavailable");
                Ok((current_price, EntryPriceSource::CurrentFallback))
            }
            Err(_) => {
                warn!(symbol, "entry price fetch timed out, using current price");
                Ok((current_price, EntryPriceSource::CurrentFallback))
            }
        }
    }

    async fn backfill_ath_window(
        &self,
        channel_id: &str,
        address: &str,
        symbol: &str,
        entry_ts: i64,
        now: chrono::DateTime<Utc>,
    ) -> PipelineResult<()> {
        match timeout(
            self.timeouts.ath_window,
            self.historical
                .forward_ath_window(symbol, entry_ts, self.forward_ath_days),
        )
        .await
        {
            Ok(Ok(window)) => {
                self.tracker
                    .apply_ath_window(channel_id, address, &window, now)
                    .map_err(fatal)?;
            }
            Ok(Err(PipelineError::Cancelled)) => return Err(PipelineError::Cancelled),
            Ok(Err(err)) => {
                debug!(symbol, %err, "ATH window unavailable, keeping best known");
            }
            Err(_) => {
                warn!(symbol, "ATH window fetch timed out, keeping best known");
            }
        }
        Ok(())
    }

    async fn persist_rows(
        &self,
        address: &str,
        chain: crate::models::Chain,
        snapshot: &crate::models::PriceSnapshot,
        channel_id: &str,
        symbol: Option<&str>,
    ) -> PipelineResult<()> {
        self.writer
            .upsert(
                Table::TokenPrices,
                address,
                &tables::token_price_row(address, chain, snapshot),
            )
            .await
            .map_err(fatal)?;

        let outcome = self
            .tracker
            .store()
            .get_active(channel_id, address)
            .or_else(|| self.latest_completed(channel_id, address));
        if let Some(outcome) = outcome {
            self.writer
                .upsert(
                    Table::Performance,
                    address,
                    &tables::performance_row(&outcome, Utc::now()),
                )
                .await
                .map_err(fatal)?;
        }

        // Lifetime extremes are enrichment, not a gate: any failure just
        // skips the HISTORICAL row this round.
        if let Some(symbol) = symbol {
            match timeout(
                self.timeouts.ath_window,
                self.historical.lifetime_extremes(symbol),
            )
            .await
            {
                Ok(Ok(extremes)) => {
                    self.writer
                        .upsert(
                            Table::Historical,
                            address,
                            &tables::historical_row(
                                address,
                                chain,
                                &extremes,
                                snapshot.price_usd,
                            ),
                        )
                        .await
                        .map_err(fatal)?;
                }
                Ok(Err(PipelineError::Cancelled)) => return Err(PipelineError::Cancelled),
                Ok(Err(err)) => debug!(symbol, %err, "lifetime extremes unavailable"),
                Err(_) => debug!(symbol, "lifetime extremes timed out"),
            }
        }
        Ok(())
    }

    fn latest_completed(&self, channel_id: &str, address: &str) -> Option<SignalOutcome> {
        self.tracker
            .store()
            .completed_snapshot()
            .into_iter()
            .filter(|o| {
                o.channel_id == channel_id && o.address.eq_ignore_ascii_case(address)
            })
            .max_by_key(|o| o.signal_ordinal)
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

#[async_trait::async_trait]
impl EnvelopeHandler for SignalCoordinator {
    async fn handle(&self, message: ProcessedMessage) -> PipelineResult<()> {
        self.process_message(&message).await
    }
}
