//! Historical bootstrap: scrape recent channel history through the
//! coordinator, checkpointing progress so an interrupted run resumes where
//! it stopped instead of re-opening signals it already produced.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::models::ScrapeProgress;
use crate::shutdown::ShutdownToken;
use crate::signals::{MessageProcessor, SignalCoordinator};
use crate::transport::ChatTransport;

/// Checkpoint the progress record every this many processed messages.
const CHECKPOINT_EVERY: u64 = 10;

/// File-backed per-channel scrape checkpoints (`scraped_channels.json`).
pub struct ScrapeProgressStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, ScrapeProgress>>,
}

impl ScrapeProgressStore {
    pub fn load(path: PathBuf) -> anyhow::Result<Self> {
        let entries = crate::fsutil::load_json_or(&path, HashMap::new)?;
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn get(&self, channel_id: &str) -> Option<ScrapeProgress> {
        self.entries.lock().get(channel_id).cloned()
    }

    pub fn is_complete(&self, channel_id: &str) -> bool {
        self.entries
            .lock()
            .get(channel_id)
            .map(|p| p.complete)
            .unwrap_or(false)
    }

    pub fn record(&self, progress: ScrapeProgress) -> anyhow::Result<()> {
        {
            self.entries
                .lock()
                .insert(progress.channel_id.clone(), progress);
        }
        let snapshot = self.entries.lock().clone();
        crate::fsutil::save_json_pretty(&self.path, &snapshot)
    }
}

pub struct HistoricalBootstrap {
    transport: Arc<dyn ChatTransport>,
    processor: Arc<MessageProcessor>,
    coordinator: Arc<SignalCoordinator>,
    progress: Arc<ScrapeProgressStore>,
    limit: usize,
    shutdown: ShutdownToken,
}

impl HistoricalBootstrap {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        processor: Arc<MessageProcessor>,
        coordinator: Arc<SignalCoordinator>,
        progress: Arc<ScrapeProgressStore>,
        limit: usize,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            transport,
            processor,
            coordinator,
            progress,
            limit,
            shutdown,
        }
    }

    /// Scrape every channel not yet marked complete. Cancellation
    /// checkpoints and returns `Cancelled`; the lifecycle moves on to
    /// realtime monitoring without waiting.
    pub async fn run(&self, channels: &[String]) -> PipelineResult<BootstrapSummary> {
        let mut summary = BootstrapSummary::default();
        for channel_id in channels {
            if self.shutdown.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if self.progress.is_complete(channel_id) {
                info!(channel = %channel_id, "already scraped, skipping");
                summary.skipped_channels += 1;
                continue;
            }
            match self.scrape_channel(channel_id).await {
                Ok(processed) => {
                    summary.scraped_channels += 1;
                    summary.messages_processed += processed;
                }
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(err) => {
                    warn!(channel = %channel_id, %err, "channel scrape failed, continuing");
                    summary.failed_channels += 1;
                }
            }
        }
        info!(
            scraped = summary.scraped_channels,
            skipped = summary.skipped_channels,
            failed = summary.failed_channels,
            messages = summary.messages_processed,
            "bootstrap finished"
        );
        Ok(summary)
    }

    /// One channel: fetch the recent-history window, replay it in id
    /// order, skip ids at or below the checkpoint.
    pub async fn scrape_channel(&self, channel_id: &str) -> PipelineResult<u64> {
        let resume_from = self
            .progress
            .get(channel_id)
            .map(|p| p.last_processed_id)
            .unwrap_or(0);
        let mut total = self
            .progress
            .get(channel_id)
            .map(|p| p.total_processed)
            .unwrap_or(0);

        let mut events = self
            .transport
            .fetch_recent(channel_id, self.limit)
            .await?;
        info!(
            channel = %channel_id,
            fetched = events.len(),
            resume_from,
            "scraping channel history"
        );
        // The transport pages newest-first; replay oldest-first so the
        // checkpoint id cleanly splits done from not-done across restarts.
        events.sort_by_key(|e| e.message_id);

        let mut processed_now = 0u64;
        let mut highest_id = resume_from;

        for event in events {
            if self.shutdown.is_cancelled() {
                self.checkpoint(channel_id, highest_id, total, false)
                    .map_err(fatal)?;
                return Err(PipelineError::Cancelled);
            }
            // Resume rule: everything at or below the checkpoint was
            // handled by a previous run.
            if event.message_id <= resume_from {
                continue;
            }

            highest_id = highest_id.max(event.message_id);
            let processed = self.processor.process(event);
            match self.coordinator.process_message(&processed).await {
                Ok(()) => {}
                Err(PipelineError::Cancelled) => {
                    self.checkpoint(channel_id, highest_id, total, false)
                        .map_err(fatal)?;
                    return Err(PipelineError::Cancelled);
                }
                Err(err) => {
                    warn!(
                        channel = %channel_id,
                        message_id = processed.event.message_id,
                        %err,
                        "message failed during bootstrap, continuing"
                    );
                }
            }

            total += 1;
            processed_now += 1;
            if processed_now % CHECKPOINT_EVERY == 0 {
                self.checkpoint(channel_id, highest_id, total, false)
                    .map_err(fatal)?;
            }
        }

        self.checkpoint(channel_id, highest_id, total, true)
            .map_err(fatal)?;
        Ok(processed_now)
    }

    fn checkpoint(
        &self,
        channel_id: &str,
        last_processed_id: i64,
        total_processed: u64,
        complete: bool,
    ) -> anyhow::Result<()> {
        self.progress.record(ScrapeProgress {
            channel_id: channel_id.to_string(),
            last_processed_id,
            total_processed,
            complete,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BootstrapSummary {
    pub scraped_channels: u64,
    pub skipped_channels: u64,
    pub failed_channels: u64,
    pub messages_processed: u64,
}

fn fatal(err: anyhow::Error) -> PipelineError {
    PipelineError::Fatal(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scraped_channels.json");

        let store = ScrapeProgressStore::load(path.clone()).unwrap();
        store
            .record(ScrapeProgress {
                channel_id: "c1".to_string(),
                last_processed_id: 60,
                total_processed: 60,
                complete: false,
            })
            .unwrap();

        let reloaded = ScrapeProgressStore::load(path).unwrap();
        let progress = reloaded.get("c1").unwrap();
        assert_eq!(progress.last_processed_id, 60);
        assert!(!reloaded.is_complete("c1"));
    }
}
