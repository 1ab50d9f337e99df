//! Chat-transport collaborator contract and the in-memory scripted
//! implementation used by tests and offline runs.
//!
//! The transport owns session concerns (auth, reconnect). The pipeline only
//! needs recent-history paging for bootstrap and a realtime subscription.

pub mod telegram;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::PipelineResult;
use crate::models::MessageEvent;

pub use telegram::TelegramBotApi;

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Up to `limit` recent messages for one channel, newest first.
    async fn fetch_recent(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> PipelineResult<Vec<MessageEvent>>;

    /// Realtime event stream across all configured channels.
    async fn subscribe(&self) -> PipelineResult<mpsc::Receiver<MessageEvent>>;
}

/// Scripted transport: plays back a fixed set of events.
pub struct ScriptedTransport {
    events: Vec<MessageEvent>,
}

impl ScriptedTransport {
    pub fn new(events: Vec<MessageEvent>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn fetch_recent(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> PipelineResult<Vec<MessageEvent>> {
        let mut matching: Vec<MessageEvent> = self
            .events
            .iter()
            .filter(|e| e.channel_id == channel_id)
            .cloned()
            .collect();
        matching.sort_by_key(|e| std::cmp::Reverse(e.message_id));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn subscribe(&self) -> PipelineResult<mpsc::Receiver<MessageEvent>> {
        let (tx, rx) = mpsc::channel(self.events.len().max(1));
        for event in self.events.clone() {
            // Buffered above scripted length; never blocks.
            let _ = tx.send(event).await;
        }
        Ok(rx)
    }
}
