//! Thin Telegram Bot API transport.
//!
//! Deliberately minimal: long-polls `getUpdates` for channel posts and maps
//! them onto message events. Session sophistication (MTProto history,
//! reconnect strategies) stays with the transport side of the fence; the
//! pipeline only sees the `ChatTransport` contract.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::ChatTransport;
use crate::error::{PipelineError, PipelineResult};
use crate::models::MessageEvent;
use crate::shutdown::ShutdownToken;

const DEFAULT_BASE_URL: &str = "https://api.telegram.org";
const LONG_POLL_SECS: u64 = 30;

pub struct TelegramBotApi {
    client: Client,
    base_url: String,
    token: String,
    shutdown: ShutdownToken,
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    channel_post: Option<ChannelPost>,
}

#[derive(Debug, Deserialize)]
struct ChannelPost {
    message_id: i64,
    chat: Chat,
    #[serde(default)]
    text: Option<String>,
    /// Unix seconds.
    date: i64,
    #[serde(default)]
    forward_count: Option<u32>,
    #[serde(default)]
    views: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    #[serde(default)]
    title: Option<String>,
}

impl TelegramBotApi {
    pub fn new(
        token: String,
        base_url: Option<String>,
        shutdown: ShutdownToken,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            // Above the long-poll horizon so idle polls do not error.
            .timeout(Duration::from_secs(LONG_POLL_SECS + 10))
            .user_agent("callwatch/0.1")
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            token,
            shutdown,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    async fn get_updates(&self, offset: Option<i64>, timeout_secs: u64) -> PipelineResult<Vec<Update>> {
        let mut query: Vec<(&str, String)> = vec![
            ("timeout", timeout_secs.to_string()),
            ("allowed_updates", "[\"channel_post\"]".to_string()),
        ];
        if let Some(offset) = offset {
            query.push(("offset", offset.to_string()));
        }

        let response = self
            .client
            .get(self.method_url("getUpdates"))
            .query(&query)
            .send()
            .await
            .map_err(PipelineError::from_http)?;
        crate::providers::check_status(&response)?;

        let body: UpdatesResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::TransientNetwork(format!("bad updates body: {e}")))?;
        if !body.ok {
            return Err(PipelineError::ProviderEmpty);
        }
        Ok(body.result)
    }

    fn to_event(post: ChannelPost) -> Option<MessageEvent> {
        let text = post.text?;
        Some(MessageEvent {
            channel_id: post.chat.id.to_string(),
            channel_name: post.chat.title.unwrap_or_default(),
            message_id: post.message_id,
            text,
            timestamp: Utc
                .timestamp_opt(post.date, 0)
                .single()
                .unwrap_or_else(Utc::now),
            forwards: post.forward_count.unwrap_or(0),
            views: post.views.unwrap_or(0),
            replies: 0,
            reactions: 0,
        })
    }
}

#[async_trait]
impl ChatTransport for TelegramBotApi {
    async fn fetch_recent(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> PipelineResult<Vec<MessageEvent>> {
        // Negative offset asks for the trailing window of updates; the Bot
        // API keeps only a short backlog, so backfill depth is best-effort.
        let offset = -(limit.min(100) as i64);
        let updates = self.get_updates(Some(offset), 0).await?;

        let mut events: Vec<MessageEvent> = updates
            .into_iter()
            .filter_map(|u| u.channel_post)
            .filter_map(Self::to_event)
            .filter(|e| e.channel_id == channel_id)
            .collect();
        events.sort_by_key(|e| std::cmp::Reverse(e.message_id));
        events.truncate(limit);
        debug!(channel_id, fetched = events.len(), "fetched recent channel posts");
        Ok(events)
    }

    async fn subscribe(&self) -> PipelineResult<mpsc::Receiver<MessageEvent>> {
        let (tx, rx) = mpsc::channel(256);
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let token = self.token.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let transport = TelegramBotApi {
                client,
                base_url,
                token,
                shutdown: shutdown.clone(),
            };
            let mut offset: Option<i64> = None;

            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                let poll = tokio::select! {
                    result = transport.get_updates(offset, LONG_POLL_SECS) => result,
                    _ = shutdown.cancelled() => break,
                };
                match poll {
                    Ok(updates) => {
                        for update in updates {
                            offset = Some(update.update_id + 1);
                            if let Some(event) =
                                update.channel_post.and_then(TelegramBotApi::to_event)
                            {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(PipelineError::Cancelled) => break,
                    Err(err) => {
                        warn!(%err, "getUpdates poll failed, backing off");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });
        Ok(rx)
    }
}
