//! Bounded priority queue of processed-message envelopes, plus the consumer
//! task that feeds the coordinator.
//!
//! High-confidence messages jump the line; within a priority class delivery
//! is FIFO. On shutdown the queue stops accepting new work and the consumer
//! drains what is already queued before exiting, so callers relying on
//! at-least-once delivery are not dropped mid-flight.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::models::ProcessedMessage;
use crate::shutdown::ShutdownToken;

/// Consecutive-failure threshold that turns on inter-consumption backoff.
const BACKOFF_THRESHOLD: u32 = 10;
/// Consecutive-failure threshold that declares the consumer fatal.
const FATAL_THRESHOLD: u32 = 20;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

struct Envelope {
    priority: u8,
    seq: u64,
    message: ProcessedMessage,
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Envelope {}

impl Ord for Envelope {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower seq (older) first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Envelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct SignalQueue {
    capacity: usize,
    heap: parking_lot::Mutex<BinaryHeap<Envelope>>,
    seq: AtomicU64,
    not_empty: Notify,
    not_full: Notify,
    shutdown: ShutdownToken,
}

impl SignalQueue {
    pub fn new(capacity: usize, shutdown: ShutdownToken) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            heap: parking_lot::Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            shutdown,
        })
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue, suspending while the queue is full. Rejects new work once
    /// shutdown has been signalled.
    pub async fn push(&self, message: ProcessedMessage) -> PipelineResult<()> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            {
                let mut heap = self.heap.lock();
                if heap.len() < self.capacity {
                    let priority = if message.high_confidence { 1 } else { 0 };
                    heap.push(Envelope {
                        priority,
                        seq: self.seq.fetch_add(1, AtomicOrdering::SeqCst),
                        message,
                    });
                    metrics::gauge!("callwatch_queue_depth", heap.len() as f64);
                    drop(heap);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            tokio::select! {
                _ = self.not_full.notified() => {}
                _ = self.shutdown.cancelled() => return Err(PipelineError::Cancelled),
            }
        }
    }

    /// Dequeue the highest-priority envelope. After shutdown, keeps
    /// returning queued items until the backlog drains, then `Cancelled`.
    pub async fn pop(&self) -> PipelineResult<ProcessedMessage> {
        loop {
            {
                let mut heap = self.heap.lock();
                if let Some(envelope) = heap.pop() {
                    metrics::gauge!("callwatch_queue_depth", heap.len() as f64);
                    drop(heap);
                    self.not_full.notify_one();
                    return Ok(envelope.message);
                }
            }
            if self.shutdown.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            tokio::select! {
                _ = self.not_empty.notified() => {}
                _ = self.shutdown.cancelled() => {}
            }
        }
    }
}

/// Per-message work the consumer drives; the coordinator implements this.
#[async_trait::async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, message: ProcessedMessage) -> PipelineResult<()>;
}

/// Consumer loop with the documented failure taxonomy: log-and-continue,
/// exponential backoff past 10 consecutive failures, fatal past 20.
pub async fn run_consumer(
    queue: Arc<SignalQueue>,
    handler: Arc<dyn EnvelopeHandler>,
    fatal_events: mpsc::UnboundedSender<String>,
) -> PipelineResult<()> {
    let mut consecutive_failures: u32 = 0;

    loop {
        let message = match queue.pop().await {
            Ok(message) => message,
            Err(PipelineError::Cancelled) => {
                info!("queue drained, consumer exiting");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        match handler.handle(message).await {
            Ok(()) => {
                consecutive_failures = 0;
            }
            Err(PipelineError::Cancelled) => {
                // Shutdown raced the handler; loop back to drain.
                debug!("handler cancelled mid-message");
            }
            Err(err) => {
                consecutive_failures += 1;
                metrics::counter!("callwatch_consumer_failures", 1);
                warn!(%err, consecutive_failures, "message handling failed");

                if consecutive_failures >= FATAL_THRESHOLD {
                    error!(
                        consecutive_failures,
                        "consumer failure threshold exceeded, requesting shutdown"
                    );
                    let _ = fatal_events.send(format!(
                        "consumer fatal after {consecutive_failures} consecutive failures"
                    ));
                    return Err(PipelineError::Fatal(
                        "consumer exceeded failure threshold".to_string(),
                    ));
                }
                if consecutive_failures >= BACKOFF_THRESHOLD {
                    let exp = consecutive_failures - BACKOFF_THRESHOLD;
                    let delay = BACKOFF_BASE
                        .saturating_mul(2u32.saturating_pow(exp))
                        .min(BACKOFF_CAP);
                    warn!(delay_ms = delay.as_millis() as u64, "consumer backing off");
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageEvent, Sentiment};
    use crate::shutdown::shutdown_pair;
    use chrono::Utc;
    use std::sync::atomic::AtomicU32;

    fn message(id: i64, high_confidence: bool) -> ProcessedMessage {
        ProcessedMessage {
            event: MessageEvent {
                channel_id: "c1".to_string(),
                channel_name: "chan".to_string(),
                message_id: id,
                text: "test".to_string(),
                timestamp: Utc::now(),
                forwards: 0,
                views: 0,
                replies: 0,
                reactions: 0,
            },
            crypto_relevant: true,
            mentions: Vec::new(),
            sentiment: Sentiment::neutral(),
            engagement_score: 0.0,
            confidence: if high_confidence { 0.9 } else { 0.1 },
            high_confidence,
        }
    }

    #[tokio::test]
    async fn high_confidence_jumps_the_line() {
        let queue = SignalQueue::new(10, ShutdownToken::detached());
        queue.push(message(1, false)).await.unwrap();
        queue.push(message(2, false)).await.unwrap();
        queue.push(message(3, true)).await.unwrap();

        assert_eq!(queue.pop().await.unwrap().event.message_id, 3);
        assert_eq!(queue.pop().await.unwrap().event.message_id, 1);
        assert_eq!(queue.pop().await.unwrap().event.message_id, 2);
    }

    #[tokio::test]
    async fn push_blocks_when_full_until_pop() {
        let queue = SignalQueue::new(1, ShutdownToken::detached());
        queue.push(message(1, false)).await.unwrap();

        let blocked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(message(2, false)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        queue.pop().await.unwrap();
        blocked.await.unwrap().unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_drains_backlog_then_cancels() {
        let (handle, token) = shutdown_pair();
        let queue = SignalQueue::new(10, token);
        queue.push(message(1, false)).await.unwrap();
        queue.push(message(2, false)).await.unwrap();

        handle.trigger();
        assert!(matches!(
            queue.push(message(3, false)).await,
            Err(PipelineError::Cancelled)
        ));

        assert_eq!(queue.pop().await.unwrap().event.message_id, 1);
        assert_eq!(queue.pop().await.unwrap().event.message_id, 2);
        assert!(matches!(queue.pop().await, Err(PipelineError::Cancelled)));
    }

    struct FailingHandler {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl EnvelopeHandler for FailingHandler {
        async fn handle(&self, _message: ProcessedMessage) -> PipelineResult<()> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Err(PipelineError::Fatal("boom".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn twenty_consecutive_failures_are_fatal() {
        let (handle, token) = shutdown_pair();
        let queue = SignalQueue::new(64, token);
        for i in 0..30 {
            queue.push(message(i, false)).await.unwrap();
        }

        let handler = Arc::new(FailingHandler {
            calls: AtomicU32::new(0),
        });
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let result = run_consumer(queue, handler.clone(), fatal_tx).await;

        assert!(matches!(result, Err(PipelineError::Fatal(_))));
        assert_eq!(handler.calls.load(AtomicOrdering::SeqCst), 20);
        assert!(fatal_rx.recv().await.is_some());
        handle.trigger();
    }
}
