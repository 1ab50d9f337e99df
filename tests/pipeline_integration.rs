//! End-to-end pipeline tests with scripted collaborators.
//!
//! Every external surface (price providers, historical providers, chat
//! transport) is a deterministic fake; the stores and tables write to temp
//! directories so each test observes real file output.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use callwatch_backend::bootstrap::{HistoricalBootstrap, ScrapeProgressStore};
use callwatch_backend::config::{ProcessorConfig, TimeoutConfig};
use callwatch_backend::error::{PipelineError, PipelineResult};
use callwatch_backend::models::{Chain, MessageEvent, OhlcCandle, PriceSnapshot};
use callwatch_backend::output::TableWriter;
use callwatch_backend::pricing::{HistoricalPriceService, PriceEngine};
use callwatch_backend::providers::{HistoricalProvider, LifetimeExtremes, PriceProvider};
use callwatch_backend::reputation::{ReputationEngine, ReputationWeights};
use callwatch_backend::sentiment::LexiconSentiment;
use callwatch_backend::shutdown::ShutdownToken;
use callwatch_backend::signals::{MessageProcessor, SignalCoordinator};
use callwatch_backend::tokens::{DeadTokenBlacklist, DeadTokenDetector, TokenRegistry};
use callwatch_backend::tracking::{OutcomeTracker, TrackingStore};
use callwatch_backend::transport::ScriptedTransport;

const USDT: &str = "0xdAC17F958D2ee523a2206206994597C13D831ec7";

// ---------------------------------------------------------------------------
// fakes
// ---------------------------------------------------------------------------

struct FakePriceProvider {
    tag: &'static str,
    prices: HashMap<String, PriceSnapshot>,
    calls: AtomicU32,
    fail_first: u32,
}

impl FakePriceProvider {
    fn new(tag: &'static str) -> Self {
        Self {
            tag,
            prices: HashMap::new(),
            calls: AtomicU32::new(0),
            fail_first: 0,
        }
    }

    fn with_price(mut self, address: &str, price: f64, market_cap: f64) -> Self {
        let mut snap = PriceSnapshot::new(price, self.tag);
        snap.market_cap = Some(market_cap);
        snap.symbol = Some("TKN".to_string());
        self.prices.insert(address.to_lowercase(), snap);
        self
    }

    fn failing_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceProvider for FakePriceProvider {
    fn tag(&self) -> &'static str {
        self.tag
    }

    fn rate_limit_per_minute(&self) -> u32 {
        60_000
    }

    async fn current_price(&self, address: &str, _chain: Chain) -> PipelineResult<PriceSnapshot> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            return Err(PipelineError::TransientNetwork("http 429".into()));
        }
        self.prices
            .get(&address.to_lowercase())
            .cloned()
            .ok_or(PipelineError::ProviderEmpty)
    }
}

struct FakeHistoricalProvider {
    tag: &'static str,
    point_price: Option<f64>,
    candles: Vec<OhlcCandle>,
}

impl FakeHistoricalProvider {
    fn empty(tag: &'static str) -> Self {
        Self {
            tag,
            point_price: None,
            candles: Vec::new(),
        }
    }
}

#[async_trait]
impl HistoricalProvider for FakeHistoricalProvider {
    fn tag(&self) -> &'static str {
        self.tag
    }

    fn rate_limit_per_minute(&self) -> u32 {
        60_000
    }

    async fn price_at(&self, _symbol: &str, _unix_ts: i64) -> PipelineResult<f64> {
        self.point_price.ok_or(PipelineError::ProviderEmpty)
    }

    async fn daily_ohlc(
        &self,
        _symbol: &str,
        _start_ts: i64,
        _days: i64,
    ) -> PipelineResult<Vec<OhlcCandle>> {
        if self.candles.is_empty() {
            return Err(PipelineError::ProviderEmpty);
        }
        Ok(self.candles.clone())
    }

    async fn lifetime_extremes(&self, _symbol: &str) -> PipelineResult<LifetimeExtremes> {
        Err(PipelineError::ProviderEmpty)
    }
}

// ---------------------------------------------------------------------------
// harness
// ---------------------------------------------------------------------------

struct Harness {
    _data_dir: tempfile::TempDir,
    output_dir: tempfile::TempDir,
    processor: Arc<MessageProcessor>,
    coordinator: Arc<SignalCoordinator>,
    tracker: Arc<OutcomeTracker>,
    blacklist: Arc<DeadTokenBlacklist>,
    providers: Vec<Arc<FakePriceProvider>>,
}

impl Harness {
    fn new(providers: Vec<FakePriceProvider>) -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        let output_dir = tempfile::tempdir().unwrap();
        Self::with_dirs(providers, data_dir, output_dir)
    }

    fn with_dirs(
        providers: Vec<FakePriceProvider>,
        data_dir: tempfile::TempDir,
        output_dir: tempfile::TempDir,
    ) -> Self {
        let shutdown = ShutdownToken::detached();
        let providers: Vec<Arc<FakePriceProvider>> =
            providers.into_iter().map(Arc::new).collect();

        let registry = Arc::new(TokenRegistry::with_defaults());
        let blacklist = Arc::new(
            DeadTokenBlacklist::load(data_dir.path().join("dead_tokens_blacklist.json"))
                .unwrap(),
        );
        let detector = Arc::new(DeadTokenDetector::new(None, blacklist.clone()));

        let mut ordered: Vec<Arc<dyn PriceProvider>> = providers
            .iter()
            .map(|p| p.clone() as Arc<dyn PriceProvider>)
            .collect();
        let specialist = ordered
            .first()
            .cloned()
            .unwrap_or_else(|| Arc::new(FakePriceProvider::new("spec")) as Arc<dyn PriceProvider>);
        // General order excludes the specialist slot.
        if !ordered.is_empty() {
            ordered.remove(0);
        }
        let engine = Arc::new(PriceEngine::new(specialist, ordered, shutdown.clone()));

        let historical = Arc::new(
            HistoricalPriceService::new(
                Arc::new(FakeHistoricalProvider::empty("hist-primary")),
                Arc::new(FakeHistoricalProvider::empty("hist-secondary")),
                data_dir.path().join("cache").join("historical_prices.json"),
                shutdown,
            )
            .unwrap(),
        );

        let store = Arc::new(TrackingStore::load(data_dir.path()).unwrap());
        let tracker = Arc::new(OutcomeTracker::new(store, 7));
        let writer = Arc::new(TableWriter::new(output_dir.path().to_path_buf(), None));
        let reputation = Arc::new(ReputationEngine::new(
            ReputationWeights::default(),
            Some(data_dir.path().join("channel_reputation.json")),
        ));

        let processor = Arc::new(MessageProcessor::new(
            ProcessorConfig::default(),
            &registry,
            Arc::new(LexiconSentiment),
        ));
        let coordinator = SignalCoordinator::new(
            registry,
            detector,
            engine,
            historical,
            tracker.clone(),
            writer,
            reputation,
            TimeoutConfig::default(),
            30,
            5,
        );

        Self {
            _data_dir: data_dir,
            output_dir,
            processor,
            coordinator,
            tracker,
            blacklist,
            providers,
        }
    }

    fn total_provider_calls(&self) -> u32 {
        self.providers.iter().map(|p| p.call_count()).sum()
    }

    fn table_lines(&self, file_name: &str) -> Option<Vec<String>> {
        let day = chrono::Local::now().date_naive().format("%Y-%m-%d").to_string();
        let path = self.output_dir.path().join(day).join(file_name);
        if !path.exists() {
            return None;
        }
        Some(
            std::fs::read_to_string(path)
                .unwrap()
                .lines()
                .map(|l| l.to_string())
                .collect(),
        )
    }

    fn output_is_empty(&self) -> bool {
        !Path::new(self.output_dir.path()).exists()
            || std::fs::read_dir(self.output_dir.path()).unwrap().next().is_none()
    }
}

fn message(channel: &str, id: i64, text: &str) -> MessageEvent {
    MessageEvent {
        channel_id: channel.to_string(),
        channel_name: format!("{channel} name"),
        message_id: id,
        text: text.to_string(),
        timestamp: Utc::now(),
        forwards: 0,
        views: 0,
        replies: 0,
        reactions: 0,
    }
}

async fn feed(harness: &Harness, event: MessageEvent) {
    let processed = harness.processor.process(event);
    harness.coordinator.process_message(&processed).await.unwrap();
}

// ---------------------------------------------------------------------------
// scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn commentary_in_prose_touches_nothing() {
    let harness = Harness::new(vec![
        FakePriceProvider::new("spec"),
        FakePriceProvider::new("gen1").with_price(USDT, 1.0, 9e10),
    ]);

    feed(&harness, message("c1", 1, "near future we'll see gains")).await;

    assert_eq!(harness.total_provider_calls(), 0);
    assert!(harness.output_is_empty());
    assert_eq!(harness.tracker.store().active_count(), 0);
}

#[tokio::test]
async fn plain_evm_call_opens_signal_and_writes_rows() {
    let harness = Harness::new(vec![
        FakePriceProvider::new("spec"),
        FakePriceProvider::new("gen1").with_price(USDT, 1.0, 9e10),
    ]);

    feed(
        &harness,
        message("c1", 7, &format!("Buy {USDT} now")),
    )
    .await;

    let outcome = harness.tracker.store().get_active("c1", USDT).unwrap();
    assert_eq!(outcome.signal_ordinal, 1);
    assert_eq!(outcome.entry_price, 1.0);
    assert_eq!(outcome.ath_multiplier, 1.0);
    assert_eq!(outcome.current_multiplier, 1.0);
    assert_eq!(outcome.first_message_id, 7);

    let messages = harness.table_lines("messages.csv").unwrap();
    assert_eq!(messages.len(), 2);

    let prices = harness.table_lines("token_prices.csv").unwrap();
    assert_eq!(prices.len(), 2);
    assert!(prices[1].starts_with(USDT));
    assert!(prices[1].contains(",evm,TKN,1,"));

    let perf = harness.table_lines("performance.csv").unwrap();
    assert_eq!(perf.len(), 2);
    assert!(perf[1].starts_with(USDT));
}

#[tokio::test]
async fn duplicate_call_is_idempotent_while_active() {
    let harness = Harness::new(vec![
        FakePriceProvider::new("spec"),
        FakePriceProvider::new("gen1").with_price(USDT, 1.0, 9e10),
    ]);

    feed(&harness, message("c1", 1, &format!("Buy {USDT} now"))).await;
    feed(&harness, message("c1", 2, &format!("Buy {USDT} again"))).await;

    assert_eq!(harness.tracker.store().active_count(), 1);
    let outcome = harness.tracker.store().get_active("c1", USDT).unwrap();
    assert_eq!(outcome.signal_ordinal, 1);
    assert_eq!(outcome.first_message_id, 1);
}

#[tokio::test]
async fn fresh_start_reopens_with_next_ordinal() {
    let harness = Harness::new(vec![
        FakePriceProvider::new("spec"),
        FakePriceProvider::new("gen1").with_price(USDT, 1.0, 9e10),
    ]);

    feed(&harness, message("c1", 1, &format!("Buy {USDT} now"))).await;
    harness
        .tracker
        .update_price("c1", USDT, 2.5, Utc::now())
        .unwrap();
    harness.tracker.complete("c1", USDT, "window_elapsed").unwrap().unwrap();

    feed(&harness, message("c1", 9, &format!("Re-entering {USDT}"))).await;

    let outcome = harness.tracker.store().get_active("c1", USDT).unwrap();
    assert_eq!(outcome.signal_ordinal, 2);
    assert_eq!(outcome.previous_signals, vec![1]);
    assert_eq!(outcome.ath_multiplier, 1.0);

    // Historical ordinal-1 row untouched and still a winner.
    let history = harness.tracker.store().completed_snapshot();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].signal_ordinal, 1);
    assert!(history[0].is_winner);
}

#[tokio::test]
async fn blacklisted_token_costs_zero_provider_calls() {
    let harness = Harness::new(vec![
        FakePriceProvider::new("spec"),
        FakePriceProvider::new("gen1").with_price(USDT, 1.0, 9e10),
    ]);

    harness
        .blacklist
        .insert(callwatch_backend::models::DeadTokenEntry {
            address: USDT.to_string(),
            chain: Chain::Evm,
            reason: callwatch_backend::models::DeadReason::DeadLp,
            supply: Some("5000".to_string()),
            holders: None,
            transfers: Some(3),
            detected_at: Utc::now(),
        })
        .unwrap();

    feed(&harness, message("c1", 1, &format!("Buy {USDT} now"))).await;

    assert_eq!(harness.total_provider_calls(), 0);
    assert_eq!(harness.tracker.store().active_count(), 0);
}

#[tokio::test]
async fn provider_failover_absorbs_429s_without_reaching_next_provider() {
    let harness = Harness::new(vec![
        FakePriceProvider::new("spec"),
        FakePriceProvider::new("provider-1")
            .with_price(USDT, 1.0, 9e10)
            .failing_first(2),
        FakePriceProvider::new("provider-2").with_price(USDT, 99.0, 9e10),
    ]);

    feed(&harness, message("c1", 1, &format!("Buy {USDT} now"))).await;

    let outcome = harness.tracker.store().get_active("c1", USDT).unwrap();
    assert_eq!(outcome.entry_price, 1.0);
    // provider-1 absorbed its 429s through retry; provider-2 never called.
    assert_eq!(harness.providers[1].call_count(), 3);
    assert_eq!(harness.providers[2].call_count(), 0);
}

#[tokio::test]
async fn ticker_only_message_resolves_through_registry() {
    let weth = "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2";
    let harness = Harness::new(vec![
        FakePriceProvider::new("spec"),
        FakePriceProvider::new("gen1").with_price(weth, 3000.0, 4e11),
    ]);

    feed(&harness, message("c1", 1, "buy ETH right now before it runs")).await;

    let outcome = harness.tracker.store().get_active("c1", weth).unwrap();
    assert_eq!(outcome.entry_price, 3000.0);
    assert_eq!(outcome.symbol.as_deref(), Some("ETH"));
}

#[tokio::test]
async fn low_market_cap_token_is_filtered_before_tracking() {
    let harness = Harness::new(vec![
        FakePriceProvider::new("spec"),
        FakePriceProvider::new("gen1").with_price(USDT, 0.001, 500.0),
    ]);

    feed(&harness, message("c1", 1, &format!("ape {USDT} here"))).await;

    // Priced once, then dropped by the floor filter; nothing tracked.
    assert_eq!(harness.providers[1].call_count(), 1);
    assert_eq!(harness.tracker.store().active_count(), 0);
    assert!(harness.table_lines("performance.csv").is_none());
}

// ---------------------------------------------------------------------------
// bootstrap resume
// ---------------------------------------------------------------------------

fn scripted_channel(channel: &str, count: i64, with_address: &str) -> Vec<MessageEvent> {
    (1..=count)
        .map(|id| {
            let text = if id % 2 == 0 {
                format!("call #{id}: buy {with_address} now")
            } else {
                format!("general chatter number {id}")
            };
            message(channel, id, &text)
        })
        .collect()
}

#[tokio::test]
async fn interrupted_bootstrap_resumes_without_duplicates() {
    let events = scripted_channel("c1", 100, USDT);

    // Uninterrupted reference run.
    let reference = Harness::new(vec![
        FakePriceProvider::new("spec"),
        FakePriceProvider::new("gen1").with_price(USDT, 1.0, 9e10),
    ]);
    {
        let transport = Arc::new(ScriptedTransport::new(events.clone()));
        let progress_dir = tempfile::tempdir().unwrap();
        let progress = Arc::new(
            ScrapeProgressStore::load(progress_dir.path().join("scraped_channels.json"))
                .unwrap(),
        );
        let bootstrap = HistoricalBootstrap::new(
            transport,
            reference.processor.clone(),
            reference.coordinator.clone(),
            progress,
            100,
            ShutdownToken::detached(),
        );
        bootstrap.run(&["c1".to_string()]).await.unwrap();
    }
    let reference_outcomes = reference.tracker.store().active_count();
    assert_eq!(reference_outcomes, 1);

    // Interrupted run: process A checkpointed at message 60 and died.
    let harness = Harness::new(vec![
        FakePriceProvider::new("spec"),
        FakePriceProvider::new("gen1").with_price(USDT, 1.0, 9e10),
    ]);
    let progress_dir = tempfile::tempdir().unwrap();
    let progress_path = progress_dir.path().join("scraped_channels.json");
    {
        let progress = Arc::new(ScrapeProgressStore::load(progress_path.clone()).unwrap());
        progress
            .record(callwatch_backend::models::ScrapeProgress {
                channel_id: "c1".to_string(),
                last_processed_id: 60,
                total_processed: 60,
                complete: false,
            })
            .unwrap();
    }

    // Process B resumes from the checkpoint.
    let transport = Arc::new(ScriptedTransport::new(events));
    let progress = Arc::new(ScrapeProgressStore::load(progress_path).unwrap());
    let bootstrap = HistoricalBootstrap::new(
        transport,
        harness.processor.clone(),
        harness.coordinator.clone(),
        progress.clone(),
        100,
        ShutdownToken::detached(),
    );
    let summary = bootstrap.run(&["c1".to_string()]).await.unwrap();

    // Only ids > 60 were touched (20 of them carry the address).
    assert_eq!(summary.messages_processed, 40);
    assert_eq!(harness.tracker.store().active_count(), reference_outcomes);
    assert!(progress.is_complete("c1"));
    let record = progress.get("c1").unwrap();
    assert_eq!(record.last_processed_id, 100);

    // A third run skips the channel entirely.
    let transport = Arc::new(ScriptedTransport::new(Vec::new()));
    let bootstrap = HistoricalBootstrap::new(
        transport,
        harness.processor.clone(),
        harness.coordinator.clone(),
        progress,
        100,
        ShutdownToken::detached(),
    );
    let summary = bootstrap.run(&["c1".to_string()]).await.unwrap();
    assert_eq!(summary.skipped_channels, 1);
    assert_eq!(summary.messages_processed, 0);
}
