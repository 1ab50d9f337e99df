//! Callwatch realtime monitor.
//!
//! Wires the full pipeline: transport subscription -> message processor ->
//! priority queue -> signal coordinator, with the historical bootstrap and
//! the periodic outcome updater running alongside.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use callwatch_backend::bootstrap::{HistoricalBootstrap, ScrapeProgressStore};
use callwatch_backend::config::Config;
use callwatch_backend::error::PipelineError;
use callwatch_backend::lifecycle::Lifecycle;
use callwatch_backend::output::{HttpSheetClient, SheetSink, TableWriter};
use callwatch_backend::pricing::{HistoricalPriceService, PriceEngine};
use callwatch_backend::providers::{
    CoinGeckoApi, CryptoCompareApi, DexScreenerApi, GeckoTerminalApi, JupiterPriceApi,
    PriceProvider,
};
use callwatch_backend::queue::{run_consumer, SignalQueue};
use callwatch_backend::reputation::{ReputationEngine, ReputationWeights};
use callwatch_backend::sentiment::LexiconSentiment;
use callwatch_backend::shutdown::shutdown_pair;
use callwatch_backend::signals::{MessageProcessor, SignalCoordinator};
use callwatch_backend::tokens::{DeadTokenBlacklist, DeadTokenDetector, TokenRegistry};
use callwatch_backend::tracking::{OutcomeTracker, OutcomeUpdater, TrackingStore};
use callwatch_backend::transport::{ChatTransport, TelegramBotApi};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("callwatch=info")),
        )
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    info!(
        channels = config.channels.len(),
        output_root = %config.output_root.display(),
        data_root = %config.data_root.display(),
        "callwatch starting"
    );

    let (shutdown_handle, shutdown) = shutdown_pair();
    let lifecycle = Lifecycle::new();
    if !lifecycle.begin_start() {
        return Ok(());
    }

    // --- shared components -------------------------------------------------
    let registry = Arc::new(TokenRegistry::with_defaults());
    let blacklist = Arc::new(
        DeadTokenBlacklist::load(config.data_root.join("dead_tokens_blacklist.json"))
            .context("failed to load dead-token blacklist")?,
    );
    let detector = Arc::new(DeadTokenDetector::new(None, blacklist.clone()));

    let http_timeout = config.timeouts.http_request;
    let jupiter = Arc::new(JupiterPriceApi::new(
        config.providers.jupiter_base_url.clone(),
        http_timeout,
    )?);
    let coingecko = Arc::new(CoinGeckoApi::new(
        config.providers.coingecko_base_url.clone(),
        config.providers.coingecko_api_key.clone(),
        http_timeout,
    )?);
    let geckoterminal = Arc::new(GeckoTerminalApi::new(
        config.providers.geckoterminal_base_url.clone(),
        http_timeout,
    )?);
    let dexscreener = Arc::new(DexScreenerApi::new(
        config.providers.dexscreener_base_url.clone(),
        http_timeout,
    )?);
    let cryptocompare = Arc::new(CryptoCompareApi::new(
        config.providers.cryptocompare_base_url.clone(),
        config.providers.cryptocompare_api_key.clone(),
        http_timeout,
    )?);

    let general: Vec<Arc<dyn PriceProvider>> =
        vec![coingecko.clone(), geckoterminal, dexscreener];
    let engine = Arc::new(PriceEngine::new(jupiter, general, shutdown.clone()));
    let historical = Arc::new(HistoricalPriceService::new(
        coingecko,
        cryptocompare,
        config.data_root.join("cache").join("historical_prices.json"),
        shutdown.clone(),
    )?);

    let store = Arc::new(TrackingStore::load(&config.data_root)?);
    // Checkpoints crossed while the process was down get settled first.
    OutcomeUpdater::resync_checkpoints(&store)?;
    let tracker = Arc::new(OutcomeTracker::new(
        store.clone(),
        config.tracking.window_days,
    ));

    let sheet: Option<Arc<dyn SheetSink>> = match HttpSheetClient::from_config(&config.sheet) {
        Ok(client) => client.map(|c| Arc::new(c) as Arc<dyn SheetSink>),
        Err(err) => {
            warn!(%err, "sheet mirror misconfigured, continuing without it");
            None
        }
    };
    let writer = Arc::new(TableWriter::new(config.output_root.clone(), sheet));
    let reputation = Arc::new(ReputationEngine::new(
        ReputationWeights::default(),
        Some(config.data_root.join("channel_reputation.json")),
    ));

    let processor = Arc::new(MessageProcessor::new(
        config.processor.clone(),
        &registry,
        Arc::new(LexiconSentiment),
    ));
    let coordinator = SignalCoordinator::new(
        registry,
        detector,
        engine.clone(),
        historical.clone(),
        tracker.clone(),
        writer.clone(),
        reputation.clone(),
        config.timeouts.clone(),
        config.tracking.forward_ath_days,
        config.per_message_parallelism,
    );

    let token = config
        .telegram_bot_token
        .clone()
        .context("TELEGRAM_BOT_TOKEN is required for the realtime monitor")?;
    let transport: Arc<dyn ChatTransport> =
        Arc::new(TelegramBotApi::new(token, None, shutdown.clone())?);

    // --- background tasks --------------------------------------------------
    let queue = SignalQueue::new(config.queue_capacity, shutdown.clone());
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<String>();

    let consumer_handle = tokio::spawn(run_consumer(
        queue.clone(),
        coordinator.clone(),
        fatal_tx.clone(),
    ));

    let updater = OutcomeUpdater::new(
        tracker.clone(),
        blacklist,
        engine,
        historical,
        writer,
        reputation,
        config.tracking.update_interval,
        config.timeouts.ath_window,
        config.tracking.forward_ath_days,
        shutdown.clone(),
    );
    let updater_handle = tokio::spawn(async move { updater.run().await });

    // Bootstrap is cancellable and never blocks the lifecycle transition.
    let bootstrap_handle = {
        let progress = Arc::new(ScrapeProgressStore::load(
            config.data_root.join("scraped_channels.json"),
        )?);
        let bootstrap = HistoricalBootstrap::new(
            transport.clone(),
            processor.clone(),
            coordinator.clone(),
            progress,
            config.historical_scrape_limit,
            shutdown.clone(),
        );
        let channels = config.channels.clone();
        tokio::spawn(async move {
            match bootstrap.run(&channels).await {
                Ok(_) => {}
                Err(PipelineError::Cancelled) => {
                    info!("bootstrap cancelled, continuing to realtime monitoring")
                }
                Err(err) => warn!(%err, "bootstrap failed"),
            }
        })
    };

    // Realtime ingest: transport stream -> processor -> queue.
    let ingest_handle = {
        let mut rx = transport.subscribe().await.map_err(|e| {
            anyhow::anyhow!("transport subscription failed: {e}")
        })?;
        let processor = processor.clone();
        let queue = queue.clone();
        let min_len = config.processor.min_message_length;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event.text.len() < min_len {
                    continue;
                }
                let processed = processor.process(event);
                match queue.push(processed).await {
                    Ok(()) => {}
                    Err(PipelineError::Cancelled) => break,
                    Err(err) => warn!(%err, "enqueue failed"),
                }
            }
        })
    };

    lifecycle.mark_running();

    {
        let shutdown = shutdown_handle;
        lifecycle.register_cleanup("bootstrap", move || {
            Box::pin(async move {
                bootstrap_handle.abort();
                Ok(())
            })
        });
        lifecycle.register_cleanup("ingest", move || {
            Box::pin(async move {
                let _ = tokio::time::timeout(Duration::from_secs(5), ingest_handle).await;
                Ok(())
            })
        });
        lifecycle.register_cleanup("consumer-drain", move || {
            Box::pin(async move {
                match tokio::time::timeout(Duration::from_secs(30), consumer_handle).await {
                    Ok(Ok(Ok(()))) => Ok(()),
                    Ok(Ok(Err(err))) => anyhow::bail!("consumer exited with error: {err}"),
                    Ok(Err(join_err)) => anyhow::bail!("consumer panicked: {join_err}"),
                    Err(_) => anyhow::bail!("consumer did not drain in time"),
                }
            })
        });
        lifecycle.register_cleanup("updater", move || {
            Box::pin(async move {
                let _ = tokio::time::timeout(Duration::from_secs(5), updater_handle).await;
                Ok(())
            })
        });

        // --- run until a stop signal ---------------------------------------
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, shutting down");
            }
            reason = fatal_rx.recv() => {
                error!(reason = reason.as_deref().unwrap_or("unknown"), "fatal pipeline event");
            }
        }

        shutdown.trigger();
    }
    lifecycle.shutdown().await;
    info!("callwatch stopped");
    Ok(())
}
