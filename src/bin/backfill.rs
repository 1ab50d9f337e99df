//! Backfill CLI: scrape channel history through the pipeline once and exit.
//!
//! Exit codes: 0 on completion, 1 on unrecoverable error, 130 on SIGINT.

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use callwatch_backend::bootstrap::{HistoricalBootstrap, ScrapeProgressStore};
use callwatch_backend::config::Config;
use callwatch_backend::error::PipelineError;
use callwatch_backend::output::TableWriter;
use callwatch_backend::pricing::{HistoricalPriceService, PriceEngine};
use callwatch_backend::providers::{
    CoinGeckoApi, CryptoCompareApi, DexScreenerApi, GeckoTerminalApi, JupiterPriceApi,
    PriceProvider,
};
use callwatch_backend::reputation::{ReputationEngine, ReputationWeights};
use callwatch_backend::sentiment::LexiconSentiment;
use callwatch_backend::shutdown::shutdown_pair;
use callwatch_backend::signals::{MessageProcessor, SignalCoordinator};
use callwatch_backend::tokens::{DeadTokenBlacklist, DeadTokenDetector, TokenRegistry};
use callwatch_backend::tracking::{OutcomeTracker, OutcomeUpdater, TrackingStore};
use callwatch_backend::transport::{ChatTransport, TelegramBotApi};

const EXIT_SIGINT: u8 = 130;

#[derive(Debug, Parser)]
#[command(name = "callwatch-backfill", about = "Scrape channel history into the pipeline")]
struct Args {
    /// Channel id to scrape; repeat for several. Defaults to the
    /// configured channel list.
    #[arg(long = "channel")]
    channels: Vec<String>,

    /// Messages to fetch per channel.
    #[arg(long, env = "CALLWATCH_SCRAPE_LIMIT")]
    limit: Option<usize>,

    /// Re-scrape channels already marked complete.
    #[arg(long)]
    backfill: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("callwatch=info")),
        )
        .init();

    match run(Args::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("backfill failed: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(limit) = args.limit {
        config.historical_scrape_limit = limit;
    }
    let channels = if args.channels.is_empty() {
        config.channels.clone()
    } else {
        args.channels.clone()
    };
    if channels.is_empty() {
        anyhow::bail!("no channels given; pass --channel or set CALLWATCH_CHANNELS");
    }

    let (shutdown_handle, shutdown) = shutdown_pair();

    let registry = Arc::new(TokenRegistry::with_defaults());
    let blacklist = Arc::new(DeadTokenBlacklist::load(
        config.data_root.join("dead_tokens_blacklist.json"),
    )?);
    let detector = Arc::new(DeadTokenDetector::new(None, blacklist));

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
    OutcomeUpdater::resync_checkpoints(&store)?;
    let tracker = Arc::new(OutcomeTracker::new(
        store,
        config.tracking.window_days,
    ));
    let writer = Arc::new(TableWriter::new(config.output_root.clone(), None));
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
        engine,
        historical,
        tracker,
        writer,
        reputation,
        config.timeouts.clone(),
        config.tracking.forward_ath_days,
        config.per_message_parallelism,
    );

    let token = config
        .telegram_bot_token
        .clone()
        .context("TELEGRAM_BOT_TOKEN is required")?;
    let transport: Arc<dyn ChatTransport> =
        Arc::new(TelegramBotApi::new(token, None, shutdown.clone())?);

    let progress_path = config.data_root.join("scraped_channels.json");
    if args.backfill && progress_path.exists() {
        info!("--backfill: clearing scrape checkpoints for a fresh pass");
        std::fs::remove_file(&progress_path)?;
    }
    let progress = Arc::new(ScrapeProgressStore::load(progress_path)?);

    let bootstrap = HistoricalBootstrap::new(
        transport,
        processor,
        coordinator,
        progress,
        config.historical_scrape_limit,
        shutdown,
    );

    let run = bootstrap.run(&channels);
    tokio::pin!(run);
    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("SIGINT received, checkpointing and exiting");
            shutdown_handle.trigger();
            // Let the scrape unwind cooperatively so the checkpoint lands.
            run.await
        }
    };

    match result {
        Ok(summary) => {
            info!(
                scraped = summary.scraped_channels,
                messages = summary.messages_processed,
                "backfill complete"
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(PipelineError::Cancelled) => Ok(ExitCode::from(EXIT_SIGINT)),
        Err(err) => Err(err.into()),
    }
}
