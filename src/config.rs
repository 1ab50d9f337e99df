//! Process-level configuration, loaded once at startup.
//!
//! Every tunable lands in one typed struct; components consume narrow views
//! of it (a sub-struct or individual fields), never the whole thing.

use std::path::PathBuf;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

/// Tunables for the message processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Engagement normalization ceiling (IC_max).
    pub ic_max: f64,
    pub confidence_threshold: f64,
    pub min_message_length: usize,
    /// Tickers that are also common English words; these require a `$`/`#`
    /// prefix to count as a mention.
    pub ambiguous_tickers: Vec<String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            ic_max: 1000.0,
            confidence_threshold: 0.5,
            min_message_length: 5,
            ambiguous_tickers: ["ONE", "NEAR", "JUST", "TIME", "PEOPLE", "MOON", "APE"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Timeouts wrapped around individual external calls. A timeout is a normal
/// failure with a documented fallback, not a cancellation.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Historical entry-price fetch for messages older than 1 hour.
    pub entry_price: Duration,
    /// Opportunistic forward-ATH window fetch.
    pub ath_window: Duration,
    /// Per-request HTTP timeout on provider clients.
    pub http_request: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            entry_price: Duration::from_secs(30),
            ath_window: Duration::from_secs(20),
            http_request: Duration::from_secs(10),
        }
    }
}

/// Outcome tracking windows.
#[derive(Debug, Clone)]
pub struct TrackingConfig {
    /// Live tracking window for open outcomes.
    pub window_days: i64,
    /// Forward-ATH window used for historical backfill.
    pub forward_ath_days: i64,
    /// Interval between live price sweeps over the active store.
    pub update_interval: Duration,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            window_days: 7,
            forward_ath_days: 30,
            update_interval: Duration::from_secs(7200),
        }
    }
}

/// Mirror-sheet sink settings. Failures on this path never fail the primary
/// file write.
#[derive(Debug, Clone)]
pub struct SheetConfig {
    pub enabled: bool,
    pub spreadsheet_id: Option<String>,
    pub api_key: Option<String>,
    pub endpoint: String,
}

impl Default for SheetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            spreadsheet_id: None,
            api_key: None,
            endpoint: "https://sheets.googleapis.com/v4/spreadsheets".to_string(),
        }
    }
}

/// Per-provider API credentials and endpoint overrides.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub coingecko_api_key: Option<String>,
    pub cryptocompare_api_key: Option<String>,
    pub jupiter_base_url: Option<String>,
    pub coingecko_base_url: Option<String>,
    pub geckoterminal_base_url: Option<String>,
    pub dexscreener_base_url: Option<String>,
    pub cryptocompare_base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Root for the daily CSV table directories.
    pub output_root: PathBuf,
    /// Root for the JSON stores (tracking, history, blacklist, cache).
    pub data_root: PathBuf,
    /// Channels monitored in realtime and scraped during bootstrap.
    pub channels: Vec<String>,
    /// Telegram bot token for the thin transport client.
    pub telegram_bot_token: Option<String>,
    /// Messages fetched per channel during historical bootstrap.
    pub historical_scrape_limit: usize,
    /// Bounded capacity of the processed-message queue.
    pub queue_capacity: usize,
    /// Parallelism cap for per-address work within one message.
    pub per_message_parallelism: usize,
    pub processor: ProcessorConfig,
    pub timeouts: TimeoutConfig,
    pub tracking: TrackingConfig,
    pub sheet: SheetConfig,
    pub providers: ProviderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("./output"),
            data_root: PathBuf::from("./data"),
            channels: Vec::new(),
            telegram_bot_token: None,
            historical_scrape_limit: 100,
            queue_capacity: 1000,
            per_message_parallelism: 5,
            processor: ProcessorConfig::default(),
            timeouts: TimeoutConfig::default(),
            tracking: TrackingConfig::default(),
            sheet: SheetConfig::default(),
            providers: ProviderConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Self::default();

        if let Ok(root) = std::env::var("CALLWATCH_OUTPUT_ROOT") {
            config.output_root = PathBuf::from(root);
        }
        if let Ok(root) = std::env::var("CALLWATCH_DATA_ROOT") {
            config.data_root = PathBuf::from(root);
        }

        config.channels = std::env::var("CALLWATCH_CHANNELS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        config.telegram_bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok();

        config.historical_scrape_limit = env_or("CALLWATCH_SCRAPE_LIMIT", 100usize);
        config.queue_capacity = env_or("CALLWATCH_QUEUE_CAPACITY", 1000usize);
        config.per_message_parallelism = env_or("CALLWATCH_PARALLELISM", 5usize).max(1);

        config.processor.ic_max = env_or("CALLWATCH_IC_MAX", 1000.0f64).max(1.0);
        config.processor.confidence_threshold =
            env_or("CALLWATCH_CONFIDENCE_THRESHOLD", 0.5f64).clamp(0.0, 1.0);
        config.processor.min_message_length = env_or("CALLWATCH_MIN_MESSAGE_LEN", 5usize);

        config.timeouts.entry_price =
            Duration::from_secs(env_or("CALLWATCH_ENTRY_PRICE_TIMEOUT_SECS", 30u64));
        config.timeouts.ath_window =
            Duration::from_secs(env_or("CALLWATCH_ATH_TIMEOUT_SECS", 20u64));
        config.timeouts.http_request =
            Duration::from_secs(env_or("CALLWATCH_HTTP_TIMEOUT_SECS", 10u64));

        config.tracking.window_days = env_or("CALLWATCH_TRACKING_WINDOW_DAYS", 7i64).max(1);
        config.tracking.forward_ath_days = env_or("CALLWATCH_FORWARD_ATH_DAYS", 30i64).max(1);
        config.tracking.update_interval =
            Duration::from_secs(env_or("CALLWATCH_UPDATE_INTERVAL_SECS", 7200u64).max(60));

        config.sheet.enabled = env_flag("CALLWATCH_SHEET_ENABLED", false);
        config.sheet.spreadsheet_id = std::env::var("CALLWATCH_SHEET_ID").ok();
        config.sheet.api_key = std::env::var("CALLWATCH_SHEET_API_KEY").ok();

        config.providers.coingecko_api_key = std::env::var("COINGECKO_API_KEY").ok();
        config.providers.cryptocompare_api_key = std::env::var("CRYPTOCOMPARE_API_KEY").ok();

        Ok(config)
    }
}
