//! Multi-provider price engine: ordered failover with caching, per-provider
//! rate limiting, retries, and circuit breaking.
//!
//! Absence is not an error: when every provider comes back empty the engine
//! returns `None`. The only error that escapes is `Cancelled`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{Chain, PriceSnapshot};
use crate::pricing::cache::TtlCache;
use crate::pricing::rate_limiter::RateLimiterRegistry;
use crate::pricing::retry::{retry_with_backoff, CircuitBreaker, RetryPolicy};
use crate::providers::PriceProvider;
use crate::shutdown::ShutdownToken;

/// Default TTL for current-price memoization.
const CURRENT_PRICE_TTL: Duration = Duration::from_secs(300);
const CACHE_CAPACITY: usize = 4096;
/// Burst allowance per provider bucket.
const BUCKET_BURST: u32 = 5;

pub struct PriceEngine {
    /// Failover order for Solana lookups.
    solana_order: Vec<Arc<dyn PriceProvider>>,
    /// Failover order for EVM and unknown chains.
    general_order: Vec<Arc<dyn PriceProvider>>,
    limiter: RateLimiterRegistry,
    breakers: HashMap<String, CircuitBreaker>,
    retry: RetryPolicy,
    cache: TtlCache<(Chain, String), PriceSnapshot>,
}

impl PriceEngine {
    /// `solana_specialist` leads the Solana order; `general` providers run
    /// in the given order for every chain.
    pub fn new(
        solana_specialist: Arc<dyn PriceProvider>,
        general: Vec<Arc<dyn PriceProvider>>,
        shutdown: ShutdownToken,
    ) -> Self {
        let mut solana_order: Vec<Arc<dyn PriceProvider>> = vec![solana_specialist];
        solana_order.extend(general.iter().cloned());

        let mut limiter = RateLimiterRegistry::new();
        let mut breakers = HashMap::new();
        for provider in &solana_order {
            limiter.register(
                provider.tag(),
                provider.rate_limit_per_minute(),
                BUCKET_BURST,
                shutdown.clone(),
            );
            breakers.insert(
                provider.tag().to_string(),
                CircuitBreaker::new(provider.tag()),
            );
        }

        Self {
            solana_order,
            general_order: general,
            limiter,
            breakers,
            retry: RetryPolicy::default(),
            cache: TtlCache::new(CACHE_CAPACITY, Some(CURRENT_PRICE_TTL)),
        }
    }

    fn order(&self, chain: Chain) -> &[Arc<dyn PriceProvider>] {
        match chain {
            Chain::Solana => &self.solana_order,
            _ => &self.general_order,
        }
    }

    /// Resolve the current price for an address, or `None` when no provider
    /// knows it. Errors only on shutdown.
    pub async fn get_price(
        &self,
        address: &str,
        chain: Chain,
    ) -> PipelineResult<Option<PriceSnapshot>> {
        let key = (chain, address.to_lowercase());
        if let Some(hit) = self.cache.get(&key) {
            metrics::counter!("callwatch_price_cache_hits", 1);
            return Ok(Some(hit));
        }
        metrics::counter!("callwatch_price_cache_misses", 1);

        for provider in self.order(chain) {
            let tag = provider.tag();
            self.limiter.acquire(tag).await?;

            let breaker = self
                .breakers
                .get(tag)
                .ok_or_else(|| PipelineError::Fatal(format!("no breaker for {tag}")))?;

            let attempt = retry_with_backoff(&self.retry, breaker, || {
                provider.current_price(address, chain)
            })
            .await;

            match attempt {
                Ok(snapshot) => {
                    if snapshot.price_usd <= 0.0 {
                        debug!(provider = tag, address, "non-positive price treated as empty");
                        continue;
                    }
                    metrics::counter!("callwatch_price_resolved", 1);
                    self.cache.insert(key, snapshot.clone());
                    return Ok(Some(snapshot));
                }
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(PipelineError::ProviderEmpty) => {
                    debug!(provider = tag, address, "provider empty, failing over");
                }
                Err(err) => {
                    warn!(provider = tag, address, %err, "provider failed, failing over");
                }
            }
        }

        metrics::counter!("callwatch_price_unresolved", 1);
        Ok(None)
    }

    /// Expose the cache for the periodic purge task.
    pub fn purge_cache(&self) {
        self.cache.purge_expired();
    }
}
