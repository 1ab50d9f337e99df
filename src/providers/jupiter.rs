//! Jupiter price API client (Solana specialist).
//!
//! First in the Solana provider order: best coverage for fresh mints that
//! the general aggregators have not indexed yet.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{check_status, PriceProvider};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Chain, PriceSnapshot};

const DEFAULT_BASE_URL: &str = "https://api.jup.ag/price/v2";

pub struct JupiterPriceApi {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    #[serde(default)]
    data: HashMap<String, Option<PriceEntry>>,
}

#[derive(Debug, Deserialize)]
struct PriceEntry {
    /// Jupiter ships the price as a decimal string.
    price: String,
}

impl JupiterPriceApi {
    pub fn new(base_url: Option<String>, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent("callwatch/0.1")
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }
}

#[async_trait]
impl PriceProvider for JupiterPriceApi {
    fn tag(&self) -> &'static str {
        "jupiter"
    }

    fn rate_limit_per_minute(&self) -> u32 {
        600
    }

    async fn current_price(&self, address: &str, chain: Chain) -> PipelineResult<PriceSnapshot> {
        if chain != Chain::Solana {
            return Err(PipelineError::ProviderEmpty);
        }

        let response = self
            .client
            .get(&self.base_url)
            .query(&[("ids", address)])
            .send()
            .await
            .map_err(PipelineError::from_http)?;
        check_status(&response)?;

        let body: PriceResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::TransientNetwork(format!("bad jupiter body: {e}")))?;

        let entry = body
            .data
            .get(address)
            .and_then(|e| e.as_ref())
            .ok_or(PipelineError::ProviderEmpty)?;
        let price: f64 = entry.price.parse().map_err(|_| PipelineError::ProviderEmpty)?;
        if price <= 0.0 {
            return Err(PipelineError::ProviderEmpty);
        }

        debug!(address, price, "jupiter price");
        Ok(PriceSnapshot::new(price, self.tag()))
    }
}
