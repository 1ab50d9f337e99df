//! Dead-token detection and the persistent blacklist.
//!
//! A token with no supply, no transfers, or a drained LP gets blacklisted so
//! later sightings skip every pricing call. Brand-new tokens with zero
//! transfers are protected; silence in the first week is not death.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use num_bigint::BigUint;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{Chain, DeadReason, DeadTokenEntry};

/// Supply below this many wei-equivalent units means dead at call time.
const DEAD_AT_CALL_SUPPLY: u64 = 1_000;
/// Supply below this, on an old contract exposing reserves, means a
/// drained LP.
const DEAD_LP_SUPPLY: u64 = 10_000;
/// Age guard for both the dead-LP and stale rules.
const PROTECTION_DAYS: i64 = 7;

/// On-chain facts about a token, as read by the collaborator.
#[derive(Debug, Clone, Default)]
pub struct TokenVitals {
    pub supply: Option<BigUint>,
    pub holders: Option<u64>,
    pub transfers: Option<u64>,
    pub has_reserves_accessor: bool,
    pub created_at: Option<DateTime<Utc>>,
}

/// Collaborator capable of reading supply/holders/transfers for a token.
#[async_trait]
pub trait OnChainReader: Send + Sync {
    async fn vitals(&self, address: &str, chain: Chain) -> PipelineResult<TokenVitals>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadVerdict {
    Alive,
    Dead(DeadReason),
}

/// Pure classification of vitals against the dead-token rules.
pub fn classify_vitals(vitals: &TokenVitals, now: DateTime<Utc>) -> DeadVerdict {
    let age = vitals
        .created_at
        .map(|created| now.signed_duration_since(created));

    if let Some(supply) = vitals.supply.as_ref() {
        if *supply < BigUint::from(DEAD_AT_CALL_SUPPLY) {
            return DeadVerdict::Dead(DeadReason::NoSupply);
        }
        if *supply < BigUint::from(DEAD_LP_SUPPLY)
            && vitals.has_reserves_accessor
            && age.map_or(false, |a| a >= ChronoDuration::days(PROTECTION_DAYS))
        {
            return DeadVerdict::Dead(DeadReason::DeadLp);
        }
    }

    if vitals.transfers == Some(0) {
        match age {
            Some(a) if a > ChronoDuration::days(PROTECTION_DAYS) => {
                return DeadVerdict::Dead(DeadReason::Stale);
            }
            // Too new to condemn.
            _ => return DeadVerdict::Alive,
        }
    }

    DeadVerdict::Alive
}

/// Persistent address blacklist, one owner, file-backed.
pub struct DeadTokenBlacklist {
    path: PathBuf,
    entries: RwLock<HashMap<String, DeadTokenEntry>>,
}

impl DeadTokenBlacklist {
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn contains(&self, address: &str) -> bool {
        self.entries.read().contains_key(&address.to_lowercase())
    }

    pub fn reason_for(&self, address: &str) -> Option<DeadReason> {
        self.entries
            .read()
            .get(&address.to_lowercase())
            .map(|e| e.reason)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn insert(&self, entry: DeadTokenEntry) -> anyhow::Result<()> {
        {
            let mut entries = self.entries.write();
            entries.insert(entry.address.to_lowercase(), entry);
        }
        self.persist()
    }

    fn persist(&self) -> anyhow::Result<()> {
        let snapshot = self.entries.read().clone();
        crate::fsutil::save_json_pretty(&self.path, &snapshot)
    }
}

/// Detector: consults the blacklist first, then the on-chain reader.
pub struct DeadTokenDetector {
    reader: Option<Arc<dyn OnChainReader>>,
    blacklist: Arc<DeadTokenBlacklist>,
}

impl DeadTokenDetector {
    pub fn new(
        reader: Option<Arc<dyn OnChainReader>>,
        blacklist: Arc<DeadTokenBlacklist>,
    ) -> Self {
        Self { reader, blacklist }
    }

    pub fn blacklist(&self) -> &Arc<DeadTokenBlacklist> {
        &self.blacklist
    }

    /// Classify an address. Blacklisted addresses short-circuit; newly dead
    /// ones are recorded so subsequent sightings skip pricing entirely.
    pub async fn classify(&self, address: &str, chain: Chain) -> PipelineResult<DeadVerdict> {
        if let Some(reason) = self.blacklist.reason_for(address) {
            return Ok(DeadVerdict::Dead(reason));
        }

        let Some(reader) = self.reader.as_ref() else {
            // No on-chain capability configured; assume alive.
            return Ok(DeadVerdict::Alive);
        };

        let vitals = match reader.vitals(address, chain).await {
            Ok(v) => v,
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(err) => {
                warn!(address, %err, "on-chain vitals unavailable, assuming alive");
                return Ok(DeadVerdict::Alive);
            }
        };

        let verdict = classify_vitals(&vitals, Utc::now());
        if let DeadVerdict::Dead(reason) = verdict {
            info!(address, reason = reason.as_str(), "token blacklisted as dead");
            let entry = DeadTokenEntry {
                address: address.to_string(),
                chain,
                reason,
                supply: vitals.supply.map(|s| s.to_string()),
                holders: vitals.holders,
                transfers: vitals.transfers,
                detected_at: Utc::now(),
            };
            self.blacklist
                .insert(entry)
                .map_err(|e| PipelineError::Fatal(format!("blacklist persist failed: {e}")))?;
        }
        Ok(verdict)
    }
}
