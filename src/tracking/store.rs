//! Two-file outcome store: active signals in `performance/tracking.json`,
//! archived ones appended to `completed_history.json`.
//!
//! One mutex guards both maps, which serializes every outcome mutation and
//! makes the no-address-in-both-stores invariant atomic with the move.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::models::{SignalOutcome, SignalStatus};

struct StoreInner {
    /// key (channel:address) -> in-progress outcome.
    active: HashMap<String, SignalOutcome>,
    /// Append-only archive, completion order.
    completed: Vec<SignalOutcome>,
}

pub struct TrackingStore {
    active_path: PathBuf,
    completed_path: PathBuf,
    inner: Mutex<StoreInner>,
}

impl TrackingStore {
    pub fn load(data_root: &Path) -> anyhow::Result<Self> {
        let active_path = data_root.join("performance").join("tracking.json");
        let completed_path = data_root.join("completed_history.json");

        let active: HashMap<String, SignalOutcome> =
            crate::fsutil::load_json_or(&active_path, HashMap::new)?;
        let completed: Vec<SignalOutcome> =
            crate::fsutil::load_json_or(&completed_path, Vec::new)?;

        info!(
            active = active.len(),
            completed = completed.len(),
            "tracking store loaded"
        );
        Ok(Self {
            active_path,
            completed_path,
            inner: Mutex::new(StoreInner { active, completed }),
        })
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn get_active(&self, channel_id: &str, address: &str) -> Option<SignalOutcome> {
        let key = SignalOutcome::key(channel_id, address);
        self.inner.lock().active.get(&key).cloned()
    }

    pub fn active_snapshot(&self) -> Vec<SignalOutcome> {
        self.inner.lock().active.values().cloned().collect()
    }

    pub fn completed_snapshot(&self) -> Vec<SignalOutcome> {
        self.inner.lock().completed.clone()
    }

    /// Archived ordinals for a (channel, address) pair, ascending.
    pub fn history_ordinals(&self, channel_id: &str, address: &str) -> Vec<u32> {
        let inner = self.inner.lock();
        let mut ordinals: Vec<u32> = inner
            .completed
            .iter()
            .filter(|o| {
                o.channel_id == channel_id && o.address.eq_ignore_ascii_case(address)
            })
            .map(|o| o.signal_ordinal)
            .collect();
        ordinals.sort_unstable();
        ordinals
    }

    /// Insert a new active outcome unless the pair is already tracked.
    /// Returns false when an active signal blocked the insert.
    pub fn insert_active_if_absent(&self, outcome: SignalOutcome) -> anyhow::Result<bool> {
        let key = SignalOutcome::key(&outcome.channel_id, &outcome.address);
        {
            let mut inner = self.inner.lock();
            if inner.active.contains_key(&key) {
                return Ok(false);
            }
            inner.active.insert(key, outcome);
        }
        self.persist_active()?;
        Ok(true)
    }

    /// Mutate one active outcome in place. Returns the updated copy.
    pub fn update_active<F>(
        &self,
        channel_id: &str,
        address: &str,
        mutate: F,
    ) -> anyhow::Result<Option<SignalOutcome>>
    where
        F: FnOnce(&mut SignalOutcome),
    {
        let key = SignalOutcome::key(channel_id, address);
        let updated = {
            let mut inner = self.inner.lock();
            match inner.active.get_mut(&key) {
                Some(outcome) => {
                    mutate(outcome);
                    Some(outcome.clone())
                }
                None => None,
            }
        };
        if updated.is_some() {
            self.persist_active()?;
        }
        Ok(updated)
    }

    /// Move one outcome from active to completed atomically.
    pub fn archive(&self, channel_id: &str, address: &str) -> anyhow::Result<Option<SignalOutcome>> {
        let key = SignalOutcome::key(channel_id, address);
        let archived = {
            let mut inner = self.inner.lock();
            match inner.active.remove(&key) {
                Some(outcome) => {
                    inner.completed.push(outcome.clone());
                    Some(outcome)
                }
                None => None,
            }
        };
        if archived.is_some() {
            self.persist_active()?;
            self.persist_completed()?;
        }
        Ok(archived)
    }

    /// Record a terminal outcome that never entered tracking (entry price
    /// unknown). It lands in the archive so the attempt is not forgotten,
    /// but reputation only reads completed-status rows.
    pub fn record_terminal(&self, outcome: SignalOutcome) -> anyhow::Result<()> {
        debug_assert_ne!(outcome.status, SignalStatus::InProgress);
        {
            let mut inner = self.inner.lock();
            inner.completed.push(outcome);
        }
        self.persist_completed()
    }

    fn persist_active(&self) -> anyhow::Result<()> {
        let snapshot = self.inner.lock().active.clone();
        crate::fsutil::save_json_pretty(&self.active_path, &snapshot)
    }

    fn persist_completed(&self) -> anyhow::Result<()> {
        let snapshot = self.inner.lock().completed.clone();
        crate::fsutil::save_json_pretty(&self.completed_path, &snapshot)
    }
}
