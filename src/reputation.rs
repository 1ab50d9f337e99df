//! Per-channel reputation aggregation.
//!
//! A pure function of the completed store: recomputing from the same
//! archive always yields the same standings. Dead-token outcomes count as
//! losers at their category multiplier; they are never excluded. The
//! composite score is monotone non-decreasing in win-rate and average
//! multiplier; the exact weights are tunable configuration, not contract.

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

use crate::models::{ChannelReputation, SignalOutcome, SignalStatus};

#[derive(Debug, Clone)]
pub struct ReputationWeights {
    pub win_rate: f64,
    pub avg_multiplier: f64,
    pub activity: f64,
    /// Signal count at which the activity component saturates.
    pub activity_saturation: u64,
}

impl Default for ReputationWeights {
    fn default() -> Self {
        Self {
            win_rate: 0.5,
            avg_multiplier: 0.3,
            activity: 0.2,
            activity_saturation: 20,
        }
    }
}

pub struct ReputationEngine {
    weights: ReputationWeights,
    /// Derived-data snapshot for operators; never read back.
    snapshot_path: Option<PathBuf>,
}

impl ReputationEngine {
    pub fn new(weights: ReputationWeights, snapshot_path: Option<PathBuf>) -> Self {
        Self {
            weights,
            snapshot_path,
        }
    }

    /// Effective final multiplier of one completed outcome.
    fn final_multiplier(outcome: &SignalOutcome) -> f64 {
        match outcome.dead {
            Some(reason) => reason.completion_multiplier(),
            None => outcome.current_multiplier,
        }
    }

    /// Effective ATH multiplier: a dead token's upside is its category
    /// multiplier, not whatever it briefly touched.
    fn ath_multiplier(outcome: &SignalOutcome) -> f64 {
        match outcome.dead {
            Some(reason) => reason.completion_multiplier(),
            None => outcome.ath_multiplier,
        }
    }

    /// Aggregate the completed store into per-channel standings.
    pub fn recompute(&self, completed: &[SignalOutcome]) -> HashMap<String, ChannelReputation> {
        let mut by_channel: HashMap<String, Vec<&SignalOutcome>> = HashMap::new();
        for outcome in completed
            .iter()
            .filter(|o| o.status == SignalStatus::Completed)
        {
            by_channel
                .entry(outcome.channel_id.clone())
                .or_default()
                .push(outcome);
        }

        let mut standings = HashMap::new();
        for (channel_id, outcomes) in by_channel {
            let total = outcomes.len() as u64;
            let mut winners = 0u64;
            let mut losers = 0u64;
            let mut neutrals = 0u64;
            let mut dead = 0u64;
            let mut ath_sum = 0.0;
            let mut final_sum = 0.0;
            let mut ath_hours_sum = 0.0;

            for outcome in &outcomes {
                let final_multiplier = Self::final_multiplier(outcome);
                ath_sum += Self::ath_multiplier(outcome);
                final_sum += final_multiplier;

                if outcome.dead.is_some() {
                    dead += 1;
                    losers += 1;
                } else if outcome.is_winner {
                    winners += 1;
                    ath_hours_sum += outcome
                        .ath_time
                        .signed_duration_since(outcome.entry_time)
                        .num_seconds() as f64
                        / 3600.0;
                } else if final_multiplier < 1.0 {
                    losers += 1;
                } else {
                    neutrals += 1;
                }
            }

            let avg_ath = ath_sum / total as f64;
            let avg_final = final_sum / total as f64;
            let win_rate = winners as f64 / total as f64;
            let mean_time_to_ath_hours = if winners > 0 {
                ath_hours_sum / winners as f64
            } else {
                0.0
            };

            let channel_name = outcomes
                .last()
                .map(|o| o.channel_name.clone())
                .unwrap_or_default();

            standings.insert(
                channel_id.clone(),
                ChannelReputation {
                    channel_id,
                    channel_name,
                    total_signals: total,
                    winners,
                    losers,
                    neutrals,
                    dead,
                    avg_ath_multiplier: avg_ath,
                    avg_final_multiplier: avg_final,
                    mean_time_to_ath_hours,
                    win_rate,
                    reputation_score: self.score(win_rate, avg_ath, total),
                    updated_at: Utc::now(),
                },
            );
        }
        standings
    }

    /// Composite score in [0, 1]. Each component is monotone
    /// non-decreasing, so the sum is too.
    fn score(&self, win_rate: f64, avg_ath_multiplier: f64, total: u64) -> f64 {
        // Multiplier squashed to [0, 1) while preserving order.
        let multiplier_component = avg_ath_multiplier.max(0.0)
            / (avg_ath_multiplier.max(0.0) + 1.0);
        let activity_component =
            (total as f64 / self.weights.activity_saturation.max(1) as f64).min(1.0);
        let score = self.weights.win_rate * win_rate
            + self.weights.avg_multiplier * multiplier_component
            + self.weights.activity * activity_component;
        score.clamp(0.0, 1.0)
    }

    /// Recompute and overwrite the snapshot file wholesale.
    pub fn recompute_and_persist(
        &self,
        completed: &[SignalOutcome],
    ) -> anyhow::Result<HashMap<String, ChannelReputation>> {
        let standings = self.recompute(completed);
        if let Some(path) = self.snapshot_path.as_ref() {
            crate::fsutil::save_json_pretty(path, &standings)?;
            info!(channels = standings.len(), "reputation snapshot written");
        }
        Ok(standings)
    }
}
