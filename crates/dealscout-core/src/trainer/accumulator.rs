//! Running totals folded from the feedback log

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::TrainerConfig;
use crate::error::{Error, Result};
use crate::feedback::{FeedbackEvent, FeedbackRecord};
use crate::weights::WeightSet;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ModelStats {
    pub successes: u64,
    pub total: u64,
}

impl ModelStats {
    fn record(&mut self, success: bool) {
        self.total += 1;
        if success {
            self.successes += 1;
        }
    }

    fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.successes as f64 / self.total as f64
    }
}

/// Everything the trainer has learned from the log so far
///
/// Score features and model stats are kept for the lifetime of the trainer.
/// Labels are consumed by each successful publish so the same outcome never
/// moves the weights twice.
#[derive(Debug, Default)]
pub(crate) struct Accumulator {
    /// Highest sequence number folded in
    pub cursor: u64,
    /// Outcomes at or below this sequence number were applied by an earlier
    /// run; `None` until loaded
    pub label_floor: Option<u64>,
    scores: HashMap<Uuid, BTreeMap<String, f64>>,
    decisions: HashMap<Uuid, String>,
    /// Latest labelled outcome per score id since the last publish
    labels: HashMap<Uuid, bool>,
    models: BTreeMap<String, ModelStats>,
}

/// Result of one weight computation
#[derive(Debug, Clone)]
pub(crate) struct WeightUpdate {
    pub weights: BTreeMap<String, f64>,
    pub deltas: BTreeMap<String, f64>,
}

impl Accumulator {
    pub fn pending_labels(&self) -> usize {
        self.labels.len()
    }

    pub fn ingest(&mut self, record: FeedbackRecord) {
        match record.event {
            FeedbackEvent::Score(score) => {
                if let Some((feature, value)) =
                    score.features().iter().find(|(_, v)| !v.is_finite())
                {
                    warn!(
                        seq = record.seq,
                        feature = %feature,
                        value,
                        "Skipping score with non-finite feature"
                    );
                    return;
                }
                self.scores.insert(score.id(), score.features().clone());
            }
            FeedbackEvent::Decision(decision) => {
                self.decisions
                    .insert(decision.id(), decision.model_id().to_string());
            }
            FeedbackEvent::Invocation(invocation) => {
                self.models
                    .entry(invocation.model_id.clone())
                    .or_default()
                    .record(invocation.succeeded());
            }
            FeedbackEvent::Outcome {
                subject_id,
                outcome,
            } => {
                let Some(label) = outcome.label() else {
                    return;
                };
                if self.scores.contains_key(&subject_id) {
                    if record.seq > self.label_floor.unwrap_or(0) {
                        self.labels.insert(subject_id, label);
                    }
                } else if let Some(model) = self.decisions.get(&subject_id) {
                    debug!(model = %model, outcome = %outcome, "Outcome attributed to routed model");
                    self.models.entry(model.clone()).or_default().record(label);
                } else {
                    warn!(
                        seq = record.seq,
                        subject = %subject_id,
                        "Skipping outcome for unknown subject"
                    );
                }
            }
        }
    }

    /// Reweight features from labelled outcomes
    ///
    /// Each feature moves by `learning_rate * (mean(closed) - mean(dead))`,
    /// is floored at zero, and the set is rescaled to the active total mass.
    pub fn compute(&self, active: &WeightSet, config: &TrainerConfig) -> Result<WeightUpdate> {
        let have = self.labels.len();
        if have < config.min_samples {
            return Err(Error::InsufficientFeedback {
                have,
                need: config.min_samples,
            });
        }

        let closed = self.mean_features(true);
        let dead = self.mean_features(false);

        let mut features: Vec<&String> = active
            .weights()
            .keys()
            .chain(closed.keys())
            .chain(dead.keys())
            .collect();
        features.sort();
        features.dedup();

        let mut deltas = BTreeMap::new();
        let mut raw = BTreeMap::new();
        for feature in features {
            let delta = closed.get(feature).copied().unwrap_or(0.0)
                - dead.get(feature).copied().unwrap_or(0.0);
            let updated = (active.weight(feature) + config.learning_rate * delta).max(0.0);
            deltas.insert(feature.clone(), delta);
            raw.insert(feature.clone(), updated);
        }

        let sum: f64 = raw.values().sum();
        if !sum.is_finite() || sum <= 0.0 {
            return Err(Error::InvalidWeightUpdate(format!(
                "updated weights sum to {}",
                sum
            )));
        }
        let mass = active.total_mass();
        let mass = if mass.is_finite() && mass > 0.0 { mass } else { 1.0 };
        let weights = raw
            .into_iter()
            .map(|(feature, w)| (feature, w * mass / sum))
            .collect();

        Ok(WeightUpdate { weights, deltas })
    }

    /// Routing bias for models with enough observations
    pub fn routing_bias(&self, config: &TrainerConfig) -> BTreeMap<String, f64> {
        self.models
            .iter()
            .filter(|(_, stats)| stats.total >= config.min_samples as u64)
            .map(|(model, stats)| {
                (
                    model.clone(),
                    config.bias_scale * (stats.success_rate() - 0.5),
                )
            })
            .collect()
    }

    /// Drop labels once they have been applied
    pub fn consume_labels(&mut self) {
        self.labels.clear();
    }

    #[cfg(test)]
    pub fn model_stats(&self, model: &str) -> Option<ModelStats> {
        self.models.get(model).copied()
    }

    fn mean_features(&self, label: bool) -> BTreeMap<String, f64> {
        let mut totals: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for (id, _) in self.labels.iter().filter(|(_, l)| **l == label) {
            let Some(features) = self.scores.get(id) else {
                continue;
            };
            for (feature, value) in features {
                let entry = totals.entry(feature.clone()).or_insert((0.0, 0));
                entry.0 += value;
                entry.1 += 1;
            }
        }
        totals
            .into_iter()
            .map(|(feature, (total, count))| (feature, total / count as f64))
            .collect()
    }
}
