//! Versioned scoring weights and routing preferences
//!
//! A [`WeightSet`] bundles the scoring weights and the learned routing bias
//! under one epoch so readers never see weights from one version mixed with
//! bias from another. The [`WeightStore`] keeps every published version and a
//! single active pointer.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// How a weight set came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightOrigin {
    /// Loaded from configuration
    Baseline,
    /// Produced by the trainer
    Trained,
}

impl std::fmt::Display for WeightOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Baseline => write!(f, "baseline"),
            Self::Trained => write!(f, "trained"),
        }
    }
}

/// One immutable version of scoring weights and routing bias
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSet {
    epoch: u64,
    weights: BTreeMap<String, f64>,
    routing_bias: BTreeMap<String, f64>,
    origin: WeightOrigin,
    created_at: DateTime<Utc>,
}

impl WeightSet {
    /// A baseline set at epoch 0 with no routing bias
    pub fn baseline<I, K>(weights: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        Self {
            epoch: 0,
            weights: weights.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            routing_bias: BTreeMap::new(),
            origin: WeightOrigin::Baseline,
            created_at: Utc::now(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn origin(&self) -> WeightOrigin {
        self.origin
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Scoring weights by feature name
    pub fn weights(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }

    /// Weight for a feature, 0 when absent
    pub fn weight(&self, feature: &str) -> f64 {
        self.weights.get(feature).copied().unwrap_or(0.0)
    }

    /// Learned routing bias by model id
    pub fn routing_bias(&self) -> &BTreeMap<String, f64> {
        &self.routing_bias
    }

    /// Routing bias for a model, 0 when absent
    pub fn bias(&self, model_id: &str) -> f64 {
        self.routing_bias.get(model_id).copied().unwrap_or(0.0)
    }

    /// Sum of all weights
    pub fn total_mass(&self) -> f64 {
        self.weights.values().sum()
    }
}

/// Check a candidate update before it can be published
pub(crate) fn validate_update(
    weights: &BTreeMap<String, f64>,
    routing_bias: &BTreeMap<String, f64>,
) -> Result<()> {
    if let Some((feature, value)) = weights
        .iter()
        .find(|(_, v)| !v.is_finite() || **v < 0.0)
    {
        return Err(Error::InvalidWeightUpdate(format!(
            "weight for '{}' is {}",
            feature, value
        )));
    }
    if !weights.values().any(|v| *v > 0.0) {
        return Err(Error::InvalidWeightUpdate(
            "at least one weight must be positive".to_string(),
        ));
    }
    if let Some((model, value)) = routing_bias.iter().find(|(_, v)| !v.is_finite()) {
        return Err(Error::InvalidWeightUpdate(format!(
            "routing bias for '{}' is {}",
            model, value
        )));
    }
    Ok(())
}

#[derive(Debug)]
struct Versions {
    /// Every version ever published, ordered by epoch
    history: Vec<Arc<WeightSet>>,
    active: Arc<WeightSet>,
}

fn next_epoch(versions: &Versions) -> u64 {
    versions.history.last().map(|w| w.epoch + 1).unwrap_or(1)
}

/// Arena of weight set versions with one active pointer
///
/// Versions are never mutated after publication. Readers clone the active
/// `Arc` and keep a consistent view for as long as they hold it.
#[derive(Debug)]
pub struct WeightStore {
    inner: RwLock<Versions>,
}

impl WeightStore {
    /// Create a store whose only version is the baseline
    pub fn new(baseline: WeightSet) -> Self {
        let baseline = Arc::new(baseline);
        Self {
            inner: RwLock::new(Versions {
                history: vec![baseline.clone()],
                active: baseline,
            }),
        }
    }

    /// Restore a store from archived versions
    ///
    /// `active_epoch` of `None` activates the newest version.
    pub fn restore(mut history: Vec<WeightSet>, active_epoch: Option<u64>) -> Result<Self> {
        if history.is_empty() {
            return Err(Error::InvalidWeightUpdate(
                "cannot restore an empty weight history".to_string(),
            ));
        }
        history.sort_by_key(|w| w.epoch);
        history.dedup_by_key(|w| w.epoch);
        let history: Vec<Arc<WeightSet>> = history.into_iter().map(Arc::new).collect();

        let active = match active_epoch {
            Some(epoch) => history
                .iter()
                .find(|w| w.epoch == epoch)
                .cloned()
                .ok_or(Error::WeightVersionNotFound(epoch))?,
            None => history[history.len() - 1].clone(),
        };

        Ok(Self {
            inner: RwLock::new(Versions { history, active }),
        })
    }

    /// The currently active version
    pub fn active(&self) -> Arc<WeightSet> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .clone()
    }

    /// The newest epoch ever published
    pub fn latest_epoch(&self) -> u64 {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.history.last().map(|w| w.epoch).unwrap_or(0)
    }

    /// Publish a new version and make it active
    ///
    /// The new epoch is one past the newest epoch ever published, so the
    /// counter never decreases even after a rollback.
    pub fn publish(
        &self,
        weights: BTreeMap<String, f64>,
        routing_bias: BTreeMap<String, f64>,
    ) -> Result<Arc<WeightSet>> {
        let pending = self.prepare(weights, routing_bias)?;
        self.commit(pending)
    }

    /// Validate an update and stamp it with the next epoch without serving it
    ///
    /// The returned set becomes visible to readers only through [`commit`],
    /// which lets callers persist it first.
    ///
    /// [`commit`]: WeightStore::commit
    pub fn prepare(
        &self,
        weights: BTreeMap<String, f64>,
        routing_bias: BTreeMap<String, f64>,
    ) -> Result<WeightSet> {
        validate_update(&weights, &routing_bias)?;
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(WeightSet {
            epoch: next_epoch(&inner),
            weights,
            routing_bias,
            origin: WeightOrigin::Trained,
            created_at: Utc::now(),
        })
    }

    /// Make a prepared set the active version
    ///
    /// Fails without touching the store when another version took the
    /// prepared epoch in the meantime.
    pub fn commit(&self, pending: WeightSet) -> Result<Arc<WeightSet>> {
        validate_update(&pending.weights, &pending.routing_bias)?;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let expected = next_epoch(&inner);
        if pending.epoch != expected {
            return Err(Error::InvalidWeightUpdate(format!(
                "prepared epoch {} is stale, next epoch is {}",
                pending.epoch, expected
            )));
        }

        let published = Arc::new(pending);
        inner.history.push(published.clone());
        inner.active = published.clone();

        info!(epoch = published.epoch, "Published weight set");
        Ok(published)
    }

    /// Point the active pointer at an older version
    pub fn rollback(&self, epoch: u64) -> Result<Arc<WeightSet>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let target = inner
            .history
            .iter()
            .find(|w| w.epoch == epoch)
            .cloned()
            .ok_or(Error::WeightVersionNotFound(epoch))?;
        let from = inner.active.epoch;
        inner.active = target.clone();

        warn!(from, to = epoch, "Rolled back active weight set");
        Ok(target)
    }

    /// A specific version
    pub fn get(&self, epoch: u64) -> Option<Arc<WeightSet>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.history.iter().find(|w| w.epoch == epoch).cloned()
    }

    /// Every version, oldest first
    pub fn history(&self) -> Vec<Arc<WeightSet>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_publish_increments_epoch() {
        let store = WeightStore::new(WeightSet::baseline([("comps", 0.5), ("distress", 0.5)]));
        assert_eq!(store.active().epoch(), 0);

        let first = store.publish(weights(&[("comps", 0.6)]), BTreeMap::new()).unwrap();
        let second = store.publish(weights(&[("comps", 0.7)]), BTreeMap::new()).unwrap();

        assert_eq!(first.epoch(), 1);
        assert_eq!(second.epoch(), 2);
        assert_eq!(store.active().epoch(), 2);
        assert_eq!(store.history().len(), 3);
        assert_eq!(store.active().origin(), WeightOrigin::Trained);
    }

    #[test]
    fn test_invalid_update_leaves_active_untouched() {
        let store = WeightStore::new(WeightSet::baseline([("comps", 1.0)]));

        let negative = store.publish(weights(&[("comps", -0.1)]), BTreeMap::new());
        assert!(matches!(negative, Err(Error::InvalidWeightUpdate(_))));

        let zero = store.publish(weights(&[("comps", 0.0)]), BTreeMap::new());
        assert!(matches!(zero, Err(Error::InvalidWeightUpdate(_))));

        let nan_bias = store.publish(weights(&[("comps", 1.0)]), weights(&[("gpt-4o", f64::NAN)]));
        assert!(matches!(nan_bias, Err(Error::InvalidWeightUpdate(_))));

        assert_eq!(store.active().epoch(), 0);
        assert_eq!(store.history().len(), 1);
    }

    #[test]
    fn test_rollback_then_publish_never_reuses_epoch() {
        let store = WeightStore::new(WeightSet::baseline([("comps", 1.0)]));
        store.publish(weights(&[("comps", 0.8)]), BTreeMap::new()).unwrap();
        store.publish(weights(&[("comps", 0.9)]), BTreeMap::new()).unwrap();

        let rolled = store.rollback(1).unwrap();
        assert_eq!(rolled.epoch(), 1);
        assert_eq!(store.active().weight("comps"), 0.8);

        let next = store.publish(weights(&[("comps", 0.5)]), BTreeMap::new()).unwrap();
        assert_eq!(next.epoch(), 3);
        assert!(matches!(store.rollback(42), Err(Error::WeightVersionNotFound(42))));
    }

    #[test]
    fn test_prepared_set_is_invisible_until_committed() {
        let store = WeightStore::new(WeightSet::baseline([("comps", 1.0)]));
        let pending = store.prepare(weights(&[("comps", 0.3)]), BTreeMap::new()).unwrap();
        assert_eq!(pending.epoch(), 1);
        assert_eq!(store.active().epoch(), 0);
        assert_eq!(store.history().len(), 1);

        // Dropping a prepared set leaves no trace
        drop(pending);
        let pending = store.prepare(weights(&[("comps", 0.4)]), BTreeMap::new()).unwrap();
        assert_eq!(pending.epoch(), 1);

        let stale = store.prepare(weights(&[("comps", 0.5)]), BTreeMap::new()).unwrap();
        store.commit(pending).unwrap();
        assert_eq!(store.active().weight("comps"), 0.4);
        assert!(matches!(store.commit(stale), Err(Error::InvalidWeightUpdate(_))));
        assert_eq!(store.active().epoch(), 1);
        assert_eq!(store.history().len(), 2);
    }

    #[test]
    fn test_held_snapshot_is_never_mutated() {
        let store = WeightStore::new(WeightSet::baseline([("comps", 1.0)]));
        let held = store.active();
        store.publish(weights(&[("comps", 0.2)]), BTreeMap::new()).unwrap();
        assert_eq!(held.weight("comps"), 1.0);
        assert_eq!(held.epoch(), 0);
    }

    #[test]
    fn test_restore_picks_active_epoch() {
        let base = WeightSet::baseline([("comps", 1.0)]);
        let store = WeightStore::new(base.clone());
        let published = store.publish(weights(&[("comps", 0.4)]), BTreeMap::new()).unwrap();

        let restored =
            WeightStore::restore(vec![(*published).clone(), base.clone()], Some(0)).unwrap();
        assert_eq!(restored.active().epoch(), 0);
        assert_eq!(restored.latest_epoch(), 1);

        let newest = WeightStore::restore(vec![base, (*published).clone()], None).unwrap();
        assert_eq!(newest.active().epoch(), 1);

        assert!(WeightStore::restore(Vec::new(), None).is_err());
    }

    #[test]
    fn test_missing_feature_weight_is_zero() {
        let set = WeightSet::baseline([("comps", 0.5)]);
        assert_eq!(set.weight("distress"), 0.0);
        assert_eq!(set.bias("gpt-4o"), 0.0);
        assert!((set.total_mass() - 0.5).abs() < 1e-12);
    }
}
