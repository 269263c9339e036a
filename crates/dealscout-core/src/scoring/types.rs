//! Scoring inputs and results

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A nearby sold property used to estimate value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparableSale {
    #[serde(default)]
    pub address: Option<String>,
    pub price: f64,
    pub sale_date: NaiveDate,
}

impl ComparableSale {
    pub fn new(price: f64, sale_date: NaiveDate) -> Self {
        Self {
            address: None,
            price,
            sale_date,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}

/// Seller-situation flags that signal motivation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistressFlags {
    pub vacant: bool,
    pub absentee_owner: bool,
    pub preforeclosure: bool,
    pub tax_delinquent: bool,
    pub liens: bool,
    pub inherited: bool,
}

impl DistressFlags {
    /// Number of flags tracked
    pub const COUNT: usize = 6;

    /// Number of flags set
    pub fn count(&self) -> usize {
        [
            self.vacant,
            self.absentee_owner,
            self.preforeclosure,
            self.tax_delinquent,
            self.liens,
            self.inherited,
        ]
        .iter()
        .filter(|f| **f)
        .count()
    }
}

/// Property-level facts about the subject
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyFeatures {
    pub year_built: Option<i32>,
    pub ownership_years: Option<f64>,
    pub distress: DistressFlags,
    pub estimated_repairs: Option<f64>,
    /// After-repair value
    pub arv: Option<f64>,
    pub last_sale_date: Option<NaiveDate>,
    pub last_sale_price: Option<f64>,
}

/// ZIP-level market metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZipMetrics {
    /// Price index, 100 = baseline
    pub price_index: f64,
    /// Sales volume change in percent
    #[serde(default)]
    pub volume_change_pct: f64,
    /// Inventory change in percent
    #[serde(default)]
    pub inventory_change_pct: f64,
    #[serde(default)]
    pub median_days_on_market: Option<f64>,
}

impl ZipMetrics {
    pub fn new(price_index: f64, volume_change_pct: f64, inventory_change_pct: f64) -> Self {
        Self {
            price_index,
            volume_change_pct,
            inventory_change_pct,
            median_days_on_market: None,
        }
    }

    pub fn with_days_on_market(mut self, days: f64) -> Self {
        self.median_days_on_market = Some(days);
        self
    }

    /// Market heat: price index scaled up by volume growth and down by inventory growth
    pub fn heat(&self) -> f64 {
        (self.price_index
            * (1.0 + self.volume_change_pct / 100.0)
            * (1.0 - self.inventory_change_pct / 100.0))
            .max(0.0)
    }
}

/// Everything needed to score one property, built per request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreInput {
    pub address: String,
    pub zip: String,
    /// Evaluation date; the recency window is measured from here
    pub as_of: NaiveDate,
    pub property: PropertyFeatures,
    pub comps: Vec<ComparableSale>,
    pub zip_metrics: Option<ZipMetrics>,
}

impl ScoreInput {
    pub fn new(address: impl Into<String>, zip: impl Into<String>, as_of: NaiveDate) -> Self {
        Self {
            address: address.into(),
            zip: zip.into(),
            as_of,
            property: PropertyFeatures::default(),
            comps: Vec::new(),
            zip_metrics: None,
        }
    }

    pub fn with_property(mut self, property: PropertyFeatures) -> Self {
        self.property = property;
        self
    }

    pub fn with_comps(mut self, comps: Vec<ComparableSale>) -> Self {
        self.comps = comps;
        self
    }

    pub fn with_zip_metrics(mut self, metrics: ZipMetrics) -> Self {
        self.zip_metrics = Some(metrics);
        self
    }
}

/// A produced deal score
///
/// Immutable once produced: fields are only readable. The id is derived from
/// the input and the weight epoch, so scoring the same input with the same
/// weights yields an identical result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub(crate) id: Uuid,
    pub(crate) address: String,
    pub(crate) zip: String,
    pub(crate) as_of: NaiveDate,
    pub(crate) score: f64,
    pub(crate) features: BTreeMap<String, f64>,
    pub(crate) contributions: BTreeMap<String, f64>,
    pub(crate) weights_epoch: u64,
    pub(crate) weights: BTreeMap<String, f64>,
    pub(crate) qualifying_comps: usize,
    pub(crate) recent_sale: bool,
    pub(crate) engine_version: String,
}

impl ScoreResult {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn zip(&self) -> &str {
        &self.zip
    }

    pub fn as_of(&self) -> NaiveDate {
        self.as_of
    }

    /// Score in [0, 100]
    pub fn score(&self) -> f64 {
        self.score
    }

    /// Normalized feature values in [0, 1]
    pub fn features(&self) -> &BTreeMap<String, f64> {
        &self.features
    }

    /// Weight times value per feature, before scaling to 100
    pub fn contributions(&self) -> &BTreeMap<String, f64> {
        &self.contributions
    }

    pub fn contribution(&self, feature: &str) -> f64 {
        self.contributions.get(feature).copied().unwrap_or(0.0)
    }

    /// Epoch of the weight set used
    pub fn weights_epoch(&self) -> u64 {
        self.weights_epoch
    }

    /// Snapshot of the weights used
    pub fn weights(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }

    /// Comparable sales inside the recency window
    pub fn qualifying_comps(&self) -> usize {
        self.qualifying_comps
    }

    /// Subject sold inside the recency window, forcing the score to 0
    pub fn recent_sale(&self) -> bool {
        self.recent_sale
    }

    pub fn engine_version(&self) -> &str {
        &self.engine_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distress_count() {
        let flags = DistressFlags {
            vacant: true,
            tax_delinquent: true,
            ..Default::default()
        };
        assert_eq!(flags.count(), 2);
        assert_eq!(DistressFlags::default().count(), 0);
    }

    #[test]
    fn test_zip_heat() {
        let metrics = ZipMetrics::new(120.0, 10.0, 5.0);
        // 120 * 1.1 * 0.95
        assert!((metrics.heat() - 125.4).abs() < 1e-9);

        let collapsing = ZipMetrics::new(100.0, 0.0, 150.0);
        assert_eq!(collapsing.heat(), 0.0);
    }
}
