//! Feature names and normalization
//!
//! Every feature is normalized to `[0, 1]` before weighting so that weights
//! are comparable across features.

use chrono::{Datelike, NaiveDate};

use super::types::{ComparableSale, DistressFlags, PropertyFeatures, ZipMetrics};

pub const COMPS: &str = "comps";
pub const DISTRESS: &str = "distress";
pub const OWNERSHIP: &str = "ownership";
pub const AGE: &str = "age";
pub const REPAIRS: &str = "repairs";
pub const ZIP_HEAT: &str = "zip_heat";
pub const ZIP_DAYS_ON_MARKET: &str = "zip_days_on_market";

/// Features computed from the subject property
pub const PROPERTY_FEATURES: [&str; 5] = [COMPS, DISTRESS, OWNERSHIP, AGE, REPAIRS];

/// Features computed from ZIP-level market metrics
pub const ZIP_FEATURES: [&str; 2] = [ZIP_HEAT, ZIP_DAYS_ON_MARKET];

const OWNERSHIP_YEARS_CAP: f64 = 30.0;
const AGE_YEARS_CAP: f64 = 100.0;
const HEAT_CAP: f64 = 200.0;
const DAYS_ON_MARKET_CAP: f64 = 180.0;

/// Baseline weights used before the trainer has published anything
pub fn baseline_weights() -> Vec<(&'static str, f64)> {
    vec![
        (COMPS, 0.25),
        (DISTRESS, 0.30),
        (OWNERSHIP, 0.10),
        (AGE, 0.05),
        (REPAIRS, 0.10),
        (ZIP_HEAT, 0.15),
        (ZIP_DAYS_ON_MARKET, 0.05),
    ]
}

/// Whether a feature name is one the engine computes
pub fn is_known(feature: &str) -> bool {
    PROPERTY_FEATURES.contains(&feature) || ZIP_FEATURES.contains(&feature)
}

/// Inclusive recency window `[start, as_of]`
#[derive(Debug, Clone, Copy)]
pub(crate) struct Window {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Window {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

pub(crate) fn comps(comps: &[ComparableSale], window: Window, ceiling: f64) -> (f64, usize) {
    let qualifying: Vec<f64> = comps
        .iter()
        .filter(|c| window.contains(c.sale_date))
        .map(|c| (c.price / ceiling).min(1.0))
        .collect();
    if qualifying.is_empty() {
        return (0.0, 0);
    }
    let mean = qualifying.iter().sum::<f64>() / qualifying.len() as f64;
    (mean, qualifying.len())
}

pub(crate) fn distress(flags: &DistressFlags) -> f64 {
    flags.count() as f64 / DistressFlags::COUNT as f64
}

pub(crate) fn ownership(property: &PropertyFeatures) -> f64 {
    property
        .ownership_years
        .map(|years| (years / OWNERSHIP_YEARS_CAP).min(1.0))
        .unwrap_or(0.0)
}

pub(crate) fn age(property: &PropertyFeatures, as_of: NaiveDate) -> f64 {
    property
        .year_built
        .map(|built| ((i64::from(as_of.year()) - i64::from(built)) as f64 / AGE_YEARS_CAP).clamp(0.0, 1.0))
        .unwrap_or(0.0)
}

pub(crate) fn repairs(property: &PropertyFeatures) -> f64 {
    match (property.estimated_repairs, property.arv) {
        (Some(repairs), Some(arv)) if arv > 0.0 => (repairs / arv).min(1.0),
        _ => 0.0,
    }
}

pub(crate) fn zip_heat(metrics: Option<&ZipMetrics>) -> f64 {
    metrics
        .map(|m| (m.heat() / HEAT_CAP).clamp(0.0, 1.0))
        .unwrap_or(0.0)
}

pub(crate) fn zip_days_on_market(metrics: Option<&ZipMetrics>) -> f64 {
    metrics
        .and_then(|m| m.median_days_on_market)
        .map(|days| (days / DAYS_ON_MARKET_CAP).min(1.0))
        .unwrap_or(0.0)
}
