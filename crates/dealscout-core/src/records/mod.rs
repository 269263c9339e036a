//! Property record store
//!
//! The record store is an external collaborator: the engine only needs
//! property facts by address, comparable sales by ZIP and ZIP market
//! metrics. [`InMemoryPropertyRecords`] serves fixtures and tests.

mod memory;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::scoring::{ComparableSale, PropertyFeatures, ScoreInput, ZipMetrics};

pub use memory::InMemoryPropertyRecords;

/// A subject property as held by the record store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub address: String,
    pub zip: String,
    #[serde(default)]
    pub features: PropertyFeatures,
}

/// Lookups the scoring path needs from the record store
#[async_trait]
pub trait PropertyRecords: Send + Sync {
    /// Property facts for an address; `PropertyNotFound` when unknown
    async fn property(&self, address: &str) -> Result<PropertyRecord>;

    /// Recorded sales in a ZIP, in no particular order
    async fn comparable_sales(&self, zip: &str) -> Result<Vec<ComparableSale>>;

    /// Market metrics for a ZIP, if tracked
    async fn zip_metrics(&self, zip: &str) -> Result<Option<ZipMetrics>>;
}

/// Assemble the scoring input for an address
///
/// The subject's own sale is never used as its comparable.
pub async fn build_score_input(
    records: &dyn PropertyRecords,
    address: &str,
    as_of: NaiveDate,
) -> Result<ScoreInput> {
    let property = records.property(address).await?;
    let subject = normalize_address(&property.address);
    let comps = records
        .comparable_sales(&property.zip)
        .await?
        .into_iter()
        .filter(|c| {
            c.address
                .as_deref()
                .is_none_or(|a| normalize_address(a) != subject)
        })
        .collect();
    let metrics = records.zip_metrics(&property.zip).await?;

    let mut input = ScoreInput::new(property.address, property.zip, as_of)
        .with_property(property.features)
        .with_comps(comps);
    input.zip_metrics = metrics;
    Ok(input)
}

pub(crate) fn normalize_address(address: &str) -> String {
    address
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
