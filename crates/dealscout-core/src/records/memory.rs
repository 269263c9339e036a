use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use super::{PropertyRecord, PropertyRecords, normalize_address};
use crate::error::{Error, Result};
use crate::scoring::{ComparableSale, ZipMetrics};

/// Record store held in memory, loadable from a JSON fixture
///
/// Fixture shape:
///
/// ```json
/// {
///   "properties": [{ "address": "12 Elm St", "zip": "30301", "features": { "year_built": 1960 } }],
///   "comparable_sales": { "30301": [{ "price": 210000, "sale_date": "2024-11-03" }] },
///   "zip_metrics": { "30301": { "price_index": 115.0, "volume_change_pct": 4.0 } }
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryPropertyRecords {
    properties: HashMap<String, PropertyRecord>,
    comparable_sales: HashMap<String, Vec<ComparableSale>>,
    zip_metrics: HashMap<String, ZipMetrics>,
}

#[derive(Deserialize)]
struct Fixture {
    #[serde(default)]
    properties: Vec<PropertyRecord>,
    #[serde(default)]
    comparable_sales: HashMap<String, Vec<ComparableSale>>,
    #[serde(default)]
    zip_metrics: HashMap<String, ZipMetrics>,
}

impl InMemoryPropertyRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let fixture: Fixture = serde_json::from_str(json)?;
        let mut records = Self::new();
        for property in fixture.properties {
            records.insert_property(property);
        }
        for (zip, sales) in fixture.comparable_sales {
            for sale in sales {
                records.add_comparable_sale(&zip, sale);
            }
        }
        for (zip, metrics) in fixture.zip_metrics {
            records.set_zip_metrics(&zip, metrics);
        }
        Ok(records)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn insert_property(&mut self, property: PropertyRecord) {
        self.properties
            .insert(normalize_address(&property.address), property);
    }

    pub fn add_comparable_sale(&mut self, zip: &str, sale: ComparableSale) {
        self.comparable_sales
            .entry(zip.trim().to_string())
            .or_default()
            .push(sale);
    }

    pub fn set_zip_metrics(&mut self, zip: &str, metrics: ZipMetrics) {
        self.zip_metrics.insert(zip.trim().to_string(), metrics);
    }

    /// Addresses of every known property, sorted
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> =
            self.properties.values().map(|p| p.address.clone()).collect();
        addresses.sort();
        addresses
    }
}

#[async_trait]
impl PropertyRecords for InMemoryPropertyRecords {
    async fn property(&self, address: &str) -> Result<PropertyRecord> {
        self.properties
            .get(&normalize_address(address))
            .cloned()
            .ok_or_else(|| Error::PropertyNotFound(address.to_string()))
    }

    async fn comparable_sales(&self, zip: &str) -> Result<Vec<ComparableSale>> {
        Ok(self
            .comparable_sales
            .get(zip.trim())
            .cloned()
            .unwrap_or_default())
    }

    async fn zip_metrics(&self, zip: &str) -> Result<Option<ZipMetrics>> {
        Ok(self.zip_metrics.get(zip.trim()).cloned())
    }
}
