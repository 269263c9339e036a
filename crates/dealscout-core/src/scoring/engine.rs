//! Deal scoring

use std::collections::BTreeMap;

use chrono::{Datelike, Months, NaiveDate};
use tracing::debug;
use uuid::Uuid;

use super::features::{self, Window};
use super::types::{ScoreInput, ScoreResult};
use crate::error::{Error, Result};
use crate::weights::WeightSet;

/// Version tag stamped on every result
pub const ENGINE_VERSION: &str = concat!("dealscout-scoring/", env!("CARGO_PKG_VERSION"));

/// Default comparable-sale price that normalizes to 1.0
pub const DEFAULT_COMP_PRICE_CEILING: f64 = 1_000_000.0;

/// Comparable sales and the subject's own last sale count inside this window
const RECENCY_MONTHS: u32 = 24;

/// Oldest construction year accepted as input
const EARLIEST_YEAR_BUILT: i32 = 1600;

/// Namespace for score ids derived from the scored input
const SCORE_NAMESPACE: Uuid = Uuid::from_u128(0x6d2f_1c84_9a3e_4b57_8e0d_52c1_f7a9_3b16);

/// Computes 0-100 deal scores
///
/// Scoring is pure: the evaluation date comes from the input and the weights
/// come from the caller, so the engine never reads a clock or shared state.
#[derive(Debug, Clone)]
pub struct ScoringEngine {
    comp_price_ceiling: f64,
}

impl Default for ScoringEngine {
    fn default() -> Self {
        Self {
            comp_price_ceiling: DEFAULT_COMP_PRICE_CEILING,
        }
    }
}

impl ScoringEngine {
    pub fn new(comp_price_ceiling: f64) -> Result<Self> {
        if !comp_price_ceiling.is_finite() || comp_price_ceiling <= 0.0 {
            return Err(Error::ConfigError(format!(
                "comp_price_ceiling must be positive, got {}",
                comp_price_ceiling
            )));
        }
        Ok(Self { comp_price_ceiling })
    }

    pub fn comp_price_ceiling(&self) -> f64 {
        self.comp_price_ceiling
    }

    /// Score one property against a weight set
    ///
    /// Comparable sales outside the recency window are dropped before
    /// anything else, so they affect neither the score nor the result id.
    pub fn score(&self, input: &ScoreInput, weights: &WeightSet) -> Result<ScoreResult> {
        let window = Window {
            start: input
                .as_of
                .checked_sub_months(Months::new(RECENCY_MONTHS))
                .unwrap_or(NaiveDate::MIN),
            end: input.as_of,
        };
        let input = &within_window(input, window);
        validate(input)?;

        let (comps, qualifying_comps) =
            features::comps(&input.comps, window, self.comp_price_ceiling);
        let zip = input.zip_metrics.as_ref();

        let values: BTreeMap<String, f64> = [
            (features::COMPS, comps),
            (features::DISTRESS, features::distress(&input.property.distress)),
            (features::OWNERSHIP, features::ownership(&input.property)),
            (features::AGE, features::age(&input.property, input.as_of)),
            (features::REPAIRS, features::repairs(&input.property)),
            (features::ZIP_HEAT, features::zip_heat(zip)),
            (features::ZIP_DAYS_ON_MARKET, features::zip_days_on_market(zip)),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();

        let contributions: BTreeMap<String, f64> = values
            .iter()
            .map(|(name, value)| (name.clone(), weights.weight(name) * value))
            .collect();

        let recent_sale = input
            .property
            .last_sale_date
            .is_some_and(|sold| window.contains(sold));

        let score = if recent_sale {
            0.0
        } else {
            (100.0 * contributions.values().sum::<f64>()).clamp(0.0, 100.0)
        };

        let id = score_id(input, weights)?;
        debug!(
            address = %input.address,
            score,
            epoch = weights.epoch(),
            qualifying_comps,
            recent_sale,
            "Scored property"
        );

        Ok(ScoreResult {
            id,
            address: input.address.clone(),
            zip: input.zip.clone(),
            as_of: input.as_of,
            score,
            features: values,
            contributions,
            weights_epoch: weights.epoch(),
            weights: weights.weights().clone(),
            qualifying_comps,
            recent_sale,
            engine_version: ENGINE_VERSION.to_string(),
        })
    }
}

fn within_window(input: &ScoreInput, window: Window) -> ScoreInput {
    ScoreInput {
        comps: input
            .comps
            .iter()
            .filter(|comp| window.contains(comp.sale_date))
            .cloned()
            .collect(),
        ..input.clone()
    }
}

fn score_id(input: &ScoreInput, weights: &WeightSet) -> Result<Uuid> {
    let key = serde_json::to_vec(&(input, weights.epoch(), weights.weights()))?;
    Ok(Uuid::new_v5(&SCORE_NAMESPACE, &key))
}

fn non_negative(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(Error::MalformedScoreInput(format!(
            "{} must be a finite non-negative number, got {}",
            name, value
        )));
    }
    Ok(())
}

fn finite(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(Error::MalformedScoreInput(format!(
            "{} must be finite, got {}",
            name, value
        )));
    }
    Ok(())
}

fn validate(input: &ScoreInput) -> Result<()> {
    if input.address.trim().is_empty() {
        return Err(Error::MalformedScoreInput("address is empty".to_string()));
    }

    let property = &input.property;
    if let Some(years) = property.ownership_years {
        non_negative("ownership_years", years)?;
    }
    if let Some(repairs) = property.estimated_repairs {
        non_negative("estimated_repairs", repairs)?;
    }
    if let Some(arv) = property.arv {
        non_negative("arv", arv)?;
    }
    if let Some(price) = property.last_sale_price {
        non_negative("last_sale_price", price)?;
    }
    if let Some(built) = property.year_built {
        if built < EARLIEST_YEAR_BUILT {
            return Err(Error::MalformedScoreInput(format!(
                "year_built {} is before {}",
                built, EARLIEST_YEAR_BUILT
            )));
        }
        if built > input.as_of.year() {
            return Err(Error::MalformedScoreInput(format!(
                "year_built {} is after the evaluation date",
                built
            )));
        }
    }

    for comp in &input.comps {
        non_negative("comparable sale price", comp.price)?;
    }

    if let Some(metrics) = &input.zip_metrics {
        non_negative("price_index", metrics.price_index)?;
        finite("volume_change_pct", metrics.volume_change_pct)?;
        finite("inventory_change_pct", metrics.inventory_change_pct)?;
        if let Some(days) = metrics.median_days_on_market {
            non_negative("median_days_on_market", days)?;
        }
    }
    Ok(())
}
