//! Deal scoring
//!
//! [`ScoringEngine::score`] turns a [`ScoreInput`] and a [`WeightSet`] into a
//! [`ScoreResult`]. Features are grouped into property features and ZIP
//! features; groups combine additively and the sum is scaled to 0-100.
//!
//! [`WeightSet`]: crate::weights::WeightSet

mod engine;
pub mod features;
mod types;

pub use engine::{DEFAULT_COMP_PRICE_CEILING, ENGINE_VERSION, ScoringEngine};
pub use features::baseline_weights;
pub use types::{
    ComparableSale, DistressFlags, PropertyFeatures, ScoreInput, ScoreResult, ZipMetrics,
};
