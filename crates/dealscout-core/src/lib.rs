//! Dealscout Core Library
//!
//! This crate provides the core functionality for Dealscout, including:
//! - Model registry and routing with retry and fallback
//! - Uniform invocation of local (Ollama) and cloud (OpenAI-compatible) backends
//! - Deterministic 0-100 deal scoring from property and ZIP features
//! - Versioned weight sets with atomic publish and rollback
//! - Append-only feedback log (in memory or SQLite)
//! - Self-learning trainer that reweights features and biases routing
//! - The [`DealEngine`] facade tying it all together

pub mod config;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod invoker;
pub mod records;
pub mod registry;
pub mod routing;
pub mod scoring;
pub mod storage;
pub mod trainer;
pub mod weights;

pub use engine::{BatchItem, BatchSummary, DealEngine};
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::engine::DealEngine;
    pub use crate::error::{Error, Result};
    pub use crate::feedback::{FeedbackEvent, FeedbackStore, Outcome};
    pub use crate::invoker::InvocationRequest;
    pub use crate::records::{InMemoryPropertyRecords, PropertyRecords};
    pub use crate::registry::TaskType;
    pub use crate::routing::RouteOptions;
    pub use crate::scoring::{ScoreInput, ScoreResult};
    pub use crate::trainer::{TrainerRun, TrainerState};
    pub use crate::weights::WeightSet;
}
