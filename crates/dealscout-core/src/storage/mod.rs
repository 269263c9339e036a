//! Storage layer - SQLite persistence
//!
//! - `database`: connection pool and schema
//! - `feedback`: the feedback log as a [`FeedbackStore`](crate::feedback::FeedbackStore)
//! - `archive`: weight set history and the active pointer

pub mod archive;
pub mod database;
pub mod feedback;

pub use archive::WeightArchive;
pub use database::{Database, DatabaseConfig};
pub use feedback::SqliteFeedbackStore;
