//! Append-only feedback log
//!
//! Every routing decision, issued score, backend invocation and real-world
//! outcome is appended here. The trainer consumes the log through
//! [`FeedbackStore::snapshot`], resuming from the last sequence number it saw.
//!
//! Two implementations are provided: [`InMemoryFeedbackStore`] for tests and
//! single-process use, and [`crate::storage::SqliteFeedbackStore`] for
//! persistence across restarts.

mod memory;
mod types;

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::error::Result;

pub use memory::InMemoryFeedbackStore;
pub use types::{FeedbackEvent, FeedbackRecord, InvocationFeedback, Outcome};

/// Finite stream of feedback records
pub type FeedbackStream = Pin<Box<dyn Stream<Item = Result<FeedbackRecord>> + Send>>;

/// Append-only record of decisions and outcomes
///
/// Appending is the only mutation. Concurrent appenders must never lose
/// records; sequence numbers are assigned in append order.
#[async_trait]
pub trait FeedbackStore: Send + Sync {
    /// Append an event and return the stored record
    async fn append(&self, event: FeedbackEvent) -> Result<FeedbackRecord>;

    /// Sequence number of the newest record (0 when empty)
    async fn head(&self) -> Result<u64>;

    /// Records with `seq > since`, bounded by the head when the snapshot opens
    async fn snapshot(&self, since: u64) -> Result<FeedbackStream>;
}
