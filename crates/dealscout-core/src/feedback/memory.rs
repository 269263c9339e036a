//! In-process feedback log

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream;
use tracing::trace;

use super::{FeedbackEvent, FeedbackRecord, FeedbackStore, FeedbackStream};
use crate::error::Result;

/// Feedback log held in memory
///
/// Appends are serialized by a mutex, so concurrent writers never lose
/// records. Snapshots copy the requested range and do not hold the lock
/// while the consumer iterates.
#[derive(Debug, Default)]
pub struct InMemoryFeedbackStore {
    records: Mutex<Vec<FeedbackRecord>>,
}

impl InMemoryFeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records appended so far
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FeedbackStore for InMemoryFeedbackStore {
    async fn append(&self, event: FeedbackEvent) -> Result<FeedbackRecord> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = FeedbackRecord {
            seq: records.len() as u64 + 1,
            recorded_at: Utc::now(),
            event,
        };
        trace!(seq = record.seq, kind = record.event.kind(), "Appended feedback");
        records.push(record.clone());
        Ok(record)
    }

    async fn head(&self) -> Result<u64> {
        Ok(self.len() as u64)
    }

    async fn snapshot(&self, since: u64) -> Result<FeedbackStream> {
        let batch: Vec<Result<FeedbackRecord>> = {
            let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            let start = (since as usize).min(records.len());
            records[start..].iter().cloned().map(Ok).collect()
        };
        Ok(Box::pin(stream::iter(batch)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::TryStreamExt;
    use uuid::Uuid;

    use super::*;
    use crate::feedback::Outcome;

    fn outcome(outcome: Outcome) -> FeedbackEvent {
        FeedbackEvent::Outcome {
            subject_id: Uuid::new_v4(),
            outcome,
        }
    }

    #[tokio::test]
    async fn test_append_assigns_sequence() {
        let store = InMemoryFeedbackStore::new();
        let first = store.append(outcome(Outcome::Closed)).await.unwrap();
        let second = store.append(outcome(Outcome::Dead)).await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(store.head().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_resumes_from_cursor() {
        let store = InMemoryFeedbackStore::new();
        for _ in 0..5 {
            store.append(outcome(Outcome::NoResponse)).await.unwrap();
        }

        let all: Vec<FeedbackRecord> = store.snapshot(0).await.unwrap().try_collect().await.unwrap();
        assert_eq!(all.len(), 5);

        let tail: Vec<FeedbackRecord> = store.snapshot(3).await.unwrap().try_collect().await.unwrap();
        assert_eq!(tail.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![4, 5]);

        let past_end: Vec<FeedbackRecord> =
            store.snapshot(99).await.unwrap().try_collect().await.unwrap();
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_is_bounded_at_open() {
        let store = InMemoryFeedbackStore::new();
        store.append(outcome(Outcome::Closed)).await.unwrap();

        let snapshot = store.snapshot(0).await.unwrap();
        store.append(outcome(Outcome::Dead)).await.unwrap();

        let seen: Vec<FeedbackRecord> = snapshot.try_collect().await.unwrap();
        assert_eq!(seen.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_not_lost() {
        let store = Arc::new(InMemoryFeedbackStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    store.append(outcome(Outcome::Closed)).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let records: Vec<FeedbackRecord> = store.snapshot(0).await.unwrap().try_collect().await.unwrap();
        assert_eq!(records.len(), 400);
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, (1..=400).collect::<Vec<u64>>());
    }
}
