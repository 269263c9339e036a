//! SQLite-backed feedback log

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::trace;

use super::database::Database;
use crate::error::{Error, Result};
use crate::feedback::{FeedbackEvent, FeedbackRecord, FeedbackStore, FeedbackStream};

/// Rows fetched per page while streaming a snapshot
const DEFAULT_PAGE_SIZE: u32 = 500;

/// Feedback log persisted in the `feedback` table
///
/// Sequence numbers come from the table's AUTOINCREMENT key, so they keep
/// growing across restarts and are never reused.
#[derive(Debug, Clone)]
pub struct SqliteFeedbackStore {
    pool: SqlitePool,
    page_size: u32,
}

impl SqliteFeedbackStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Number of stored records per event kind
    pub async fn counts(&self) -> Result<Vec<(String, u64)>> {
        let rows = sqlx::query("SELECT kind, COUNT(*) AS n FROM feedback GROUP BY kind ORDER BY kind")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<String, _>("kind"), row.get::<i64, _>("n") as u64))
            .collect())
    }
}

fn decode(row: &SqliteRow) -> Result<FeedbackRecord> {
    let seq: i64 = row.get("seq");
    let recorded_at: DateTime<Utc> = row.get("recorded_at");
    let event: String = row.get("event");
    Ok(FeedbackRecord {
        seq: seq as u64,
        recorded_at,
        event: serde_json::from_str(&event)?,
    })
}

#[async_trait]
impl FeedbackStore for SqliteFeedbackStore {
    async fn append(&self, event: FeedbackEvent) -> Result<FeedbackRecord> {
        let recorded_at = Utc::now();
        let body = serde_json::to_string(&event)?;

        let result = sqlx::query("INSERT INTO feedback (kind, recorded_at, event) VALUES (?, ?, ?)")
            .bind(event.kind())
            .bind(recorded_at)
            .bind(&body)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        let seq = result.last_insert_rowid() as u64;
        trace!(seq, kind = event.kind(), "Appended feedback");
        Ok(FeedbackRecord {
            seq,
            recorded_at,
            event,
        })
    }

    async fn head(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS head FROM feedback")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        Ok(row.get::<i64, _>("head") as u64)
    }

    async fn snapshot(&self, since: u64) -> Result<FeedbackStream> {
        let head = self.head().await?;
        let pool = self.pool.clone();
        let page_size = self.page_size;

        let stream = async_stream::stream! {
            let mut cursor = since;
            'pages: while cursor < head {
                let rows = sqlx::query(
                    "SELECT seq, recorded_at, event FROM feedback \
                     WHERE seq > ? AND seq <= ? ORDER BY seq LIMIT ?",
                )
                .bind(cursor as i64)
                .bind(head as i64)
                .bind(page_size as i64)
                .fetch_all(&pool)
                .await;

                let rows = match rows {
                    Ok(rows) => rows,
                    Err(e) => {
                        yield Err(Error::DatabaseError(e));
                        break 'pages;
                    }
                };
                if rows.is_empty() {
                    break 'pages;
                }

                for row in &rows {
                    cursor = row.get::<i64, _>("seq") as u64;
                    yield decode(row);
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
