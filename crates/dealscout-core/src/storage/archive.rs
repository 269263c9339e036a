//! Persistent weight set history

use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use super::database::Database;
use crate::error::{Error, Result};
use crate::weights::{WeightSet, WeightStore};

const INSERT_SET_SQL: &str =
    "INSERT OR IGNORE INTO weight_sets (epoch, origin, created_at, body) VALUES (?, ?, ?, ?)";

const SET_ACTIVE_SQL: &str = "INSERT INTO weight_state (id, active_epoch) VALUES (1, ?) \
     ON CONFLICT(id) DO UPDATE SET active_epoch = excluded.active_epoch";

/// Every published weight set and the active epoch, kept in SQLite
///
/// Rows are written once per epoch and never updated; only the active
/// pointer row changes.
#[derive(Debug, Clone)]
pub struct WeightArchive {
    pool: SqlitePool,
}

impl WeightArchive {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Store a weight set; saving an epoch twice keeps the first copy
    pub async fn save(&self, set: &WeightSet) -> Result<()> {
        let body = serde_json::to_string(set)?;
        sqlx::query(INSERT_SET_SQL)
            .bind(set.epoch() as i64)
            .bind(set.origin().to_string())
            .bind(set.created_at())
            .bind(&body)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        debug!(epoch = set.epoch(), "Archived weight set");
        Ok(())
    }

    /// Record which epoch is active
    pub async fn set_active(&self, epoch: u64) -> Result<()> {
        sqlx::query(SET_ACTIVE_SQL)
            .bind(epoch as i64)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        Ok(())
    }

    /// Feedback sequence number whose outcomes have already been trained on
    pub async fn trained_through(&self) -> Result<u64> {
        let row = sqlx::query("SELECT trained_through FROM weight_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        Ok(row.map(|r| r.get::<i64, _>("trained_through") as u64).unwrap_or(0))
    }

    /// Save a weight set and make it the active one
    pub async fn publish(&self, set: &WeightSet) -> Result<()> {
        self.save(set).await?;
        self.set_active(set.epoch()).await
    }

    /// Save a trained set, activate it and advance the trained-through marker atomically
    ///
    /// Either all three writes land or none do.
    pub async fn publish_trained(&self, set: &WeightSet, trained_through: u64) -> Result<()> {
        let body = serde_json::to_string(set)?;
        let mut tx = self.pool.begin().await.map_err(Error::DatabaseError)?;

        sqlx::query(INSERT_SET_SQL)
            .bind(set.epoch() as i64)
            .bind(set.origin().to_string())
            .bind(set.created_at())
            .bind(&body)
            .execute(&mut *tx)
            .await
            .map_err(Error::DatabaseError)?;
        sqlx::query(SET_ACTIVE_SQL)
            .bind(set.epoch() as i64)
            .execute(&mut *tx)
            .await
            .map_err(Error::DatabaseError)?;
        sqlx::query("UPDATE weight_state SET trained_through = ? WHERE id = 1")
            .bind(trained_through as i64)
            .execute(&mut *tx)
            .await
            .map_err(Error::DatabaseError)?;

        tx.commit().await.map_err(Error::DatabaseError)?;
        debug!(epoch = set.epoch(), trained_through, "Archived trained weight set");
        Ok(())
    }

    pub async fn active_epoch(&self) -> Result<Option<u64>> {
        let row = sqlx::query("SELECT active_epoch FROM weight_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        Ok(row.map(|r| r.get::<i64, _>("active_epoch") as u64))
    }

    /// All archived versions, oldest first
    pub async fn load_all(&self) -> Result<Vec<WeightSet>> {
        let rows = sqlx::query("SELECT body FROM weight_sets ORDER BY epoch")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        rows.iter()
            .map(|row| {
                let body: String = row.get("body");
                serde_json::from_str(&body).map_err(Error::from)
            })
            .collect()
    }

    /// Rebuild a weight store from the archive
    ///
    /// When nothing is archived yet, `baseline` is archived and becomes the
    /// only version.
    pub async fn restore_or_init(&self, baseline: WeightSet) -> Result<WeightStore> {
        let history = self.load_all().await?;
        if history.is_empty() {
            self.publish(&baseline).await?;
            return Ok(WeightStore::new(baseline));
        }

        let active = self.active_epoch().await?;
        let store = WeightStore::restore(history, active)?;
        info!(
            active = store.active().epoch(),
            latest = store.latest_epoch(),
            "Restored weight history"
        );
        Ok(store)
    }
}
