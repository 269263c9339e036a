//! SQLite connection pool and schema

use std::path::{Path, PathBuf};
use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::debug;

use crate::error::{Error, Result};

/// Default maximum connections in the pool
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Append-only feedback log
const FEEDBACK_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS feedback (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    recorded_at DATETIME NOT NULL,
    event TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_feedback_kind ON feedback(kind);
"#;

/// Every published weight set plus the active pointer
const WEIGHT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS weight_sets (
    epoch INTEGER PRIMARY KEY,
    origin TEXT NOT NULL,
    created_at DATETIME NOT NULL,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS weight_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    active_epoch INTEGER NOT NULL,
    trained_through INTEGER NOT NULL DEFAULT 0
);
"#;

/// Database configuration options
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    pub path: PathBuf,
    pub max_connections: u32,
    /// Journal mode (default: WAL so readers don't block the appender)
    pub journal_mode: SqliteJournalMode,
    pub synchronous: SqliteSynchronous,
}

impl DatabaseConfig {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            journal_mode: SqliteJournalMode::Wal,
            synchronous: SqliteSynchronous::Normal,
        }
    }

    /// Config for an in-memory database (useful for testing)
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::from(":memory:"),
            max_connections: 1, // In-memory requires single connection
            journal_mode: SqliteJournalMode::Memory,
            synchronous: SqliteSynchronous::Normal,
        }
    }

    fn is_memory(&self) -> bool {
        self.path.to_string_lossy() == ":memory:"
    }
}

/// Pooled SQLite handle shared by the feedback log and the weight archive
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    config: DatabaseConfig,
}

impl Database {
    /// Connect and create the schema
    pub async fn new(config: DatabaseConfig) -> Result<Self> {
        if !config.is_memory() {
            if let Some(parent) = config.path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let connection_str = if config.is_memory() {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", config.path.display())
        };

        let connect_options = SqliteConnectOptions::from_str(&connection_str)
            .map_err(Error::DatabaseError)?
            .journal_mode(config.journal_mode)
            .synchronous(config.synchronous)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(connect_options)
            .await
            .map_err(Error::DatabaseError)?;

        let db = Self { pool, config };
        db.init().await?;
        Ok(db)
    }

    /// Open a database file with default settings
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::new(DatabaseConfig::with_path(path)).await
    }

    /// Create an in-memory database (useful for testing)
    pub async fn in_memory() -> Result<Self> {
        Self::new(DatabaseConfig::in_memory()).await
    }

    /// Create tables that don't exist yet
    pub async fn init(&self) -> Result<()> {
        for sql in [FEEDBACK_SCHEMA, WEIGHT_SCHEMA] {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(Error::DatabaseError)?;
        }
        debug!(path = %self.config.path.display(), "Database schema initialized");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Check if database is healthy
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
