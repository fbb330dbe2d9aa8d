use std::{fs, path::Path};

use sqlx::{SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;
use time::OffsetDateTime;

use super::clock;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload serialization error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("invalid operation kind: {0}")]
    InvalidOperationKind(String),
    #[error("invalid task status: {0}")]
    InvalidStatus(String),
    #[error("timestamp out of range: {0}")]
    InvalidTimestamp(i64),
    #[error("task {0} not found")]
    MissingTask(i64),
    #[error("pending operation {0} not found")]
    MissingOperation(i64),
}

/// SQLite database holding local tasks, the pending operation outbox and the
/// tasks-backend mapping table.
#[derive(Clone)]
pub struct IndexStore {
    pool: SqlitePool,
}

impl IndexStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) fn encode_time(at: OffsetDateTime) -> i64 {
    clock::to_millis(at)
}

pub(crate) fn decode_time(ms: i64) -> Result<OffsetDateTime, IndexError> {
    clock::from_millis(ms).ok_or(IndexError::InvalidTimestamp(ms))
}

pub(crate) fn decode_opt_time(ms: Option<i64>) -> Result<Option<OffsetDateTime>, IndexError> {
    ms.map(decode_time).transpose()
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
