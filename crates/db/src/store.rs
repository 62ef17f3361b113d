//! Append-only run store seam used by the recorder.

use async_trait::async_trait;

use genloop_core::job::RunRecord;

use crate::repositories::RunRecordRepo;
use crate::DbPool;

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist one record, returning its store-assigned id.
    async fn append(&self, record: &RunRecord) -> Result<i64, sqlx::Error>;
}

/// [`RunStore`] backed by the SQLite `run_records` table.
#[derive(Debug, Clone)]
pub struct SqliteRunStore {
    pool: DbPool,
}

impl SqliteRunStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn append(&self, record: &RunRecord) -> Result<i64, sqlx::Error> {
        RunRecordRepo::insert(&self.pool, record, chrono::Utc::now()).await
    }
}
