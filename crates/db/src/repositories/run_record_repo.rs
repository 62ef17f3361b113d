//! Repository for the append-only `run_records` table.

use genloop_core::job::RunRecord;
use genloop_core::types::Timestamp;

use crate::models::run_record::{CheckpointUsage, OutcomeCount, RunRecordRow};
use crate::DbPool;

/// Column list for `run_records` queries.
const COLUMNS: &str = "id, run_tag, seq, prompt_id, checkpoint_type, checkpoint, loras, params, \
                       outcome, error, artifacts, submitted_at, finished_at, duration_ms, recorded_at";

/// Provides insert and read operations for run records. There is no update
/// or delete.
pub struct RunRecordRepo;

impl RunRecordRepo {
    /// Insert a record, returning the generated ID.
    pub async fn insert(
        pool: &DbPool,
        record: &RunRecord,
        recorded_at: Timestamp,
    ) -> Result<i64, sqlx::Error> {
        let encode = |e: serde_json::Error| sqlx::Error::Encode(Box::new(e));
        let loras = serde_json::to_string(&record.loras).map_err(encode)?;
        let params = serde_json::to_string(&record.params).map_err(encode)?;
        let artifacts = serde_json::to_string(&record.artifacts).map_err(encode)?;
        let seq = i64::try_from(record.seq)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

        sqlx::query_scalar(
            "INSERT INTO run_records \
                (run_tag, seq, prompt_id, checkpoint_type, checkpoint, loras, params, outcome, \
                 error, artifacts, submitted_at, finished_at, duration_ms, recorded_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
             RETURNING id",
        )
        .bind(&record.run_tag)
        .bind(seq)
        .bind(&record.prompt_id)
        .bind(&record.checkpoint_type)
        .bind(&record.checkpoint)
        .bind(loras)
        .bind(params)
        .bind(record.outcome.as_str())
        .bind(&record.error)
        .bind(artifacts)
        .bind(record.submitted_at)
        .bind(record.finished_at)
        .bind(record.duration_ms)
        .bind(recorded_at)
        .fetch_one(pool)
        .await
    }

    /// Records with `from <= recorded_at < to`, oldest first.
    pub async fn list_between(
        pool: &DbPool,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<RunRecordRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM run_records \
             WHERE recorded_at >= ?1 AND recorded_at < ?2 ORDER BY id"
        );
        sqlx::query_as::<_, RunRecordRow>(&query)
            .bind(from)
            .bind(to)
            .fetch_all(pool)
            .await
    }

    /// Records of one checkpoint type, oldest first.
    pub async fn list_by_checkpoint_type(
        pool: &DbPool,
        checkpoint_type: &str,
    ) -> Result<Vec<RunRecordRow>, sqlx::Error> {
        let query =
            format!("SELECT {COLUMNS} FROM run_records WHERE checkpoint_type = ?1 ORDER BY id");
        sqlx::query_as::<_, RunRecordRow>(&query)
            .bind(checkpoint_type)
            .fetch_all(pool)
            .await
    }

    /// Records of one run, in sequence order.
    pub async fn list_by_run(pool: &DbPool, run_tag: &str) -> Result<Vec<RunRecordRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM run_records WHERE run_tag = ?1 ORDER BY seq");
        sqlx::query_as::<_, RunRecordRow>(&query)
            .bind(run_tag)
            .fetch_all(pool)
            .await
    }

    /// Number of records per outcome for one run.
    pub async fn outcome_counts(
        pool: &DbPool,
        run_tag: &str,
    ) -> Result<Vec<OutcomeCount>, sqlx::Error> {
        sqlx::query_as::<_, OutcomeCount>(
            "SELECT outcome, COUNT(*) AS count FROM run_records \
             WHERE run_tag = ?1 GROUP BY outcome ORDER BY outcome",
        )
        .bind(run_tag)
        .fetch_all(pool)
        .await
    }

    /// Per-checkpoint usage across all runs, most used first.
    pub async fn checkpoint_usage(pool: &DbPool) -> Result<Vec<CheckpointUsage>, sqlx::Error> {
        sqlx::query_as::<_, CheckpointUsage>(
            "SELECT checkpoint_type, checkpoint, COUNT(*) AS count FROM run_records \
             GROUP BY checkpoint_type, checkpoint \
             ORDER BY count DESC, checkpoint_type, checkpoint",
        )
        .fetch_all(pool)
        .await
    }
}
