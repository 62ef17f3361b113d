//! Run record entity models.

use std::path::PathBuf;

use serde::Serialize;
use sqlx::FromRow;

use genloop_core::job::{LoraSnapshot, RunOutcome, RunRecord};
use genloop_core::types::Timestamp;

/// A row from the `run_records` table.
///
/// `loras`, `params` and `artifacts` are JSON text columns.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RunRecordRow {
    pub id: i64,
    pub run_tag: String,
    pub seq: i64,
    pub prompt_id: Option<String>,
    pub checkpoint_type: String,
    pub checkpoint: String,
    pub loras: String,
    pub params: String,
    pub outcome: String,
    pub error: Option<String>,
    pub artifacts: String,
    pub submitted_at: Timestamp,
    pub finished_at: Timestamp,
    pub duration_ms: i64,
    pub recorded_at: Timestamp,
}

/// A persisted record with its store-assigned id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRunRecord {
    pub id: i64,
    pub recorded_at: Timestamp,
    pub record: RunRecord,
}

/// Errors decoding a row back into a [`RunRecord`].
#[derive(Debug, thiserror::Error)]
pub enum RowDecodeError {
    #[error("run record {id}: invalid JSON in {column}: {source}")]
    Json {
        id: i64,
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("run record {id}: {message}")]
    Value { id: i64, message: String },
}

impl TryFrom<RunRecordRow> for StoredRunRecord {
    type Error = RowDecodeError;

    fn try_from(row: RunRecordRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let json = |column: &'static str| move |source| RowDecodeError::Json { id, column, source };

        let loras: Vec<LoraSnapshot> = serde_json::from_str(&row.loras).map_err(json("loras"))?;
        let params = serde_json::from_str(&row.params).map_err(json("params"))?;
        let artifacts: Vec<PathBuf> =
            serde_json::from_str(&row.artifacts).map_err(json("artifacts"))?;
        let outcome: RunOutcome = row
            .outcome
            .parse()
            .map_err(|message| RowDecodeError::Value { id, message })?;
        let seq = u64::try_from(row.seq).map_err(|_| RowDecodeError::Value {
            id,
            message: format!("negative seq {}", row.seq),
        })?;

        Ok(Self {
            id,
            recorded_at: row.recorded_at,
            record: RunRecord {
                run_tag: row.run_tag,
                seq,
                prompt_id: row.prompt_id,
                checkpoint_type: row.checkpoint_type,
                checkpoint: row.checkpoint,
                loras,
                params,
                outcome,
                error: row.error,
                artifacts,
                submitted_at: row.submitted_at,
                finished_at: row.finished_at,
                duration_ms: row.duration_ms,
            },
        })
    }
}

/// Job count per outcome.
#[derive(Debug, Clone, FromRow, Serialize, PartialEq, Eq)]
pub struct OutcomeCount {
    pub outcome: String,
    pub count: i64,
}

/// How often one checkpoint was used.
#[derive(Debug, Clone, FromRow, Serialize, PartialEq, Eq)]
pub struct CheckpointUsage {
    pub checkpoint_type: String,
    pub checkpoint: String,
    pub count: i64,
}
