//! Run recorder.
//!
//! Appends one [`RunRecord`] per finished job to the run store. A failed
//! write is retried once; a second failure is logged as data loss and
//! returned to the caller, which keeps running.

use std::time::Duration;

use genloop_core::job::RunRecord;
use genloop_db::store::RunStore;

use crate::error::RecorderError;

/// Pause before the single retry.
const RETRY_DELAY: Duration = Duration::from_millis(250);

const MAX_ATTEMPTS: u32 = 2;

pub struct RunRecorder<S> {
    store: S,
}

impl<S: RunStore> RunRecorder<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persist `record`, returning its store id.
    pub async fn record(&self, record: &RunRecord) -> Result<i64, RecorderError> {
        let mut attempt = 1;
        loop {
            match self.store.append(record).await {
                Ok(id) => {
                    tracing::debug!(
                        seq = record.seq,
                        record_id = id,
                        outcome = %record.outcome,
                        "Run record written",
                    );
                    return Ok(id);
                }
                Err(e) if attempt < MAX_ATTEMPTS => {
                    tracing::warn!(seq = record.seq, error = %e, "Run record write failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    tracing::error!(
                        seq = record.seq,
                        prompt_id = record.prompt_id.as_deref().unwrap_or(""),
                        outcome = %record.outcome,
                        error = %e,
                        "Run record lost",
                    );
                    return Err(RecorderError {
                        seq: record.seq,
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }
}
