use std::path::PathBuf;

use genloop_core::error::CoreError;
use genloop_core::types::JobSeq;

/// Errors that stop a run.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Selection or job building failed. Configuration is validated at load,
    /// so this indicates an inconsistent catalog.
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// A run record could not be written, even after the retry.
#[derive(Debug, thiserror::Error)]
#[error("Failed to persist run record for job {seq} after {attempts} attempts: {source}")]
pub struct RecorderError {
    pub seq: JobSeq,
    pub attempts: u32,
    #[source]
    pub source: sqlx::Error,
}

/// Filesystem watching could not be set up.
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Failed to create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}
