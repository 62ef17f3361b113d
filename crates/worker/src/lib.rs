//! Batch generation worker.
//!
//! The [`orchestrator::Orchestrator`] drives jobs through
//! select → build → submit → poll → record, with the
//! [`watcher::ResultWatcher`] observing the output directory and the
//! [`recorder::RunRecorder`] persisting one record per finished job.

pub mod error;
pub mod orchestrator;
pub mod recorder;
pub mod watcher;
