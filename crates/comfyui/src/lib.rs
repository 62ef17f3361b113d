//! ComfyUI HTTP client library.
//!
//! Provides the REST API wrapper, typed `/queue` and `/history` payloads,
//! the submission retry policy and the [`queue::QueueClient`] seam the
//! orchestrator drives.

pub mod api;
pub mod messages;
pub mod queue;
pub mod retry;
