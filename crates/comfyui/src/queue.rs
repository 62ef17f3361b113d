//! Job queue client.
//!
//! [`QueueClient`] is the seam between the orchestrator and the server:
//! submit a built job, inspect the queue, poll a prompt's history and cancel
//! a prompt. [`HttpQueueClient`] implements it over [`ComfyUIApi`] with the
//! submission retry policy applied.

use std::path::PathBuf;

use async_trait::async_trait;

use genloop_core::job::Job;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::messages::{self, HistoryStatus, QueueState};
use crate::retry::{retry_with_backoff, RetryPolicy};

/// Errors from the queue client.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Every submission attempt failed. Fatal for that job only.
    #[error("Submission failed after {attempts} attempts: {last_error}")]
    Submission {
        attempts: u32,
        last_error: ComfyUIApiError,
    },

    /// A queue or history poll failed. The next poll may succeed.
    #[error("Poll failed: {0}")]
    Poll(#[from] ComfyUIApiError),

    /// The server answered with a payload that could not be interpreted.
    #[error("Malformed server response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Queue `job` and return the server-assigned prompt id.
    async fn submit(&self, job: &Job) -> Result<String, QueueError>;

    async fn poll_queue(&self) -> Result<QueueState, QueueError>;

    async fn poll_history(&self, prompt_id: &str) -> Result<HistoryStatus, QueueError>;

    /// Best-effort removal of a queued prompt.
    async fn cancel(&self, prompt_id: &str) -> Result<(), QueueError>;
}

/// [`QueueClient`] backed by the ComfyUI HTTP API.
pub struct HttpQueueClient {
    api: ComfyUIApi,
    client_id: String,
    retry: RetryPolicy,
    output_dir: PathBuf,
}

impl HttpQueueClient {
    /// * `client_id` - Sent with every submission.
    /// * `output_dir` - Directory history output paths are resolved against.
    pub fn new(api: ComfyUIApi, client_id: String, retry: RetryPolicy, output_dir: PathBuf) -> Self {
        Self {
            api,
            client_id,
            retry,
            output_dir,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl QueueClient for HttpQueueClient {
    async fn submit(&self, job: &Job) -> Result<String, QueueError> {
        let response = retry_with_backoff(&self.retry, "submit", |attempt| {
            tracing::debug!(seq = job.seq, attempt, "Submitting prompt");
            self.api.submit_workflow(&job.workflow, &self.client_id)
        })
        .await
        .map_err(|e| QueueError::Submission {
            attempts: e.attempts,
            last_error: e.last_error,
        })?;

        tracing::info!(
            seq = job.seq,
            prompt_id = %response.prompt_id,
            queue_number = response.number,
            "Prompt queued",
        );
        Ok(response.prompt_id)
    }

    async fn poll_queue(&self) -> Result<QueueState, QueueError> {
        let value = self.api.get_queue().await?;
        messages::parse_queue(&value).map_err(|e| QueueError::Malformed(format!("queue: {e}")))
    }

    async fn poll_history(&self, prompt_id: &str) -> Result<HistoryStatus, QueueError> {
        let value = self.api.get_history(prompt_id).await?;
        messages::parse_history(prompt_id, &value, &self.output_dir)
            .map_err(|e| QueueError::Malformed(format!("history of {prompt_id}: {e}")))
    }

    async fn cancel(&self, prompt_id: &str) -> Result<(), QueueError> {
        self.api.cancel_execution(prompt_id).await?;
        tracing::info!(prompt_id, "Prompt removed from queue");
        Ok(())
    }
}
