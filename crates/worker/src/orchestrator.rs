//! Job orchestration loop.
//!
//! A single control loop owns the in-flight table and the RNG stream. Each
//! tick it fills free slots (select → build → submit), polls the history of
//! every in-flight job, records finished jobs and then waits one poll
//! interval. Once the job quota is reached or the cancellation token fires
//! the loop is draining: no new jobs start, in-flight jobs are polled until
//! they finish or time out.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use genloop_comfyui::messages::HistoryStatus;
use genloop_comfyui::queue::QueueClient;
use genloop_core::builder::JobBuilder;
use genloop_core::config::ConfigModel;
use genloop_core::error::CoreError;
use genloop_core::job::{Job, JobOutcome, RunOutcome, RunRecord};
use genloop_core::params::IntParam;
use genloop_core::selector::{self, CheckpointSelection};
use genloop_core::types::{JobSeq, Timestamp};
use genloop_db::store::RunStore;

use crate::error::WorkerError;
use crate::recorder::RunRecorder;
use crate::watcher::ResultWatcher;

/// Counts reported when a run ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub run_tag: String,
    /// Jobs started, including ones whose submission failed.
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    /// Records that could not be persisted.
    pub lost_records: u64,
}

impl RunSummary {
    fn count(&mut self, outcome: RunOutcome) {
        match outcome {
            RunOutcome::Completed => self.completed += 1,
            RunOutcome::Failed => self.failed += 1,
            RunOutcome::TimedOut => self.timed_out += 1,
        }
    }
}

/// The selection in use and how many more draws each level allows before
/// the level above it draws again.
struct RepeatState {
    selection: CheckpointSelection,
    /// Character draws left for this checkpoint.
    characters_left: u64,
    /// LoRA draws left for this character.
    loras_left: u64,
    /// Jobs left for this LoRA set.
    jobs_left: u64,
}

/// A submitted job waiting for its history entry.
struct InFlightJob {
    job: Job,
    prompt_id: String,
    submitted_at: Timestamp,
    started: Instant,
    deadline: Instant,
}

pub struct Orchestrator<Q, S> {
    config: ConfigModel,
    queue: Q,
    recorder: RunRecorder<S>,
    watcher: Option<ResultWatcher>,
    run_tag: String,
    rng: StdRng,
    in_flight: BTreeMap<JobSeq, InFlightJob>,
    current: Option<RepeatState>,
    next_seq: JobSeq,
    summary: RunSummary,
}

impl<Q: QueueClient, S: RunStore> Orchestrator<Q, S> {
    pub fn new(
        config: ConfigModel,
        queue: Q,
        recorder: RunRecorder<S>,
        watcher: Option<ResultWatcher>,
        run_tag: impl Into<String>,
    ) -> Self {
        let rng = match config.settings().run.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let run_tag = run_tag.into();
        Self {
            config,
            queue,
            recorder,
            watcher,
            summary: RunSummary {
                run_tag: run_tag.clone(),
                ..RunSummary::default()
            },
            run_tag,
            rng,
            in_flight: BTreeMap::new(),
            current: None,
            next_seq: 1,
        }
    }

    pub fn run_tag(&self) -> &str {
        &self.run_tag
    }

    /// Run until the job quota is reached or `cancel` fires, then drain.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<RunSummary, WorkerError> {
        let run = &self.config.settings().run;
        let poll_interval = Duration::from_millis(run.poll_interval_ms);
        tracing::info!(
            run_tag = %self.run_tag,
            total_jobs = ?run.total_jobs,
            concurrency = run.concurrency,
            "Run starting",
        );

        let mut announced_drain = false;
        loop {
            let draining = cancel.is_cancelled() || self.quota_reached();
            if draining && !announced_drain {
                announced_drain = true;
                tracing::info!(in_flight = self.in_flight.len(), "Draining in-flight jobs");
            }
            if !draining {
                self.fill_slots(&cancel).await?;
            }

            self.ingest_watcher();
            self.poll_in_flight().await;

            if self.in_flight.is_empty() && (cancel.is_cancelled() || self.quota_reached()) {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !cancel.is_cancelled() => {
                    tracing::info!("Interrupted");
                }
                _ = self.wait_tick(poll_interval) => {}
            }
        }

        let summary = self.summary;
        tracing::info!(
            run_tag = %summary.run_tag,
            started = summary.started,
            completed = summary.completed,
            failed = summary.failed,
            timed_out = summary.timed_out,
            lost_records = summary.lost_records,
            "Run finished",
        );
        Ok(summary)
    }

    // ---- private helpers ----

    fn quota_reached(&self) -> bool {
        self.config
            .settings()
            .run
            .total_jobs
            .is_some_and(|total| self.summary.started >= total)
    }

    /// Start jobs until every slot is busy, the quota is reached, the run
    /// is cancelled or the server is backed up.
    async fn fill_slots(&mut self, cancel: &CancellationToken) -> Result<(), WorkerError> {
        let concurrency = self.config.settings().run.concurrency;
        while self.in_flight.len() < concurrency && !self.quota_reached() && !cancel.is_cancelled()
        {
            if self.server_backed_up().await {
                break;
            }

            let seq = self.next_seq;
            let selection = self.next_selection()?;
            let job = JobBuilder::new(&self.config, &self.run_tag).build(seq, &selection, &mut self.rng)?;
            self.next_seq += 1;
            self.summary.started += 1;

            tracing::info!(
                seq,
                checkpoint_type = %job.checkpoint_type,
                checkpoint = %job.checkpoint.display_name,
                loras = job.lora_chain().count(),
                seed = job.params.seed,
                "Submitting job",
            );

            let submitted_at = Utc::now();
            let started = Instant::now();
            match self.queue.submit(&job).await {
                Ok(prompt_id) => {
                    let timeout = Duration::from_secs(self.config.settings().run.job_timeout_secs);
                    self.in_flight.insert(
                        seq,
                        InFlightJob {
                            job,
                            prompt_id,
                            submitted_at,
                            started,
                            deadline: started + timeout,
                        },
                    );
                }
                Err(e) => {
                    tracing::error!(seq, error = %e, "Job submission failed");
                    let outcome = JobOutcome::Failed {
                        error: e.to_string(),
                    };
                    self.finish(&job, None, outcome, submitted_at, started).await;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn server_backed_up(&self) -> bool {
        let Some(limit) = self.config.settings().run.max_server_pending else {
            return false;
        };
        match self.queue.poll_queue().await {
            Ok(state) if state.pending.len() >= limit as usize => {
                tracing::debug!(pending = state.pending.len(), limit, "Server queue full, holding back");
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(error = %e, "Queue poll failed, holding back");
                true
            }
        }
    }

    /// Reuse the current selection while the repeat counters last. An
    /// exhausted LoRA counter redraws the LoRAs, an exhausted character
    /// counter redraws the character, and an exhausted checkpoint counter
    /// draws a new selection.
    fn next_selection(&mut self) -> Result<CheckpointSelection, CoreError> {
        let Some(mut state) = self.current.take() else {
            return self.fresh_selection();
        };
        let run = &self.config.settings().run;
        if state.jobs_left > 0 {
            state.jobs_left -= 1;
        } else if state.loras_left > 0 {
            state.loras_left -= 1;
            selector::redraw_loras(&self.config, &mut state.selection, &mut self.rng)?;
            state.jobs_left = remaining(&run.lora_repeat, "run.lora_repeat", &mut self.rng)?;
            tracing::debug!(loras = state.selection.loras.len(), "Redrew LoRAs");
        } else if state.characters_left > 0 {
            state.characters_left -= 1;
            selector::redraw_character(&self.config, &mut state.selection, &mut self.rng)?;
            state.loras_left =
                remaining(&run.character_repeat, "run.character_repeat", &mut self.rng)?;
            state.jobs_left = remaining(&run.lora_repeat, "run.lora_repeat", &mut self.rng)?;
            tracing::debug!(
                character = state.selection.character.as_ref().map(|c| c.display_name.as_str()),
                loras = state.selection.loras.len(),
                "Redrew character",
            );
        } else {
            return self.fresh_selection();
        }
        let selection = state.selection.clone();
        self.current = Some(state);
        Ok(selection)
    }

    fn fresh_selection(&mut self) -> Result<CheckpointSelection, CoreError> {
        let run = &self.config.settings().run;
        let pinned = match (&run.start_checkpoint, self.summary.started) {
            (Some(start), 0) => selector::select_start(&self.config, start, &mut self.rng)?,
            _ => None,
        };
        let selection = match pinned {
            Some(selection) => selection,
            None => selector::select(&self.config, &mut self.rng)?,
        };
        let characters_left =
            remaining(&run.checkpoint_repeat, "run.checkpoint_repeat", &mut self.rng)?;
        let loras_left = remaining(&run.character_repeat, "run.character_repeat", &mut self.rng)?;
        let jobs_left = remaining(&run.lora_repeat, "run.lora_repeat", &mut self.rng)?;
        let state = RepeatState {
            selection,
            characters_left,
            loras_left,
            jobs_left,
        };

        tracing::info!(
            checkpoint_type = %state.selection.checkpoint_type,
            checkpoint = %state.selection.checkpoint.display_name,
            character = state.selection.character.as_ref().map(|c| c.display_name.as_str()),
            loras = state.selection.loras.len(),
            characters_left = state.characters_left,
            "Selected checkpoint",
        );
        let selection = state.selection.clone();
        self.current = Some(state);
        Ok(selection)
    }

    fn ingest_watcher(&mut self) {
        if let Some(watcher) = self.watcher.as_mut() {
            for artifact in watcher.drain() {
                if !self.in_flight.contains_key(&artifact.seq) {
                    tracing::debug!(seq = artifact.seq, "Artifact for job not in flight");
                }
            }
        }
    }

    async fn poll_in_flight(&mut self) {
        let seqs: Vec<JobSeq> = self.in_flight.keys().copied().collect();
        for seq in seqs {
            let Some(entry) = self.in_flight.get(&seq) else {
                continue;
            };
            let timed_out = Instant::now() >= entry.deadline;
            let prompt_id = entry.prompt_id.clone();
            let polled = self.queue.poll_history(&prompt_id).await;
            let outcome = match polled {
                Ok(HistoryStatus::Pending) if timed_out => Some(JobOutcome::TimedOut),
                Ok(HistoryStatus::Pending) => None,
                Ok(HistoryStatus::Completed(outputs)) => Some(JobOutcome::Completed {
                    artifacts: self.resolve_artifacts(seq, outputs),
                }),
                Ok(HistoryStatus::Failed(error)) => Some(JobOutcome::Failed { error }),
                Err(e) if timed_out => {
                    tracing::warn!(seq, error = %e, "History poll failed at deadline");
                    Some(JobOutcome::TimedOut)
                }
                Err(e) => {
                    tracing::warn!(seq, error = %e, "History poll failed");
                    None
                }
            };

            let Some(outcome) = outcome else {
                continue;
            };
            let Some(entry) = self.in_flight.remove(&seq) else {
                continue;
            };
            if outcome == JobOutcome::TimedOut {
                tracing::warn!(
                    seq,
                    prompt_id = %entry.prompt_id,
                    timeout_secs = self.config.settings().run.job_timeout_secs,
                    "Job timed out",
                );
                if let Err(e) = self.queue.cancel(&entry.prompt_id).await {
                    tracing::warn!(seq, error = %e, "Failed to cancel timed-out prompt");
                }
            }
            self.finish(
                &entry.job,
                Some(entry.prompt_id),
                outcome,
                entry.submitted_at,
                entry.started,
            )
            .await;
        }
    }

    /// History outputs win; watcher artifacts fill in when history lists
    /// none.
    fn resolve_artifacts(&mut self, seq: JobSeq, outputs: Vec<PathBuf>) -> Vec<PathBuf> {
        let Some(watcher) = self.watcher.as_mut() else {
            return outputs;
        };
        watcher.drain();
        let watched = watcher.finish(seq);
        if outputs.is_empty() {
            if !watched.is_empty() {
                tracing::info!(seq, count = watched.len(), "Using watcher artifacts");
            }
            return watched;
        }
        for path in watched.iter().filter(|p| !outputs.contains(p)) {
            tracing::warn!(seq, path = %path.display(), "Watcher saw artifact missing from history");
        }
        outputs
    }

    async fn finish(
        &mut self,
        job: &Job,
        prompt_id: Option<String>,
        outcome: JobOutcome,
        submitted_at: Timestamp,
        started: Instant,
    ) {
        if let Some(watcher) = self.watcher.as_mut() {
            watcher.finish(job.seq);
        }
        let elapsed = TimeDelta::from_std(started.elapsed()).unwrap_or(TimeDelta::zero());
        let kind = outcome.kind();
        match &outcome {
            JobOutcome::Completed { artifacts } => tracing::info!(
                seq = job.seq,
                artifacts = artifacts.len(),
                elapsed_ms = elapsed.num_milliseconds(),
                "Job completed",
            ),
            JobOutcome::Failed { error } => {
                tracing::warn!(seq = job.seq, error = %error, "Job failed")
            }
            JobOutcome::TimedOut => {}
        }

        let record = RunRecord::from_job(
            &self.run_tag,
            job,
            prompt_id,
            outcome,
            submitted_at,
            submitted_at + elapsed,
        );
        self.summary.count(kind);
        if self.recorder.record(&record).await.is_err() {
            self.summary.lost_records += 1;
        }
    }

    async fn wait_tick(&mut self, interval: Duration) {
        let deadline = Instant::now() + interval;
        match self.watcher.as_mut() {
            Some(watcher) => loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() || watcher.next_event(remaining).await.is_none() {
                    break;
                }
            },
            None => tokio::time::sleep_until(deadline).await,
        }
    }
}

/// Sample a repeat count and return how many uses remain after this one.
fn remaining(repeat: &IntParam, name: &str, rng: &mut StdRng) -> Result<u64, CoreError> {
    let count: u64 = repeat.sample_as(rng, name)?;
    Ok(count.saturating_sub(1))
}
