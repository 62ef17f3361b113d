//! Output directory watcher.
//!
//! File events from [`notify`] are forwarded into a tokio channel and turned
//! into [`Artifact`]s by parsing the job sequence number out of the file
//! name. The path → job mapping is set once: replayed or out-of-order events
//! for a known path, and events for jobs already finished, are ignored.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;

use genloop_core::naming;
use genloop_core::types::JobSeq;

use crate::error::WatcherError;

/// An image file attributed to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub seq: JobSeq,
    pub path: PathBuf,
}

pub struct ResultWatcher {
    rx: mpsc::UnboundedReceiver<PathBuf>,
    /// Kept alive for as long as events are wanted.
    _watcher: Option<RecommendedWatcher>,
    run_tag: Option<String>,
    resolved: HashMap<PathBuf, JobSeq>,
    by_seq: HashMap<JobSeq, Vec<PathBuf>>,
    finished: HashSet<JobSeq>,
    closed: bool,
}

impl ResultWatcher {
    /// Watch `output_dir` recursively for images belonging to `run_tag`.
    pub fn watch(output_dir: &Path, run_tag: &str) -> Result<Self, WatcherError> {
        std::fs::create_dir_all(output_dir).map_err(|source| WatcherError::CreateDir {
            path: output_dir.to_path_buf(),
            source,
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Create(CreateKind::File | CreateKind::Any)
                            | EventKind::Modify(ModifyKind::Name(_))
                    );
                    if relevant {
                        for path in event.paths {
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Output watcher error"),
            }
        })
        .map_err(|source| WatcherError::Watch {
            path: output_dir.to_path_buf(),
            source,
        })?;
        watcher
            .watch(output_dir, RecursiveMode::Recursive)
            .map_err(|source| WatcherError::Watch {
                path: output_dir.to_path_buf(),
                source,
            })?;

        tracing::info!(dir = %output_dir.display(), "Watching output directory");
        let mut this = Self::from_channel(rx, Some(run_tag.to_string()));
        this._watcher = Some(watcher);
        Ok(this)
    }

    /// Build a watcher over an existing path channel.
    pub fn from_channel(rx: mpsc::UnboundedReceiver<PathBuf>, run_tag: Option<String>) -> Self {
        Self {
            rx,
            _watcher: None,
            run_tag,
            resolved: HashMap::new(),
            by_seq: HashMap::new(),
            finished: HashSet::new(),
            closed: false,
        }
    }

    /// Wait up to `wait` for the next new artifact.
    ///
    /// Returns `None` when the wait elapses. A closed channel waits out the
    /// full duration so callers can use this as their tick.
    pub async fn next_event(&mut self, wait: Duration) -> Option<Artifact> {
        let deadline = Instant::now() + wait;
        loop {
            if self.closed {
                tokio::time::sleep_until(deadline).await;
                return None;
            }
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return None,
                Ok(None) => {
                    tracing::warn!("Output watcher channel closed, relying on history outputs");
                    self.closed = true;
                }
                Ok(Some(path)) => {
                    if let Some(artifact) = self.ingest(path) {
                        return Some(artifact);
                    }
                }
            }
        }
    }

    /// Consume every event already queued without waiting.
    pub fn drain(&mut self) -> Vec<Artifact> {
        let mut artifacts = Vec::new();
        while let Ok(path) = self.rx.try_recv() {
            artifacts.extend(self.ingest(path));
        }
        artifacts
    }

    /// Artifacts seen so far for `seq`.
    pub fn artifacts(&self, seq: JobSeq) -> &[PathBuf] {
        self.by_seq.get(&seq).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Mark `seq` finished and hand back its artifacts. Later events for it
    /// are ignored.
    pub fn finish(&mut self, seq: JobSeq) -> Vec<PathBuf> {
        self.finished.insert(seq);
        self.resolved.retain(|_, owner| *owner != seq);
        self.by_seq.remove(&seq).unwrap_or_default()
    }

    // ---- private helpers ----

    fn ingest(&mut self, path: PathBuf) -> Option<Artifact> {
        if self.resolved.contains_key(&path) {
            return None;
        }
        let seq = naming::parse_job_seq(&path, self.run_tag.as_deref())?;
        if self.finished.contains(&seq) {
            tracing::debug!(seq, path = %path.display(), "Artifact for finished job ignored");
            return None;
        }
        tracing::debug!(seq, path = %path.display(), "Artifact detected");
        self.resolved.insert(path.clone(), seq);
        self.by_seq.entry(seq).or_default().push(path.clone());
        Some(Artifact { seq, path })
    }
}
