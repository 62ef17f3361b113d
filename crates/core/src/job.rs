//! Job and run record types shared by the builder, queue client, recorder
//! and orchestrator.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::catalog::{CheckpointRef, LoraRef};
use crate::types::{JobSeq, Timestamp};

/// One LoRA in the loader chain with its sampled strengths.
#[derive(Debug, Clone, PartialEq)]
pub struct LoraApplication {
    pub lora: LoraRef,
    pub strength_model: f64,
    pub strength_clip: f64,
}

/// Serialized form of a LoRA application stored with each run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraSnapshot {
    pub name: String,
    pub strength_model: f64,
    pub strength_clip: f64,
}

impl From<&LoraApplication> for LoraSnapshot {
    fn from(app: &LoraApplication) -> Self {
        Self {
            name: app.lora.name.clone(),
            strength_model: app.strength_model,
            strength_clip: app.strength_clip,
        }
    }
}

/// Sampled generation parameters of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub seed: u64,
    pub steps: u32,
    pub cfg: f64,
    pub sampler_name: String,
    pub scheduler: String,
    pub denoise: f64,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positive_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
}

/// A fully built, submittable job.
#[derive(Debug, Clone)]
pub struct Job {
    pub seq: JobSeq,
    pub checkpoint_type: String,
    pub checkpoint: CheckpointRef,
    pub character: Option<LoraApplication>,
    pub loras: Vec<LoraApplication>,
    pub params: GenerationParams,
    pub filename_prefix: String,
    /// Rendered API-format workflow graph.
    pub workflow: serde_json::Value,
}

impl Job {
    /// Character LoRA first, then the regular LoRAs, as they appear in the
    /// loader chain.
    pub fn lora_chain(&self) -> impl Iterator<Item = &LoraApplication> {
        self.character.iter().chain(self.loras.iter())
    }
}

/// Terminal state of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { artifacts: Vec<PathBuf> },
    Failed { error: String },
    TimedOut,
}

impl JobOutcome {
    pub fn kind(&self) -> RunOutcome {
        match self {
            Self::Completed { .. } => RunOutcome::Completed,
            Self::Failed { .. } => RunOutcome::Failed,
            Self::TimedOut => RunOutcome::TimedOut,
        }
    }
}

/// Outcome column of a run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
    TimedOut,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(format!("unknown run outcome '{other}'")),
        }
    }
}

/// Durable record of one finished job. Written once, never updated.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_tag: String,
    pub seq: JobSeq,
    /// `None` when submission failed before the server assigned an id.
    pub prompt_id: Option<String>,
    pub checkpoint_type: String,
    pub checkpoint: String,
    pub loras: Vec<LoraSnapshot>,
    pub params: GenerationParams,
    pub outcome: RunOutcome,
    pub error: Option<String>,
    pub artifacts: Vec<PathBuf>,
    pub submitted_at: Timestamp,
    pub finished_at: Timestamp,
    pub duration_ms: i64,
}

impl RunRecord {
    /// Snapshot `job` with its terminal outcome.
    pub fn from_job(
        run_tag: &str,
        job: &Job,
        prompt_id: Option<String>,
        outcome: JobOutcome,
        submitted_at: Timestamp,
        finished_at: Timestamp,
    ) -> Self {
        let kind = outcome.kind();
        let (error, artifacts) = match outcome {
            JobOutcome::Completed { artifacts } => (None, artifacts),
            JobOutcome::Failed { error } => (Some(error), Vec::new()),
            JobOutcome::TimedOut => (Some("job timed out".to_string()), Vec::new()),
        };
        Self {
            run_tag: run_tag.to_string(),
            seq: job.seq,
            prompt_id,
            checkpoint_type: job.checkpoint_type.clone(),
            checkpoint: job.checkpoint.name.clone(),
            loras: job.lora_chain().map(LoraSnapshot::from).collect(),
            params: job.params.clone(),
            outcome: kind,
            error,
            artifacts,
            submitted_at,
            finished_at,
            duration_ms: (finished_at - submitted_at).num_milliseconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_round_trips_through_str() {
        for o in [RunOutcome::Completed, RunOutcome::Failed, RunOutcome::TimedOut] {
            assert_eq!(o.as_str().parse::<RunOutcome>().unwrap(), o);
        }
        assert!("lost".parse::<RunOutcome>().is_err());
    }

    #[test]
    fn params_serialize_without_absent_prompts() {
        let p = GenerationParams {
            seed: 1,
            steps: 20,
            cfg: 7.0,
            sampler_name: "euler".into(),
            scheduler: "normal".into(),
            denoise: 1.0,
            width: 1024,
            height: 1024,
            positive_prompt: None,
            negative_prompt: Some("blurry".into()),
        };
        let v = serde_json::to_value(&p).unwrap();
        assert!(v.get("positive_prompt").is_none());
        assert_eq!(v["negative_prompt"], "blurry");
    }
}
