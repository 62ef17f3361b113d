//! Typed configuration schema.
//!
//! The YAML document is deserialized straight into these structs. Unknown
//! keys are rejected (`deny_unknown_fields`), numeric bounds are checked with
//! [`validator`], and the cross-field rules live in [`Settings::check`].
//! Everything in here is plain data; file discovery and template loading
//! happen in [`crate::config::ConfigModel`].

use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use validator::Validate;

use crate::error::CoreError;
use crate::params::{ChoiceParam, FloatParam, IntParam};

/// Default ComfyUI HTTP endpoint.
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8188";

/// Default workflow template file name, relative to `paths.data_dir`.
pub const DEFAULT_WORKFLOW_FILE: &str = "workflow_api.json";

// ---------------------------------------------------------------------------
// Ordered map
// ---------------------------------------------------------------------------

/// A string-keyed map that keeps declaration order.
///
/// Weighted draws break ties by declaration order, so the order of keys in
/// the YAML document is significant and must survive deserialization.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<T>(Vec<(String, T)>);

impl<T> OrderedMap<T> {
    pub fn from_entries(entries: Vec<(String, T)>) -> Self {
        Self(entries)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T> Default for OrderedMap<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for OrderedMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedMapVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<T> {
            type Value = OrderedMap<T>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map with string keys")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries: Vec<(String, T)> = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, T>()? {
                    if entries.iter().any(|(k, _)| *k == key) {
                        return Err(serde::de::Error::custom(format!("duplicate key '{key}'")));
                    }
                    entries.push((key, value));
                }
                Ok(OrderedMap(entries))
            }
        }

        deserializer.deserialize_map(OrderedMapVisitor(PhantomData))
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Root of the configuration document.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    pub paths: PathSettings,
    /// Checkpoint type name -> type settings, in declaration order.
    pub checkpoint_types: OrderedMap<CheckpointTypeSettings>,
    #[serde(default)]
    #[validate(nested)]
    pub loras: LoraSettings,
    #[serde(default)]
    #[validate(nested)]
    pub characters: CharacterSettings,
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    #[validate(nested)]
    pub run: RunSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    /// Base HTTP URL, e.g. `http://127.0.0.1:8188`.
    #[serde(default = "default_server_url")]
    pub url: String,
    /// Client id sent with every submission. A random UUID when unset.
    #[serde(default)]
    pub client_id: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            client_id: None,
        }
    }
}

/// Filesystem locations. Relative paths are resolved against the directory
/// containing the configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathSettings {
    /// Root of the checkpoint tree: `<checkpoint_dir>/<type>/**/*.safetensors`.
    pub checkpoint_dir: PathBuf,
    /// Root of the LoRA tree: `<lora_dir>/<type>/<subdir>/**/*.safetensors`.
    pub lora_dir: PathBuf,
    /// Directory the server writes generated images into.
    pub output_dir: PathBuf,
    /// Local state: run database and workflow template.
    pub data_dir: PathBuf,
    /// Workflow template (API format JSON), relative to `data_dir`.
    #[serde(default = "default_workflow_file")]
    pub workflow: PathBuf,
}

impl PathSettings {
    /// Resolve every relative path against `base`.
    pub fn resolve_against(&mut self, base: &Path) {
        for path in [
            &mut self.checkpoint_dir,
            &mut self.lora_dir,
            &mut self.output_dir,
            &mut self.data_dir,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        if self.workflow.is_relative() {
            self.workflow = self.data_dir.join(&self.workflow);
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointTypeSettings {
    /// Relative weight of this type. Zero disables the type.
    pub weight: u32,
    /// Explicit checkpoint files, relative to `paths.checkpoint_dir`.
    /// When empty the type directory is scanned instead.
    #[serde(default)]
    pub checkpoints: Vec<String>,
    /// Optional per-checkpoint weights keyed by file stem.
    #[serde(default)]
    pub checkpoint_weights: OrderedMap<u32>,
    /// Probability of drawing from the weighted checkpoints rather than
    /// uniformly from the unweighted ones.
    #[serde(default = "default_weighted_probability")]
    pub weighted_probability: f64,
    /// Optional per-character weights keyed by file stem.
    #[serde(default)]
    pub character_weights: OrderedMap<u32>,
    /// Prompt fragments keyed by the file stem of a checkpoint, character or
    /// LoRA of this type. Appended to the prompts of every job using it.
    #[serde(default)]
    pub triggers: OrderedMap<TriggerPrompt>,
}

/// Prompt text contributed by one model file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerPrompt {
    #[serde(default)]
    pub positive: Option<String>,
    #[serde(default)]
    pub negative: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct LoraSettings {
    /// Sub-directory of `<lora_dir>/<type>` holding the candidate LoRAs.
    #[serde(default = "default_lora_subdir")]
    pub subdir: String,
    /// Independent inclusion probability of each candidate LoRA.
    #[serde(default)]
    #[validate(range(min = 0.0, max = 1.0))]
    pub probability: f64,
    /// Upper bound on LoRAs per job (character LoRA not included).
    #[serde(default = "default_lora_max_count")]
    pub max_count: usize,
    #[serde(default = "default_strength")]
    pub strength_model: FloatParam,
    #[serde(default = "default_strength")]
    pub strength_clip: FloatParam,
}

impl Default for LoraSettings {
    fn default() -> Self {
        Self {
            subdir: default_lora_subdir(),
            probability: 0.0,
            max_count: default_lora_max_count(),
            strength_model: default_strength(),
            strength_clip: default_strength(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CharacterSettings {
    /// Sub-directory of `<lora_dir>/<type>` holding character LoRAs.
    #[serde(default = "default_character_subdir")]
    pub subdir: String,
    /// Probability of generating without a character LoRA.
    #[serde(default = "default_skip_probability")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub skip_probability: f64,
    /// Probability of drawing from the weighted characters
    /// (`checkpoint_types.<type>.character_weights`) rather than uniformly
    /// from the unweighted ones.
    #[serde(default = "default_weighted_probability")]
    pub weighted_probability: f64,
    #[serde(default = "default_strength")]
    pub strength_model: FloatParam,
    #[serde(default = "default_strength")]
    pub strength_clip: FloatParam,
}

impl Default for CharacterSettings {
    fn default() -> Self {
        Self {
            subdir: default_character_subdir(),
            skip_probability: default_skip_probability(),
            weighted_probability: default_weighted_probability(),
            strength_model: default_strength(),
            strength_clip: default_strength(),
        }
    }
}

/// Sampler parameters. Each entry is a fixed value, an inclusive
/// `[min, max]` range, a list of choices, or a `{choice: weight}` map.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationSettings {
    /// Fixed sampler seed. A fresh 64-bit seed per job when unset.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_steps")]
    pub steps: IntParam,
    #[serde(default = "default_cfg")]
    pub cfg: FloatParam,
    #[serde(default = "default_sampler")]
    pub sampler_name: ChoiceParam,
    #[serde(default = "default_scheduler")]
    pub scheduler: ChoiceParam,
    #[serde(default = "default_denoise")]
    pub denoise: FloatParam,
    #[serde(default = "default_size")]
    pub width: IntParam,
    #[serde(default = "default_size")]
    pub height: IntParam,
    #[serde(default)]
    pub positive_prompt: Option<ChoiceParam>,
    #[serde(default)]
    pub negative_prompt: Option<ChoiceParam>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            seed: None,
            steps: default_steps(),
            cfg: default_cfg(),
            sampler_name: default_sampler(),
            scheduler: default_scheduler(),
            denoise: default_denoise(),
            width: default_size(),
            height: default_size(),
            positive_prompt: None,
            negative_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    /// Total submission attempts, including the first.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    #[validate(range(min = 1.0, max = 10.0))]
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RunSettings {
    /// Stop after this many jobs. Runs until interrupted when unset.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub total_jobs: Option<u64>,
    /// Maximum number of jobs in flight on the server at once.
    #[serde(default = "default_concurrency")]
    #[validate(range(min = 1, max = 64))]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 10))]
    pub poll_interval_ms: u64,
    /// A job not present in the server history after this long times out.
    #[serde(default = "default_job_timeout_secs")]
    #[validate(range(min = 1))]
    pub job_timeout_secs: u64,
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetrySettings,
    /// Seed of the run's RNG stream. Seeded from the OS when unset.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Character draws made before a new checkpoint is selected.
    #[serde(default = "default_repeat")]
    pub checkpoint_repeat: IntParam,
    /// LoRA draws made before a new character is selected.
    #[serde(default = "default_repeat")]
    pub character_repeat: IntParam,
    /// Jobs submitted before new LoRAs are drawn.
    #[serde(default = "default_repeat")]
    pub lora_repeat: IntParam,
    /// Hold back submissions while the server has this many pending prompts.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub max_server_pending: Option<u32>,
    /// `"<type>/<file>"` checkpoint used for the first job of the run.
    #[serde(default)]
    pub start_checkpoint: Option<String>,
    /// Watch `paths.output_dir` for artifacts as a fallback to history.
    #[serde(default = "default_true")]
    pub watch_outputs: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            total_jobs: None,
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            job_timeout_secs: default_job_timeout_secs(),
            retry: RetrySettings::default(),
            seed: None,
            checkpoint_repeat: default_repeat(),
            character_repeat: default_repeat(),
            lora_repeat: default_repeat(),
            max_server_pending: None,
            start_checkpoint: None,
            watch_outputs: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl Settings {
    /// Parse a YAML document. Paths are left as written.
    pub fn from_yaml_str(text: &str) -> Result<Self, CoreError> {
        serde_yaml::from_str(text).map_err(|e| CoreError::config(e.to_string()))
    }

    /// Read and parse a configuration file, resolving relative paths
    /// against the file's directory.
    pub fn from_file(path: &Path) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings = Self::from_yaml_str(&text)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        settings.paths.resolve_against(base);
        Ok(settings)
    }

    /// Validate bounds and cross-field rules.
    ///
    /// Everything that can make a later selection or build fail is
    /// rejected here so a bad configuration never starts a run.
    pub fn check(&self) -> Result<(), CoreError> {
        self.validate()
            .map_err(|e| CoreError::config(e.to_string().replace('\n', "; ")))?;

        if self.checkpoint_types.is_empty() {
            return Err(CoreError::config("checkpoint_types must not be empty"));
        }
        let total: u64 = self
            .checkpoint_types
            .iter()
            .map(|(_, t)| u64::from(t.weight))
            .sum();
        if total == 0 {
            return Err(CoreError::config(
                "at least one checkpoint type must have a positive weight",
            ));
        }
        for (name, t) in self.checkpoint_types.iter() {
            check_probability(
                &format!("checkpoint_types.{name}.weighted_probability"),
                t.weighted_probability,
            )?;
        }
        check_probability("loras.probability", self.loras.probability)?;
        check_probability("characters.skip_probability", self.characters.skip_probability)?;
        check_probability(
            "characters.weighted_probability",
            self.characters.weighted_probability,
        )?;

        let g = &self.generation;
        g.steps.check("generation.steps")?;
        g.steps.check_min("generation.steps", 1)?;
        g.steps.check_fits::<u32>("generation.steps")?;
        g.cfg.check("generation.cfg")?;
        g.sampler_name.check("generation.sampler_name")?;
        g.scheduler.check("generation.scheduler")?;
        g.denoise.check("generation.denoise")?;
        g.width.check("generation.width")?;
        g.width.check_min("generation.width", 8)?;
        g.width.check_fits::<u32>("generation.width")?;
        g.height.check("generation.height")?;
        g.height.check_min("generation.height", 8)?;
        g.height.check_fits::<u32>("generation.height")?;
        if let Some(p) = &g.positive_prompt {
            p.check("generation.positive_prompt")?;
        }
        if let Some(p) = &g.negative_prompt {
            p.check("generation.negative_prompt")?;
        }

        self.loras.strength_model.check("loras.strength_model")?;
        self.loras.strength_clip.check("loras.strength_clip")?;
        self.characters.strength_model.check("characters.strength_model")?;
        self.characters.strength_clip.check("characters.strength_clip")?;

        for (name, repeat) in [
            ("run.checkpoint_repeat", &self.run.checkpoint_repeat),
            ("run.character_repeat", &self.run.character_repeat),
            ("run.lora_repeat", &self.run.lora_repeat),
        ] {
            repeat.check(name)?;
            repeat.check_min(name, 1)?;
        }
        if self.run.retry.initial_delay_ms > self.run.retry.max_delay_ms {
            return Err(CoreError::config(
                "run.retry.initial_delay_ms must not exceed run.retry.max_delay_ms",
            ));
        }
        Ok(())
    }
}

/// NaN fails every comparison, so a plain range check would let it through.
fn check_probability(name: &str, value: f64) -> Result<(), CoreError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(CoreError::Configuration(format!("{name} must be within [0, 1]")))
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_workflow_file() -> PathBuf {
    PathBuf::from(DEFAULT_WORKFLOW_FILE)
}

fn default_weighted_probability() -> f64 {
    0.5
}

fn default_lora_subdir() -> String {
    "etc".to_string()
}

fn default_character_subdir() -> String {
    "char".to_string()
}

fn default_lora_max_count() -> usize {
    3
}

fn default_skip_probability() -> f64 {
    0.5
}

fn default_strength() -> FloatParam {
    FloatParam::Fixed(1.0)
}

fn default_steps() -> IntParam {
    IntParam::Fixed(20)
}

fn default_cfg() -> FloatParam {
    FloatParam::Fixed(7.0)
}

fn default_sampler() -> ChoiceParam {
    ChoiceParam::Fixed("euler".to_string())
}

fn default_scheduler() -> ChoiceParam {
    ChoiceParam::Fixed("normal".to_string())
}

fn default_denoise() -> FloatParam {
    FloatParam::Fixed(1.0)
}

fn default_size() -> IntParam {
    IntParam::Fixed(1024)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_concurrency() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_job_timeout_secs() -> u64 {
    600
}

fn default_repeat() -> IntParam {
    IntParam::Fixed(1)
}

fn default_true() -> bool {
    true
}
