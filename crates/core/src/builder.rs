//! Job construction.
//!
//! Combines a [`CheckpointSelection`] with sampled generation parameters and
//! renders the workflow graph. Parameters are drawn in a fixed order so one
//! RNG seed always yields the same job.

use rand::Rng;

use crate::config::ConfigModel;
use crate::error::CoreError;
use crate::job::{GenerationParams, Job, LoraApplication};
use crate::naming;
use crate::params::FloatParam;
use crate::selector::CheckpointSelection;
use crate::settings::TriggerPrompt;
use crate::types::JobSeq;
use crate::workflow::WorkflowInputs;

pub struct JobBuilder<'a> {
    config: &'a ConfigModel,
    run_tag: &'a str,
}

impl<'a> JobBuilder<'a> {
    pub fn new(config: &'a ConfigModel, run_tag: &'a str) -> Self {
        Self { config, run_tag }
    }

    /// Build job `seq` for `selection`.
    pub fn build<R: Rng>(
        &self,
        seq: JobSeq,
        selection: &CheckpointSelection,
        rng: &mut R,
    ) -> Result<Job, CoreError> {
        let settings = self.config.settings();
        let mut params = sample_params(settings, rng)?;
        self.apply_triggers(selection, &mut params);

        let character = selection
            .character
            .as_ref()
            .map(|lora| {
                apply(
                    lora,
                    &settings.characters.strength_model,
                    &settings.characters.strength_clip,
                    "characters",
                    rng,
                )
            })
            .transpose()?;
        let loras = selection
            .loras
            .iter()
            .map(|lora| {
                apply(
                    lora,
                    &settings.loras.strength_model,
                    &settings.loras.strength_clip,
                    "loras",
                    rng,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let filename_prefix = naming::filename_prefix(
            &selection.checkpoint_type,
            &selection.checkpoint.display_name,
            self.run_tag,
            seq,
        );
        let chain: Vec<&LoraApplication> = character.iter().chain(loras.iter()).collect();
        let workflow = self.config.template().render(&WorkflowInputs {
            checkpoint_name: &selection.checkpoint.name,
            loras: &chain,
            params: &params,
            filename_prefix: &filename_prefix,
        })?;

        Ok(Job {
            seq,
            checkpoint_type: selection.checkpoint_type.clone(),
            checkpoint: selection.checkpoint.clone(),
            character,
            loras,
            params,
            filename_prefix,
            workflow,
        })
    }
}

impl JobBuilder<'_> {
    /// Append the trigger prompts of the checkpoint, the character and each
    /// LoRA, in chain order, to the sampled prompts.
    fn apply_triggers(&self, selection: &CheckpointSelection, params: &mut GenerationParams) {
        let Some(checkpoint_type) = self
            .config
            .checkpoint_types()
            .iter()
            .find(|t| t.name == selection.checkpoint_type)
        else {
            return;
        };
        let triggers: Vec<&TriggerPrompt> = std::iter::once(&selection.checkpoint)
            .chain(selection.character.iter())
            .chain(selection.loras.iter())
            .filter_map(|model| checkpoint_type.trigger(&model.display_name))
            .collect();
        if triggers.is_empty() {
            return;
        }
        params.positive_prompt = merge_prompt(
            params.positive_prompt.take(),
            triggers.iter().filter_map(|t| t.positive.as_deref()),
        );
        params.negative_prompt = merge_prompt(
            params.negative_prompt.take(),
            triggers.iter().filter_map(|t| t.negative.as_deref()),
        );
    }
}

// ---- private helpers ----

/// Join `base` and `extra` with `", "`, skipping blank and repeated parts.
fn merge_prompt<'a>(base: Option<String>, extra: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    for part in base.into_iter().chain(extra.map(str::to_string)) {
        let part = part.trim();
        if !part.is_empty() && !parts.iter().any(|p| p == part) {
            parts.push(part.to_string());
        }
    }
    (!parts.is_empty()).then(|| parts.join(", "))
}

fn sample_params<R: Rng>(
    settings: &crate::settings::Settings,
    rng: &mut R,
) -> Result<GenerationParams, CoreError> {
    let g = &settings.generation;
    let seed = match g.seed {
        Some(seed) => seed,
        None => rng.random::<u64>(),
    };
    Ok(GenerationParams {
        seed,
        steps: g.steps.sample_as(rng, "generation.steps")?,
        cfg: g.cfg.sample(rng, "generation.cfg")?,
        sampler_name: g.sampler_name.sample(rng, "generation.sampler_name")?,
        scheduler: g.scheduler.sample(rng, "generation.scheduler")?,
        denoise: g.denoise.sample(rng, "generation.denoise")?,
        width: g.width.sample_as(rng, "generation.width")?,
        height: g.height.sample_as(rng, "generation.height")?,
        positive_prompt: g
            .positive_prompt
            .as_ref()
            .map(|p| p.sample(rng, "generation.positive_prompt"))
            .transpose()?,
        negative_prompt: g
            .negative_prompt
            .as_ref()
            .map(|p| p.sample(rng, "generation.negative_prompt"))
            .transpose()?,
    })
}

fn apply<R: Rng>(
    lora: &crate::catalog::LoraRef,
    strength_model: &FloatParam,
    strength_clip: &FloatParam,
    section: &str,
    rng: &mut R,
) -> Result<LoraApplication, CoreError> {
    Ok(LoraApplication {
        lora: lora.clone(),
        strength_model: strength_model.sample(rng, &format!("{section}.strength_model"))?,
        strength_clip: strength_clip.sample(rng, &format!("{section}.strength_clip"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CheckpointType, ModelRef};
    use crate::settings::Settings;
    use crate::workflow::WorkflowTemplate;
    use assert_matches::assert_matches;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;
    use std::path::Path;

    const SETTINGS: &str = r#"
paths: { checkpoint_dir: /m/ckpt, lora_dir: /m/lora, output_dir: /out, data_dir: /data }
checkpoint_types:
  IL: { weight: 1 }
loras: { probability: 0.5, strength_model: [0.4, 0.9] }
generation:
  steps: [20, 30]
  cfg: [4.0, 8.0]
  sampler_name: { euler: 1, dpmpp_2m: 3 }
  scheduler: [normal, karras]
  width: 832
  height: 1216
  positive_prompt: [a castle, a forest]
"#;

    fn config() -> ConfigModel {
        let settings = Settings::from_yaml_str(SETTINGS).unwrap();
        let model = |p: &str| ModelRef::under_root(Path::new("/m"), &Path::new("/m").join(p));
        let types = vec![CheckpointType::new("IL", 1, vec![model("ckpt/IL/anime.safetensors")])
            .with_loras(vec![model("lora/IL/etc/style.safetensors")])];
        let template = WorkflowTemplate::from_value(json!({
            "3": {"class_type": "KSampler", "inputs": {"seed": 0, "steps": 1, "cfg": 1.0,
                  "sampler_name": "x", "scheduler": "x", "denoise": 1.0, "model": ["10", 0],
                  "positive": ["6", 0]}},
            "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "x"}},
            "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "", "clip": ["10", 1]}},
            "9": {"class_type": "SaveImage", "inputs": {"filename_prefix": "x", "images": ["3", 0]}},
            "10": {"class_type": "LoraLoader", "inputs": {"lora_name": "x", "strength_model": 1.0,
                   "strength_clip": 1.0, "model": ["4", 0], "clip": ["4", 1]}}
        }))
        .unwrap();
        ConfigModel::from_parts(settings, types, template).unwrap()
    }

    fn selection(config: &ConfigModel, with_lora: bool) -> CheckpointSelection {
        let t = &config.checkpoint_types()[0];
        CheckpointSelection {
            checkpoint_type: t.name.clone(),
            checkpoint: t.checkpoints[0].clone(),
            character: None,
            loras: if with_lora { t.loras.clone() } else { vec![] },
        }
    }

    #[test]
    fn fixed_seed_builds_identical_jobs() {
        let config = config();
        let builder = JobBuilder::new(&config, "run");
        let sel = selection(&config, true);
        let a = builder.build(1, &sel, &mut StdRng::seed_from_u64(99)).unwrap();
        let b = builder.build(1, &sel, &mut StdRng::seed_from_u64(99)).unwrap();
        assert_eq!(a.params, b.params);
        assert_eq!(a.loras, b.loras);
        assert_eq!(a.workflow, b.workflow);
    }

    #[test]
    fn sampled_values_respect_ranges() {
        let config = config();
        let builder = JobBuilder::new(&config, "run");
        let sel = selection(&config, true);
        let mut rng = StdRng::seed_from_u64(5);
        for seq in 0..50 {
            let job = builder.build(seq, &sel, &mut rng).unwrap();
            assert!((20..=30).contains(&job.params.steps));
            assert!((4.0..=8.0).contains(&job.params.cfg));
            assert_eq!(job.params.width, 832);
            assert!(["euler", "dpmpp_2m"].contains(&job.params.sampler_name.as_str()));
            assert!((0.4..=0.9).contains(&job.loras[0].strength_model));
            assert_eq!(job.loras[0].strength_clip, 1.0);
        }
    }

    #[test]
    fn job_carries_prefix_and_rendered_graph() {
        let config = config();
        let builder = JobBuilder::new(&config, "run7");
        let job = builder
            .build(3, &selection(&config, false), &mut StdRng::seed_from_u64(1))
            .unwrap();
        assert_eq!(job.filename_prefix, "IL/anime/anime-run7-job000003");
        assert_eq!(job.workflow["9"]["inputs"]["filename_prefix"], job.filename_prefix.as_str());
        assert_eq!(job.workflow["4"]["inputs"]["ckpt_name"], "IL/anime.safetensors");
        assert_eq!(job.workflow["3"]["inputs"]["seed"], job.params.seed);
        assert!(job.workflow.get("10").is_none());
    }

    #[test]
    fn trigger_prompts_follow_chain_order() {
        let base = config();
        let trigger = |positive: &str, negative: Option<&str>| TriggerPrompt {
            positive: Some(positive.to_string()),
            negative: negative.map(str::to_string),
        };
        let types = vec![base.checkpoint_types()[0].clone().with_triggers(
            crate::settings::OrderedMap::from_entries(vec![
                ("style".to_string(), trigger("ink lines", Some("blurry"))),
                ("anime".to_string(), trigger("anime style", None)),
            ]),
        )];
        let config = ConfigModel::from_parts(
            Settings::from_yaml_str(SETTINGS).unwrap(),
            types,
            base.template().clone(),
        )
        .unwrap();
        let builder = JobBuilder::new(&config, "run");

        let job = builder
            .build(1, &selection(&config, true), &mut StdRng::seed_from_u64(2))
            .unwrap();
        let positive = job.params.positive_prompt.unwrap();
        assert!(positive.ends_with(", anime style, ink lines"), "{positive}");
        assert!(positive.starts_with("a castle") || positive.starts_with("a forest"));
        assert_eq!(job.params.negative_prompt.as_deref(), Some("blurry"));
        assert_eq!(job.workflow["6"]["inputs"]["text"], positive.as_str());

        let job = builder
            .build(2, &selection(&config, false), &mut StdRng::seed_from_u64(2))
            .unwrap();
        assert!(job.params.positive_prompt.unwrap().ends_with(", anime style"));
        assert!(job.params.negative_prompt.is_none());
    }

    #[test]
    fn merge_prompt_skips_blank_and_repeated_parts() {
        assert_eq!(
            merge_prompt(Some("a castle".into()), ["", "night", "a castle"].into_iter()),
            Some("a castle, night".into())
        );
        assert_eq!(merge_prompt(None, std::iter::empty()), None);
    }

    #[test]
    fn configured_seed_is_used_verbatim() {
        let mut settings = Settings::from_yaml_str(SETTINGS).unwrap();
        settings.generation.seed = Some(42);
        let base = config();
        let config = ConfigModel::from_parts(
            settings,
            base.checkpoint_types().to_vec(),
            base.template().clone(),
        )
        .unwrap();
        let builder = JobBuilder::new(&config, "run");
        let job = builder
            .build(0, &selection(&config, false), &mut StdRng::seed_from_u64(8))
            .unwrap();
        assert_eq!(job.params.seed, 42);
    }

    #[test]
    fn malformed_range_fails_build() {
        let mut settings = Settings::from_yaml_str(SETTINGS).unwrap();
        settings.generation.steps = crate::params::IntParam::Range([9, 3]);
        let base = config();
        let config = ConfigModel::from_parts(
            settings,
            base.checkpoint_types().to_vec(),
            base.template().clone(),
        )
        .unwrap();
        let builder = JobBuilder::new(&config, "run");
        assert_matches!(
            builder.build(0, &selection(&config, false), &mut StdRng::seed_from_u64(8)),
            Err(CoreError::Configuration(_))
        );
    }
}
