//! ComfyUI workflow template binding.
//!
//! The template is an API-format graph: an object keyed by node id where
//! each node has a `class_type` and an `inputs` object. Links between nodes
//! are encoded as `[source_node_id, output_slot]` arrays. Rendering writes
//! the job's checkpoint, sampler parameters, prompts, LoRA chain and output
//! prefix into a copy of the graph.

use std::path::Path;

use serde_json::{json, Map, Value};

use crate::error::CoreError;
use crate::job::{GenerationParams, LoraApplication};

// ---------------------------------------------------------------------------
// Node class types
// ---------------------------------------------------------------------------

const CHECKPOINT_LOADER_CLASS: &str = "CheckpointLoaderSimple";
const KSAMPLER_CLASS: &str = "KSampler";
const KSAMPLER_ADVANCED_CLASS: &str = "KSamplerAdvanced";
const EMPTY_LATENT_CLASS: &str = "EmptyLatentImage";
const CLIP_TEXT_ENCODE_CLASS: &str = "CLIPTextEncode";
const LORA_LOADER_CLASS: &str = "LoraLoader";
const SAVE_IMAGE_CLASS: &str = "SaveImage";

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// Everything that varies per job.
#[derive(Debug, Clone, Copy)]
pub struct WorkflowInputs<'a> {
    pub checkpoint_name: &'a str,
    /// Full loader chain, character LoRA first.
    pub loras: &'a [&'a LoraApplication],
    pub params: &'a GenerationParams,
    pub filename_prefix: &'a str,
}

/// A validated workflow graph with its binding points located.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    graph: Map<String, Value>,
    checkpoint_loaders: Vec<String>,
    samplers: Vec<String>,
    latents: Vec<String>,
    save_images: Vec<String>,
    positive_encoders: Vec<String>,
    negative_encoders: Vec<String>,
    lora_loader: Option<String>,
}

impl WorkflowTemplate {
    /// Read and validate a template file.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|e| {
            CoreError::Workflow(format!("{}: invalid JSON: {e}", path.display()))
        })?;
        Self::from_value(value)
    }

    /// Validate a parsed graph and locate the nodes rendering writes into.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        let Value::Object(graph) = value else {
            return Err(CoreError::Workflow(
                "workflow must be an object keyed by node id".to_string(),
            ));
        };
        if graph.is_empty() {
            return Err(CoreError::Workflow("workflow contains no nodes".to_string()));
        }

        let mut ids_by_class: Vec<(String, String)> = Vec::with_capacity(graph.len());
        for (id, node) in &graph {
            let class_type = node
                .get("class_type")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    CoreError::Workflow(format!("node '{id}' is missing 'class_type'"))
                })?;
            if !node.get("inputs").is_some_and(Value::is_object) {
                return Err(CoreError::Workflow(format!(
                    "node '{id}' is missing an 'inputs' object"
                )));
            }
            ids_by_class.push((class_type.to_string(), id.clone()));
        }
        let of_class = |classes: &[&str]| -> Vec<String> {
            let mut ids: Vec<String> = ids_by_class
                .iter()
                .filter(|(c, _)| classes.contains(&c.as_str()))
                .map(|(_, id)| id.clone())
                .collect();
            ids.sort();
            ids
        };

        let checkpoint_loaders = of_class(&[CHECKPOINT_LOADER_CLASS]);
        let samplers = of_class(&[KSAMPLER_CLASS, KSAMPLER_ADVANCED_CLASS]);
        let latents = of_class(&[EMPTY_LATENT_CLASS]);
        let save_images = of_class(&[SAVE_IMAGE_CLASS]);
        let lora_loaders = of_class(&[LORA_LOADER_CLASS]);

        for (ids, class) in [
            (&checkpoint_loaders, CHECKPOINT_LOADER_CLASS),
            (&samplers, KSAMPLER_CLASS),
            (&save_images, SAVE_IMAGE_CLASS),
        ] {
            if ids.is_empty() {
                return Err(CoreError::Workflow(format!(
                    "workflow has no {class} node"
                )));
            }
        }
        if lora_loaders.len() > 1 {
            return Err(CoreError::Workflow(format!(
                "workflow has {} {LORA_LOADER_CLASS} nodes, expected at most one",
                lora_loaders.len()
            )));
        }
        let lora_loader = lora_loaders.into_iter().next();
        if let Some(id) = &lora_loader {
            let inputs = &graph[id]["inputs"];
            if link_target(&inputs["model"]).is_none() || link_target(&inputs["clip"]).is_none() {
                return Err(CoreError::Workflow(format!(
                    "{LORA_LOADER_CLASS} node '{id}' must link its model and clip inputs"
                )));
            }
        }

        let encoder_for = |input: &str| -> Vec<String> {
            let mut ids: Vec<String> = samplers
                .iter()
                .filter_map(|s| link_target(&graph[s]["inputs"][input]))
                .filter(|(id, _)| {
                    graph.get(id.as_str()).and_then(|n| n["class_type"].as_str())
                        == Some(CLIP_TEXT_ENCODE_CLASS)
                })
                .map(|(id, _)| id)
                .collect();
            ids.sort();
            ids.dedup();
            ids
        };
        let positive_encoders = encoder_for("positive");
        let negative_encoders = encoder_for("negative");

        Ok(Self {
            graph,
            checkpoint_loaders,
            samplers,
            latents,
            save_images,
            positive_encoders,
            negative_encoders,
            lora_loader,
        })
    }

    /// Whether the template can apply LoRAs.
    pub fn has_lora_loader(&self) -> bool {
        self.lora_loader.is_some()
    }

    /// Render a submittable graph for one job.
    pub fn render(&self, inputs: &WorkflowInputs<'_>) -> Result<Value, CoreError> {
        let mut graph = self.graph.clone();
        let p = inputs.params;

        for id in &self.checkpoint_loaders {
            set_literal(&mut graph, id, "ckpt_name", json!(inputs.checkpoint_name));
        }
        for id in &self.samplers {
            let seed_key = if class_of(&graph, id) == Some(KSAMPLER_ADVANCED_CLASS) {
                "noise_seed"
            } else {
                "seed"
            };
            set_literal(&mut graph, id, seed_key, json!(p.seed));
            set_literal(&mut graph, id, "steps", json!(p.steps));
            set_literal(&mut graph, id, "cfg", json!(p.cfg));
            set_literal(&mut graph, id, "sampler_name", json!(p.sampler_name));
            set_literal(&mut graph, id, "scheduler", json!(p.scheduler));
            set_literal(&mut graph, id, "denoise", json!(p.denoise));
        }
        for id in &self.latents {
            set_literal(&mut graph, id, "width", json!(p.width));
            set_literal(&mut graph, id, "height", json!(p.height));
        }
        if let Some(text) = &p.positive_prompt {
            for id in &self.positive_encoders {
                set_literal(&mut graph, id, "text", json!(text));
            }
        }
        if let Some(text) = &p.negative_prompt {
            for id in &self.negative_encoders {
                set_literal(&mut graph, id, "text", json!(text));
            }
        }
        for id in &self.save_images {
            set_literal(&mut graph, id, "filename_prefix", json!(inputs.filename_prefix));
        }

        match (&self.lora_loader, inputs.loras.is_empty()) {
            (Some(id), true) => bypass_lora_loader(&mut graph, id)?,
            (Some(id), false) => expand_lora_chain(&mut graph, id, inputs.loras)?,
            (None, false) => {
                return Err(CoreError::Workflow(format!(
                    "job has LoRAs but the workflow has no {LORA_LOADER_CLASS} node"
                )));
            }
            (None, true) => {}
        }

        Ok(Value::Object(graph))
    }
}

// ---- private helpers ----

/// `[node_id, slot]` of a link input.
fn link_target(value: &Value) -> Option<(String, u64)> {
    match value.as_array().map(Vec::as_slice) {
        Some([Value::String(id), slot]) => slot.as_u64().map(|s| (id.clone(), s)),
        _ => None,
    }
}

fn class_of<'a>(graph: &'a Map<String, Value>, id: &str) -> Option<&'a str> {
    graph.get(id)?.get("class_type")?.as_str()
}

/// Overwrite `inputs[key]` when it exists and holds a literal. Links and
/// absent inputs are left untouched.
fn set_literal(graph: &mut Map<String, Value>, id: &str, key: &str, value: Value) -> bool {
    let Some(slot) = graph
        .get_mut(id)
        .and_then(|n| n.get_mut("inputs"))
        .and_then(|i| i.get_mut(key))
    else {
        return false;
    };
    if link_target(slot).is_some() {
        return false;
    }
    *slot = value;
    true
}

/// Point every input linked to `[from, slot]` at `to` instead.
fn relink(graph: &mut Map<String, Value>, from: &str, mut to: impl FnMut(u64) -> Option<Value>) {
    for node in graph.values_mut() {
        let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
            continue;
        };
        for value in inputs.values_mut() {
            if let Some((id, slot)) = link_target(value) {
                if id == from {
                    if let Some(replacement) = to(slot) {
                        *value = replacement;
                    }
                }
            }
        }
    }
}

fn bypass_lora_loader(graph: &mut Map<String, Value>, id: &str) -> Result<(), CoreError> {
    let node = graph
        .remove(id)
        .ok_or_else(|| CoreError::Workflow(format!("node '{id}' disappeared")))?;
    let model = node["inputs"]["model"].clone();
    let clip = node["inputs"]["clip"].clone();
    relink(graph, id, |slot| match slot {
        0 => Some(model.clone()),
        1 => Some(clip.clone()),
        _ => None,
    });
    Ok(())
}

fn expand_lora_chain(
    graph: &mut Map<String, Value>,
    id: &str,
    loras: &[&LoraApplication],
) -> Result<(), CoreError> {
    let template = graph
        .get(id)
        .cloned()
        .ok_or_else(|| CoreError::Workflow(format!("node '{id}' disappeared")))?;

    let mut next_id = graph
        .keys()
        .filter_map(|k| k.parse::<u64>().ok())
        .max()
        .unwrap_or(0)
        + 1;
    let mut chain_ids = vec![id.to_string()];
    for _ in 1..loras.len() {
        while graph.contains_key(&next_id.to_string()) {
            next_id += 1;
        }
        chain_ids.push(next_id.to_string());
        next_id += 1;
    }

    if let Some(last) = chain_ids.last().filter(|last| last.as_str() != id) {
        let last = last.clone();
        relink(graph, id, |slot| Some(json!([last, slot])));
    }

    for (index, (node_id, lora)) in chain_ids.iter().zip(loras).enumerate() {
        let mut node = template.clone();
        let inputs = &mut node["inputs"];
        inputs["lora_name"] = json!(lora.lora.name);
        inputs["strength_model"] = json!(lora.strength_model);
        inputs["strength_clip"] = json!(lora.strength_clip);
        if index > 0 {
            let prev = &chain_ids[index - 1];
            inputs["model"] = json!([prev, 0]);
            inputs["clip"] = json!([prev, 1]);
        }
        graph.insert(node_id.clone(), node);
    }
    Ok(())
}
