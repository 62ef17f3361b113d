//! Model file catalog.
//!
//! Resolves every enabled checkpoint type into its concrete checkpoint and
//! LoRA files. Files are discovered once at startup and never change for the
//! lifetime of a [`ConfigModel`](crate::config::ConfigModel).

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::CoreError;
use crate::settings::{CheckpointTypeSettings, OrderedMap, Settings, TriggerPrompt};

/// Extension of the model files the server loads.
pub const MODEL_EXTENSION: &str = "safetensors";

/// A model file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    /// Absolute path.
    pub path: PathBuf,
    /// Name the server knows the file by: path relative to the model root,
    /// `/`-separated.
    pub name: String,
    /// File stem, used for weights, filenames and log output.
    pub display_name: String,
}

pub type CheckpointRef = ModelRef;
pub type LoraRef = ModelRef;

impl ModelRef {
    /// Build a reference for `path` located under `root`.
    pub fn under_root(root: &Path, path: &Path) -> Self {
        let relative = path.strip_prefix(root).unwrap_or(path);
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let display_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        Self {
            path: path.to_path_buf(),
            name,
            display_name,
        }
    }
}

/// One checkpoint type with its resolved files.
#[derive(Debug, Clone)]
pub struct CheckpointType {
    pub name: String,
    pub weight: u32,
    pub checkpoints: Vec<CheckpointRef>,
    /// `(index into checkpoints, weight)` for individually weighted files.
    pub weighted: Vec<(usize, u32)>,
    pub weighted_probability: f64,
    pub loras: Vec<LoraRef>,
    pub characters: Vec<LoraRef>,
    /// `(index into characters, weight)` for individually weighted files.
    pub weighted_characters: Vec<(usize, u32)>,
    /// Prompt fragments keyed by file stem.
    pub triggers: OrderedMap<TriggerPrompt>,
}

impl CheckpointType {
    pub fn new(name: impl Into<String>, weight: u32, checkpoints: Vec<CheckpointRef>) -> Self {
        Self {
            name: name.into(),
            weight,
            checkpoints,
            weighted: Vec::new(),
            weighted_probability: 0.5,
            loras: Vec::new(),
            characters: Vec::new(),
            weighted_characters: Vec::new(),
            triggers: OrderedMap::default(),
        }
    }

    pub fn with_loras(mut self, loras: Vec<LoraRef>) -> Self {
        self.loras = loras;
        self
    }

    pub fn with_characters(mut self, characters: Vec<LoraRef>) -> Self {
        self.characters = characters;
        self
    }

    /// Attach per-checkpoint weights keyed by display name. Unknown names
    /// are ignored with a warning.
    pub fn with_checkpoint_weights<'a>(
        mut self,
        weights: impl IntoIterator<Item = (&'a str, u32)>,
        probability: f64,
    ) -> Self {
        self.weighted_probability = probability;
        self.weighted = resolve_weights(&self.name, "checkpoint", &self.checkpoints, weights);
        self
    }

    /// Attach per-character weights keyed by display name. Call after
    /// [`with_characters`](Self::with_characters).
    pub fn with_character_weights<'a>(
        mut self,
        weights: impl IntoIterator<Item = (&'a str, u32)>,
    ) -> Self {
        self.weighted_characters =
            resolve_weights(&self.name, "character", &self.characters, weights);
        self
    }

    pub fn with_triggers(mut self, triggers: OrderedMap<TriggerPrompt>) -> Self {
        self.triggers = triggers;
        self
    }

    /// Prompt fragments attached to the model file with stem `display_name`.
    pub fn trigger(&self, display_name: &str) -> Option<&TriggerPrompt> {
        self.triggers.get(display_name)
    }

    /// Whether this type takes part in selection.
    pub fn is_enabled(&self) -> bool {
        self.weight > 0
    }

    /// Scan the filesystem for one type's files.
    pub fn discover(
        name: &str,
        type_settings: &CheckpointTypeSettings,
        settings: &Settings,
    ) -> Result<Self, CoreError> {
        let paths = &settings.paths;
        let checkpoints = if type_settings.checkpoints.is_empty() {
            scan_models(&paths.checkpoint_dir, &paths.checkpoint_dir.join(name))?
        } else {
            type_settings
                .checkpoints
                .iter()
                .map(|relative| {
                    let path = paths.checkpoint_dir.join(relative);
                    if path.is_file() {
                        Ok(ModelRef::under_root(&paths.checkpoint_dir, &path))
                    } else {
                        Err(CoreError::Configuration(format!(
                            "checkpoint_types.{name}: checkpoint {} does not exist",
                            path.display()
                        )))
                    }
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        let type_lora_dir = paths.lora_dir.join(name);
        let loras = scan_models(&paths.lora_dir, &type_lora_dir.join(&settings.loras.subdir))?;
        let characters =
            scan_models(&paths.lora_dir, &type_lora_dir.join(&settings.characters.subdir))?;

        tracing::info!(
            checkpoint_type = name,
            checkpoints = checkpoints.len(),
            loras = loras.len(),
            characters = characters.len(),
            "Discovered model files",
        );

        Ok(Self::new(name, type_settings.weight, checkpoints)
            .with_loras(loras)
            .with_characters(characters)
            .with_checkpoint_weights(
                type_settings.checkpoint_weights.iter().map(|(k, w)| (k, *w)),
                type_settings.weighted_probability,
            )
            .with_character_weights(type_settings.character_weights.iter().map(|(k, w)| (k, *w)))
            .with_triggers(type_settings.triggers.clone()))
    }
}

/// Map `stem -> weight` entries onto indices into `models`. Unknown stems
/// are ignored with a warning.
fn resolve_weights<'a>(
    type_name: &str,
    kind: &str,
    models: &[ModelRef],
    weights: impl IntoIterator<Item = (&'a str, u32)>,
) -> Vec<(usize, u32)> {
    let mut resolved = Vec::new();
    for (stem, weight) in weights {
        match models.iter().position(|m| m.display_name == stem) {
            Some(index) => resolved.push((index, weight)),
            None => tracing::warn!(
                checkpoint_type = type_name,
                kind,
                name = stem,
                "Weighted model not found, ignoring",
            ),
        }
    }
    resolved
}

/// Recursively collect `*.safetensors` files under `dir`, sorted by name.
///
/// A missing directory yields an empty list; symlinked directories are
/// followed.
pub fn scan_models(root: &Path, dir: &Path) -> Result<Vec<ModelRef>, CoreError> {
    if !dir.exists() {
        tracing::debug!(dir = %dir.display(), "Model directory does not exist");
        return Ok(Vec::new());
    }

    let mut models = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.map_err(|e| CoreError::Io {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf()),
            source: e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
        })?;
        let is_model = entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == MODEL_EXTENSION);
        if is_model {
            models.push(ModelRef::under_root(root, entry.path()));
        }
    }
    models.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(models)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn model_ref_name_is_relative_and_slash_separated() {
        let r = ModelRef::under_root(
            Path::new("/models"),
            Path::new("/models/IL/sub/anime.safetensors"),
        );
        assert_eq!(r.name, "IL/sub/anime.safetensors");
        assert_eq!(r.display_name, "anime");
    }

    #[test]
    fn scan_finds_nested_safetensors_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("IL/b.safetensors"));
        touch(&root.join("IL/nested/a.safetensors"));
        touch(&root.join("IL/readme.txt"));

        let found = scan_models(root, &root.join("IL")).unwrap();
        let names: Vec<&str> = found.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["IL/b.safetensors", "IL/nested/a.safetensors"]);
    }

    #[test]
    fn scan_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let found = scan_models(dir.path(), &dir.path().join("nope")).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn checkpoint_weights_resolve_by_stem() {
        let refs = vec![
            ModelRef::under_root(Path::new("/m"), Path::new("/m/IL/a.safetensors")),
            ModelRef::under_root(Path::new("/m"), Path::new("/m/IL/b.safetensors")),
        ];
        let t = CheckpointType::new("IL", 1, refs)
            .with_checkpoint_weights([("b", 10), ("missing", 3)], 0.8);
        assert_eq!(t.weighted, vec![(1, 10)]);
        assert_eq!(t.weighted_probability, 0.8);
    }

    #[test]
    fn discover_attaches_character_weights_and_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("ckpt/IL/anime.safetensors"));
        touch(&root.join("lora/IL/char/hero.safetensors"));
        touch(&root.join("lora/IL/char/rogue.safetensors"));
        let doc = format!(
            "paths: {{ checkpoint_dir: {0}/ckpt, lora_dir: {0}/lora, output_dir: {0}/out, \
             data_dir: {0}/data }}\ncheckpoint_types:\n  IL:\n    weight: 1\n    \
             character_weights: {{ rogue: 4, ghost: 1 }}\n    triggers:\n      \
             anime: {{ positive: anime style }}\n",
            root.display()
        );
        let settings = Settings::from_yaml_str(&doc).unwrap();
        let type_settings = settings.checkpoint_types.get("IL").unwrap();

        let t = CheckpointType::discover("IL", type_settings, &settings).unwrap();
        assert_eq!(t.weighted_characters, vec![(1, 4)]);
        assert_eq!(
            t.trigger("anime").and_then(|p| p.positive.as_deref()),
            Some("anime style")
        );
        assert!(t.trigger("hero").is_none());
    }
}
