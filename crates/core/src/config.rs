//! Immutable per-run configuration model.
//!
//! Bundles the validated [`Settings`], the resolved model catalog and the
//! workflow template. Built once at startup and passed by reference to the
//! selector, builder and orchestrator.

use std::path::Path;

use crate::catalog::CheckpointType;
use crate::error::CoreError;
use crate::settings::Settings;
use crate::workflow::WorkflowTemplate;

#[derive(Debug, Clone)]
pub struct ConfigModel {
    settings: Settings,
    types: Vec<CheckpointType>,
    template: WorkflowTemplate,
}

impl ConfigModel {
    /// Load a configuration file, scan the model directories and read the
    /// workflow template.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        Self::from_settings(Settings::from_file(path)?)
    }

    /// Validate already-parsed settings and resolve everything they point at.
    pub fn from_settings(settings: Settings) -> Result<Self, CoreError> {
        settings.check()?;

        let mut types = Vec::with_capacity(settings.checkpoint_types.len());
        for (name, type_settings) in settings.checkpoint_types.iter() {
            if type_settings.weight == 0 {
                tracing::debug!(checkpoint_type = name, "Checkpoint type disabled");
                types.push(CheckpointType::new(name, 0, Vec::new()));
                continue;
            }
            let resolved = CheckpointType::discover(name, type_settings, &settings)?;
            if resolved.checkpoints.is_empty() {
                return Err(CoreError::Configuration(format!(
                    "checkpoint type '{name}' has no checkpoint files under {}",
                    settings.paths.checkpoint_dir.join(name).display()
                )));
            }
            types.push(resolved);
        }

        let template = WorkflowTemplate::load(&settings.paths.workflow)?;
        Self::from_parts(settings, types, template)
    }

    /// Assemble a model from already-resolved parts.
    pub fn from_parts(
        settings: Settings,
        types: Vec<CheckpointType>,
        template: WorkflowTemplate,
    ) -> Result<Self, CoreError> {
        let lora_possible = settings.loras.probability > 0.0
            && types.iter().any(|t| t.is_enabled() && !t.loras.is_empty());
        let character_possible = settings.characters.skip_probability < 1.0
            && types.iter().any(|t| t.is_enabled() && !t.characters.is_empty());
        if (lora_possible || character_possible) && !template.has_lora_loader() {
            return Err(CoreError::config(
                "LoRAs are configured but the workflow template has no LoraLoader node",
            ));
        }

        if let Some(start) = &settings.run.start_checkpoint {
            if !start.contains('/') {
                return Err(CoreError::Configuration(format!(
                    "run.start_checkpoint '{start}' must be '<type>/<file>'"
                )));
            }
        }

        Ok(Self {
            settings,
            types,
            template,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Every declared checkpoint type, disabled ones included, in
    /// declaration order.
    pub fn checkpoint_types(&self) -> &[CheckpointType] {
        &self.types
    }

    pub fn template(&self) -> &WorkflowTemplate {
        &self.template
    }
}
