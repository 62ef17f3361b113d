//! Weighted checkpoint and LoRA selection.
//!
//! A draw first picks a checkpoint type by cumulative weight, then a
//! checkpoint of that type, then the optional character LoRA and the regular
//! LoRAs. Selection is a pure function of the catalog, the LoRA settings and
//! the RNG stream.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::catalog::{CheckpointRef, CheckpointType, LoraRef, ModelRef};
use crate::config::ConfigModel;
use crate::error::CoreError;
use crate::settings::{CharacterSettings, LoraSettings};

// ---------------------------------------------------------------------------
// Cumulative weight table
// ---------------------------------------------------------------------------

/// Cumulative sums over a weight list. Zero weights never win a draw.
#[derive(Debug, Clone)]
pub struct CumulativeWeights {
    cumulative: Vec<u64>,
    total: u64,
}

impl CumulativeWeights {
    /// `None` when the weights sum to zero (or the list is empty).
    pub fn new(weights: impl IntoIterator<Item = u32>) -> Option<Self> {
        let mut total = 0u64;
        let cumulative: Vec<u64> = weights
            .into_iter()
            .map(|w| {
                total += u64::from(w);
                total
            })
            .collect();
        (total > 0).then_some(Self { cumulative, total })
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Draw in `[0, total)` and return the index of the bucket it lands in.
    /// Earlier entries win ties.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> usize {
        let draw = rng.random_range(0..self.total);
        self.cumulative.partition_point(|&c| c <= draw)
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// The checkpoint and LoRA combination chosen for one or more jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSelection {
    pub checkpoint_type: String,
    pub checkpoint: CheckpointRef,
    /// Character LoRA, first in the chain when present.
    pub character: Option<LoraRef>,
    /// Regular LoRAs in catalog order.
    pub loras: Vec<LoraRef>,
}

/// Draw a selection from the configuration.
pub fn select<R: Rng>(config: &ConfigModel, rng: &mut R) -> Result<CheckpointSelection, CoreError> {
    select_from(
        config.checkpoint_types(),
        &config.settings().loras,
        &config.settings().characters,
        rng,
    )
}

/// Draw a selection from an explicit catalog.
pub fn select_from<R: Rng>(
    types: &[CheckpointType],
    loras: &LoraSettings,
    characters: &CharacterSettings,
    rng: &mut R,
) -> Result<CheckpointSelection, CoreError> {
    let checkpoint_type = select_type(types, rng)?;
    let checkpoint = select_checkpoint(checkpoint_type, rng)?.clone();
    Ok(select_adapters(checkpoint_type, checkpoint, loras, characters, rng))
}

/// Pick a checkpoint type by cumulative weight over enabled types.
pub fn select_type<'a, R: Rng>(
    types: &'a [CheckpointType],
    rng: &mut R,
) -> Result<&'a CheckpointType, CoreError> {
    if types.is_empty() {
        return Err(CoreError::config("checkpoint type table is empty"));
    }
    let table = CumulativeWeights::new(types.iter().map(|t| t.weight)).ok_or_else(|| {
        CoreError::config("no checkpoint type has a positive weight")
    })?;
    Ok(&types[table.sample(rng)])
}

/// The first selection of a run, pinned to `"<type>/<file>"`.
///
/// Returns `Ok(None)` when the checkpoint is not in the catalog so the run
/// falls back to a weighted draw.
pub fn select_start<R: Rng>(
    config: &ConfigModel,
    start: &str,
    rng: &mut R,
) -> Result<Option<CheckpointSelection>, CoreError> {
    let Some((type_name, file)) = start.split_once('/') else {
        return Err(CoreError::config(format!(
            "run.start_checkpoint '{start}' must be '<type>/<file>'"
        )));
    };
    let Some(checkpoint_type) = config
        .checkpoint_types()
        .iter()
        .find(|t| t.name == type_name)
    else {
        tracing::warn!(start, "Start checkpoint type not found, using weighted draw");
        return Ok(None);
    };
    let wanted = file.trim_end_matches(".safetensors");
    let Some(checkpoint) = checkpoint_type
        .checkpoints
        .iter()
        .find(|c| c.display_name == wanted || c.name == start)
    else {
        tracing::warn!(start, "Start checkpoint not found, using weighted draw");
        return Ok(None);
    };

    Ok(Some(select_adapters(
        checkpoint_type,
        checkpoint.clone(),
        &config.settings().loras,
        &config.settings().characters,
        rng,
    )))
}

/// Draw a new character (and with it new LoRAs) for `selection`, keeping
/// its checkpoint.
pub fn redraw_character<R: Rng>(
    config: &ConfigModel,
    selection: &mut CheckpointSelection,
    rng: &mut R,
) -> Result<(), CoreError> {
    let checkpoint_type = type_named(config, &selection.checkpoint_type)?;
    selection.character = pick_character(checkpoint_type, &config.settings().characters, rng);
    selection.loras = pick_loras(checkpoint_type, &config.settings().loras, rng);
    Ok(())
}

/// Draw new LoRAs for `selection`, keeping its checkpoint and character.
pub fn redraw_loras<R: Rng>(
    config: &ConfigModel,
    selection: &mut CheckpointSelection,
    rng: &mut R,
) -> Result<(), CoreError> {
    let checkpoint_type = type_named(config, &selection.checkpoint_type)?;
    selection.loras = pick_loras(checkpoint_type, &config.settings().loras, rng);
    Ok(())
}

// ---- private helpers ----

fn type_named<'a>(config: &'a ConfigModel, name: &str) -> Result<&'a CheckpointType, CoreError> {
    config
        .checkpoint_types()
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| CoreError::Configuration(format!("unknown checkpoint type '{name}'")))
}

fn select_checkpoint<'a, R: Rng>(
    checkpoint_type: &'a CheckpointType,
    rng: &mut R,
) -> Result<&'a CheckpointRef, CoreError> {
    if checkpoint_type.checkpoints.is_empty() {
        return Err(CoreError::Configuration(format!(
            "checkpoint type '{}' has no checkpoint files",
            checkpoint_type.name
        )));
    }
    Ok(pick_weighted(
        &checkpoint_type.checkpoints,
        &checkpoint_type.weighted,
        checkpoint_type.weighted_probability,
        rng,
    ))
}

/// With `probability`, draw among the weighted entries by weight; otherwise
/// uniformly among the unweighted ones. Falls back to all entries when the
/// chosen side is empty. `all` must not be empty.
fn pick_weighted<'a, R: Rng>(
    all: &'a [ModelRef],
    weighted: &[(usize, u32)],
    probability: f64,
    rng: &mut R,
) -> &'a ModelRef {
    if let Some(table) = CumulativeWeights::new(weighted.iter().map(|(_, w)| *w)) {
        if rng.random_bool(probability) {
            let (index, _) = weighted[table.sample(rng)];
            return &all[index];
        }
        let unweighted: Vec<&ModelRef> = all
            .iter()
            .enumerate()
            .filter(|(i, _)| !weighted.iter().any(|(w, _)| w == i))
            .map(|(_, m)| m)
            .collect();
        if !unweighted.is_empty() {
            return unweighted[rng.random_range(0..unweighted.len())];
        }
    }
    &all[rng.random_range(0..all.len())]
}

fn pick_character<R: Rng>(
    checkpoint_type: &CheckpointType,
    characters: &CharacterSettings,
    rng: &mut R,
) -> Option<LoraRef> {
    if checkpoint_type.characters.is_empty() || rng.random_bool(characters.skip_probability) {
        return None;
    }
    Some(
        pick_weighted(
            &checkpoint_type.characters,
            &checkpoint_type.weighted_characters,
            characters.weighted_probability,
            rng,
        )
        .clone(),
    )
}

fn pick_loras<R: Rng>(
    checkpoint_type: &CheckpointType,
    loras: &LoraSettings,
    rng: &mut R,
) -> Vec<LoraRef> {
    let mut order: Vec<usize> = (0..checkpoint_type.loras.len()).collect();
    order.shuffle(rng);
    let mut picked: Vec<usize> = Vec::new();
    for index in order {
        if picked.len() >= loras.max_count {
            break;
        }
        if rng.random_bool(loras.probability) {
            picked.push(index);
        }
    }
    picked.sort_unstable();
    picked
        .into_iter()
        .map(|i| checkpoint_type.loras[i].clone())
        .collect()
}

fn select_adapters<R: Rng>(
    checkpoint_type: &CheckpointType,
    checkpoint: CheckpointRef,
    loras: &LoraSettings,
    characters: &CharacterSettings,
    rng: &mut R,
) -> CheckpointSelection {
    let character = pick_character(checkpoint_type, characters, rng);
    CheckpointSelection {
        checkpoint_type: checkpoint_type.name.clone(),
        checkpoint,
        character,
        loras: pick_loras(checkpoint_type, loras, rng),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::path::Path;

    fn model(name: &str) -> ModelRef {
        ModelRef::under_root(Path::new("/m"), &Path::new("/m").join(format!("{name}.safetensors")))
    }

    fn kind(name: &str, weight: u32) -> CheckpointType {
        CheckpointType::new(name, weight, vec![model(&format!("{name}/base"))])
    }

    #[test]
    fn cumulative_weights_skip_zero_buckets() {
        let table = CumulativeWeights::new([0, 2, 0, 1]).unwrap();
        assert_eq!(table.total(), 3);
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..100 {
            let i = table.sample(&mut rng);
            assert!(i == 1 || i == 3);
        }
    }

    #[test]
    fn cumulative_weights_reject_zero_total() {
        assert!(CumulativeWeights::new([0, 0]).is_none());
        assert!(CumulativeWeights::new(Vec::<u32>::new()).is_none());
    }

    #[test]
    fn selection_converges_to_weights() {
        let types = vec![kind("A", 3), kind("B", 1)];
        let mut rng = StdRng::seed_from_u64(42);
        let mut a = 0;
        for _ in 0..1000 {
            let s = select_from(
                &types,
                &LoraSettings::default(),
                &CharacterSettings::default(),
                &mut rng,
            )
            .unwrap();
            if s.checkpoint_type == "A" {
                a += 1;
            }
        }
        assert!((700..=800).contains(&a), "A drawn {a} times");
    }

    #[test]
    fn disabled_type_is_never_selected() {
        let types = vec![kind("A", 0), kind("B", 1)];
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..100 {
            assert_eq!(select_type(&types, &mut rng).unwrap().name, "B");
        }
    }

    #[test]
    fn empty_and_zero_tables_fail() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_matches!(select_type(&[], &mut rng), Err(CoreError::Configuration(_)));
        let zero = vec![kind("A", 0), kind("B", 0)];
        assert_matches!(select_type(&zero, &mut rng), Err(CoreError::Configuration(_)));
    }

    #[test]
    fn type_without_checkpoints_fails() {
        let types = vec![CheckpointType::new("A", 1, vec![])];
        let mut rng = StdRng::seed_from_u64(1);
        assert_matches!(
            select_from(&types, &LoraSettings::default(), &CharacterSettings::default(), &mut rng),
            Err(CoreError::Configuration(msg)) if msg.contains("'A'")
        );
    }

    #[test]
    fn lora_count_is_capped_and_ordered() {
        let loras: Vec<ModelRef> = (0..6).map(|i| model(&format!("A/etc/l{i}"))).collect();
        let types = vec![kind("A", 1).with_loras(loras)];
        let settings = LoraSettings {
            probability: 1.0,
            max_count: 2,
            ..LoraSettings::default()
        };
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..50 {
            let s = select_from(&types, &settings, &CharacterSettings::default(), &mut rng).unwrap();
            assert_eq!(s.loras.len(), 2);
            assert!(s.loras[0].name < s.loras[1].name);
        }
    }

    #[test]
    fn zero_probability_selects_no_loras() {
        let types = vec![kind("A", 1).with_loras(vec![model("A/etc/x")])];
        let mut rng = StdRng::seed_from_u64(2);
        let s = select_from(&types, &LoraSettings::default(), &CharacterSettings::default(), &mut rng)
            .unwrap();
        assert!(s.loras.is_empty());
    }

    #[test]
    fn character_is_skipped_or_drawn() {
        let types = vec![kind("A", 1).with_characters(vec![model("A/char/hero")])];
        let mut rng = StdRng::seed_from_u64(2);
        let always = CharacterSettings {
            skip_probability: 0.0,
            ..CharacterSettings::default()
        };
        let s = select_from(&types, &LoraSettings::default(), &always, &mut rng).unwrap();
        assert_eq!(s.character.map(|c| c.display_name), Some("hero".to_string()));

        let never = CharacterSettings {
            skip_probability: 1.0,
            ..CharacterSettings::default()
        };
        let s = select_from(&types, &LoraSettings::default(), &never, &mut rng).unwrap();
        assert!(s.character.is_none());
    }

    #[test]
    fn weighted_checkpoints_are_preferred() {
        let refs = vec![model("A/a"), model("A/b"), model("A/c")];
        let types = vec![CheckpointType::new("A", 1, refs).with_checkpoint_weights([("c", 1)], 1.0)];
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..50 {
            let s = select_from(&types, &LoraSettings::default(), &CharacterSettings::default(), &mut rng)
                .unwrap();
            assert_eq!(s.checkpoint.display_name, "c");
        }
    }

    #[test]
    fn weighted_characters_are_preferred() {
        let chars = vec![model("A/char/hero"), model("A/char/rogue"), model("A/char/mage")];
        let types = vec![kind("A", 1)
            .with_characters(chars)
            .with_character_weights([("rogue", 1)])];
        let always = CharacterSettings {
            skip_probability: 0.0,
            weighted_probability: 1.0,
            ..CharacterSettings::default()
        };
        let mut rng = StdRng::seed_from_u64(6);
        for _ in 0..50 {
            let s = select_from(&types, &LoraSettings::default(), &always, &mut rng).unwrap();
            assert_eq!(s.character.unwrap().display_name, "rogue");
        }

        let unweighted_only = CharacterSettings {
            weighted_probability: 0.0,
            ..always
        };
        for _ in 0..50 {
            let s = select_from(&types, &LoraSettings::default(), &unweighted_only, &mut rng).unwrap();
            assert_ne!(s.character.unwrap().display_name, "rogue");
        }
    }

    #[test]
    fn same_seed_same_selection() {
        let types = vec![kind("A", 3), kind("B", 1)];
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..20)
                .map(|_| {
                    select_from(&types, &LoraSettings::default(), &CharacterSettings::default(), &mut rng)
                        .unwrap()
                        .checkpoint_type
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(77), draw(77));
    }
}
