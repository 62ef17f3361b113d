//! Generation parameter values and how they are sampled.
//!
//! Numeric parameters are a fixed value or an inclusive `[min, max]` range.
//! Categorical parameters are a fixed value, a list sampled uniformly, or a
//! `{choice: weight}` map sampled by cumulative weight.

use rand::Rng;
use serde::Deserialize;

use crate::error::CoreError;
use crate::selector::CumulativeWeights;
use crate::settings::OrderedMap;

/// Integer parameter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum IntParam {
    Fixed(i64),
    Range([i64; 2]),
}

/// Floating-point parameter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FloatParam {
    Fixed(f64),
    Range([f64; 2]),
}

/// Categorical parameter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ChoiceParam {
    Fixed(String),
    Uniform(Vec<String>),
    Weighted(OrderedMap<u32>),
}

fn malformed(name: &str, detail: impl std::fmt::Display) -> CoreError {
    CoreError::Configuration(format!("{name}: {detail}"))
}

impl IntParam {
    /// Reject ranges with `min > max`.
    pub fn check(&self, name: &str) -> Result<(), CoreError> {
        match self {
            Self::Fixed(_) => Ok(()),
            Self::Range([min, max]) if min > max => {
                Err(malformed(name, format!("min {min} is greater than max {max}")))
            }
            Self::Range(_) => Ok(()),
        }
    }

    /// Reject values that can fall below `floor`.
    pub fn check_min(&self, name: &str, floor: i64) -> Result<(), CoreError> {
        let low = match self {
            Self::Fixed(v) => *v,
            Self::Range([min, _]) => *min,
        };
        if low < floor {
            return Err(malformed(name, format!("must be at least {floor}")));
        }
        Ok(())
    }

    /// Reject values that cannot be represented as `T`.
    pub fn check_fits<T: TryFrom<i64>>(&self, name: &str) -> Result<(), CoreError> {
        let (low, high) = match self {
            Self::Fixed(v) => (*v, *v),
            Self::Range([min, max]) => (*min, *max),
        };
        for v in [low, high] {
            if T::try_from(v).is_err() {
                return Err(malformed(
                    name,
                    format!("value {v} does not fit {}", std::any::type_name::<T>()),
                ));
            }
        }
        Ok(())
    }

    pub fn sample<R: Rng>(&self, rng: &mut R, name: &str) -> Result<i64, CoreError> {
        self.check(name)?;
        Ok(match self {
            Self::Fixed(v) => *v,
            Self::Range([min, max]) => rng.random_range(*min..=*max),
        })
    }

    /// Sample and convert into the target integer type.
    pub fn sample_as<T, R>(&self, rng: &mut R, name: &str) -> Result<T, CoreError>
    where
        T: TryFrom<i64>,
        R: Rng,
    {
        let v = self.sample(rng, name)?;
        T::try_from(v).map_err(|_| malformed(name, format!("value {v} is out of range")))
    }
}

impl FloatParam {
    pub fn check(&self, name: &str) -> Result<(), CoreError> {
        match self {
            Self::Fixed(v) if !v.is_finite() => Err(malformed(name, "must be finite")),
            Self::Fixed(_) => Ok(()),
            Self::Range([min, max]) if !min.is_finite() || !max.is_finite() => {
                Err(malformed(name, "bounds must be finite"))
            }
            Self::Range([min, max]) if min > max => {
                Err(malformed(name, format!("min {min} is greater than max {max}")))
            }
            Self::Range(_) => Ok(()),
        }
    }

    pub fn sample<R: Rng>(&self, rng: &mut R, name: &str) -> Result<f64, CoreError> {
        self.check(name)?;
        Ok(match self {
            Self::Fixed(v) => *v,
            Self::Range([min, max]) => rng.random_range(*min..=*max),
        })
    }
}

impl ChoiceParam {
    pub fn check(&self, name: &str) -> Result<(), CoreError> {
        match self {
            Self::Fixed(_) => Ok(()),
            Self::Uniform(choices) if choices.is_empty() => {
                Err(malformed(name, "choice list is empty"))
            }
            Self::Uniform(_) => Ok(()),
            Self::Weighted(map) if map.is_empty() => Err(malformed(name, "choice map is empty")),
            Self::Weighted(map) if map.iter().all(|(_, w)| *w == 0) => {
                Err(malformed(name, "choice weights sum to zero"))
            }
            Self::Weighted(_) => Ok(()),
        }
    }

    pub fn sample<R: Rng>(&self, rng: &mut R, name: &str) -> Result<String, CoreError> {
        self.check(name)?;
        match self {
            Self::Fixed(v) => Ok(v.clone()),
            Self::Uniform(choices) => Ok(choices[rng.random_range(0..choices.len())].clone()),
            Self::Weighted(map) => {
                let table = CumulativeWeights::new(map.iter().map(|(_, w)| *w))
                    .ok_or_else(|| malformed(name, "choice weights sum to zero"))?;
                let index = table.sample(rng);
                map.iter()
                    .nth(index)
                    .map(|(choice, _)| choice.to_string())
                    .ok_or_else(|| malformed(name, "weighted draw out of bounds"))
            }
        }
    }
}
