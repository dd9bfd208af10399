//! Hyperparameter search space and sampled configurations.

use crate::error::MlError;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stepped integer range, bounds inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntRange {
    pub min: usize,
    pub max: usize,
    pub step: usize,
    pub default: Option<usize>,
}

impl IntRange {
    pub fn new(min: usize, max: usize, step: usize) -> Self {
        Self {
            min,
            max,
            step,
            default: None,
        }
    }

    pub fn with_default(mut self, default: usize) -> Self {
        self.default = Some(default);
        self
    }

    pub fn default_value(&self) -> usize {
        self.default.unwrap_or(self.min)
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let steps = (self.max - self.min) / self.step;
        self.min + rng.gen_range(0..=steps) * self.step
    }

    pub fn contains(&self, value: usize) -> bool {
        (self.min..=self.max).contains(&value) && (value - self.min) % self.step == 0
    }

    fn validate(&self, name: &str) -> Result<(), MlError> {
        if self.step == 0 || self.min > self.max {
            return Err(MlError::invalid_input(format!(
                "{name}: empty range {}..={} step {}",
                self.min, self.max, self.step
            )));
        }
        if self.default.is_some_and(|d| !self.contains(d)) {
            return Err(MlError::invalid_input(format!("{name}: default outside range")));
        }
        Ok(())
    }
}

/// Stepped float range, bounds inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub default: Option<f64>,
}

impl FloatRange {
    pub fn new(min: f64, max: f64, step: f64) -> Self {
        Self {
            min,
            max,
            step,
            default: None,
        }
    }

    pub fn with_default(mut self, default: f64) -> Self {
        self.default = Some(default);
        self
    }

    pub fn default_value(&self) -> f64 {
        self.default.unwrap_or(self.min)
    }

    fn steps(&self) -> usize {
        ((self.max - self.min) / self.step + 1e-9).floor() as usize
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let k = rng.gen_range(0..=self.steps());
        round_to_grid(self.min + k as f64 * self.step)
    }

    pub fn contains(&self, value: f64) -> bool {
        if value < self.min - 1e-9 || value > self.max + 1e-9 {
            return false;
        }
        let k = (value - self.min) / self.step;
        (k - k.round()).abs() < 1e-6
    }

    fn validate(&self, name: &str) -> Result<(), MlError> {
        if self.step.is_nan() || self.step <= 0.0 || self.min > self.max {
            return Err(MlError::invalid_input(format!(
                "{name}: empty range {}..={} step {}",
                self.min, self.max, self.step
            )));
        }
        if self.default.is_some_and(|d| !self.contains(d)) {
            return Err(MlError::invalid_input(format!("{name}: default outside range")));
        }
        Ok(())
    }
}

// 0.1 + 0.05 * 3 prints as 0.25, not 0.25000000000000006.
fn round_to_grid(x: f64) -> f64 {
    (x * 1e9).round() / 1e9
}

/// One convolution block: conv, 2x2 max-pool, dropout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvBlock {
    pub filters: usize,
    pub dropout: f64,
}

/// One dense block: dense ReLU layer, dropout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseBlock {
    pub units: usize,
    pub dropout: f64,
}

/// A point in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperParameters {
    pub conv_blocks: Vec<ConvBlock>,
    pub dense_blocks: Vec<DenseBlock>,
    pub learning_rate: f64,
}

impl HyperParameters {
    /// SHA-256 of the canonical JSON encoding; equal configurations hash equal.
    pub fn canonical_hash(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(&json))
    }
}

impl std::fmt::Display for HyperParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conv [")?;
        for (i, b) in self.conv_blocks.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} filters/{:.2} dropout", b.filters, b.dropout)?;
        }
        write!(f, "] dense [")?;
        for (i, b) in self.dense_blocks.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} units/{:.2} dropout", b.units, b.dropout)?;
        }
        write!(f, "] learning rate {}", self.learning_rate)
    }
}

/// The tunable dimensions of the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub conv_blocks: IntRange,
    pub filters: IntRange,
    pub conv_dropout: FloatRange,
    pub dense_blocks: IntRange,
    pub units: IntRange,
    pub dense_dropout: FloatRange,
    pub learning_rates: Vec<f64>,
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            conv_blocks: IntRange::new(1, 3, 1).with_default(2),
            filters: IntRange::new(32, 256, 32),
            conv_dropout: FloatRange::new(0.0, 0.5, 0.05).with_default(0.25),
            dense_blocks: IntRange::new(1, 2, 1).with_default(1),
            units: IntRange::new(32, 512, 32),
            dense_dropout: FloatRange::new(0.0, 0.5, 0.05).with_default(0.5),
            learning_rates: vec![1e-2, 1e-3, 1e-4],
        }
    }
}

impl SearchSpace {
    pub fn validate(&self) -> Result<(), MlError> {
        self.conv_blocks.validate("conv_blocks")?;
        self.filters.validate("filters")?;
        self.conv_dropout.validate("conv_dropout")?;
        self.dense_blocks.validate("dense_blocks")?;
        self.units.validate("units")?;
        self.dense_dropout.validate("dense_dropout")?;
        if self.learning_rates.is_empty() || self.learning_rates.iter().any(|lr| *lr <= 0.0) {
            return Err(MlError::invalid_input(
                "learning_rates must be a non-empty list of positive values",
            ));
        }
        Ok(())
    }

    /// Draw one configuration uniformly from every dimension.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> HyperParameters {
        let conv_blocks = (0..self.conv_blocks.sample(rng))
            .map(|_| ConvBlock {
                filters: self.filters.sample(rng),
                dropout: self.conv_dropout.sample(rng),
            })
            .collect();
        let dense_blocks = (0..self.dense_blocks.sample(rng))
            .map(|_| DenseBlock {
                units: self.units.sample(rng),
                dropout: self.dense_dropout.sample(rng),
            })
            .collect();
        let learning_rate = self
            .learning_rates
            .choose(rng)
            .copied()
            .unwrap_or(1e-3);
        HyperParameters {
            conv_blocks,
            dense_blocks,
            learning_rate,
        }
    }

    /// Every dimension at its default value.
    pub fn defaults(&self) -> HyperParameters {
        HyperParameters {
            conv_blocks: vec![
                ConvBlock {
                    filters: self.filters.default_value(),
                    dropout: self.conv_dropout.default_value(),
                };
                self.conv_blocks.default_value()
            ],
            dense_blocks: vec![
                DenseBlock {
                    units: self.units.default_value(),
                    dropout: self.dense_dropout.default_value(),
                };
                self.dense_blocks.default_value()
            ],
            learning_rate: self.learning_rates.first().copied().unwrap_or(1e-3),
        }
    }

    pub fn contains(&self, hp: &HyperParameters) -> bool {
        self.conv_blocks.contains(hp.conv_blocks.len())
            && self.dense_blocks.contains(hp.dense_blocks.len())
            && hp
                .conv_blocks
                .iter()
                .all(|b| self.filters.contains(b.filters) && self.conv_dropout.contains(b.dropout))
            && hp
                .dense_blocks
                .iter()
                .all(|b| self.units.contains(b.units) && self.dense_dropout.contains(b.dropout))
            && self.learning_rates.contains(&hp.learning_rate)
    }

    /// Largest number of 2x2 pools any configuration applies.
    pub fn max_pools(&self) -> usize {
        self.conv_blocks.max
    }
}
