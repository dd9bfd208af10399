//! Declarative network architectures.
//!
//! A [`ModelSpec`] is plain data: it is what gets embedded in saved artifacts,
//! what the hyperparameter search produces, and what [`crate::model::Model`]
//! is instantiated from.

use crate::config::ImageSize;
use crate::error::MlError;
use crate::training::metrics::MetricKind;
use crate::tuner::HyperParameters;
use serde::{Deserialize, Serialize};

/// Colour channels of every input image.
pub const INPUT_CHANNELS: usize = 3;

/// Hidden-layer activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Linear,
}

/// Activation of the single-unit output layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputActivation {
    Sigmoid,
}

/// Layer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerConfig {
    /// Square kernel, `same` padding, stride 1.
    Conv2d {
        filters: usize,
        kernel_size: usize,
        activation: Activation,
    },
    MaxPool2d {
        pool_size: usize,
    },
    Dropout {
        rate: f64,
    },
    Flatten,
    Dense {
        units: usize,
        activation: Activation,
    },
}

impl LayerConfig {
    pub fn conv(filters: usize) -> Self {
        Self::Conv2d {
            filters,
            kernel_size: 3,
            activation: Activation::Relu,
        }
    }

    pub fn pool() -> Self {
        Self::MaxPool2d { pool_size: 2 }
    }

    pub fn dropout(rate: f64) -> Self {
        Self::Dropout { rate }
    }

    pub fn dense(units: usize) -> Self {
        Self::Dense {
            units,
            activation: Activation::Relu,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Conv2d { .. } => "conv2d",
            Self::MaxPool2d { .. } => "max_pooling2d",
            Self::Dropout { .. } => "dropout",
            Self::Flatten => "flatten",
            Self::Dense { .. } => "dense",
        }
    }
}

/// Optimizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Adam {
        learning_rate: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
    },
}

impl OptimizerConfig {
    pub fn adam(learning_rate: f64) -> Self {
        Self::Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Adam { learning_rate, .. } => *learning_rate,
        }
    }
}

/// Loss function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    BinaryCrossEntropy,
}

/// Output tensor shape of a layer, batch dimension omitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerShape {
    /// `(channels, height, width)`
    Spatial(usize, usize, usize),
    Flat(usize),
}

impl std::fmt::Display for LayerShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spatial(c, h, w) => write!(f, "(None, {h}, {w}, {c})"),
            Self::Flat(n) => write!(f, "(None, {n})"),
        }
    }
}

/// Full architecture configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub input: ImageSize,
    pub layers: Vec<LayerConfig>,
    pub output_units: usize,
    pub output_activation: OutputActivation,
    pub optimizer: OptimizerConfig,
    pub loss: LossKind,
    pub metrics: Vec<MetricKind>,
}

impl ModelSpec {
    /// The hand-tuned three-block classifier.
    pub fn fixed(input: ImageSize) -> Self {
        Self {
            input,
            layers: vec![
                LayerConfig::conv(128),
                LayerConfig::pool(),
                LayerConfig::dropout(0.1),
                LayerConfig::conv(256),
                LayerConfig::pool(),
                LayerConfig::dropout(0.15),
                LayerConfig::conv(192),
                LayerConfig::pool(),
                LayerConfig::dropout(0.3),
                LayerConfig::Flatten,
                LayerConfig::dense(64),
                LayerConfig::dropout(0.3),
                LayerConfig::dense(96),
                LayerConfig::dropout(0.1),
            ],
            output_units: 1,
            output_activation: OutputActivation::Sigmoid,
            optimizer: OptimizerConfig::adam(1e-3),
            loss: LossKind::BinaryCrossEntropy,
            metrics: MetricKind::all().to_vec(),
        }
    }

    /// Architecture described by one sampled point of the search space.
    pub fn from_hyperparameters(hp: &HyperParameters, input: ImageSize) -> Self {
        let mut layers = Vec::new();
        for block in &hp.conv_blocks {
            layers.push(LayerConfig::conv(block.filters));
            layers.push(LayerConfig::pool());
            layers.push(LayerConfig::dropout(block.dropout));
        }
        layers.push(LayerConfig::Flatten);
        for block in &hp.dense_blocks {
            layers.push(LayerConfig::dense(block.units));
            layers.push(LayerConfig::dropout(block.dropout));
        }
        Self {
            input,
            layers,
            output_units: 1,
            output_activation: OutputActivation::Sigmoid,
            optimizer: OptimizerConfig::adam(hp.learning_rate),
            loss: LossKind::BinaryCrossEntropy,
            metrics: MetricKind::all().to_vec(),
        }
    }

    /// Output shape after every layer, followed by the output layer's.
    ///
    /// Fails when a layer cannot accept its input, e.g. pooling a map that is
    /// already 1 pixel wide or a dense layer before flattening.
    pub fn output_shapes(&self) -> Result<Vec<LayerShape>, MlError> {
        let mut shape = LayerShape::Spatial(INPUT_CHANNELS, self.input.height, self.input.width);
        let mut shapes = Vec::with_capacity(self.layers.len() + 1);
        for (i, layer) in self.layers.iter().enumerate() {
            shape = match (layer, shape) {
                (LayerConfig::Conv2d { filters, kernel_size, .. }, LayerShape::Spatial(_, h, w)) => {
                    if *filters == 0 || *kernel_size == 0 || kernel_size % 2 == 0 {
                        return Err(MlError::model(format!(
                            "layer {i}: conv2d needs filters > 0 and an odd kernel"
                        )));
                    }
                    LayerShape::Spatial(*filters, h, w)
                }
                (LayerConfig::MaxPool2d { pool_size }, LayerShape::Spatial(c, h, w)) => {
                    if *pool_size == 0 || h < *pool_size || w < *pool_size {
                        return Err(MlError::model(format!(
                            "layer {i}: cannot pool a {h}x{w} map with size {pool_size}"
                        )));
                    }
                    LayerShape::Spatial(c, h / pool_size, w / pool_size)
                }
                (LayerConfig::Dropout { rate }, s) => {
                    if !(0.0..1.0).contains(rate) {
                        return Err(MlError::model(format!(
                            "layer {i}: dropout rate {rate} outside [0, 1)"
                        )));
                    }
                    s
                }
                (LayerConfig::Flatten, LayerShape::Spatial(c, h, w)) => LayerShape::Flat(c * h * w),
                (LayerConfig::Flatten, s @ LayerShape::Flat(_)) => s,
                (LayerConfig::Dense { units, .. }, LayerShape::Flat(_)) if *units > 0 => {
                    LayerShape::Flat(*units)
                }
                (layer, s) => {
                    return Err(MlError::model(format!(
                        "layer {i}: {} cannot follow output shape {s}",
                        layer.kind()
                    )));
                }
            };
            shapes.push(shape);
        }
        match shape {
            LayerShape::Flat(_) => shapes.push(LayerShape::Flat(self.output_units)),
            s => {
                return Err(MlError::model(format!(
                    "output layer needs a flat input, got {s}"
                )));
            }
        }
        Ok(shapes)
    }

    /// Layer table with output shapes and parameter counts.
    pub fn summary(&self) -> Result<ModelSummary, MlError> {
        let shapes = self.output_shapes()?;
        let mut rows = Vec::with_capacity(shapes.len());
        let mut previous = LayerShape::Spatial(INPUT_CHANNELS, self.input.height, self.input.width);
        let mut counters: std::collections::HashMap<&'static str, usize> = Default::default();
        for (layer, shape) in self.layers.iter().zip(&shapes) {
            let params = match (layer, previous) {
                (LayerConfig::Conv2d { filters, kernel_size, .. }, LayerShape::Spatial(c, _, _)) => {
                    kernel_size * kernel_size * c * filters + filters
                }
                (LayerConfig::Dense { units, .. }, LayerShape::Flat(n)) => n * units + units,
                _ => 0,
            };
            let kind = layer.kind();
            let index = counters.entry(kind).or_insert(0);
            rows.push(LayerSummary {
                name: format!("{kind}_{index}"),
                output_shape: shape.to_string(),
                params,
            });
            *index += 1;
            previous = *shape;
        }
        if let (LayerShape::Flat(n), Some(out)) = (previous, shapes.last()) {
            rows.push(LayerSummary {
                name: "output".to_string(),
                output_shape: out.to_string(),
                params: n * self.output_units + self.output_units,
            });
        }
        Ok(ModelSummary { rows })
    }

    /// Check the layer stack can be instantiated.
    pub fn validate(&self) -> Result<(), MlError> {
        if self.output_units != 1 {
            return Err(MlError::model(format!(
                "binary classifier needs a single output unit, got {}",
                self.output_units
            )));
        }
        if self.optimizer.learning_rate() <= 0.0 {
            return Err(MlError::model("learning rate must be positive"));
        }
        self.output_shapes().map(|_| ())
    }
}

/// One row of a [`ModelSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSummary {
    pub name: String,
    pub output_shape: String,
    pub params: usize,
}

/// Printable layer table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub rows: Vec<LayerSummary>,
}

impl ModelSummary {
    pub fn total_params(&self) -> usize {
        self.rows.iter().map(|r| r.params).sum()
    }
}

impl std::fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:<24} {:<24} {:>12}", "Layer", "Output Shape", "Param #")?;
        writeln!(f, "{}", "=".repeat(62))?;
        for row in &self.rows {
            writeln!(f, "{:<24} {:<24} {:>12}", row.name, row.output_shape, row.params)?;
        }
        writeln!(f, "{}", "=".repeat(62))?;
        write!(f, "Total params: {}", self.total_params())
    }
}
