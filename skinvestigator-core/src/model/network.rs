//! Candle realisation of a [`ModelSpec`]: layers, weights and optimizer state.

use crate::data::Batch;
use crate::error::MlError;
use crate::model::architecture::{
    Activation, INPUT_CHANNELS, LayerConfig, LayerShape, ModelSpec, OptimizerConfig,
};
use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{AdamW, Conv2d, Conv2dConfig, Dropout, Linear, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use std::collections::HashMap;
use std::sync::MutexGuard;

enum Layer {
    Conv { conv: Conv2d, activation: Activation },
    Pool(usize),
    Dropout(Dropout),
    Flatten,
    Dense { linear: Linear, activation: Activation },
}

/// Result of running one batch through the network.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Mean binary cross-entropy over the batch.
    pub loss: f64,
    /// Sigmoid outputs, one per sample.
    pub probabilities: Vec<f32>,
}

/// Deep copy of every weight, keyed by variable name.
#[derive(Debug, Clone)]
pub struct WeightSnapshot {
    tensors: HashMap<String, Tensor>,
}

impl WeightSnapshot {
    pub fn tensors(&self) -> &HashMap<String, Tensor> {
        &self.tensors
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Largest absolute element difference against `other`; `None` when the
    /// two snapshots hold different variables or shapes.
    pub fn max_abs_diff(&self, other: &WeightSnapshot) -> Result<Option<f32>, MlError> {
        if self.tensors.len() != other.tensors.len() {
            return Ok(None);
        }
        let mut worst = 0f32;
        for (name, a) in &self.tensors {
            let Some(b) = other.tensors.get(name) else {
                return Ok(None);
            };
            if a.dims() != b.dims() {
                return Ok(None);
            }
            let diff = (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
            worst = worst.max(diff);
        }
        Ok(Some(worst))
    }
}

/// A compiled binary classifier: layer graph, weights, Adam state and the
/// tracked metric set.
pub struct Model {
    spec: ModelSpec,
    varmap: VarMap,
    layers: Vec<Layer>,
    output: Linear,
    optimizer: AdamW,
    device: Device,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("spec", &self.spec)
            .field("device", &self.device)
            .field("learning_rate", &self.learning_rate())
            .finish()
    }
}

impl Model {
    /// Instantiate `spec` with freshly initialised weights.
    pub fn new(spec: ModelSpec, device: &Device) -> Result<Self, MlError> {
        spec.validate()?;
        let shapes = spec.output_shapes()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let mut layers = Vec::with_capacity(spec.layers.len());
        let mut previous = LayerShape::Spatial(INPUT_CHANNELS, spec.input.height, spec.input.width);
        let (mut conv_index, mut dense_index) = (0, 0);
        for (config, shape) in spec.layers.iter().zip(&shapes) {
            let layer = match config {
                LayerConfig::Conv2d {
                    filters,
                    kernel_size,
                    activation,
                } => {
                    let LayerShape::Spatial(in_channels, _, _) = previous else {
                        return Err(MlError::model("conv2d requires a spatial input"));
                    };
                    let cfg = Conv2dConfig {
                        padding: kernel_size / 2,
                        ..Default::default()
                    };
                    let conv = candle_nn::conv2d(
                        in_channels,
                        *filters,
                        *kernel_size,
                        cfg,
                        vb.pp(format!("conv2d_{conv_index}")),
                    )?;
                    conv_index += 1;
                    Layer::Conv {
                        conv,
                        activation: *activation,
                    }
                }
                LayerConfig::MaxPool2d { pool_size } => Layer::Pool(*pool_size),
                LayerConfig::Dropout { rate } => Layer::Dropout(Dropout::new(*rate as f32)),
                LayerConfig::Flatten => Layer::Flatten,
                LayerConfig::Dense { units, activation } => {
                    let LayerShape::Flat(in_features) = previous else {
                        return Err(MlError::model("dense requires a flat input"));
                    };
                    let linear = candle_nn::linear(
                        in_features,
                        *units,
                        vb.pp(format!("dense_{dense_index}")),
                    )?;
                    dense_index += 1;
                    Layer::Dense {
                        linear,
                        activation: *activation,
                    }
                }
            };
            layers.push(layer);
            previous = *shape;
        }

        let LayerShape::Flat(in_features) = previous else {
            return Err(MlError::model("output layer requires a flat input"));
        };
        let output = candle_nn::linear(in_features, spec.output_units, vb.pp("output"))?;

        let optimizer = build_optimizer(&spec.optimizer, &varmap)?;
        tracing::debug!(
            layers = spec.layers.len(),
            variables = varmap.all_vars().len(),
            "Built model"
        );

        Ok(Self {
            spec,
            varmap,
            layers,
            output,
            optimizer,
            device: device.clone(),
        })
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Pre-activation output of the final unit, shape `[B]`.
    pub fn forward_logits(&self, images: &Tensor, train: bool) -> Result<Tensor, MlError> {
        let mut xs = images.clone();
        for layer in &self.layers {
            xs = match layer {
                Layer::Conv { conv, activation } => activate(conv.forward(&xs)?, *activation)?,
                Layer::Pool(size) => xs.max_pool2d(*size)?,
                Layer::Dropout(dropout) => dropout.forward(&xs, train)?,
                Layer::Flatten => xs.flatten_from(1)?,
                Layer::Dense { linear, activation } => {
                    activate(linear.forward(&xs)?, *activation)?
                }
            };
        }
        Ok(self.output.forward(&xs)?.squeeze(1)?)
    }

    /// Sigmoid probabilities in inference mode.
    pub fn predict(&self, images: &Tensor) -> Result<Vec<f32>, MlError> {
        let logits = self.forward_logits(images, false)?;
        Ok(candle_nn::ops::sigmoid(&logits)?.to_vec1::<f32>()?)
    }

    /// One optimisation step on `batch` with dropout active.
    ///
    /// The returned probabilities are those computed before the update.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepOutput, MlError> {
        let logits = self.forward_logits(&batch.images, true)?;
        let loss = binary_cross_entropy_with_logits(&logits, &batch.labels)?;
        let loss_value = f64::from(loss.to_scalar::<f32>()?);
        if !loss_value.is_finite() {
            return Err(MlError::training(format!(
                "loss diverged to {loss_value}"
            )));
        }
        let probabilities = candle_nn::ops::sigmoid(&logits)?.to_vec1::<f32>()?;
        self.optimizer.backward_step(&loss)?;
        Ok(StepOutput {
            loss: loss_value,
            probabilities,
        })
    }

    /// Loss and probabilities on `batch` in inference mode.
    pub fn evaluate_step(&self, batch: &Batch) -> Result<StepOutput, MlError> {
        let logits = self.forward_logits(&batch.images, false)?;
        let loss = binary_cross_entropy_with_logits(&logits, &batch.labels)?;
        Ok(StepOutput {
            loss: f64::from(loss.to_scalar::<f32>()?),
            probabilities: candle_nn::ops::sigmoid(&logits)?.to_vec1::<f32>()?,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }

    pub fn parameter_count(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Every weight tensor sorted by name. The tensors share storage with the
    /// live variables.
    pub fn named_tensors(&self) -> Result<Vec<(String, Tensor)>, MlError> {
        let vars = self.lock_vars()?;
        let mut tensors: Vec<(String, Tensor)> = vars
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        tensors.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(tensors)
    }

    pub fn snapshot(&self) -> Result<WeightSnapshot, MlError> {
        let vars = self.lock_vars()?;
        let mut tensors = HashMap::with_capacity(vars.len());
        for (name, var) in vars.iter() {
            tensors.insert(name.clone(), var.as_tensor().copy()?);
        }
        Ok(WeightSnapshot { tensors })
    }

    pub fn restore(&mut self, snapshot: &WeightSnapshot) -> Result<(), MlError> {
        self.load_weights(&snapshot.tensors)
    }

    /// Overwrite every variable from `tensors`; all names must be present
    /// with matching shapes. Nothing is written unless every tensor checks out.
    pub fn load_weights(&mut self, tensors: &HashMap<String, Tensor>) -> Result<(), MlError> {
        let vars = self.lock_vars()?;
        let mut staged = Vec::with_capacity(vars.len());
        for (name, var) in vars.iter() {
            let source = tensors
                .get(name)
                .ok_or_else(|| MlError::model(format!("missing weight tensor '{name}'")))?;
            if source.dims() != var.dims() {
                return Err(MlError::model(format!(
                    "weight '{name}' has shape {:?}, expected {:?}",
                    source.dims(),
                    var.dims()
                )));
            }
            staged.push((var, source.to_dtype(DType::F32)?.to_device(&self.device)?));
        }
        for (var, source) in staged {
            var.set(&source)?;
        }
        Ok(())
    }

    fn lock_vars(&self) -> Result<MutexGuard<'_, HashMap<String, Var>>, MlError> {
        self.varmap
            .data()
            .lock()
            .map_err(|_| MlError::model("weight store lock poisoned"))
    }
}

fn build_optimizer(config: &OptimizerConfig, varmap: &VarMap) -> Result<AdamW, MlError> {
    match config {
        OptimizerConfig::Adam {
            learning_rate,
            beta1,
            beta2,
            epsilon,
        } => {
            // AdamW without decay is plain Adam.
            let params = ParamsAdamW {
                lr: *learning_rate,
                beta1: *beta1,
                beta2: *beta2,
                eps: *epsilon,
                weight_decay: 0.0,
            };
            Ok(AdamW::new(varmap.all_vars(), params)?)
        }
    }
}

fn activate(xs: Tensor, activation: Activation) -> candle_core::Result<Tensor> {
    match activation {
        Activation::Relu => xs.relu(),
        Activation::Linear => Ok(xs),
    }
}

/// Mean binary cross-entropy of sigmoid(`logits`) against 0/1 `targets`,
/// in the overflow-free form `max(x, 0) - x*y + ln(1 + e^-|x|)`.
pub fn binary_cross_entropy_with_logits(
    logits: &Tensor,
    targets: &Tensor,
) -> candle_core::Result<Tensor> {
    let positive_part = logits.relu()?;
    let cross = (logits * targets)?;
    let softplus = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    ((positive_part - cross)? + softplus)?.mean_all()
}
