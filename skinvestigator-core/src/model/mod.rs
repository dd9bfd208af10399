//! Model definition, execution and persistence.

pub mod architecture;
pub mod io;
pub mod network;
pub mod quantize;

pub use architecture::{
    Activation, LayerConfig, LayerShape, LossKind, ModelSpec, ModelSummary, OptimizerConfig,
    OutputActivation,
};
pub use io::{load_model, quantized_path, save_model};
pub use network::{Model, StepOutput, WeightSnapshot};
pub use quantize::{QuantizationResult, QuantizedModel, quantize_model};
