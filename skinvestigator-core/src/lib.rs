//! # skinvestigator-core: training orchestration for skin-lesion classifiers
//!
//! A [`TrainingSession`] takes a binary image classifier from class-folder
//! corpora to saved artifacts in four phases:
//!
//! 1. **Data provisioning**: scanned folders become restartable, shuffled
//!    batch streams with optional augmentation ([`data`]).
//! 2. **Model definition**: a fixed convolutional architecture or one found
//!    by Hyperband search ([`model`], [`tuner`]).
//! 3. **Training**: the epoch loop with run logging, learning-rate
//!    scheduling, best-model checkpoints and early stopping ([`training`]).
//! 4. **Evaluation and persistence**: test-set metrics, a full-precision
//!    safetensors artifact and its int8 quantized sibling.
//!
//! Numeric work (convolutions, autodiff, Adam) is done by candle.

// Foundation
pub mod config;
pub mod error;
pub mod persistence;

// Data provisioning
pub mod data;

// Model definition and artifacts
pub mod model;
pub mod tuner;

// Training
pub mod training;

// Orchestration
pub mod session;

// Re-exports
pub use config::{AppConfig, ImageSize, SessionConfig, load_config};
pub use data::{Augmentation, Batch, DataPipeline, DataPipelines};
pub use error::MlError;
pub use model::{Model, ModelSpec, QuantizedModel};
pub use session::{EvaluationReport, SavedArtifacts, TrainingSession, TuningOutcome};
pub use training::{History, TrainOptions};
pub use tuner::{HyperParameters, SearchSpace, TunerOptions};
