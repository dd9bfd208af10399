//! Hyperparameter search over the classifier's architecture and learning rate.

pub mod hyperband;
pub mod space;
pub mod trial;

pub use hyperband::{Bracket, Hyperband, Round, SearchOutcome, TunerOptions, bracket_schedule};
pub use space::{ConvBlock, DenseBlock, FloatRange, HyperParameters, IntRange, SearchSpace};
pub use trial::{Oracle, Trial, TrialStatus};
