//! Training infrastructure: epoch loop, observers, metrics, checkpoints and run logs.

pub mod callbacks;
pub mod checkpoint;
pub mod metrics;
pub mod run_log;
pub mod runner;

pub use callbacks::{
    BestCheckpoint, EarlyStopping, EpochContext, EpochObserver, ObserverAction, ReduceLrOnPlateau,
};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use metrics::{EpochRecord, History, MetricAccumulator, MetricKind, MetricSet};
pub use run_log::RunLogger;
pub use runner::{RunId, TrainOptions, Trainer};
