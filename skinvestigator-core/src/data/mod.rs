//! Data provisioning: class-folder scanning, augmentation and batched pipelines.

pub mod augment;
pub mod folder;
pub mod pipeline;

pub use augment::Augmentation;
pub use folder::{ImageFolder, Sample};
pub use pipeline::{Batch, BatchStream, DataPipeline, DataPipelines};
