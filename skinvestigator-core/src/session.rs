//! The training session: provisioning, model definition, training, evaluation
//! and persistence, in that order.

use crate::config::SessionConfig;
use crate::data::{Augmentation, DataPipeline, DataPipelines};
use crate::error::MlError;
use crate::model::io::{load_model, quantized_path, save_model};
use crate::model::quantize::quantize_model;
use crate::model::{Model, ModelSpec, ModelSummary};
use crate::persistence::atomic_write;
use crate::training::{
    BestCheckpoint, CheckpointManager, EarlyStopping, EpochObserver, History, MetricAccumulator,
    ReduceLrOnPlateau, RunId, RunLogger, TrainOptions, Trainer,
};
use crate::tuner::{Hyperband, HyperParameters, SearchSpace, Trial, TunerOptions};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Sub-directory of the log dir holding the post-search training runs.
pub const HPARAM_LOG_DIR: &str = "hparam_tuning";

/// Manifest entries kept by the checkpoint manager.
const MAX_CHECKPOINT_ENTRIES: usize = 100;

/// Test-set metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub loss: f64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub auc: f64,
    pub samples: usize,
}

impl std::fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Test accuracy: {}, Test precision: {}, Test recall: {}, Test AUC: {}",
            self.accuracy, self.precision, self.recall, self.auc
        )
    }
}

/// Files written by [`TrainingSession::save`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedArtifacts {
    pub primary: PathBuf,
    pub quantized: PathBuf,
    pub primary_bytes: u64,
    pub quantized_bytes: u64,
}

/// Result of [`TrainingSession::tune_hyperparameters`].
#[derive(Debug, Clone)]
pub struct TuningOutcome {
    pub best: HyperParameters,
    /// Best validation loss the winning trial reached during the search.
    pub best_score: f64,
    pub trials: Vec<Trial>,
    /// History of the full training run of the winning configuration.
    pub history: History,
}

/// Orchestrates one classifier from raw folders to saved artifacts.
pub struct TrainingSession {
    config: SessionConfig,
    device: Device,
    model: Option<Model>,
}

impl TrainingSession {
    pub fn new(config: SessionConfig) -> Result<Self, MlError> {
        config.validate()?;
        let device = select_device(config.use_gpu)?;
        tracing::info!(
            img_size = %config.img_size,
            batch_size = config.batch_size,
            device = ?device,
            "Training session created"
        );
        Ok(Self {
            config,
            device,
            model: None,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The live model, if one has been built, tuned or loaded.
    pub fn model(&self) -> Option<&Model> {
        self.model.as_ref()
    }

    fn check_model(&self) -> Result<&Model, MlError> {
        self.model.as_ref().ok_or(MlError::ModelNotBuilt)
    }

    fn check_model_mut(&mut self) -> Result<&mut Model, MlError> {
        self.model.as_mut().ok_or(MlError::ModelNotBuilt)
    }

    // ---------------------------------------------------------------------
    // Data provisioning
    // ---------------------------------------------------------------------

    /// Pipeline over one class-folder directory.
    pub fn create_data_pipeline(&self, dir: &Path, augment: bool) -> Result<DataPipeline, MlError> {
        let augmentation = if augment {
            Augmentation::standard()
        } else {
            Augmentation::none()
        };
        let pipeline = DataPipeline::from_directory(
            dir,
            self.config.batch_size,
            self.config.img_size,
            augmentation,
            self.device.clone(),
        )?
        .with_seed(self.config.seed);
        tracing::info!(
            dir = %dir.display(),
            samples = pipeline.len(),
            classes = ?pipeline.folder().classes,
            augment,
            "Found images"
        );
        Ok(pipeline)
    }

    /// Train, validation and test pipelines, none augmented.
    pub fn preprocess_data(&self) -> Result<DataPipelines, MlError> {
        self.preprocess_data_with(false)
    }

    /// As [`Self::preprocess_data`], optionally augmenting the train pipeline.
    ///
    /// Validation reads the test directory unless `use_validation_dir` is set.
    pub fn preprocess_data_with(&self, augment_train: bool) -> Result<DataPipelines, MlError> {
        let validation_dir = if self.config.use_validation_dir {
            &self.config.val_dir
        } else {
            &self.config.test_dir
        };
        Ok(DataPipelines {
            train: self.create_data_pipeline(&self.config.train_dir, augment_train)?,
            validation: self
                .create_data_pipeline(validation_dir, false)?
                .with_shuffle(false),
            test: self
                .create_data_pipeline(&self.config.test_dir, false)?
                .with_shuffle(false),
        })
    }

    // ---------------------------------------------------------------------
    // Model definition
    // ---------------------------------------------------------------------

    /// Build the fixed architecture, replacing any live model.
    pub fn build_model(&mut self, num_classes: usize) -> Result<&Model, MlError> {
        if num_classes != 2 {
            return Err(MlError::invalid_input(format!(
                "only binary classification is supported, got {num_classes} classes"
            )));
        }
        self.build_model_from_spec(ModelSpec::fixed(self.config.img_size))
    }

    /// Instantiate an arbitrary architecture as the live model.
    pub fn build_model_from_spec(&mut self, spec: ModelSpec) -> Result<&Model, MlError> {
        let model = Model::new(spec, &self.device)?;
        tracing::info!(parameters = model.parameter_count(), "Model built");
        Ok(&*self.model.insert(model))
    }

    /// Layer table of the live model.
    pub fn summary(&self) -> Result<ModelSummary, MlError> {
        self.check_model()?.spec().summary()
    }

    /// Search the default space, then train the winner and make it the live
    /// model.
    pub fn tune_hyperparameters(
        &mut self,
        train: &DataPipeline,
        val: &DataPipeline,
        options: &TunerOptions,
    ) -> Result<TuningOutcome, MlError> {
        self.tune_hyperparameters_in(SearchSpace::default(), train, val, options)
    }

    pub fn tune_hyperparameters_in(
        &mut self,
        space: SearchSpace,
        train: &DataPipeline,
        val: &DataPipeline,
        options: &TunerOptions,
    ) -> Result<TuningOutcome, MlError> {
        let mut tuner = Hyperband::new(
            space,
            options.clone(),
            self.config.img_size,
            self.device.clone(),
            self.config.search_dir.clone(),
        )?;
        let search = tuner.search(train, val)?;
        tracing::info!(
            trial = %search.best_trial,
            val_loss = search.best_score,
            trials = search.trials.len(),
            hyperparameters = %search.best,
            "The hyperparameter search is complete"
        );

        let mut model = Model::new(
            ModelSpec::from_hyperparameters(&search.best, self.config.img_size),
            &self.device,
        )?;
        let (run_id, run_dir) = RunId::allocate(&self.config.log_dir.join(HPARAM_LOG_DIR))?;
        tracing::info!(run = %run_id, "Training best configuration");
        let observers: Vec<Box<dyn EpochObserver>> = vec![Box::new(RunLogger::new(run_dir))];
        let mut trainer = Trainer::new(observers)
            .with_steps(options.steps_per_epoch, options.validation_steps);
        let history = trainer.fit(&mut model, train, val, options.max_epochs)?;
        self.model = Some(model);

        Ok(TuningOutcome {
            best: search.best,
            best_score: search.best_score,
            trials: search.trials,
            history,
        })
    }

    // ---------------------------------------------------------------------
    // Training
    // ---------------------------------------------------------------------

    /// Fit the live model with the run logger, LR scheduler, best-model
    /// checkpoint and early stopping attached.
    pub fn train(
        &mut self,
        train: &DataPipeline,
        val: &DataPipeline,
        options: &TrainOptions,
    ) -> Result<History, MlError> {
        self.check_model()?;
        let (run_id, run_dir) = RunId::allocate(&self.config.log_dir)?;
        let checkpoints = CheckpointManager::new(self.config.model_dir.clone(), MAX_CHECKPOINT_ENTRIES);
        let observers: Vec<Box<dyn EpochObserver>> = vec![
            Box::new(RunLogger::new(run_dir).with_image_every(options.image_log_every)),
            Box::new(ReduceLrOnPlateau::new(
                options.lr_factor,
                options.patience_lr,
                options.min_lr,
                options.min_delta,
                options.cooldown_lr,
            )),
            Box::new(BestCheckpoint::new(checkpoints.best_model_path(run_id.as_str()))),
            Box::new(EarlyStopping::new(options.patience_es, options.es_min_delta)),
        ];
        let mut trainer = Trainer::new(observers)
            .with_steps(options.steps_per_epoch, options.validation_steps)
            .with_checkpoints(checkpoints, &run_id);

        tracing::info!(run = %run_id, epochs = options.epochs, "Training");
        let model = self.check_model_mut()?;
        trainer.fit(model, train, val, options.epochs)
    }

    // ---------------------------------------------------------------------
    // Evaluation
    // ---------------------------------------------------------------------

    /// Evaluate the live model on a fresh pass over the test directory.
    pub fn evaluate(&self) -> Result<EvaluationReport, MlError> {
        self.check_model()?;
        let test = self
            .create_data_pipeline(&self.config.test_dir, false)?
            .with_shuffle(false);
        self.evaluate_pipeline(&test)
    }

    /// One inference-mode pass over `pipeline`.
    pub fn evaluate_pipeline(&self, pipeline: &DataPipeline) -> Result<EvaluationReport, MlError> {
        let model = self.check_model()?;
        let mut stream = pipeline.batches();
        let mut acc = MetricAccumulator::new();
        for _ in 0..pipeline.steps_per_epoch() {
            let batch = stream.next_batch()?;
            let out = model.evaluate_step(&batch)?;
            acc.update(&out.probabilities, &batch.label_values()?, out.loss)?;
        }
        let m = acc.finish();
        let report = EvaluationReport {
            loss: m.loss,
            accuracy: m.accuracy,
            precision: m.precision,
            recall: m.recall,
            auc: m.auc,
            samples: acc.samples(),
        };
        tracing::info!(loss = report.loss, samples = report.samples, "{report}");
        Ok(report)
    }

    // ---------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------

    /// Write the live model to `path` plus its quantized sibling.
    ///
    /// A failure writing the quantized file leaves the primary in place.
    pub fn save(&self, path: &Path) -> Result<SavedArtifacts, MlError> {
        let model = self.check_model()?;
        let primary_bytes = save_model(model, path)?;

        let quantized = quantized_path(path);
        let (bytes, result) = quantize_model(model)?;
        atomic_write(&quantized, &bytes)?;
        tracing::info!(
            quantized_tensors = result.quantized_tensors,
            "Model saved as {} and {}",
            path.display(),
            quantized.display()
        );

        Ok(SavedArtifacts {
            primary: path.to_path_buf(),
            quantized,
            primary_bytes,
            quantized_bytes: bytes.len() as u64,
        })
    }

    /// Replace the live model with one read from `path`.
    pub fn load(&mut self, path: &Path) -> Result<&Model, MlError> {
        let model = load_model(path, &self.device)?;
        if model.spec().input != self.config.img_size {
            return Err(MlError::model(format!(
                "{} was saved for {} inputs, session uses {}",
                path.display(),
                model.spec().input,
                self.config.img_size
            )));
        }
        tracing::info!("Model loaded from {}", path.display());
        Ok(&*self.model.insert(model))
    }
}

fn select_device(use_gpu: bool) -> Result<Device, MlError> {
    if !use_gpu {
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        return Ok(Device::new_cuda(0)?);
    }
    if candle_core::utils::metal_is_available() {
        return Ok(Device::new_metal(0)?);
    }
    tracing::warn!("GPU requested but no GPU backend is available; using CPU");
    Ok(Device::Cpu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session_in(dir: &Path) -> TrainingSession {
        TrainingSession::new(SessionConfig {
            train_dir: dir.join("train"),
            val_dir: dir.join("validation"),
            test_dir: dir.join("test"),
            log_dir: dir.join("logs"),
            model_dir: dir.join("models"),
            search_dir: dir.join("search"),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_report_display() {
        let report = EvaluationReport {
            loss: 0.3,
            accuracy: 0.9,
            precision: 0.8,
            recall: 0.75,
            auc: 0.95,
            samples: 10,
        };
        assert_eq!(
            report.to_string(),
            "Test accuracy: 0.9, Test precision: 0.8, Test recall: 0.75, Test AUC: 0.95"
        );
    }

    #[test]
    fn test_rejects_multiclass() {
        let dir = TempDir::new().unwrap();
        let mut session = session_in(dir.path());
        assert!(matches!(
            session.build_model(3),
            Err(MlError::InvalidInput(_))
        ));
        assert!(session.model().is_none());
    }

    #[test]
    fn test_evaluate_and_save_need_model() {
        let dir = TempDir::new().unwrap();
        let session = session_in(dir.path());
        assert!(matches!(session.evaluate(), Err(MlError::ModelNotBuilt)));
        assert!(matches!(
            session.save(&dir.path().join("m.safetensors")),
            Err(MlError::ModelNotBuilt)
        ));
        assert!(matches!(session.summary(), Err(MlError::ModelNotBuilt)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SessionConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(TrainingSession::new(config).is_err());
    }

    #[test]
    fn test_build_replaces_model() {
        let dir = TempDir::new().unwrap();
        let mut session = TrainingSession::new(SessionConfig {
            img_size: crate::config::ImageSize::new(16, 16),
            log_dir: dir.path().join("logs"),
            ..Default::default()
        })
        .unwrap();
        let first = session.build_model(2).unwrap().parameter_count();
        let second = session.build_model(2).unwrap().parameter_count();
        assert_eq!(first, second);
        assert_eq!(session.summary().unwrap().total_params(), first);
    }
}
