//! Training runner: the epoch loop and its observer wiring.

use crate::data::DataPipeline;
use crate::error::MlError;
use crate::model::Model;
use crate::training::callbacks::{EpochContext, EpochObserver, ObserverAction};
use crate::training::checkpoint::{Checkpoint, CheckpointManager};
use crate::training::metrics::{EpochRecord, History, MetricAccumulator};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Epoch-loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainOptions {
    /// Upper bound on epochs; early stopping normally ends the run sooner.
    pub epochs: usize,
    /// Non-improving epochs before the learning rate is cut.
    pub patience_lr: usize,
    /// Non-improving epochs before training halts.
    pub patience_es: usize,
    pub min_lr: f64,
    /// Minimum `val_loss` decrease the scheduler counts as improvement.
    pub min_delta: f64,
    pub cooldown_lr: usize,
    pub lr_factor: f64,
    /// Minimum `val_loss` decrease early stopping counts as improvement.
    pub es_min_delta: f64,
    /// Epoch interval for validation image grids; 0 disables them.
    pub image_log_every: usize,
    /// Training batches per epoch; one full pass when unset.
    pub steps_per_epoch: Option<usize>,
    /// Validation batches per epoch; one full pass when unset.
    pub validation_steps: Option<usize>,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            epochs: 1000,
            patience_lr: 100,
            patience_es: 100,
            min_lr: 1e-6,
            min_delta: 1e-3,
            cooldown_lr: 20,
            lr_factor: 0.2,
            es_min_delta: 0.0,
            image_log_every: 10,
            steps_per_epoch: None,
            validation_steps: None,
        }
    }
}

/// Identity of one training run: a local timestamp, suffixed when a run
/// directory with that name already exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(String);

impl RunId {
    pub fn now() -> Self {
        Self(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string())
    }

    /// Claim a fresh run directory under `root`, returning its id and path.
    ///
    /// The directory is created here, so two runs started within the same
    /// second still end up in different directories.
    pub fn allocate(root: &Path) -> Result<(Self, PathBuf), MlError> {
        std::fs::create_dir_all(root)?;
        let base = Self::now().0;
        let mut candidate = base.clone();
        let mut suffix = 2;
        loop {
            let dir = root.join(&candidate);
            match std::fs::create_dir(&dir) {
                Ok(()) => return Ok((Self(candidate), dir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    candidate = format!("{base}-{suffix}");
                    suffix += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Runs the epoch loop and dispatches to its observers.
pub struct Trainer {
    observers: Vec<Box<dyn EpochObserver>>,
    steps_per_epoch: Option<usize>,
    validation_steps: Option<usize>,
    checkpoints: Option<(CheckpointManager, String)>,
}

impl Trainer {
    pub fn new(observers: Vec<Box<dyn EpochObserver>>) -> Self {
        Self {
            observers,
            steps_per_epoch: None,
            validation_steps: None,
            checkpoints: None,
        }
    }

    pub fn with_steps(mut self, train: Option<usize>, validation: Option<usize>) -> Self {
        self.steps_per_epoch = train;
        self.validation_steps = validation;
        self
    }

    /// Record checkpoints requested by observers in `manager`'s manifest.
    pub fn with_checkpoints(mut self, manager: CheckpointManager, run_id: &RunId) -> Self {
        self.checkpoints = Some((manager, run_id.to_string()));
        self
    }

    pub fn observer_names(&self) -> Vec<&str> {
        self.observers.iter().map(|o| o.name()).collect()
    }

    /// Train for `epochs` epochs starting at epoch 0.
    pub fn fit(
        &mut self,
        model: &mut Model,
        train: &DataPipeline,
        val: &DataPipeline,
        epochs: usize,
    ) -> Result<History, MlError> {
        self.fit_from(model, train, val, 0, epochs)
    }

    /// Train epochs `initial_epoch..epochs`.
    pub fn fit_from(
        &mut self,
        model: &mut Model,
        train: &DataPipeline,
        val: &DataPipeline,
        initial_epoch: usize,
        epochs: usize,
    ) -> Result<History, MlError> {
        let train_steps = self
            .steps_per_epoch
            .unwrap_or_else(|| train.steps_per_epoch())
            .max(1);
        let val_steps = self
            .validation_steps
            .unwrap_or_else(|| val.steps_per_epoch())
            .max(1);

        for observer in &mut self.observers {
            observer.on_train_begin(model)?;
        }
        tracing::info!(
            epochs = epochs.saturating_sub(initial_epoch),
            train_steps,
            val_steps,
            observers = ?self.observer_names(),
            "Training started"
        );

        let mut train_stream = train.batches();
        let mut val_stream = val.batches();
        let mut history = History::default();

        for epoch in initial_epoch..epochs {
            let started = Instant::now();
            let learning_rate = model.learning_rate();

            let mut train_acc = MetricAccumulator::new();
            for _ in 0..train_steps {
                let batch = train_stream.next_batch()?;
                let out = model.train_step(&batch)?;
                train_acc.update(&out.probabilities, &batch.label_values()?, out.loss)?;
            }

            let mut val_acc = MetricAccumulator::new();
            let mut sample = None;
            for _ in 0..val_steps {
                let batch = val_stream.next_batch()?;
                let out = model.evaluate_step(&batch)?;
                val_acc.update(&out.probabilities, &batch.label_values()?, out.loss)?;
                if sample.is_none() {
                    sample = Some(batch);
                }
            }
            tracing::debug!(
                train_samples = train_acc.samples(),
                val_samples = val_acc.samples(),
                "Epoch batches done"
            );

            let record = EpochRecord {
                epoch,
                train: train_acc.finish(),
                val: val_acc.finish(),
                learning_rate,
                duration_secs: started.elapsed().as_secs_f64(),
            };
            tracing::info!(
                epoch = epoch + 1,
                loss = record.train.loss,
                accuracy = record.train.accuracy,
                val_loss = record.val.loss,
                val_accuracy = record.val.accuracy,
                val_auc = record.val.auc,
                lr = learning_rate,
                "Epoch {}/{}",
                epoch + 1,
                epochs
            );

            let actions = {
                let ctx = EpochContext {
                    epoch,
                    record: &record,
                    model: &*model,
                    sample: sample.as_ref(),
                    learning_rate,
                };
                self.observers
                    .iter_mut()
                    .map(|o| o.on_epoch_end(&ctx))
                    .collect::<Result<Vec<_>, _>>()?
            };
            let val_loss = record.val.loss;
            history.record_epoch(record);

            let mut halt = false;
            for action in actions {
                match action {
                    ObserverAction::Continue => {}
                    ObserverAction::AdjustLearningRate(lr) => {
                        tracing::info!(
                            epoch = epoch + 1,
                            from = model.learning_rate(),
                            to = lr,
                            "Reducing learning rate"
                        );
                        model.set_learning_rate(lr);
                    }
                    ObserverAction::Checkpoint(path) => {
                        self.write_checkpoint(model, &path, epoch, val_loss)?;
                    }
                    ObserverAction::HaltAndRestore(snapshot) => {
                        if let Some(snapshot) = snapshot {
                            model.restore(&snapshot)?;
                            tracing::info!("Restored best weights");
                        }
                        halt = true;
                    }
                }
            }
            if halt {
                history.stopped_epoch = Some(epoch);
                break;
            }
        }

        history.best_checkpoint = self.verified_best()?;
        for observer in &mut self.observers {
            observer.on_train_end(&history)?;
        }
        tracing::info!(
            epochs = history.epochs_completed(),
            best_epoch = history.best_epoch.map(|e| e + 1),
            best_val_loss = history.best_val_loss,
            "Training finished"
        );
        Ok(history)
    }

    /// Best manifest entry of this run, or an error when its file no longer
    /// matches the recorded hash.
    fn verified_best(&self) -> Result<Option<Checkpoint>, MlError> {
        let Some((manager, run_id)) = &self.checkpoints else {
            return Ok(None);
        };
        let Some(best) = manager.best(run_id)? else {
            return Ok(None);
        };
        if !manager.verify(&best)? {
            return Err(MlError::training(format!(
                "best checkpoint {} does not match its recorded hash",
                best.path.display()
            )));
        }
        tracing::debug!(epoch = best.epoch + 1, path = %best.path.display(), "Best checkpoint verified");
        Ok(Some(best))
    }

    fn write_checkpoint(
        &self,
        model: &Model,
        path: &Path,
        epoch: usize,
        val_loss: f64,
    ) -> Result<(), MlError> {
        match &self.checkpoints {
            Some((manager, run_id)) => {
                manager.save(model, path, run_id, epoch, val_loss)?;
            }
            None => {
                crate::model::io::save_model(model, path)?;
            }
        }
        Ok(())
    }
}
