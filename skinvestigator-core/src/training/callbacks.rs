//! Epoch-end observers: learning-rate scheduling, best-model checkpointing and
//! early stopping.
//!
//! Observers never mutate the model themselves. Each one inspects an
//! [`EpochContext`] and returns an [`ObserverAction`]; the trainer applies the
//! actions in observer order once every observer has run.

use crate::data::Batch;
use crate::error::MlError;
use crate::model::{Model, WeightSnapshot};
use crate::training::metrics::{EpochRecord, History};
use std::path::PathBuf;

/// Action an observer can request.
#[derive(Debug, Clone)]
pub enum ObserverAction {
    Continue,
    /// Switch the optimizer to this learning rate for the next epoch.
    AdjustLearningRate(f64),
    /// Write the current weights to this path.
    Checkpoint(PathBuf),
    /// Stop training, optionally rolling the weights back first.
    HaltAndRestore(Option<WeightSnapshot>),
}

impl PartialEq for ObserverAction {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Continue, Self::Continue) => true,
            (Self::AdjustLearningRate(a), Self::AdjustLearningRate(b)) => a == b,
            (Self::Checkpoint(a), Self::Checkpoint(b)) => a == b,
            (Self::HaltAndRestore(a), Self::HaltAndRestore(b)) => a.is_some() == b.is_some(),
            _ => false,
        }
    }
}

/// What an observer sees at the end of an epoch.
pub struct EpochContext<'a> {
    /// Zero-based epoch index.
    pub epoch: usize,
    pub record: &'a EpochRecord,
    pub model: &'a Model,
    /// First validation batch of the epoch.
    pub sample: Option<&'a Batch>,
    pub learning_rate: f64,
}

impl EpochContext<'_> {
    pub fn val_loss(&self) -> f64 {
        self.record.val.loss
    }
}

/// Trait for epoch-end observers.
pub trait EpochObserver: Send {
    fn name(&self) -> &str;

    fn on_train_begin(&mut self, _model: &Model) -> Result<(), MlError> {
        Ok(())
    }

    fn on_epoch_end(&mut self, ctx: &EpochContext<'_>) -> Result<ObserverAction, MlError>;

    fn on_train_end(&mut self, _history: &History) -> Result<(), MlError> {
        Ok(())
    }
}

/// Cuts the learning rate when validation loss stops improving.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    pub factor: f64,
    pub patience: usize,
    pub min_lr: f64,
    pub min_delta: f64,
    pub cooldown: usize,
    wait: usize,
    cooldown_counter: usize,
    best: f64,
}

impl ReduceLrOnPlateau {
    pub fn new(factor: f64, patience: usize, min_lr: f64, min_delta: f64, cooldown: usize) -> Self {
        Self {
            factor,
            patience,
            min_lr,
            min_delta,
            cooldown,
            wait: 0,
            cooldown_counter: 0,
            best: f64::INFINITY,
        }
    }

    pub fn in_cooldown(&self) -> bool {
        self.cooldown_counter > 0
    }

    /// Feed one epoch's monitored value; returns the new learning rate when a
    /// reduction fires.
    pub fn observe(&mut self, current: f64, lr: f64) -> Option<f64> {
        if self.in_cooldown() {
            self.cooldown_counter -= 1;
            self.wait = 0;
        }

        if current < self.best - self.min_delta {
            self.best = current;
            self.wait = 0;
            return None;
        }
        if self.in_cooldown() {
            return None;
        }

        self.wait += 1;
        if self.wait >= self.patience && lr > self.min_lr {
            self.cooldown_counter = self.cooldown;
            self.wait = 0;
            return Some((lr * self.factor).max(self.min_lr));
        }
        None
    }
}

impl EpochObserver for ReduceLrOnPlateau {
    fn name(&self) -> &str {
        "reduce_lr_on_plateau"
    }

    fn on_epoch_end(&mut self, ctx: &EpochContext<'_>) -> Result<ObserverAction, MlError> {
        Ok(match self.observe(ctx.val_loss(), ctx.learning_rate) {
            Some(lr) => ObserverAction::AdjustLearningRate(lr),
            None => ObserverAction::Continue,
        })
    }
}

/// Outcome of feeding one epoch to [`EarlyStopping::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    Improved,
    Waiting,
    Stop,
}

/// Early stopping with best-weight restoration.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    pub patience: usize,
    pub min_delta: f64,
    pub restore_best_weights: bool,
    wait: usize,
    best: f64,
    best_epoch: Option<usize>,
    stopped_epoch: Option<usize>,
    best_weights: Option<WeightSnapshot>,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            restore_best_weights: true,
            wait: 0,
            best: f64::INFINITY,
            best_epoch: None,
            stopped_epoch: None,
            best_weights: None,
        }
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    pub fn observe(&mut self, epoch: usize, current: f64) -> StopDecision {
        self.wait += 1;
        if current < self.best - self.min_delta {
            self.best = current;
            self.best_epoch = Some(epoch);
            self.wait = 0;
            return StopDecision::Improved;
        }
        // Never stop on the first epoch.
        if self.wait >= self.patience && epoch > 0 {
            self.stopped_epoch = Some(epoch);
            return StopDecision::Stop;
        }
        StopDecision::Waiting
    }
}

impl EpochObserver for EarlyStopping {
    fn name(&self) -> &str {
        "early_stopping"
    }

    fn on_train_begin(&mut self, _model: &Model) -> Result<(), MlError> {
        self.wait = 0;
        self.best = f64::INFINITY;
        self.best_epoch = None;
        self.stopped_epoch = None;
        self.best_weights = None;
        Ok(())
    }

    fn on_epoch_end(&mut self, ctx: &EpochContext<'_>) -> Result<ObserverAction, MlError> {
        match self.observe(ctx.epoch, ctx.val_loss()) {
            StopDecision::Improved => {
                if self.restore_best_weights {
                    self.best_weights = Some(ctx.model.snapshot()?);
                }
                Ok(ObserverAction::Continue)
            }
            StopDecision::Waiting => Ok(ObserverAction::Continue),
            StopDecision::Stop => {
                tracing::info!(
                    epoch = ctx.epoch + 1,
                    best_epoch = self.best_epoch.map(|e| e + 1),
                    best_val_loss = self.best,
                    "Early stopping"
                );
                let snapshot = if self.restore_best_weights {
                    self.best_weights.clone()
                } else {
                    None
                };
                Ok(ObserverAction::HaltAndRestore(snapshot))
            }
        }
    }
}

/// Requests a checkpoint whenever validation loss reaches a new minimum.
#[derive(Debug, Clone)]
pub struct BestCheckpoint {
    path: PathBuf,
    best: f64,
}

impl BestCheckpoint {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            best: f64::INFINITY,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl EpochObserver for BestCheckpoint {
    fn name(&self) -> &str {
        "best_checkpoint"
    }

    fn on_epoch_end(&mut self, ctx: &EpochContext<'_>) -> Result<ObserverAction, MlError> {
        let current = ctx.val_loss();
        if current < self.best {
            tracing::debug!(
                epoch = ctx.epoch + 1,
                previous = self.best,
                current,
                "val_loss improved"
            );
            self.best = current;
            return Ok(ObserverAction::Checkpoint(self.path.clone()));
        }
        Ok(ObserverAction::Continue)
    }
}
