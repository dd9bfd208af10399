//! Training metrics tracking.
//!
//! Streaming binary-classification metrics (accuracy, precision, recall and
//! ROC AUC) plus the per-epoch [`History`] a training run returns.

use crate::error::MlError;
use crate::training::checkpoint::Checkpoint;
use serde::{Deserialize, Serialize};

/// Decision threshold for accuracy, precision and recall.
pub const DECISION_THRESHOLD: f32 = 0.5;

/// Number of thresholds the ROC curve is sampled at.
pub const AUC_THRESHOLDS: usize = 200;

const AUC_EPSILON: f32 = 1e-7;

/// A tracked metric. The names double as the registry used when loading
/// saved models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Accuracy,
    Precision,
    Recall,
    Auc,
}

impl MetricKind {
    pub fn all() -> &'static [MetricKind] {
        &[
            MetricKind::Accuracy,
            MetricKind::Precision,
            MetricKind::Recall,
            MetricKind::Auc,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            MetricKind::Accuracy => "accuracy",
            MetricKind::Precision => "precision",
            MetricKind::Recall => "recall",
            MetricKind::Auc => "auc",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|m| m.name() == name)
    }
}

/// Loss plus every tracked metric for one pass over a pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSet {
    pub loss: f64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub auc: f64,
}

impl MetricSet {
    /// Look a value up by its metric name (`"loss"`, `"accuracy"`, ...).
    pub fn get(&self, name: &str) -> Option<f64> {
        match name {
            "loss" => Some(self.loss),
            _ => MetricKind::from_name(name).map(|m| self.metric(m)),
        }
    }

    pub fn metric(&self, kind: MetricKind) -> f64 {
        match kind {
            MetricKind::Accuracy => self.accuracy,
            MetricKind::Precision => self.precision,
            MetricKind::Recall => self.recall,
            MetricKind::Auc => self.auc,
        }
    }
}

/// Accumulates predictions batch by batch.
#[derive(Debug, Clone)]
pub struct MetricAccumulator {
    loss_sum: f64,
    samples: usize,
    correct: usize,
    true_positives: usize,
    false_positives: usize,
    false_negatives: usize,
    positives: usize,
    negatives: usize,
    thresholds: Vec<f32>,
    roc_tp: Vec<usize>,
    roc_fp: Vec<usize>,
}

impl Default for MetricAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricAccumulator {
    pub fn new() -> Self {
        let n = AUC_THRESHOLDS;
        let mut thresholds = Vec::with_capacity(n);
        thresholds.push(-AUC_EPSILON);
        thresholds.extend((1..n - 1).map(|i| i as f32 / (n - 1) as f32));
        thresholds.push(1.0 + AUC_EPSILON);
        Self {
            loss_sum: 0.0,
            samples: 0,
            correct: 0,
            true_positives: 0,
            false_positives: 0,
            false_negatives: 0,
            positives: 0,
            negatives: 0,
            thresholds,
            roc_tp: vec![0; n],
            roc_fp: vec![0; n],
        }
    }

    /// Fold in one batch: sigmoid outputs, 0/1 labels and the batch's mean loss.
    pub fn update(
        &mut self,
        probabilities: &[f32],
        labels: &[f32],
        mean_loss: f64,
    ) -> Result<(), MlError> {
        if probabilities.len() != labels.len() {
            return Err(MlError::evaluation(format!(
                "{} predictions for {} labels",
                probabilities.len(),
                labels.len()
            )));
        }
        self.loss_sum += mean_loss * probabilities.len() as f64;
        self.samples += probabilities.len();

        for (&p, &y) in probabilities.iter().zip(labels) {
            let actual = y > DECISION_THRESHOLD;
            let predicted = p > DECISION_THRESHOLD;
            if actual == predicted {
                self.correct += 1;
            }
            match (predicted, actual) {
                (true, true) => self.true_positives += 1,
                (true, false) => self.false_positives += 1,
                (false, true) => self.false_negatives += 1,
                (false, false) => {}
            }
            if actual {
                self.positives += 1;
            } else {
                self.negatives += 1;
            }
            for (i, &t) in self.thresholds.iter().enumerate() {
                if p > t {
                    if actual {
                        self.roc_tp[i] += 1;
                    } else {
                        self.roc_fp[i] += 1;
                    }
                } else {
                    // Thresholds ascend, so no later one can be exceeded.
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn finish(&self) -> MetricSet {
        MetricSet {
            loss: divide_no_nan(self.loss_sum, self.samples as f64),
            accuracy: divide_no_nan(self.correct as f64, self.samples as f64),
            precision: divide_no_nan(
                self.true_positives as f64,
                (self.true_positives + self.false_positives) as f64,
            ),
            recall: divide_no_nan(
                self.true_positives as f64,
                (self.true_positives + self.false_negatives) as f64,
            ),
            auc: self.roc_auc(),
        }
    }

    // Trapezoidal area under the ROC curve sampled at the fixed thresholds.
    fn roc_auc(&self) -> f64 {
        let tpr: Vec<f64> = self
            .roc_tp
            .iter()
            .map(|&tp| divide_no_nan(tp as f64, self.positives as f64))
            .collect();
        let fpr: Vec<f64> = self
            .roc_fp
            .iter()
            .map(|&fp| divide_no_nan(fp as f64, self.negatives as f64))
            .collect();
        (0..self.thresholds.len() - 1)
            .map(|i| (fpr[i] - fpr[i + 1]) * (tpr[i] + tpr[i + 1]) / 2.0)
            .sum()
    }
}

fn divide_no_nan(num: f64, den: f64) -> f64 {
    if den == 0.0 { 0.0 } else { num / den }
}

/// Metrics of one completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Zero-based epoch index.
    pub epoch: usize,
    pub train: MetricSet,
    pub val: MetricSet,
    /// Learning rate the epoch was trained with.
    pub learning_rate: f64,
    pub duration_secs: f64,
}

/// Append-only per-epoch record of a training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub records: Vec<EpochRecord>,
    pub best_epoch: Option<usize>,
    pub best_val_loss: Option<f64>,
    /// Epoch at which early stopping halted the run.
    pub stopped_epoch: Option<usize>,
    pub total_training_time_secs: f64,
    /// Lowest-loss checkpoint of the run, verified against its manifest hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_checkpoint: Option<Checkpoint>,
}

impl History {
    pub fn record_epoch(&mut self, record: EpochRecord) {
        let val_loss = record.val.loss;
        if self.best_val_loss.is_none_or(|best| val_loss < best) {
            self.best_val_loss = Some(val_loss);
            self.best_epoch = Some(record.epoch);
        }
        self.total_training_time_secs += record.duration_secs;
        self.records.push(record);
    }

    pub fn epochs_completed(&self) -> usize {
        self.records.len()
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.records.last()
    }

    /// Values of one metric across epochs: `loss`, `accuracy`, ..., their
    /// `val_` counterparts, or `lr`.
    pub fn series(&self, key: &str) -> Option<Vec<f64>> {
        if key == "lr" {
            return Some(self.records.iter().map(|r| r.learning_rate).collect());
        }
        let (val, name) = match key.strip_prefix("val_") {
            Some(rest) => (true, rest),
            None => (false, key),
        };
        self.records
            .iter()
            .map(|r| if val { r.val.get(name) } else { r.train.get(name) })
            .collect()
    }
}
