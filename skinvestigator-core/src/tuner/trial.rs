//! Trials and the on-disk oracle that tracks them.
//!
//! ```text
//! <search_dir>/<project>/oracle.json
//! <search_dir>/<project>/trial_<id>/trial.json
//! <search_dir>/<project>/trial_<id>/checkpoint.safetensors
//! ```

use crate::error::MlError;
use crate::model::io::MODEL_EXTENSION;
use crate::persistence::{atomic_write_json, load_json};
use crate::tuner::space::HyperParameters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ORACLE_FILE: &str = "oracle.json";
pub const TRIAL_FILE: &str = "trial.json";

/// Trial lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One sampled configuration and how far it has been trained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: String,
    pub hyperparameters: HyperParameters,
    pub hash: String,
    pub iteration: usize,
    pub bracket: usize,
    /// Highest successive-halving round this trial was trained in.
    pub round: usize,
    pub epochs_trained: usize,
    pub best_val_loss: Option<f64>,
    pub status: TrialStatus,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Trial {
    /// Objective value, `+inf` for trials without a score.
    pub fn score(&self) -> f64 {
        self.best_val_loss.unwrap_or(f64::INFINITY)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OracleState {
    trials: Vec<Trial>,
    best_trial: Option<String>,
    completed: bool,
}

/// Trial table persisted under the project directory.
#[derive(Debug)]
pub struct Oracle {
    dir: PathBuf,
    state: OracleState,
}

impl Oracle {
    /// Open the project at `dir`, reading any existing oracle.
    pub fn open(dir: &Path) -> Result<Self, MlError> {
        let state = load_json(&dir.join(ORACLE_FILE))?.unwrap_or_default();
        Ok(Self {
            dir: dir.to_path_buf(),
            state,
        })
    }

    /// Start over: wipe the project directory.
    pub fn reset(dir: &Path) -> Result<Self, MlError> {
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        std::fs::create_dir_all(dir)?;
        let oracle = Self {
            dir: dir.to_path_buf(),
            state: OracleState::default(),
        };
        oracle.save()?;
        Ok(oracle)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_complete(&self) -> bool {
        self.state.completed
    }

    pub fn trials(&self) -> &[Trial] {
        &self.state.trials
    }

    pub fn trial(&self, id: &str) -> Option<&Trial> {
        self.state.trials.iter().find(|t| t.id == id)
    }

    pub fn contains_hash(&self, hash: &str) -> bool {
        self.state.trials.iter().any(|t| t.hash == hash)
    }

    pub fn trial_dir(&self, id: &str) -> PathBuf {
        self.dir.join(format!("trial_{id}"))
    }

    pub fn weights_path(&self, id: &str) -> PathBuf {
        self.trial_dir(id)
            .join(format!("checkpoint.{MODEL_EXTENSION}"))
    }

    /// Register a new pending trial and return its id.
    pub fn create_trial(
        &mut self,
        hyperparameters: HyperParameters,
        iteration: usize,
        bracket: usize,
    ) -> Result<String, MlError> {
        let id = format!("{:04}", self.state.trials.len());
        let trial = Trial {
            id: id.clone(),
            hash: hyperparameters.canonical_hash(),
            hyperparameters,
            iteration,
            bracket,
            round: 0,
            epochs_trained: 0,
            best_val_loss: None,
            status: TrialStatus::Pending,
            error: None,
            updated_at: Utc::now(),
        };
        self.state.trials.push(trial.clone());
        self.write_trial(&trial)?;
        Ok(id)
    }

    /// Replace the stored copy of `trial` and persist it.
    pub fn update(&mut self, mut trial: Trial) -> Result<(), MlError> {
        trial.updated_at = Utc::now();
        let slot = self
            .state
            .trials
            .iter_mut()
            .find(|t| t.id == trial.id)
            .ok_or_else(|| MlError::not_found(format!("trial {}", trial.id)))?;
        *slot = trial.clone();
        self.state.best_trial = self.best().map(|t| t.id.clone());
        self.write_trial(&trial)?;
        self.save()
    }

    /// Completed trial with the lowest validation loss.
    pub fn best(&self) -> Option<&Trial> {
        self.state
            .trials
            .iter()
            .filter(|t| t.status == TrialStatus::Completed && t.best_val_loss.is_some())
            .min_by(|a, b| a.score().total_cmp(&b.score()))
    }

    pub fn mark_complete(&mut self) -> Result<(), MlError> {
        self.state.completed = true;
        self.save()
    }

    pub fn save(&self) -> Result<(), MlError> {
        atomic_write_json(&self.dir.join(ORACLE_FILE), &self.state)?;
        Ok(())
    }

    fn write_trial(&self, trial: &Trial) -> Result<(), MlError> {
        atomic_write_json(&self.trial_dir(&trial.id).join(TRIAL_FILE), trial)?;
        Ok(())
    }
}
