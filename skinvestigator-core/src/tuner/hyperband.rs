//! Hyperband: successive halving over brackets of randomly sampled trials.

use crate::config::ImageSize;
use crate::data::DataPipeline;
use crate::error::MlError;
use crate::model::io::{load_model, save_model};
use crate::model::{Model, ModelSpec};
use crate::training::Trainer;
use crate::tuner::space::{HyperParameters, SearchSpace};
use crate::tuner::trial::{Oracle, Trial, TrialStatus};
use candle_core::Device;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Resampling attempts before a duplicate configuration ends a bracket early.
pub const MAX_RESAMPLE_ATTEMPTS: usize = 20;

/// Hyperband settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerOptions {
    /// Epoch budget of the most-trained configurations.
    pub max_epochs: usize,
    /// Reduction factor between successive-halving rounds.
    pub factor: usize,
    pub hyperband_iterations: usize,
    pub seed: u64,
    pub project_name: String,
    /// Discard an existing project instead of reusing its results.
    pub overwrite: bool,
    pub steps_per_epoch: Option<usize>,
    pub validation_steps: Option<usize>,
}

impl Default for TunerOptions {
    fn default() -> Self {
        Self {
            max_epochs: 25,
            factor: 3,
            hyperband_iterations: 2,
            seed: 42,
            project_name: "skin_cancer_detection".to_string(),
            overwrite: false,
            steps_per_epoch: None,
            validation_steps: None,
        }
    }
}

impl TunerOptions {
    pub fn validate(&self) -> Result<(), MlError> {
        if self.max_epochs == 0 {
            return Err(MlError::invalid_input("max_epochs must be at least 1"));
        }
        if self.factor < 2 {
            return Err(MlError::invalid_input("factor must be at least 2"));
        }
        if self.hyperband_iterations == 0 {
            return Err(MlError::invalid_input(
                "hyperband_iterations must be at least 1",
            ));
        }
        if self.project_name.is_empty()
            || self.project_name.contains(['/', '\\'])
            || self.project_name.starts_with('.')
        {
            return Err(MlError::invalid_input(format!(
                "project_name '{}' is not a plain directory name",
                self.project_name
            )));
        }
        Ok(())
    }
}

/// One successive-halving round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub trials: usize,
    pub epochs: usize,
}

/// A bracket: a starting population and its halving rounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bracket {
    pub index: usize,
    pub rounds: Vec<Round>,
}

/// Brackets of one Hyperband iteration, most exploratory first.
pub fn bracket_schedule(max_epochs: usize, factor: usize) -> Vec<Bracket> {
    let s_max = floor_log(max_epochs, factor);
    (0..=s_max)
        .rev()
        .map(|s| {
            let initial = ((s_max + 1) * factor.pow(s as u32)).div_ceil(s + 1);
            let rounds = (0..=s)
                .map(|r| Round {
                    trials: (initial / factor.pow(r as u32)).max(1),
                    epochs: max_epochs.div_ceil(factor.pow((s - r) as u32)),
                })
                .collect();
            Bracket { index: s, rounds }
        })
        .collect()
}

// Largest k with factor^k <= n.
fn floor_log(n: usize, factor: usize) -> usize {
    let mut k = 0;
    let mut power = factor;
    while power <= n {
        k += 1;
        power = power.saturating_mul(factor);
        if power == usize::MAX {
            break;
        }
    }
    k
}

/// Result of a completed search.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub best: HyperParameters,
    pub best_trial: String,
    pub best_score: f64,
    pub trials: Vec<Trial>,
    /// True when results were read from an earlier completed search.
    pub reused: bool,
}

/// Hyperband tuner over a [`SearchSpace`].
pub struct Hyperband {
    space: SearchSpace,
    options: TunerOptions,
    input: ImageSize,
    device: Device,
    directory: PathBuf,
}

impl Hyperband {
    pub fn new(
        space: SearchSpace,
        options: TunerOptions,
        input: ImageSize,
        device: Device,
        directory: PathBuf,
    ) -> Result<Self, MlError> {
        space.validate()?;
        options.validate()?;
        let min_side = input.height.min(input.width);
        let pooled = u32::try_from(space.max_pools())
            .ok()
            .and_then(|pools| min_side.checked_shr(pools))
            .unwrap_or(0);
        if pooled == 0 {
            return Err(MlError::invalid_input(format!(
                "{input} images are too small for {} pooling blocks",
                space.max_pools()
            )));
        }
        Ok(Self {
            space,
            options,
            input,
            device,
            directory,
        })
    }

    pub fn options(&self) -> &TunerOptions {
        &self.options
    }

    pub fn project_dir(&self) -> PathBuf {
        self.directory.join(&self.options.project_name)
    }

    /// Run the search (or reuse a completed one) and return the best trial.
    pub fn search(
        &mut self,
        train: &DataPipeline,
        val: &DataPipeline,
    ) -> Result<SearchOutcome, MlError> {
        let project = self.project_dir();
        if !self.options.overwrite {
            let oracle = Oracle::open(&project)?;
            if oracle.is_complete() {
                tracing::info!(
                    project = %project.display(),
                    "Reusing completed hyperparameter search"
                );
                return outcome(&oracle, true);
            }
        }

        let mut oracle = Oracle::reset(&project)?;
        let mut rng = StdRng::seed_from_u64(self.options.seed);
        let schedule = bracket_schedule(self.options.max_epochs, self.options.factor);
        tracing::info!(
            max_epochs = self.options.max_epochs,
            factor = self.options.factor,
            iterations = self.options.hyperband_iterations,
            brackets = schedule.len(),
            "Hyperparameter search started"
        );

        for iteration in 0..self.options.hyperband_iterations {
            for bracket in &schedule {
                self.run_bracket(&mut oracle, &mut rng, iteration, bracket, train, val)?;
            }
        }
        oracle.mark_complete()?;
        outcome(&oracle, false)
    }

    fn run_bracket(
        &self,
        oracle: &mut Oracle,
        rng: &mut StdRng,
        iteration: usize,
        bracket: &Bracket,
        train: &DataPipeline,
        val: &DataPipeline,
    ) -> Result<(), MlError> {
        let Some(first) = bracket.rounds.first() else {
            return Ok(());
        };
        let mut survivors = Vec::with_capacity(first.trials);
        for _ in 0..first.trials {
            match self.sample_unique(oracle, rng) {
                Some(hp) => survivors.push(oracle.create_trial(hp, iteration, bracket.index)?),
                None => {
                    tracing::warn!(
                        bracket = bracket.index,
                        "Search space exhausted; bracket continues with fewer trials"
                    );
                    break;
                }
            }
        }

        for (r, round) in bracket.rounds.iter().enumerate() {
            let keep = if r == 0 {
                round.trials
            } else {
                (survivors.len() / self.options.factor).clamp(1, round.trials)
            };
            survivors.truncate(keep);
            for id in &survivors {
                self.run_trial(oracle, id, r, round.epochs, train, val)?;
            }
            survivors.sort_by(|a, b| {
                let score = |id: &String| oracle.trial(id).map_or(f64::INFINITY, Trial::score);
                score(a).total_cmp(&score(b))
            });
            tracing::debug!(
                bracket = bracket.index,
                round = r,
                epochs = round.epochs,
                trained = survivors.len(),
                "Round complete"
            );
        }
        Ok(())
    }

    fn sample_unique(&self, oracle: &Oracle, rng: &mut StdRng) -> Option<HyperParameters> {
        (0..MAX_RESAMPLE_ATTEMPTS)
            .map(|_| self.space.sample(rng))
            .find(|hp| !oracle.contains_hash(&hp.canonical_hash()))
    }

    fn run_trial(
        &self,
        oracle: &mut Oracle,
        id: &str,
        round: usize,
        epochs: usize,
        train: &DataPipeline,
        val: &DataPipeline,
    ) -> Result<(), MlError> {
        let mut trial = oracle
            .trial(id)
            .cloned()
            .ok_or_else(|| MlError::not_found(format!("trial {id}")))?;
        if trial.status == TrialStatus::Failed || trial.epochs_trained >= epochs {
            return Ok(());
        }

        let weights = oracle.weights_path(id);
        let mut model = if trial.epochs_trained > 0 && weights.exists() {
            load_model(&weights, &self.device)?
        } else {
            Model::new(
                ModelSpec::from_hyperparameters(&trial.hyperparameters, self.input),
                &self.device,
            )?
        };

        trial.status = TrialStatus::Running;
        trial.round = round;
        oracle.update(trial.clone())?;

        let mut trainer = Trainer::new(Vec::new())
            .with_steps(self.options.steps_per_epoch, self.options.validation_steps);
        match trainer.fit_from(&mut model, train, val, trial.epochs_trained, epochs) {
            Ok(history) => {
                save_model(&model, &weights)?;
                trial.epochs_trained = epochs;
                trial.best_val_loss = match (trial.best_val_loss, history.best_val_loss) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                trial.status = TrialStatus::Completed;
                tracing::info!(
                    trial = id,
                    epochs,
                    val_loss = trial.best_val_loss,
                    hyperparameters = %trial.hyperparameters,
                    "Trial finished"
                );
            }
            // Divergent configurations are dropped from the search.
            Err(MlError::Training(reason)) => {
                tracing::warn!(trial = id, %reason, "Trial failed");
                trial.status = TrialStatus::Failed;
                trial.error = Some(reason);
            }
            Err(e) => return Err(e),
        }
        oracle.update(trial)
    }
}

fn outcome(oracle: &Oracle, reused: bool) -> Result<SearchOutcome, MlError> {
    let best = oracle
        .best()
        .ok_or_else(|| MlError::search("no trial completed successfully"))?;
    Ok(SearchOutcome {
        best: best.hyperparameters.clone(),
        best_trial: best.id.clone(),
        best_score: best.score(),
        trials: oracle.trials().to_vec(),
        reused,
    })
}
