//! Checkpoint management for training runs.

use crate::error::MlError;
use crate::model::Model;
use crate::model::io::{MODEL_EXTENSION, encode_model};
use crate::persistence::{atomic_write, atomic_write_json, load_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Name of the manifest kept beside the checkpoints.
pub const MANIFEST_FILE: &str = "checkpoints.json";

/// A written checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// Zero-based epoch the weights were taken after.
    pub epoch: usize,
    /// Validation loss at that epoch.
    pub loss: f64,
    pub path: PathBuf,
    /// SHA-256 of the file contents.
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Checkpoint manager.
pub struct CheckpointManager {
    base_dir: PathBuf,
    max_entries: usize,
}

impl CheckpointManager {
    pub fn new(base_dir: PathBuf, max_entries: usize) -> Self {
        Self {
            base_dir,
            max_entries,
        }
    }

    /// Where the best weights of `run_id` are written.
    pub fn best_model_path(&self, run_id: &str) -> PathBuf {
        self.base_dir
            .join(format!("{run_id}_best_model.{MODEL_EXTENSION}"))
    }

    fn manifest_path(&self) -> PathBuf {
        self.base_dir.join(MANIFEST_FILE)
    }

    /// Every manifest entry, oldest first.
    pub fn list(&self) -> Result<Vec<Checkpoint>, MlError> {
        Ok(load_json(&self.manifest_path())?.unwrap_or_default())
    }

    /// Entries belonging to one run.
    pub fn for_run(&self, run_id: &str) -> Result<Vec<Checkpoint>, MlError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|c| c.run_id == run_id)
            .collect())
    }

    /// Get the best checkpoint (lowest loss) of a run.
    pub fn best(&self, run_id: &str) -> Result<Option<Checkpoint>, MlError> {
        Ok(self.for_run(run_id)?.into_iter().min_by(|a, b| {
            a.loss
                .partial_cmp(&b.loss)
                .unwrap_or(std::cmp::Ordering::Equal)
        }))
    }

    /// Write `model` to `path` and append an entry to the manifest.
    pub fn save(
        &self,
        model: &Model,
        path: &Path,
        run_id: &str,
        epoch: usize,
        loss: f64,
    ) -> Result<Checkpoint, MlError> {
        std::fs::create_dir_all(&self.base_dir)?;
        let bytes = encode_model(model)?;
        atomic_write(path, &bytes)?;

        let checkpoint = Checkpoint {
            run_id: run_id.to_string(),
            epoch,
            loss,
            path: path.to_path_buf(),
            hash: format!("{:x}", Sha256::digest(&bytes)),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };

        let mut checkpoints = self.list()?;
        checkpoints.push(checkpoint.clone());
        while checkpoints.len() > self.max_entries {
            checkpoints.remove(0);
        }
        atomic_write_json(&self.manifest_path(), &checkpoints)?;

        tracing::info!(
            epoch = epoch + 1,
            val_loss = loss,
            path = %path.display(),
            "Saved best checkpoint"
        );
        Ok(checkpoint)
    }

    /// True when the file on disk still hashes to the recorded digest.
    pub fn verify(&self, checkpoint: &Checkpoint) -> Result<bool, MlError> {
        if !checkpoint.path.exists() {
            return Ok(false);
        }
        let bytes = std::fs::read(&checkpoint.path)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)) == checkpoint.hash)
    }
}
