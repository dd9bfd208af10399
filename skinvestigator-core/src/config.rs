//! Configuration system for skinvestigator.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from `~/.config/skinvestigator/config.toml` and/or
//! `skinvestigator.toml` in the workspace directory.

use crate::error::MlError;
use crate::training::TrainOptions;
use crate::tuner::TunerOptions;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the workspace-level configuration file.
pub const WORKSPACE_CONFIG_FILE: &str = "skinvestigator.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Paths, batching and image geometry for a training session.
    #[serde(default)]
    pub session: SessionConfig,
    /// Epoch loop and observer settings.
    #[serde(default)]
    pub training: TrainOptions,
    /// Hyperparameter search settings.
    #[serde(default)]
    pub tuning: TunerOptions,
}

impl AppConfig {
    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, MlError> {
        toml::to_string_pretty(self).map_err(|e| MlError::Config(e.to_string()))
    }
}

/// Target image geometry; every decoded image is resized to this.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageSize {
    pub height: usize,
    pub width: usize,
}

impl ImageSize {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    pub fn pixels(&self) -> usize {
        self.height * self.width
    }
}

impl Default for ImageSize {
    fn default() -> Self {
        Self::new(180, 180)
    }
}

impl std::fmt::Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

/// Immutable settings of one training session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Training corpus: one sub-directory per class.
    #[serde(default = "default_train_dir")]
    pub train_dir: PathBuf,
    /// Validation corpus: one sub-directory per class.
    #[serde(default = "default_val_dir")]
    pub val_dir: PathBuf,
    /// Held-out test corpus: one sub-directory per class.
    #[serde(default = "default_test_dir")]
    pub test_dir: PathBuf,
    /// Root of the per-run structured logs.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Directory receiving best-epoch checkpoints.
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    /// Directory receiving hyperparameter-search trials.
    #[serde(default = "default_search_dir")]
    pub search_dir: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub img_size: ImageSize,
    /// Seed for shuffling and augmentation; entropy-seeded when unset.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Bind the validation pipeline to `val_dir` instead of `test_dir`.
    #[serde(default)]
    pub use_validation_dir: bool,
    /// Run on the first CUDA/Metal device when the crate was built with one.
    #[serde(default)]
    pub use_gpu: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            train_dir: default_train_dir(),
            val_dir: default_val_dir(),
            test_dir: default_test_dir(),
            log_dir: default_log_dir(),
            model_dir: default_model_dir(),
            search_dir: default_search_dir(),
            batch_size: default_batch_size(),
            img_size: ImageSize::default(),
            seed: None,
            use_validation_dir: false,
            use_gpu: false,
        }
    }
}

impl SessionConfig {
    /// Reject settings no pipeline or model could be built from.
    pub fn validate(&self) -> Result<(), MlError> {
        if self.batch_size == 0 {
            return Err(MlError::Config("batch_size must be at least 1".into()));
        }
        if self.img_size.height == 0 || self.img_size.width == 0 {
            return Err(MlError::Config(format!(
                "img_size must be non-zero, got {}",
                self.img_size
            )));
        }
        Ok(())
    }
}

fn default_train_dir() -> PathBuf {
    PathBuf::from("data/train")
}

fn default_val_dir() -> PathBuf {
    PathBuf::from("data/validation")
}

fn default_test_dir() -> PathBuf {
    PathBuf::from("data/test")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_search_dir() -> PathBuf {
    PathBuf::from("hyperband_logs")
}

fn default_batch_size() -> usize {
    32
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit config file (passed as argument)
/// 2. Environment variables (prefixed with `SKINVESTIGATOR_`)
/// 3. Workspace-local config (`skinvestigator.toml`)
/// 4. User config (`~/.config/skinvestigator/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
) -> Result<AppConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(WORKSPACE_CONFIG_FILE);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // SKINVESTIGATOR_SESSION__BATCH_SIZE, SKINVESTIGATOR_TRAINING__EPOCHS, ...
    figment = figment.merge(Env::prefixed("SKINVESTIGATOR_").split("__"));

    if let Some(path) = explicit {
        figment = figment.merge(Toml::file(path));
    }

    figment.extract().map_err(Box::new)
}

/// Location of the user-level configuration file, if the platform has one.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "skinvestigator", "skinvestigator")
        .map(|d| d.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_session_shape() {
        let config = SessionConfig::default();
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.img_size, ImageSize::new(180, 180));
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.model_dir, PathBuf::from("models"));
        assert_eq!(config.search_dir, PathBuf::from("hyperband_logs"));
        assert!(!config.use_validation_dir);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = SessionConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(MlError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_image() {
        let config = SessionConfig {
            img_size: ImageSize::new(0, 32),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_workspace_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(WORKSPACE_CONFIG_FILE),
            r#"
[session]
batch_size = 8
train_dir = "corpus/train"

[session.img_size]
height = 64
width = 48

[training]
patience_es = 7
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.session.batch_size, 8);
        assert_eq!(config.session.train_dir, PathBuf::from("corpus/train"));
        assert_eq!(config.session.img_size, ImageSize::new(64, 48));
        assert_eq!(config.training.patience_es, 7);
        // Untouched keys keep their defaults.
        assert_eq!(config.training.patience_lr, 100);
        assert_eq!(config.tuning.factor, 3);
    }

    #[test]
    fn test_explicit_file_wins_over_workspace() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(WORKSPACE_CONFIG_FILE),
            "[session]\nbatch_size = 8\n",
        )
        .unwrap();
        let explicit = dir.path().join("override.toml");
        std::fs::write(&explicit, "[session]\nbatch_size = 4\n").unwrap();

        let config = load_config(Some(dir.path()), Some(&explicit)).unwrap();
        assert_eq!(config.session.batch_size, 4);
    }

    #[test]
    fn test_toml_rendering_roundtrip() {
        let config = AppConfig::default();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[session]"));
        let parsed: AppConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
