//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use skinvestigator_core::config::{AppConfig, SessionConfig, WORKSPACE_CONFIG_FILE, load_config};
use skinvestigator_core::model::ModelSpec;
use skinvestigator_core::{EvaluationReport, SavedArtifacts, TrainingSession};
use std::path::{Path, PathBuf};

/// File name used when no `--output` is given.
const DEFAULT_ARTIFACT: &str = "skinvestigator.safetensors";

/// Blocking body of a model subcommand, run against the loaded configuration.
type Job = Box<dyn FnOnce(AppConfig) -> anyhow::Result<()> + Send>;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    explicit_config: Option<&Path>,
) -> anyhow::Result<()> {
    let (name, job): (&str, Job) = match command {
        Commands::Config { action } => return handle_config(action, workspace, explicit_config),
        Commands::Train {
            augment,
            epochs,
            output,
        } => (
            "train",
            Box::new(move |config: AppConfig| run_train(config, augment, epochs, output)) as Job,
        ),
        Commands::Tune {
            max_epochs,
            overwrite,
            output,
        } => (
            "tune",
            Box::new(move |config: AppConfig| run_tune(config, max_epochs, overwrite, output)) as Job,
        ),
        Commands::Evaluate { model } => (
            "evaluate",
            Box::new(move |config: AppConfig| run_evaluate(config, &model)) as Job,
        ),
        Commands::Summary { model } => (
            "summary",
            Box::new(move |config: AppConfig| run_summary(config, model.as_deref())) as Job,
        ),
    };

    let config = load_workspace_config(workspace, explicit_config)?;
    tracing::info!(command = name, workspace = %workspace.display(), "Starting command");
    let started = std::time::Instant::now();
    // Training is CPU-bound; keep it off the async runtime.
    let result = tokio::task::spawn_blocking(move || job(config)).await?;
    match &result {
        Ok(()) => tracing::info!(
            command = name,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Command finished"
        ),
        Err(e) => tracing::warn!(command = name, error = %e, "Command failed"),
    }
    result
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    explicit_config: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace.join(WORKSPACE_CONFIG_FILE);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            std::fs::write(&config_path, AppConfig::default().to_toml()?)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(Some(workspace), explicit_config)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            println!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// Load the layered configuration and anchor its relative paths at `workspace`.
fn load_workspace_config(
    workspace: &Path,
    explicit_config: Option<&Path>,
) -> anyhow::Result<AppConfig> {
    let mut config = load_config(Some(workspace), explicit_config)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    resolve_paths(&mut config.session, workspace);
    Ok(config)
}

fn resolve_paths(session: &mut SessionConfig, workspace: &Path) {
    for dir in [
        &mut session.train_dir,
        &mut session.val_dir,
        &mut session.test_dir,
        &mut session.log_dir,
        &mut session.model_dir,
        &mut session.search_dir,
    ] {
        if dir.is_relative() {
            *dir = workspace.join(&*dir);
        }
    }
}

fn artifact_path(session: &SessionConfig, output: Option<PathBuf>) -> PathBuf {
    output.unwrap_or_else(|| session.model_dir.join(DEFAULT_ARTIFACT))
}

fn run_train(
    mut config: AppConfig,
    augment: bool,
    epochs: Option<usize>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(epochs) = epochs {
        config.training.epochs = epochs;
    }
    let output = artifact_path(&config.session, output);

    let mut session = TrainingSession::new(config.session)?;
    let data = session.preprocess_data_with(augment)?;
    session.build_model(data.train.folder().classes.len())?;
    println!("{}", session.summary()?);

    let history = session.train(&data.train, &data.validation, &config.training)?;
    if let Some(stopped) = history.stopped_epoch {
        println!("Stopped early after epoch {}", stopped + 1);
    }
    if let Some(best) = &history.best_checkpoint {
        println!(
            "Best checkpoint: {} (epoch {}, val_loss {:.4})",
            best.path.display(),
            best.epoch + 1,
            best.loss
        );
    }

    let report = session.evaluate_pipeline(&data.test)?;
    let saved = session.save(&output)?;
    print_outcome(&report, &saved);
    Ok(())
}

fn run_tune(
    mut config: AppConfig,
    max_epochs: Option<usize>,
    overwrite: bool,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(max_epochs) = max_epochs {
        config.tuning.max_epochs = max_epochs;
    }
    config.tuning.overwrite |= overwrite;
    let output = artifact_path(&config.session, output);

    let mut session = TrainingSession::new(config.session)?;
    let data = session.preprocess_data()?;
    let outcome = session.tune_hyperparameters(&data.train, &data.validation, &config.tuning)?;
    println!(
        "Best configuration ({} trials, val_loss {:.4}): {}",
        outcome.trials.len(),
        outcome.best_score,
        outcome.best
    );
    println!("{}", session.summary()?);

    let report = session.evaluate_pipeline(&data.test)?;
    let saved = session.save(&output)?;
    print_outcome(&report, &saved);
    Ok(())
}

fn run_evaluate(config: AppConfig, model: &Path) -> anyhow::Result<()> {
    let mut session = TrainingSession::new(config.session)?;
    session.load(model)?;
    let report = session.evaluate()?;
    println!("{report}");
    println!("Test loss: {:.4} over {} samples", report.loss, report.samples);
    Ok(())
}

fn run_summary(config: AppConfig, model: Option<&Path>) -> anyhow::Result<()> {
    let summary = match model {
        Some(path) => {
            let mut session = TrainingSession::new(config.session)?;
            session.load(path)?;
            session.summary()?
        }
        None => ModelSpec::fixed(config.session.img_size).summary()?,
    };
    println!("{summary}");
    Ok(())
}

fn print_outcome(report: &EvaluationReport, saved: &SavedArtifacts) {
    println!("{report}");
    println!(
        "Saved {} ({} bytes) and {} ({} bytes)",
        saved.primary.display(),
        saved.primary_bytes,
        saved.quantized.display(),
        saved.quantized_bytes
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_relative_paths_resolve_against_workspace() {
        let mut session = SessionConfig {
            log_dir: PathBuf::from("/abs/logs"),
            ..Default::default()
        };
        resolve_paths(&mut session, Path::new("/ws"));
        assert_eq!(session.train_dir, PathBuf::from("/ws/data/train"));
        assert_eq!(session.search_dir, PathBuf::from("/ws/hyperband_logs"));
        assert_eq!(session.log_dir, PathBuf::from("/abs/logs"));
    }

    #[test]
    fn test_default_artifact_lives_in_model_dir() {
        let session = SessionConfig {
            model_dir: PathBuf::from("/ws/models"),
            ..Default::default()
        };
        assert_eq!(
            artifact_path(&session, None),
            PathBuf::from("/ws/models/skinvestigator.safetensors")
        );
        let explicit = PathBuf::from("/tmp/m.safetensors");
        assert_eq!(artifact_path(&session, Some(explicit.clone())), explicit);
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        handle_config(ConfigAction::Init, dir.path(), None).unwrap();
        let path = dir.path().join(WORKSPACE_CONFIG_FILE);
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("[session]"));

        std::fs::write(&path, "[training]\nepochs = 3\n").unwrap();
        handle_config(ConfigAction::Init, dir.path(), None).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "[training]\nepochs = 3\n"
        );
    }

    #[test]
    fn test_workspace_config_is_layered() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(WORKSPACE_CONFIG_FILE),
            "[session]\nbatch_size = 8\n",
        )
        .unwrap();
        let config = load_workspace_config(dir.path(), None).unwrap();
        assert_eq!(config.session.batch_size, 8);
        assert_eq!(config.session.model_dir, dir.path().join("models"));
    }

    #[tokio::test]
    async fn test_config_command_skips_workspace_loading() {
        let dir = TempDir::new().unwrap();
        // An unparsable workspace config would fail any model command.
        std::fs::write(dir.path().join(WORKSPACE_CONFIG_FILE), "not = [toml").unwrap();
        let command = Commands::Config {
            action: ConfigAction::Init,
        };
        handle_command(command, dir.path(), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_model_commands_run_on_blocking_pool() {
        let dir = TempDir::new().unwrap();
        handle_command(Commands::Summary { model: None }, dir.path(), None)
            .await
            .unwrap();

        let missing = Commands::Evaluate {
            model: dir.path().join("absent.safetensors"),
        };
        assert!(handle_command(missing, dir.path(), None).await.is_err());
    }
}
