//! Epoch observers driven through a real training loop.

mod common;

use candle_core::Device;
use pretty_assertions::assert_eq;
use skinvestigator_core::config::ImageSize;
use skinvestigator_core::error::MlError;
use skinvestigator_core::model::{Model, WeightSnapshot};
use skinvestigator_core::training::{
    BestCheckpoint, CheckpointManager, EarlyStopping, EpochContext, EpochObserver, ObserverAction,
    ReduceLrOnPlateau, RunId, Trainer,
};
use skinvestigator_core::{Augmentation, DataPipeline};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Keeps a copy of the weights seen at every epoch end.
struct WeightRecorder {
    seen: Arc<Mutex<Vec<WeightSnapshot>>>,
}

impl EpochObserver for WeightRecorder {
    fn name(&self) -> &str {
        "weight_recorder"
    }

    fn on_epoch_end(&mut self, ctx: &EpochContext<'_>) -> Result<ObserverAction, MlError> {
        self.seen.lock().unwrap().push(ctx.model.snapshot()?);
        Ok(ObserverAction::Continue)
    }
}

fn pipelines(root: &Path) -> (DataPipeline, DataPipeline) {
    common::write_corpus(&root.join("train"), 4);
    common::write_corpus(&root.join("val"), 2);
    let size = ImageSize::new(common::SIDE as usize, common::SIDE as usize);
    let train = DataPipeline::from_directory(
        &root.join("train"),
        4,
        size,
        Augmentation::none(),
        Device::Cpu,
    )
    .unwrap()
    .with_seed(Some(3));
    let val = DataPipeline::from_directory(&root.join("val"), 4, size, Augmentation::none(), Device::Cpu)
        .unwrap()
        .with_shuffle(false);
    (train, val)
}

#[test]
fn test_early_stopping_restores_best_weights() {
    let dir = TempDir::new().unwrap();
    let (train, val) = pipelines(dir.path());
    let mut model = Model::new(common::tiny_spec(), &Device::Cpu).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    // A huge min_delta means only the first epoch counts as an improvement.
    let observers: Vec<Box<dyn EpochObserver>> = vec![
        Box::new(WeightRecorder { seen: seen.clone() }),
        Box::new(EarlyStopping::new(2, 1e9)),
    ];
    let mut trainer = Trainer::new(observers);
    let history = trainer.fit(&mut model, &train, &val, 10).unwrap();

    assert_eq!(history.epochs_completed(), 3);
    assert_eq!(history.stopped_epoch, Some(2));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    let restored = model.snapshot().unwrap();
    assert_eq!(restored.max_abs_diff(&seen[0]).unwrap(), Some(0.0));
    let drift = restored.max_abs_diff(&seen[2]).unwrap().unwrap();
    assert!(drift > 0.0, "weights never moved after the best epoch");
}

#[test]
fn test_plateau_schedule_halves_to_floor() {
    let dir = TempDir::new().unwrap();
    let (train, val) = pipelines(dir.path());
    let mut model = Model::new(common::tiny_spec(), &Device::Cpu).unwrap();

    let observers: Vec<Box<dyn EpochObserver>> =
        vec![Box::new(ReduceLrOnPlateau::new(0.5, 1, 1e-4, 1e9, 0))];
    let mut trainer = Trainer::new(observers).with_steps(Some(1), Some(1));
    let history = trainer.fit(&mut model, &train, &val, 6).unwrap();

    let lrs = history.series("lr").unwrap();
    let expected = [1e-3, 1e-3, 5e-4, 2.5e-4, 1.25e-4, 1e-4];
    assert_eq!(lrs.len(), expected.len());
    for (got, want) in lrs.iter().zip(expected) {
        assert!((got - want).abs() < 1e-12, "lr {got} != {want}");
    }
    assert!((model.learning_rate() - 1e-4).abs() < 1e-12);
    assert!(lrs.windows(2).all(|w| w[1] <= w[0]));
}

#[test]
fn test_best_checkpoint_without_manager_writes_plain_file() {
    let dir = TempDir::new().unwrap();
    let (train, val) = pipelines(dir.path());
    let mut model = Model::new(common::tiny_spec(), &Device::Cpu).unwrap();
    let target = dir.path().join("ckpt").join("best.safetensors");

    let observers: Vec<Box<dyn EpochObserver>> = vec![Box::new(BestCheckpoint::new(target.clone()))];
    let mut trainer = Trainer::new(observers).with_steps(Some(1), Some(1));
    trainer.fit(&mut model, &train, &val, 2).unwrap();

    assert!(target.exists());
    let loaded = skinvestigator_core::model::load_model(&target, &Device::Cpu).unwrap();
    assert_eq!(loaded.spec(), model.spec());
}

#[test]
fn test_history_reports_verified_best_checkpoint() {
    let dir = TempDir::new().unwrap();
    let (train, val) = pipelines(dir.path());
    let mut model = Model::new(common::tiny_spec(), &Device::Cpu).unwrap();
    let (run_id, _) = RunId::allocate(&dir.path().join("logs")).unwrap();
    let manager = CheckpointManager::new(dir.path().join("models"), 10);
    let target = manager.best_model_path(run_id.as_str());

    let observers: Vec<Box<dyn EpochObserver>> = vec![Box::new(BestCheckpoint::new(target.clone()))];
    let mut trainer = Trainer::new(observers)
        .with_steps(Some(1), Some(1))
        .with_checkpoints(manager, &run_id);
    let history = trainer.fit(&mut model, &train, &val, 3).unwrap();

    let best = history.best_checkpoint.expect("best checkpoint recorded");
    assert_eq!(best.path, target);
    assert_eq!(Some(best.epoch), history.best_epoch);
    assert_eq!(best.run_id, run_id.as_str());
}

#[test]
fn test_history_without_manager_has_no_checkpoint() {
    let dir = TempDir::new().unwrap();
    let (train, val) = pipelines(dir.path());
    let mut model = Model::new(common::tiny_spec(), &Device::Cpu).unwrap();
    let mut trainer = Trainer::new(Vec::new()).with_steps(Some(1), Some(1));
    let history = trainer.fit(&mut model, &train, &val, 1).unwrap();
    assert!(history.best_checkpoint.is_none());
}

#[test]
fn test_resumed_fit_numbers_epochs_from_initial() {
    let dir = TempDir::new().unwrap();
    let (train, val) = pipelines(dir.path());
    let mut model = Model::new(common::tiny_spec(), &Device::Cpu).unwrap();

    let mut trainer = Trainer::new(Vec::new()).with_steps(Some(1), Some(1));
    let history = trainer.fit_from(&mut model, &train, &val, 3, 5).unwrap();
    let epochs: Vec<usize> = history.records.iter().map(|r| r.epoch).collect();
    assert_eq!(epochs, vec![3, 4]);
}
