use std::{path::Path, sync::Arc};

use anyhow::Result;
use candle_core::Device;
use serde_json::Value;
use tempfile::tempdir;
use training::{
    checkpoint::{load_checkpoint, CheckpointRecord, CheckpointStore},
    data::TransformPipeline,
    ConfigDocument, DataLoader, DriverState, ImageDataLoader, ImageDataset, RunConfig, RunContext,
    Trainer, TrainingError,
};

const CONFIG: &str = "
test1:
  batch_size: 8
  num_workers: 2
  data_augmentation: true
  data_normalize: true
  optim: sgd
  lr: 0.1
  momentum: 0.9
  weight_decay: 0.0005
  lr_sched: CosineAnnealingLR
  max_epochs: 1
  grad_clip: 0.5
  resume_ckpt: ''
  weights_init_type: kaiming_normal
  architecture: custom
  num_blocks: [1, 1]
  channels: [8, 16]
adam_run:
  batch_size: 4
  num_workers: 0
  data_augmentation: false
  data_normalize: false
  optim: adam
  lr: 0.001
  momentum: 0.0
  weight_decay: 0.0
  lr_sched: step
  max_epochs: 1
  grad_clip: false
  resume_ckpt: null
  weights_init_type: orthogonal
  num_blocks: [1, 1]
  channels: [8, 16]
resnet18:
  batch_size: 128
  num_workers: 0
  data_augmentation: true
  data_normalize: true
  optim: sgd
  lr: 0.1
  momentum: 0.9
  weight_decay: 0.0005
  lr_sched: CosineAnnealingLR
  max_epochs: 200
  grad_clip: 0
  resume_ckpt: ''
  architecture: resnet18
";

fn synthetic_loader(examples: usize, batch: usize, train: bool, seed: u64) -> Box<dyn DataLoader> {
    let image_len = 3 * 32 * 32;
    let pixels = (0..examples * image_len)
        .map(|i| ((i / image_len) * 23 + i % 97) as u8)
        .collect();
    let labels = (0..examples).map(|i| (i % 10) as u8).collect();
    let dataset = ImageDataset::new(pixels, labels, 3, 32, 32).expect("synthetic dataset");
    let pipeline = if train {
        TransformPipeline::for_training(true, true)
    } else {
        TransformPipeline::for_evaluation(true)
    };
    Box::new(
        ImageDataLoader::new(
            Arc::new(dataset),
            pipeline,
            Device::Cpu,
            batch,
            train,
            if train { 2 } else { 0 },
            seed,
        )
        .expect("synthetic loader"),
    )
}

fn resolve(run: &str, overrides: &[(&str, Value)]) -> Result<RunConfig> {
    let mut document = ConfigDocument::from_yaml_str(CONFIG)?;
    for (key, value) in overrides {
        document.apply_override(run, key, value.clone())?;
    }
    Ok(document.resolve(run)?)
}

fn trainer(config: RunConfig, summaries: &Path) -> Result<Trainer, TrainingError> {
    let context = RunContext::new(config.run_name(), Device::Cpu)
        .with_summaries_dir(summaries)
        .quiet();
    let batch = config.batch_size;
    let eval_batch = config.eval_batch_size();
    Trainer::with_loaders(
        config,
        context,
        synthetic_loader(20, batch, true, 3),
        synthetic_loader(10, eval_batch, false, 3),
    )
}

#[test]
fn over_budget_model_is_rejected_before_any_io() -> Result<()> {
    let dir = tempdir()?;
    let summaries = dir.path().join("summaries");
    let config = resolve("resnet18", &[])?;

    let err = match trainer(config, &summaries) {
        Ok(_) => panic!("resnet18 must exceed the parameter budget"),
        Err(err) => err,
    };
    assert!(err.is_budget_rejection());
    match err {
        TrainingError::BudgetExceeded {
            total_params,
            ceiling,
        } => {
            assert_eq!(total_params, 11_173_962);
            assert_eq!(ceiling, 5_000_000);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!summaries.exists());
    Ok(())
}

#[test]
fn single_epoch_run_checkpoints_best_accuracy() -> Result<()> {
    let dir = tempdir()?;
    let mut trainer = trainer(resolve("test1", &[])?, dir.path())?;
    assert_eq!(trainer.state(), DriverState::Ready);

    let summary = trainer.run()?;
    assert_eq!(trainer.state(), DriverState::Completed);
    assert_eq!(summary.start_epoch, 0);
    assert_eq!(summary.epochs_run, 1);

    let expected_lr = 0.1 * (1.0 + (std::f64::consts::PI / 200.0).cos()) / 2.0;
    assert!((trainer.learning_rate() - expected_lr).abs() < 1e-12);

    let checkpoint = dir.path().join("test1").join("checkpoint.pth");
    assert_eq!(summary.checkpoint_path.is_some(), summary.best_accuracy > 0.0);
    if let Some(path) = summary.checkpoint_path {
        assert_eq!(path, checkpoint);
        let loaded = load_checkpoint(&path, &Device::Cpu)?;
        assert_eq!(loaded.record.epoch, 0);
        assert_eq!(loaded.record.accuracy, summary.best_accuracy);
        assert_eq!(
            loaded.record.config["total_params"].as_u64(),
            Some(trainer.total_params() as u64)
        );
        assert_eq!(loaded.record.config["optim"], Value::from("sgd"));
        assert!(loaded.tensors.contains_key("layer2.0.shortcut.1.running_var"));
    } else {
        assert!(!checkpoint.exists());
    }
    Ok(())
}

#[test]
fn resume_restores_epoch_and_best_accuracy() -> Result<()> {
    let dir = tempdir()?;
    let seed_trainer = trainer(resolve("test1", &[])?, dir.path())?;
    let saved = CheckpointStore::new(dir.path(), "seeded").save(
        seed_trainer.params(),
        &CheckpointRecord {
            accuracy: 42.5,
            epoch: 3,
            config: Value::Null,
        },
    )?;
    let resume = Value::from(saved.display().to_string());

    let mut finished = trainer(
        resolve("test1", &[("resume_ckpt", resume.clone()), ("max_epochs", Value::from(3))])?,
        dir.path(),
    )?;
    assert_eq!(finished.run_state().start_epoch, 3);
    assert_eq!(finished.run_state().best_accuracy, 42.5);
    let summary = finished.run()?;
    assert_eq!(summary.start_epoch, 3);
    assert_eq!(summary.epochs_run, 0);
    assert_eq!(summary.best_accuracy, 42.5);
    assert!(!dir.path().join("test1").exists());

    let mut continued = trainer(
        resolve("test1", &[("resume_ckpt", resume), ("max_epochs", Value::from(4))])?,
        dir.path(),
    )?;
    let summary = continued.run()?;
    assert_eq!(summary.epochs_run, 1);
    assert!(summary.best_accuracy >= 42.5);
    Ok(())
}

#[test]
fn missing_resume_checkpoint_is_fatal() -> Result<()> {
    let dir = tempdir()?;
    let missing = dir.path().join("nowhere").join("checkpoint.pth");
    let config = resolve(
        "test1",
        &[("resume_ckpt", Value::from(missing.display().to_string()))],
    )?;
    assert!(matches!(
        trainer(config, dir.path()),
        Err(TrainingError::CheckpointLoad(_))
    ));
    Ok(())
}

#[test]
fn adam_with_unrecognized_schedule_keeps_constant_rate() -> Result<()> {
    let dir = tempdir()?;
    let mut trainer = trainer(resolve("adam_run", &[])?, dir.path())?;
    let summary = trainer.run()?;
    assert_eq!(summary.epochs_run, 1);
    assert_eq!(trainer.learning_rate(), 0.001);
    Ok(())
}

#[test]
fn zero_epochs_only_builds_state() -> Result<()> {
    let dir = tempdir()?;
    let mut trainer = trainer(resolve("test1", &[("max_epochs", Value::from(0))])?, dir.path())?;
    let summary = trainer.run()?;
    assert_eq!(summary.epochs_run, 0);
    assert_eq!(summary.best_accuracy, 0.0);
    assert!(summary.checkpoint_path.is_none());
    Ok(())
}

#[test]
fn missing_dataset_is_an_initialization_error() -> Result<()> {
    let dir = tempdir()?;
    let config = resolve(
        "test1",
        &[
            ("data_dir", Value::from(dir.path().display().to_string())),
            ("download", Value::Bool(false)),
        ],
    )?;
    let err = match Trainer::new(config) {
        Ok(_) => panic!("dataset should be missing"),
        Err(err) => err,
    };
    assert!(matches!(err, TrainingError::Initialization(_)));
    assert!(err.to_string().contains("data_batch_1.bin"));
    Ok(())
}
