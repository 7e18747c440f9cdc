use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use layers::{NamedParam, ParamStore, WeightInit};
use model::{build_model, ImageClassifier};
use tracing::{debug, info, warn};

use crate::{
    budget::ParameterBudget,
    checkpoint::{self, CheckpointRecord, CheckpointStore, DEFAULT_SUMMARIES_DIR},
    config::RunConfig,
    data::{
        ensure_cifar10, load_cifar10, BlockingDataLoader, CifarSplit, DataLoader, ImageDataLoader,
        TransformPipeline,
    },
    logging::{Logger, LoggingSettings},
    loss::{CrossEntropyLoss, LossOutput},
    metrics::{EpochSummary, Phase, RunMetrics},
    optimizer::{clip_grad_value, OptimizerConfig, TrainerOptimizer},
    scheduler::{LRScheduler, SchedulerConfig},
    TrainingError,
};

pub type BoxedLoader = BlockingDataLoader<Box<dyn DataLoader>>;

/// Where the driver currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Initializing,
    BudgetCheck,
    Rejected,
    Ready,
    TrainingEpoch(usize),
    EvaluationEpoch(usize),
    ScheduleStep(usize),
    Completed,
}

impl DriverState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DriverState::Rejected | DriverState::Completed)
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverState::Initializing => f.write_str("initializing"),
            DriverState::BudgetCheck => f.write_str("budget-check"),
            DriverState::Rejected => f.write_str("rejected"),
            DriverState::Ready => f.write_str("ready"),
            DriverState::TrainingEpoch(epoch) => write!(f, "training(epoch={epoch})"),
            DriverState::EvaluationEpoch(epoch) => write!(f, "evaluation(epoch={epoch})"),
            DriverState::ScheduleStep(epoch) => write!(f, "schedule-step(epoch={epoch})"),
            DriverState::Completed => f.write_str("completed"),
        }
    }
}

/// Epoch bookkeeping threaded through the loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunState {
    pub start_epoch: usize,
    pub epoch: usize,
    pub best_accuracy: f64,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            start_epoch: 0,
            epoch: 0,
            best_accuracy: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub start_epoch: usize,
    pub epochs_run: usize,
    pub best_accuracy: f64,
    pub checkpoint_path: Option<PathBuf>,
}

/// Everything about a run that does not come from the config document.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_name: String,
    pub summaries_dir: PathBuf,
    pub device: Device,
    pub enable_stdout: bool,
}

impl RunContext {
    pub fn new(run_name: impl Into<String>, device: Device) -> Self {
        Self {
            run_name: run_name.into(),
            summaries_dir: PathBuf::from(DEFAULT_SUMMARIES_DIR),
            device,
            enable_stdout: true,
        }
    }

    pub fn with_summaries_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.summaries_dir = dir.into();
        self
    }

    pub fn quiet(mut self) -> Self {
        self.enable_stdout = false;
        self
    }
}

/// A model that has passed the parameter budget.
pub struct GatedModel {
    pub classifier: Box<dyn ImageClassifier>,
    pub params: ParamStore,
    pub total_params: usize,
}

/// Builds the configured model and runs it through the budget gate.
///
/// Nothing touches the dataset or the summaries directory before this
/// returns, so a rejected model leaves no trace on disk.
pub fn build_gated_model(
    config: &RunConfig,
    device: &Device,
    budget: ParameterBudget,
) -> Result<GatedModel, TrainingError> {
    log_transition(DriverState::Initializing);
    let model_config = config.model_config(device)?;
    let built = build_model(&model_config).map_err(|err| {
        TrainingError::initialization(format!("failed to build model: {err}"))
    })?;
    info!(
        run = config.run_name(),
        layout = %model_config,
        total_params = built.total_params,
        "model built"
    );
    info!("\n{}", built.classifier);

    log_transition(DriverState::BudgetCheck);
    if let Err(err) = budget.check(built.total_params) {
        log_transition(DriverState::Rejected);
        return Err(err);
    }
    Ok(GatedModel {
        classifier: built.classifier,
        params: built.params,
        total_params: built.total_params,
    })
}

/// Picks Metal, then CUDA, then the CPU.
pub fn select_device() -> Device {
    let cuda_available = cuda_is_available();
    let metal_available = metal_is_available();
    debug!(cuda_available, metal_available, "device detection");

    let device = if metal_available {
        match Device::new_metal(0) {
            Ok(device) => device,
            Err(err) => {
                warn!(%err, "failed to initialize metal device, falling back to CPU");
                Device::Cpu
            }
        }
    } else if cuda_available {
        match Device::cuda_if_available(0) {
            Ok(device) => device,
            Err(err) => {
                warn!(%err, "cuda reported available but initialization failed");
                Device::Cpu
            }
        }
    } else {
        Device::Cpu
    };
    info!(
        is_cuda = device.is_cuda(),
        is_metal = device.is_metal(),
        is_cpu = device.is_cpu(),
        "device selected"
    );
    device
}

pub struct Trainer {
    config: RunConfig,
    device: Device,
    classifier: Box<dyn ImageClassifier>,
    params: ParamStore,
    trainable: Vec<NamedParam>,
    total_params: usize,
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    loss: CrossEntropyLoss,
    train_loader: BoxedLoader,
    eval_loader: BoxedLoader,
    checkpoints: CheckpointStore,
    logger: Logger,
    state: RunState,
    driver_state: DriverState,
}

impl Trainer {
    /// Full run setup against the CIFAR-10 batches under `config.data_dir`,
    /// checkpointing beneath `./summaries`.
    pub fn new(config: RunConfig) -> Result<Self, TrainingError> {
        let context = RunContext::new(config.run_name(), select_device());
        let gated = build_gated_model(&config, &context.device, ParameterBudget::default())?;

        if config.download {
            let source = ensure_cifar10(&config.data_dir)?;
            debug!(?source, "dataset source");
        }
        let train_set = Arc::new(load_cifar10(&config.data_dir, CifarSplit::Train)?);
        let test_set = Arc::new(load_cifar10(&config.data_dir, CifarSplit::Test)?);
        info!(
            train_examples = train_set.len(),
            test_examples = test_set.len(),
            "dataset loaded"
        );

        let train_loader = ImageDataLoader::new(
            train_set,
            TransformPipeline::for_training(config.data_augmentation, config.data_normalize),
            context.device.clone(),
            config.batch_size,
            true,
            config.num_workers,
            config.seed,
        )?;
        let eval_loader = ImageDataLoader::new(
            test_set,
            TransformPipeline::for_evaluation(config.data_normalize),
            context.device.clone(),
            config.eval_batch_size(),
            false,
            config.num_workers,
            config.seed,
        )?;

        Self::assemble(
            config,
            context,
            gated,
            Box::new(train_loader),
            Box::new(eval_loader),
        )
    }

    /// Setup with caller-supplied data streams.
    pub fn with_loaders(
        config: RunConfig,
        context: RunContext,
        train_loader: Box<dyn DataLoader>,
        eval_loader: Box<dyn DataLoader>,
    ) -> Result<Self, TrainingError> {
        Self::with_budget(
            config,
            context,
            ParameterBudget::default(),
            train_loader,
            eval_loader,
        )
    }

    pub fn with_budget(
        config: RunConfig,
        context: RunContext,
        budget: ParameterBudget,
        train_loader: Box<dyn DataLoader>,
        eval_loader: Box<dyn DataLoader>,
    ) -> Result<Self, TrainingError> {
        let gated = build_gated_model(&config, &context.device, budget)?;
        Self::assemble(config, context, gated, train_loader, eval_loader)
    }

    fn assemble(
        config: RunConfig,
        context: RunContext,
        gated: GatedModel,
        train_loader: Box<dyn DataLoader>,
        eval_loader: Box<dyn DataLoader>,
    ) -> Result<Self, TrainingError> {
        let config = config.with_total_params(gated.total_params);
        if let Err(err) = context.device.set_seed(config.seed) {
            debug!(%err, "device RNG not seeded");
        }

        if let Some(name) = config.weights_init_type.as_deref() {
            let scheme = WeightInit::from_name(name);
            let touched = scheme.apply(&gated.params).map_err(|err| {
                TrainingError::initialization(format!("weight init '{name}' failed: {err}"))
            })?;
            debug!(scheme = ?scheme, tensors = touched, "weights initialized");
        }

        let mut state = RunState::default();
        if let Some(path) = config.resume_ckpt.as_deref() {
            state = resume_from(path, &gated.params, &context.device)?;
        }

        let trainable = gated.params.trainable();
        if trainable.is_empty() {
            return Err(TrainingError::initialization(
                "model produced no trainable parameters",
            ));
        }
        let optimizer = TrainerOptimizer::new(trainable.clone(), OptimizerConfig::from(&config))?;
        let scheduler = SchedulerConfig::from_kind(&config.lr_sched, config.lr).build()?;
        let logger = Logger::new(LoggingSettings::from_config(
            context.enable_stdout,
            config.log_every_n_batches,
            config.tensorboard_dir.clone(),
        ))?;
        let checkpoints = CheckpointStore::new(&context.summaries_dir, &context.run_name);

        log_transition(DriverState::Ready);
        Ok(Self {
            config,
            device: context.device,
            classifier: gated.classifier,
            params: gated.params,
            trainable,
            total_params: gated.total_params,
            optimizer,
            scheduler,
            loss: CrossEntropyLoss::new(),
            train_loader: BlockingDataLoader::new(train_loader),
            eval_loader: BlockingDataLoader::new(eval_loader),
            checkpoints,
            logger,
            state,
            driver_state: DriverState::Ready,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn state(&self) -> DriverState {
        self.driver_state
    }

    pub fn run_state(&self) -> RunState {
        self.state
    }

    pub fn total_params(&self) -> usize {
        self.total_params
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoints.path()
    }

    /// Runs epochs `start_epoch..max_epochs`, each one train, evaluate, then
    /// advance the schedule.
    pub fn run(&mut self) -> Result<RunSummary, TrainingError> {
        let start_epoch = self.state.start_epoch;
        let mut epochs_run = 0usize;
        self.state.epoch = start_epoch;
        info!(
            run = self.config.run_name(),
            start_epoch,
            max_epochs = self.config.max_epochs,
            "starting training"
        );

        while self.state.epoch < self.config.max_epochs {
            let epoch = self.state.epoch;

            self.transition(DriverState::TrainingEpoch(epoch));
            self.logger
                .log_epoch_start(epoch, self.optimizer.learning_rate())?;
            let train = self.train_epoch(epoch)?;
            self.logger.log_epoch(&train)?;

            self.transition(DriverState::EvaluationEpoch(epoch));
            let test = self.evaluate_epoch(epoch)?;
            self.logger.log_epoch(&test)?;
            self.record_evaluation(epoch, test.accuracy)?;

            self.transition(DriverState::ScheduleStep(epoch));
            let lr = self.scheduler.step();
            self.optimizer.set_learning_rate(lr);

            self.state.epoch += 1;
            epochs_run += 1;
        }

        self.transition(DriverState::Completed);
        let checkpoint_path = self.checkpoints.exists().then(|| self.checkpoints.path());
        info!(
            epochs_run,
            best_accuracy = self.state.best_accuracy,
            "training finished"
        );
        Ok(RunSummary {
            start_epoch,
            epochs_run,
            best_accuracy: self.state.best_accuracy,
            checkpoint_path,
        })
    }

    /// One pass over the shuffled training stream.
    pub fn train_epoch(&mut self, epoch: usize) -> Result<EpochSummary, TrainingError> {
        self.train_loader.start_epoch(epoch)?;
        let num_batches = self.train_loader.num_batches();
        let mut metrics = RunMetrics::new(Phase::Train, epoch);

        while let Some(batch) = self.train_loader.next_batch()? {
            let images = batch.images.to_device(&self.device)?;
            let labels = batch.labels.to_device(&self.device)?;

            let logits = self.classifier.forward_t(&images, true)?;
            let LossOutput { loss, metrics: batch_metrics } = self.loss.compute(&logits, &labels)?;
            let mut grads = loss.backward()?;
            if let Some(clip) = self.config.grad_clip {
                clip_grad_value(&mut grads, &self.trainable, clip)?;
            }
            self.optimizer.step(&mut grads)?;

            let progress = metrics.record(
                batch_metrics.average_loss() as f64,
                batch_metrics.correct(),
                batch_metrics.examples(),
            );
            self.logger.log_batch(&progress, num_batches);
        }

        Ok(metrics.finalize())
    }

    /// One pass over the test stream using running batch-norm statistics.
    pub fn evaluate_epoch(&mut self, epoch: usize) -> Result<EpochSummary, TrainingError> {
        self.eval_loader.start_epoch(epoch)?;
        let num_batches = self.eval_loader.num_batches();
        let mut metrics = RunMetrics::new(Phase::Test, epoch);

        while let Some(batch) = self.eval_loader.next_batch()? {
            let images = batch.images.to_device(&self.device)?;
            let labels = batch.labels.to_device(&self.device)?;

            let logits = self.classifier.forward_t(&images, false)?.detach();
            let output = self.loss.compute(&logits, &labels)?;
            let progress = metrics.record(
                output.metrics.average_loss() as f64,
                output.metrics.correct(),
                output.metrics.examples(),
            );
            self.logger.log_batch(&progress, num_batches);
        }

        if metrics.total() == 0 {
            return Err(TrainingError::runtime(
                "evaluation stream yielded no examples",
            ));
        }
        Ok(metrics.finalize())
    }

    /// Persists a checkpoint when `accuracy` strictly beats the best so far.
    /// Returns whether a checkpoint was written.
    pub fn record_evaluation(&mut self, epoch: usize, accuracy: f64) -> Result<bool, TrainingError> {
        if accuracy <= self.state.best_accuracy {
            return Ok(false);
        }
        info!(epoch, accuracy, previous = self.state.best_accuracy, "Saving..");
        let record = CheckpointRecord {
            accuracy,
            epoch,
            config: self.config.snapshot(),
        };
        let path = self.checkpoints.save(&self.params, &record)?;
        debug!(path = %path.display(), "checkpoint written");
        self.state.best_accuracy = accuracy;
        Ok(true)
    }

    fn transition(&mut self, next: DriverState) {
        self.driver_state = next;
        log_transition(next);
    }
}

fn log_transition(state: DriverState) {
    debug!(state = %state, "driver state");
}

fn resume_from(path: &Path, params: &ParamStore, device: &Device) -> Result<RunState, TrainingError> {
    let loaded = checkpoint::load_checkpoint(path, device)?;
    checkpoint::apply_model_weights(params, loaded.tensors)?;
    info!(
        path = %path.display(),
        epoch = loaded.record.epoch,
        accuracy = loaded.record.accuracy,
        "resumed from checkpoint"
    );
    Ok(RunState {
        start_epoch: loaded.record.epoch,
        epoch: loaded.record.epoch,
        best_accuracy: loaded.record.accuracy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDocument;
    use crate::data::ImageDataset;
    use tempfile::tempdir;

    const RUN: &str = "
tiny:
  batch_size: 4
  num_workers: 0
  data_augmentation: false
  data_normalize: true
  optim: sgd
  lr: 0.1
  momentum: 0.9
  weight_decay: 0.0005
  lr_sched: CosineAnnealingLR
  max_epochs: 1
  grad_clip: 0
  resume_ckpt: ''
  architecture: custom
  num_blocks: [1, 1]
  channels: [8, 16]
";

    fn loader(examples: usize, batch: usize, shuffle: bool) -> Box<dyn DataLoader> {
        let pixels = (0..examples * 3 * 32 * 32).map(|i| (i % 251) as u8).collect();
        let labels = (0..examples).map(|i| (i % 10) as u8).collect();
        let dataset = ImageDataset::new(pixels, labels, 3, 32, 32).unwrap();
        Box::new(
            ImageDataLoader::new(
                Arc::new(dataset),
                TransformPipeline::for_evaluation(true),
                Device::Cpu,
                batch,
                shuffle,
                0,
                7,
            )
            .unwrap(),
        )
    }

    fn trainer(summaries: &Path) -> Trainer {
        let config = ConfigDocument::from_yaml_str(RUN)
            .unwrap()
            .resolve("tiny")
            .unwrap();
        let context = RunContext::new("tiny", Device::Cpu)
            .with_summaries_dir(summaries)
            .quiet();
        Trainer::with_loaders(config, context, loader(8, 4, true), loader(4, 1, false)).unwrap()
    }

    #[test]
    fn only_strict_improvements_write_checkpoints() {
        let dir = tempdir().unwrap();
        let mut trainer = trainer(dir.path());
        assert_eq!(trainer.state(), DriverState::Ready);

        assert!(trainer.record_evaluation(0, 10.0).unwrap());
        assert!(!trainer.record_evaluation(1, 10.0).unwrap());
        assert!(!trainer.record_evaluation(2, 5.0).unwrap());
        assert!(trainer.record_evaluation(3, 20.0).unwrap());

        let loaded = checkpoint::load_checkpoint(&trainer.checkpoint_path(), &Device::Cpu).unwrap();
        assert_eq!(loaded.record.epoch, 3);
        assert_eq!(loaded.record.accuracy, 20.0);
        assert_eq!(
            loaded.record.config["total_params"].as_u64(),
            Some(trainer.total_params() as u64)
        );
    }

    #[test]
    fn zero_accuracy_never_checkpoints() {
        let dir = tempdir().unwrap();
        let mut trainer = trainer(dir.path());
        assert!(!trainer.record_evaluation(0, 0.0).unwrap());
        assert!(!trainer.checkpoint_path().exists());
    }

    #[test]
    fn evaluation_leaves_weights_untouched() {
        let dir = tempdir().unwrap();
        let mut trainer = trainer(dir.path());
        let before = trainer.params().get("linear.weight").unwrap();
        let before = before.var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let summary = trainer.evaluate_epoch(0).unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.batches, 4);
        let after = trainer.params().get("linear.weight").unwrap();
        let after = after.var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn batch_counts_follow_the_loaders() {
        let dir = tempdir().unwrap();
        let config = ConfigDocument::from_yaml_str(RUN)
            .unwrap()
            .resolve("tiny")
            .unwrap();
        let context = RunContext::new("tiny", Device::Cpu)
            .with_summaries_dir(dir.path())
            .quiet();
        let mut trainer =
            Trainer::with_loaders(config, context, loader(10, 3, true), loader(5, 2, false))
                .unwrap();
        assert_eq!(trainer.train_loader.num_batches(), 4);
        assert_eq!(trainer.eval_loader.num_batches(), 3);

        let train = trainer.train_epoch(0).unwrap();
        assert_eq!((train.batches, train.total), (4, 10));
        let test = trainer.evaluate_epoch(0).unwrap();
        assert_eq!((test.batches, test.total), (3, 5));
    }

    #[test]
    fn driver_states_render() {
        assert_eq!(DriverState::TrainingEpoch(2).to_string(), "training(epoch=2)");
        assert!(DriverState::Completed.is_terminal());
        assert!(!DriverState::Ready.is_terminal());
    }
}
