pub mod budget;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use budget::{ParameterBudget, DEFAULT_PARAMETER_CEILING};
pub use checkpoint::{CheckpointRecord, CheckpointStore, LoadedCheckpoint};
pub use config::{ConfigDocument, OptimizerKind, RunConfig, ScheduleKind, TrainingError};
pub use data::{BlockingDataLoader, DataLoader, ImageBatch, ImageDataLoader, ImageDataset};
pub use logging::{Logger, LoggingSettings};
pub use loss::{CrossEntropyLoss, LossMetrics, LossOutput};
pub use metrics::{BatchProgress, EpochSummary, Phase, RunMetrics};
pub use optimizer::{OptimizerConfig, TrainerOptimizer};
pub use scheduler::{LRScheduler, SchedulerConfig};
pub use trainer::{DriverState, RunContext, RunState, RunSummary, Trainer};
