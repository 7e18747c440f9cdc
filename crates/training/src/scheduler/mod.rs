use std::f64::consts::PI;

use tracing::warn;

use crate::{config::ScheduleKind, TrainingError};

/// Epochs over which the cosine schedule anneals, independent of `max_epochs`.
pub const COSINE_HORIZON: usize = 200;

/// Per-epoch learning-rate schedule.
pub trait LRScheduler: Send {
    /// Advances one epoch and returns the new learning rate.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerConfig {
    CosineAnnealing {
        base_lr: f64,
        min_lr: f64,
        horizon: usize,
    },
    Constant {
        base_lr: f64,
    },
}

impl SchedulerConfig {
    pub fn from_kind(kind: &ScheduleKind, base_lr: f64) -> Self {
        match kind {
            ScheduleKind::CosineAnnealingLR => SchedulerConfig::CosineAnnealing {
                base_lr,
                min_lr: 0.0,
                horizon: COSINE_HORIZON,
            },
            ScheduleKind::Unrecognized(name) => {
                warn!(
                    schedule = %name,
                    "unrecognized lr_sched; keeping a constant learning rate"
                );
                SchedulerConfig::Constant { base_lr }
            }
        }
    }

    pub fn build(self) -> Result<Box<dyn LRScheduler>, TrainingError> {
        match self {
            SchedulerConfig::CosineAnnealing {
                base_lr,
                min_lr,
                horizon,
            } => Ok(Box::new(CosineAnnealing::new(base_lr, min_lr, horizon)?)),
            SchedulerConfig::Constant { base_lr } => Ok(Box::new(Constant { base_lr })),
        }
    }
}

/// Closed-form cosine annealing; past the horizon the curve keeps following
/// the cosine and rises again.
#[derive(Debug, Clone)]
pub struct CosineAnnealing {
    base_lr: f64,
    min_lr: f64,
    horizon: usize,
    epoch: usize,
    current_lr: f64,
}

impl CosineAnnealing {
    pub fn new(base_lr: f64, min_lr: f64, horizon: usize) -> Result<Self, TrainingError> {
        if horizon == 0 {
            return Err(TrainingError::initialization(
                "cosine schedule requires a horizon greater than zero",
            ));
        }
        if min_lr > base_lr {
            return Err(TrainingError::initialization(
                "cosine schedule min_lr cannot exceed the base learning rate",
            ));
        }
        Ok(Self {
            base_lr,
            min_lr,
            horizon,
            epoch: 0,
            current_lr: base_lr,
        })
    }

    pub fn lr_at(&self, epoch: usize) -> f64 {
        let progress = epoch as f64 / self.horizon as f64;
        self.min_lr + (self.base_lr - self.min_lr) * (1.0 + (PI * progress).cos()) / 2.0
    }
}

impl LRScheduler for CosineAnnealing {
    fn step(&mut self) -> f64 {
        self.epoch += 1;
        self.current_lr = self.lr_at(self.epoch);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}

#[derive(Debug, Clone)]
struct Constant {
    base_lr: f64,
}

impl LRScheduler for Constant {
    fn step(&mut self) -> f64 {
        self.base_lr
    }

    fn learning_rate(&self) -> f64 {
        self.base_lr
    }
}
