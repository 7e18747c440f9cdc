use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::TrainingError;

/// Mean cross entropy between `(batch, classes)` logits and integer labels.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self
    }

    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let (batch, classes) = match logits.dims() {
            [batch, classes] => (*batch, *classes),
            dims => {
                return Err(TrainingError::runtime(format!(
                    "cross entropy expects (batch, classes) logits, got {:?}",
                    dims
                )))
            }
        };
        if batch == 0 || classes == 0 {
            return Err(TrainingError::runtime(
                "cross entropy needs at least one example and one class",
            ));
        }
        if targets.dims() != [batch] {
            return Err(TrainingError::runtime(format!(
                "targets must be shaped ({},), got {:?}",
                batch,
                targets.dims()
            )));
        }

        let targets = targets.to_device(logits.device())?;
        let targets = match targets.dtype() {
            DType::U32 => targets,
            DType::I64 | DType::U8 => targets.to_dtype(DType::U32)?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported target dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };

        let log_probs = ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
        let nll = log_probs
            .gather(&targets.unsqueeze(1)?, 1)?
            .squeeze(1)?
            .neg()?;
        let loss = nll.mean_all()?;
        let average_loss = loss.to_vec0::<f32>()?;

        let correct = logits
            .argmax(D::Minus1)?
            .eq(&targets)?
            .to_dtype(DType::U32)?
            .sum_all()?
            .to_vec0::<u32>()? as usize;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                average_loss,
                examples: batch,
                correct,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar loss tensor; backpropagate through this.
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone, Copy)]
pub struct LossMetrics {
    average_loss: f32,
    examples: usize,
    correct: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    pub fn examples(&self) -> usize {
        self.examples
    }

    /// Examples whose arg-max prediction matches the label.
    pub fn correct(&self) -> usize {
        self.correct
    }
}
