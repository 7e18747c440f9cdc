use candle_core::{backprop::GradStore, DType, Tensor, Var};
use layers::NamedParam;

use crate::{
    config::{OptimizerKind, RunConfig},
    TrainingError,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizerConfig {
    Sgd(SgdConfig),
    Adam(AdamConfig),
}

/// Momentum SGD with L2 weight decay folded into the gradient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

/// Adam with L2 weight decay folded into the gradient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl From<&RunConfig> for OptimizerConfig {
    fn from(value: &RunConfig) -> Self {
        match value.optim {
            OptimizerKind::Sgd => OptimizerConfig::Sgd(SgdConfig {
                learning_rate: value.lr,
                momentum: value.momentum,
                weight_decay: value.weight_decay,
            }),
            OptimizerKind::Adam => OptimizerConfig::Adam(AdamConfig {
                learning_rate: value.lr,
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
                weight_decay: value.weight_decay,
            }),
        }
    }
}

#[derive(Debug)]
pub struct TrainerOptimizer {
    config: OptimizerConfig,
    params: Vec<ParameterSlot>,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    momentum_buffer: Option<Tensor>,
    first_moment: Option<Tensor>,
    second_moment: Option<Tensor>,
    steps: usize,
}

impl TrainerOptimizer {
    pub fn new(params: Vec<NamedParam>, config: OptimizerConfig) -> Result<Self, TrainingError> {
        if params.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }
        let mut slots = Vec::with_capacity(params.len());
        for param in params {
            if !param.kind.is_trainable() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-trainable tensor '{}'",
                    param.name
                )));
            }
            if !param.var.as_tensor().dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    param.name
                )));
            }
            slots.push(ParameterSlot {
                name: param.name,
                param: param.var,
                momentum_buffer: None,
                first_moment: None,
                second_moment: None,
                steps: 0,
            });
        }
        Ok(Self {
            config,
            params: slots,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        match self.config {
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate,
            OptimizerConfig::Adam(cfg) => cfg.learning_rate,
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.config {
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate = lr,
            OptimizerConfig::Adam(cfg) => cfg.learning_rate = lr,
        }
    }

    /// Applies one update to every parameter that has a gradient in `grads`,
    /// consuming those gradients.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let config = self.config;
        for slot in &mut self.params {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let updated = match config {
                OptimizerConfig::Sgd(cfg) => slot.step_sgd(cfg, grad),
                OptimizerConfig::Adam(cfg) => slot.step_adam(cfg, grad),
            };
            updated.map_err(|err| {
                TrainingError::runtime(format!("update of '{}' failed: {err}", slot.name))
            })?;
        }
        Ok(())
    }
}

impl ParameterSlot {
    fn decayed_grad(&self, grad: Tensor, weight_decay: f64) -> Result<(Tensor, Tensor), TrainingError> {
        let param = self.param.as_tensor().to_dtype(DType::F32)?;
        let grad = grad.to_dtype(DType::F32)?;
        let grad = if weight_decay != 0.0 {
            (grad + param.affine(weight_decay, 0.0)?)?
        } else {
            grad
        };
        Ok((param, grad))
    }

    fn write(&self, next: Tensor) -> Result<(), TrainingError> {
        let dtype = self.param.as_tensor().dtype();
        let next = if dtype == DType::F32 {
            next
        } else {
            next.to_dtype(dtype)?
        };
        self.param.set(&next)?;
        Ok(())
    }

    fn step_sgd(&mut self, cfg: SgdConfig, grad: Tensor) -> Result<(), TrainingError> {
        let (param, mut direction) = self.decayed_grad(grad, cfg.weight_decay)?;
        if cfg.momentum != 0.0 {
            let buffer = match self.momentum_buffer.take() {
                Some(buffer) => (buffer.affine(cfg.momentum, 0.0)? + &direction)?,
                None => direction.clone(),
            };
            direction = buffer.clone();
            self.momentum_buffer = Some(buffer);
        }
        self.steps += 1;
        let next = (param - direction.affine(cfg.learning_rate, 0.0)?)?;
        self.write(next)
    }

    fn step_adam(&mut self, cfg: AdamConfig, grad: Tensor) -> Result<(), TrainingError> {
        let (param, grad) = self.decayed_grad(grad, cfg.weight_decay)?;
        self.steps += 1;

        let grad_term = grad.affine(1.0 - cfg.beta1, 0.0)?;
        let first = match self.first_moment.take() {
            Some(prev) => (prev.affine(cfg.beta1, 0.0)? + grad_term)?,
            None => grad_term,
        };
        let grad_sq_term = grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?;
        let second = match self.second_moment.take() {
            Some(prev) => (prev.affine(cfg.beta2, 0.0)? + grad_sq_term)?,
            None => grad_sq_term,
        };

        let bias_correction1 = 1.0 - cfg.beta1.powi(self.steps as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.steps as i32);
        let step_size = cfg.learning_rate / bias_correction1;
        let denom = second
            .sqrt()?
            .affine(1.0 / bias_correction2.sqrt(), cfg.epsilon)?;
        let update = first.div(&denom)?.affine(step_size, 0.0)?;
        let next = (param - update)?;

        self.first_moment = Some(first);
        self.second_moment = Some(second);
        self.write(next)
    }
}

/// Clamps every gradient element of `params` into `[-clip_value, clip_value]`.
pub fn clip_grad_value(
    grads: &mut GradStore,
    params: &[NamedParam],
    clip_value: f64,
) -> Result<(), TrainingError> {
    if clip_value.is_nan() || clip_value < 0.0 {
        return Err(TrainingError::runtime(format!(
            "gradient clip value must be non-negative, got {}",
            clip_value
        )));
    }
    for param in params {
        let tensor = param.var.as_tensor();
        if let Some(grad) = grads.get(tensor) {
            let clipped = grad.clamp(-clip_value, clip_value)?;
            grads.insert(tensor, clipped);
        }
    }
    Ok(())
}
