//! Dense classifier head.
//!
//! Inputs are `(batch, in_features)`; outputs `(batch, out_features)`. Weights
//! use the `(out, in)` layout and the stock Kaiming-uniform initialisation,
//! with the bias bound derived from the same fan-in.

use candle_core::{Error, Result, Tensor, Var};

use crate::{
    checks,
    params::{ParamKind, ParamPath},
};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a single projection layer with bias.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.input_dim * self.output_dim + if self.bias { self.output_dim } else { 0 }
    }
}

#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Var,
    bias: Option<Var>,
}

impl Linear {
    /// Registers `weight` (and `bias`) under `path`.
    pub fn new(config: LinearConfig, path: &ParamPath) -> Result<Self> {
        if config.input_dim == 0 || config.output_dim == 0 {
            return Err(Error::Msg(format!(
                "{}: linear dimensions must be non-zero",
                path.qualified("weight")
            )));
        }
        let bound = 1.0 / (config.input_dim as f64).sqrt();
        let weight = Tensor::rand(
            -bound as f32,
            bound as f32,
            (config.output_dim, config.input_dim),
            path.device(),
        )?;
        let weight = path.var("weight", ParamKind::LinearWeight, weight)?;
        let bias = if config.bias {
            let bias = Tensor::rand(-bound as f32, bound as f32, config.output_dim, path.device())?;
            Some(path.var("bias", ParamKind::Bias, bias)?)
        } else {
            None
        };
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        checks::expect_rank("linear.input", features, 2)?;
        let (_, input_dim) = features.dims2()?;
        if input_dim != self.config.input_dim {
            return Err(Error::Msg(format!(
                "linear.input: expected last dim {} but received {}",
                self.config.input_dim, input_dim
            )));
        }
        let output = features.matmul(&self.weight.as_tensor().t()?)?;
        match &self.bias {
            Some(bias) => output.broadcast_add(bias.as_tensor()),
            None => Ok(output),
        }
    }
}
