//! Batch normalisation over `(batch, channels, height, width)` inputs.
//!
//! Statistics are computed per channel across the batch and spatial axes.
//! Running estimates live in the parameter store as non-trainable buffers so
//! they travel with checkpoints; training-mode forwards update them in place
//! with an exponential moving average.

use candle_core::{Error, Result, Tensor, Var};

use crate::{
    checks,
    params::{ParamKind, ParamPath},
};

/// Configuration for [`BatchNorm2d`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormConfig {
    /// Number of channels being normalised.
    pub num_features: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
    /// Weight given to the current batch when updating running statistics.
    pub momentum: f64,
}

impl BatchNormConfig {
    pub fn new(num_features: usize) -> Self {
        Self {
            num_features,
            epsilon: 1e-5,
            momentum: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    config: BatchNormConfig,
    weight: Var,
    bias: Var,
    running_mean: Var,
    running_var: Var,
}

impl BatchNorm2d {
    /// Registers `weight`, `bias`, `running_mean` and `running_var` under `path`.
    pub fn new(config: BatchNormConfig, path: &ParamPath) -> Result<Self> {
        if config.num_features == 0 {
            return Err(Error::Msg(format!(
                "{}: batch norm requires at least one channel",
                path.qualified("weight")
            )));
        }
        if !(0.0..=1.0).contains(&config.momentum) {
            return Err(Error::Msg(format!(
                "{}: momentum must lie in [0, 1], got {}",
                path.qualified("weight"),
                config.momentum
            )));
        }
        let c = config.num_features;
        let device = path.device();
        let dtype = path.dtype();
        let weight = path.var("weight", ParamKind::NormScale, Tensor::ones(c, dtype, device)?)?;
        let bias = path.var("bias", ParamKind::NormShift, Tensor::zeros(c, dtype, device)?)?;
        let running_mean = path.var(
            "running_mean",
            ParamKind::RunningStat,
            Tensor::zeros(c, dtype, device)?,
        )?;
        let running_var = path.var(
            "running_var",
            ParamKind::RunningStat,
            Tensor::ones(c, dtype, device)?,
        )?;
        Ok(Self {
            config,
            weight,
            bias,
            running_mean,
            running_var,
        })
    }

    pub fn config(&self) -> &BatchNormConfig {
        &self.config
    }

    pub fn running_mean(&self) -> &Tensor {
        self.running_mean.as_tensor()
    }

    pub fn running_var(&self) -> &Tensor {
        self.running_var.as_tensor()
    }

    /// Normalises with batch statistics when `train` is set (updating the
    /// running estimates), otherwise with the running estimates.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_image_batch("batch_norm.input", xs, self.config.num_features)?;
        let channels = self.config.num_features;
        let (mean, var) = if train {
            let (batch, _, height, width) = xs.dims4()?;
            let count = batch * height * width;
            if count < 2 {
                return Err(Error::Msg(format!(
                    "batch_norm.input: training needs more than one value per channel, got {:?}",
                    xs.dims()
                )));
            }
            let mean = xs.mean_keepdim((0, 2, 3))?;
            let var = xs.broadcast_sub(&mean)?.sqr()?.mean_keepdim((0, 2, 3))?;
            self.update_running_stats(&mean, &var, count)?;
            (mean, var)
        } else {
            (
                self.running_mean.as_tensor().reshape((1, channels, 1, 1))?,
                self.running_var.as_tensor().reshape((1, channels, 1, 1))?,
            )
        };

        let denom = (var + self.config.epsilon)?.sqrt()?;
        let normalized = xs.broadcast_sub(&mean)?.broadcast_div(&denom)?;
        let weight = self.weight.as_tensor().reshape((1, channels, 1, 1))?;
        let bias = self.bias.as_tensor().reshape((1, channels, 1, 1))?;
        normalized.broadcast_mul(&weight)?.broadcast_add(&bias)
    }

    fn update_running_stats(&self, mean: &Tensor, var: &Tensor, count: usize) -> Result<()> {
        let momentum = self.config.momentum;
        let unbiased = count as f64 / (count - 1) as f64;
        let mean = mean.detach().flatten_all()?;
        let var = var.detach().flatten_all()?.affine(unbiased, 0.0)?;

        let next_mean = (self.running_mean.as_tensor().affine(1.0 - momentum, 0.0)?
            + mean.affine(momentum, 0.0)?)?;
        let next_var = (self.running_var.as_tensor().affine(1.0 - momentum, 0.0)?
            + var.affine(momentum, 0.0)?)?;
        self.running_mean.set(&next_mean)?;
        self.running_var.set(&next_var)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamStore;
    use candle_core::{DType, Device};

    fn build(channels: usize) -> Result<(ParamStore, BatchNorm2d)> {
        let store = ParamStore::new();
        let path = store.root(&Device::Cpu, DType::F32).pp("bn1");
        let bn = BatchNorm2d::new(BatchNormConfig::new(channels), &path)?;
        Ok((store, bn))
    }

    #[test]
    fn registers_parameters_and_buffers() -> Result<()> {
        let (store, _) = build(4)?;
        let names: Vec<String> = store.all().into_iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec![
                "bn1.weight",
                "bn1.bias",
                "bn1.running_mean",
                "bn1.running_var"
            ]
        );
        assert_eq!(store.trainable_count(), 8);
        Ok(())
    }

    #[test]
    fn training_forward_normalises_each_channel() -> Result<()> {
        let (_, bn) = build(2)?;
        let xs = Tensor::randn(3f32, 2.0, (4, 2, 5, 5), &Device::Cpu)?;
        let ys = bn.forward_t(&xs, true)?;
        let mean = ys.mean_keepdim((0, 2, 3))?.flatten_all()?.to_vec1::<f32>()?;
        let var = ys
            .sqr()?
            .mean_keepdim((0, 2, 3))?
            .flatten_all()?
            .to_vec1::<f32>()?;
        for (m, v) in mean.iter().zip(var.iter()) {
            assert!(m.abs() < 1e-4, "mean {m}");
            assert!((v - 1.0).abs() < 1e-2, "var {v}");
        }
        Ok(())
    }

    #[test]
    fn running_stats_follow_momentum() -> Result<()> {
        let (_, bn) = build(1)?;
        // Values 1, 3 per channel: mean 2, unbiased variance 2.
        let xs = Tensor::new(&[1f32, 3.0], &Device::Cpu)?.reshape((2, 1, 1, 1))?;
        bn.forward_t(&xs, true)?;
        let mean = bn.running_mean().to_vec1::<f32>()?;
        let var = bn.running_var().to_vec1::<f32>()?;
        assert!((mean[0] - 0.2).abs() < 1e-6);
        assert!((var[0] - (0.9 + 0.2)).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn eval_forward_uses_running_stats_without_updating() -> Result<()> {
        let (_, bn) = build(1)?;
        let xs = Tensor::new(&[2f32, 4.0], &Device::Cpu)?.reshape((2, 1, 1, 1))?;
        let ys = bn.forward_t(&xs, false)?.flatten_all()?.to_vec1::<f32>()?;
        let scale = 1.0 / (1.0f32 + 1e-5).sqrt();
        assert!((ys[0] - 2.0 * scale).abs() < 1e-5);
        assert!((ys[1] - 4.0 * scale).abs() < 1e-5);
        assert_eq!(bn.running_mean().to_vec1::<f32>()?, vec![0.0]);
        Ok(())
    }
}
