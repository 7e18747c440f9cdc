//! 2D convolution over `(batch, channels, height, width)` tensors.
//!
//! Kernels are stored as `(out_channels, in_channels, kernel, kernel)` and
//! default to Kaiming-uniform with `a = sqrt(5)`, the stock initialisation of
//! mainstream frameworks, so that an unconfigured model starts from the same
//! distribution a reference implementation would.

use candle_core::{Result, Tensor, Var};

use crate::{
    checks,
    params::{ParamKind, ParamPath},
};

/// Static description of a square convolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conv2dConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub bias: bool,
}

impl Conv2dConfig {
    /// "Same" padding for odd kernels, no bias (followed by batch norm).
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize, stride: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding: kernel_size / 2,
            bias: false,
        }
    }

    /// Number of trainable scalars this layer will register.
    pub fn parameter_count(&self) -> usize {
        let weight = self.out_channels * self.in_channels * self.kernel_size * self.kernel_size;
        weight + if self.bias { self.out_channels } else { 0 }
    }

    /// Spatial size of the output for a square input of side `input`.
    pub fn output_size(&self, input: usize) -> usize {
        (input + 2 * self.padding).saturating_sub(self.kernel_size) / self.stride.max(1) + 1
    }
}

#[derive(Debug, Clone)]
pub struct Conv2d {
    config: Conv2dConfig,
    weight: Var,
    bias: Option<Var>,
}

impl Conv2d {
    /// Registers `weight` (and `bias`) under `path`.
    pub fn new(config: Conv2dConfig, path: &ParamPath) -> Result<Self> {
        if config.in_channels == 0 || config.out_channels == 0 || config.kernel_size == 0 {
            return Err(candle_core::Error::Msg(format!(
                "{}: channels and kernel size must be non-zero",
                path.qualified("weight")
            )));
        }
        if config.stride == 0 {
            return Err(candle_core::Error::Msg(format!(
                "{}: stride must be non-zero",
                path.qualified("weight")
            )));
        }

        let fan_in = (config.in_channels * config.kernel_size * config.kernel_size) as f64;
        let bound = 1.0 / fan_in.sqrt();
        let shape = (
            config.out_channels,
            config.in_channels,
            config.kernel_size,
            config.kernel_size,
        );
        let weight = Tensor::rand(-bound as f32, bound as f32, shape, path.device())?;
        let weight = path.var("weight", ParamKind::ConvWeight, weight)?;

        let bias = if config.bias {
            let bias = Tensor::rand(-bound as f32, bound as f32, config.out_channels, path.device())?;
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

    pub fn config(&self) -> &Conv2dConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        checks::expect_image_batch("conv2d.input", images, self.config.in_channels)?;
        let output = images.conv2d(
            self.weight.as_tensor(),
            self.config.padding,
            self.config.stride,
            1,
            1,
        )?;
        match &self.bias {
            Some(bias) => {
                let bias = bias.as_tensor().reshape((1, self.config.out_channels, 1, 1))?;
                output.broadcast_add(&bias)
            }
            None => Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamStore;
    use candle_core::{DType, Device};

    #[test]
    fn same_padding_preserves_spatial_size() -> Result<()> {
        let store = ParamStore::new();
        let path = store.root(&Device::Cpu, DType::F32).pp("conv1");
        let conv = Conv2d::new(Conv2dConfig::new(3, 8, 3, 1), &path)?;
        let images = Tensor::randn(0f32, 1.0, (2, 3, 16, 16), &Device::Cpu)?;
        let output = conv.forward(&images)?;
        assert_eq!(output.dims(), &[2, 8, 16, 16]);
        assert_eq!(store.trainable_count(), conv.config().parameter_count());
        Ok(())
    }

    #[test]
    fn strided_conv_halves_resolution() -> Result<()> {
        let store = ParamStore::new();
        let path = store.root(&Device::Cpu, DType::F32).pp("shortcut");
        let config = Conv2dConfig::new(4, 8, 1, 2);
        assert_eq!(config.output_size(16), 8);
        let conv = Conv2d::new(config, &path)?;
        let images = Tensor::randn(0f32, 1.0, (1, 4, 16, 16), &Device::Cpu)?;
        assert_eq!(conv.forward(&images)?.dims(), &[1, 8, 8, 8]);
        Ok(())
    }

    #[test]
    fn identity_kernel_reproduces_input() -> Result<()> {
        let store = ParamStore::new();
        let path = store.root(&Device::Cpu, DType::F32);
        let conv = Conv2d::new(Conv2dConfig::new(1, 1, 3, 1), &path)?;
        let mut kernel = vec![0f32; 9];
        kernel[4] = 1.0;
        store
            .get("weight")
            .unwrap()
            .var
            .set(&Tensor::from_vec(kernel, (1, 1, 3, 3), &Device::Cpu)?)?;

        let images = Tensor::arange(0f32, 16.0, &Device::Cpu)?.reshape((1, 1, 4, 4))?;
        let output = conv.forward(&images)?;
        let diff = output.sub(&images)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }
}
