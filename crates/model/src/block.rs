use std::fmt;

use candle_core::{Result, Tensor};
use layers::{BatchNorm2d, BatchNormConfig, Conv2d, Conv2dConfig, ParamPath};

/// Projection applied to the residual path when the block changes shape.
#[derive(Debug, Clone)]
struct Shortcut {
    conv: Conv2d,
    norm: BatchNorm2d,
}

/// Two-convolution residual block of the CIFAR ResNets.
///
/// Parameters are registered as `conv1`, `bn1`, `conv2`, `bn2` and, when the
/// stride or width changes, `shortcut.0` (conv) and `shortcut.1` (norm).
pub struct BasicBlock {
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    conv1: Conv2d,
    bn1: BatchNorm2d,
    conv2: Conv2d,
    bn2: BatchNorm2d,
    shortcut: Option<Shortcut>,
}

impl fmt::Debug for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicBlock")
            .field("in_channels", &self.in_channels)
            .field("out_channels", &self.out_channels)
            .field("stride", &self.stride)
            .field("projected", &self.shortcut.is_some())
            .finish()
    }
}

impl fmt::Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BasicBlock({} -> {}, stride {}",
            self.in_channels, self.out_channels, self.stride
        )?;
        if self.shortcut.is_some() {
            f.write_str(", projected")?;
        }
        f.write_str(")")
    }
}

impl BasicBlock {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        kernel_size: usize,
        skip_kernel_size: usize,
        path: &ParamPath,
    ) -> Result<Self> {
        let conv1 = Conv2d::new(
            Conv2dConfig::new(in_channels, out_channels, kernel_size, stride),
            &path.pp("conv1"),
        )?;
        let bn1 = BatchNorm2d::new(BatchNormConfig::new(out_channels), &path.pp("bn1"))?;
        let conv2 = Conv2d::new(
            Conv2dConfig::new(out_channels, out_channels, kernel_size, 1),
            &path.pp("conv2"),
        )?;
        let bn2 = BatchNorm2d::new(BatchNormConfig::new(out_channels), &path.pp("bn2"))?;

        let shortcut = if stride != 1 || in_channels != out_channels {
            let skip = path.pp("shortcut");
            Some(Shortcut {
                conv: Conv2d::new(
                    Conv2dConfig::new(in_channels, out_channels, skip_kernel_size, stride),
                    &skip.pp(0),
                )?,
                norm: BatchNorm2d::new(BatchNormConfig::new(out_channels), &skip.pp(1))?,
            })
        } else {
            None
        };

        Ok(Self {
            in_channels,
            out_channels,
            stride,
            conv1,
            bn1,
            conv2,
            bn2,
            shortcut,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn has_projection(&self) -> bool {
        self.shortcut.is_some()
    }

    /// `relu(bn2(conv2(relu(bn1(conv1(x))))) + shortcut(x))`
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.bn1.forward_t(&self.conv1.forward(xs)?, train)?.relu()?;
        let out = self.bn2.forward_t(&self.conv2.forward(&out)?, train)?;
        let residual = match &self.shortcut {
            Some(shortcut) => shortcut.norm.forward_t(&shortcut.conv.forward(xs)?, train)?,
            None => xs.clone(),
        };
        (out + residual)?.relu()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use layers::ParamStore;

    #[test]
    fn identity_block_keeps_shape_without_projection() -> Result<()> {
        let store = ParamStore::new();
        let path = store.root(&Device::Cpu, DType::F32).pp("layer1").pp(0);
        let block = BasicBlock::new(8, 8, 1, 3, 1, &path)?;
        assert!(!block.has_projection());
        assert_eq!(store.trainable_count(), 1184);

        let xs = Tensor::randn(0f32, 1.0, (2, 8, 8, 8), &Device::Cpu)?;
        let ys = block.forward_t(&xs, true)?;
        assert_eq!(ys.dims(), &[2, 8, 8, 8]);
        let min = ys.min_all()?.to_vec0::<f32>()?;
        assert!(min >= 0.0);
        Ok(())
    }

    #[test]
    fn downsampling_block_projects_shortcut() -> Result<()> {
        let store = ParamStore::new();
        let path = store.root(&Device::Cpu, DType::F32).pp("layer2").pp(0);
        let block = BasicBlock::new(8, 16, 2, 3, 1, &path)?;
        assert!(block.has_projection());
        assert!(store.get("layer2.0.shortcut.0.weight").is_some());
        assert!(store.get("layer2.0.shortcut.1.running_var").is_some());
        assert_eq!(store.trainable_count(), 3680);

        let xs = Tensor::randn(0f32, 1.0, (2, 8, 8, 8), &Device::Cpu)?;
        assert_eq!(block.forward_t(&xs, false)?.dims(), &[2, 16, 4, 4]);
        Ok(())
    }
}
