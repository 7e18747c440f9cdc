use std::fmt;

use candle_core::{DType, Device, Error, Result};

/// Channel widths of the canonical CIFAR ResNets.
const RESNET_CHANNELS: [usize; 4] = [64, 128, 256, 512];

/// Named architecture families understood by the model factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchitectureVariant {
    ResNet18,
    ResNet34,
    /// Stage depths and widths come from the configuration.
    Custom,
}

impl ArchitectureVariant {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "resnet18" | "resnet-18" => Some(Self::ResNet18),
            "resnet34" | "resnet-34" => Some(Self::ResNet34),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ResNet18 => "resnet18",
            Self::ResNet34 => "resnet34",
            Self::Custom => "custom",
        }
    }

    fn fixed_blocks(self) -> Option<[usize; 4]> {
        match self {
            Self::ResNet18 => Some([2, 2, 2, 2]),
            Self::ResNet34 => Some([3, 4, 6, 3]),
            Self::Custom => None,
        }
    }
}

impl fmt::Display for ArchitectureVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One residual stage: `blocks` basic blocks producing `channels` maps, the
/// first of which applies `stride`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    pub blocks: usize,
    pub channels: usize,
    pub stride: usize,
}

/// High-level configuration for assembling a CIFAR ResNet.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub variant: ArchitectureVariant,
    /// Blocks per stage; ignored for the fixed variants.
    pub num_blocks: Vec<usize>,
    /// Output channels per stage; ignored for the fixed variants.
    pub channels: Vec<usize>,
    pub conv_kernel_size: usize,
    pub skip_kernel_size: usize,
    pub pool_kernel_size: usize,
    pub num_classes: usize,
    pub image_size: usize,
    pub in_channels: usize,
    pub dtype: DType,
    pub device: Device,
}

impl ModelConfig {
    pub fn resnet18(device: &Device) -> Self {
        Self::with_variant(ArchitectureVariant::ResNet18, Vec::new(), Vec::new(), device)
    }

    pub fn resnet34(device: &Device) -> Self {
        Self::with_variant(ArchitectureVariant::ResNet34, Vec::new(), Vec::new(), device)
    }

    pub fn custom(num_blocks: Vec<usize>, channels: Vec<usize>, device: &Device) -> Self {
        Self::with_variant(ArchitectureVariant::Custom, num_blocks, channels, device)
    }

    fn with_variant(
        variant: ArchitectureVariant,
        num_blocks: Vec<usize>,
        channels: Vec<usize>,
        device: &Device,
    ) -> Self {
        Self {
            variant,
            num_blocks,
            channels,
            conv_kernel_size: 3,
            skip_kernel_size: 1,
            pool_kernel_size: 4,
            num_classes: 10,
            image_size: 32,
            in_channels: 3,
            dtype: DType::F32,
            device: device.clone(),
        }
    }

    /// Resolves the stage layout for the configured variant.
    pub fn stages(&self) -> Result<Vec<StageSpec>> {
        let (blocks, channels): (Vec<usize>, Vec<usize>) = match self.variant.fixed_blocks() {
            Some(blocks) => (blocks.to_vec(), RESNET_CHANNELS.to_vec()),
            None => (self.num_blocks.clone(), self.channels.clone()),
        };
        if blocks.is_empty() {
            return Err(Error::Msg("num_blocks must list at least one stage".into()));
        }
        if blocks.len() != channels.len() {
            return Err(Error::Msg(format!(
                "num_blocks ({}) and channels ({}) must have the same length",
                blocks.len(),
                channels.len()
            )));
        }
        Ok(blocks
            .into_iter()
            .zip(channels)
            .enumerate()
            .map(|(index, (blocks, channels))| StageSpec {
                blocks,
                channels,
                stride: if index == 0 { 1 } else { 2 },
            })
            .collect())
    }

    /// Side length of the feature maps leaving the last stage.
    pub fn final_feature_size(&self) -> Result<usize> {
        let stages = self.stages()?;
        let mut size = self.image_size;
        for stage in stages.iter().skip(1) {
            let padding = self.conv_kernel_size / 2;
            size = (size + 2 * padding).saturating_sub(self.conv_kernel_size) / stage.stride + 1;
        }
        Ok(size)
    }

    /// Width of the flattened features fed to the classifier head.
    pub fn classifier_features(&self) -> Result<usize> {
        let stages = self.stages()?;
        let last = stages
            .last()
            .map(|stage| stage.channels)
            .ok_or_else(|| Error::Msg("model has no stages".into()))?;
        let pooled = self.final_feature_size()? / self.pool_kernel_size;
        Ok(last * pooled * pooled)
    }

    /// Validate structural invariants before any tensor is allocated.
    pub fn validate(&self) -> Result<()> {
        let stages = self.stages()?;
        if stages.iter().any(|stage| stage.blocks == 0) {
            return Err(Error::Msg("every stage needs at least one block".into()));
        }
        if stages.iter().any(|stage| stage.channels == 0) {
            return Err(Error::Msg("stage channels must be greater than zero".into()));
        }
        if self.conv_kernel_size == 0 || self.conv_kernel_size % 2 == 0 {
            return Err(Error::Msg(format!(
                "conv_kernel_size must be odd and positive, got {}",
                self.conv_kernel_size
            )));
        }
        if self.skip_kernel_size == 0 || self.skip_kernel_size % 2 == 0 {
            return Err(Error::Msg(format!(
                "skip_kernel_size must be odd and positive, got {}",
                self.skip_kernel_size
            )));
        }
        if self.num_classes == 0 {
            return Err(Error::Msg("num_classes must be greater than zero".into()));
        }
        if self.in_channels == 0 || self.image_size == 0 {
            return Err(Error::Msg("input shape must be non-empty".into()));
        }
        if self.pool_kernel_size == 0 {
            return Err(Error::Msg("pool_kernel_size must be greater than zero".into()));
        }
        let final_size = self.final_feature_size()?;
        if self.pool_kernel_size > final_size {
            return Err(Error::Msg(format!(
                "pool_kernel_size ({}) exceeds final feature map size ({})",
                self.pool_kernel_size, final_size
            )));
        }
        Ok(())
    }
}


impl fmt::Display for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Ok(stages) = self.stages() else {
            return write!(f, "{} (invalid stage layout)", self.variant);
        };
        write!(f, "{} stages [", self.variant)?;
        for (index, stage) in stages.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}x{}/s{}", stage.blocks, stage.channels, stage.stride)?;
        }
        write!(
            f,
            "], kernel {}, skip {}, pool {}, {} classes",
            self.conv_kernel_size, self.skip_kernel_size, self.pool_kernel_size, self.num_classes
        )
    }
}
