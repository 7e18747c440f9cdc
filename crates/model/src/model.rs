use std::fmt;

use candle_core::{Error, Result, Tensor};
use layers::{
    checks, BatchNorm2d, BatchNormConfig, Conv2d, Conv2dConfig, Linear, LinearConfig, ParamPath,
};

use crate::{block::BasicBlock, config::ModelConfig};

/// Anything that maps an image batch to class logits. `Display` renders the
/// layer layout.
pub trait ImageClassifier: Send + fmt::Display {
    /// Logits shaped `(batch, num_classes)`; `train` selects batch statistics
    /// for normalisation layers.
    fn forward_t(&self, images: &Tensor, train: bool) -> Result<Tensor>;

    fn num_classes(&self) -> usize;
}

/// CIFAR-style ResNet: 3x3 stem, residual stages, average pool, linear head.
pub struct ResNet {
    config: ModelConfig,
    conv1: Conv2d,
    bn1: BatchNorm2d,
    stages: Vec<Vec<BasicBlock>>,
    linear: Linear,
    features: usize,
}

impl ResNet {
    /// Builds the network, registering every tensor beneath `root`.
    pub fn new(config: ModelConfig, root: &ParamPath) -> Result<Self> {
        config.validate()?;
        let stages_spec = config.stages()?;
        let stem_channels = stages_spec
            .first()
            .map(|stage| stage.channels)
            .ok_or_else(|| Error::Msg("model has no stages".into()))?;

        let conv1 = Conv2d::new(
            Conv2dConfig::new(config.in_channels, stem_channels, config.conv_kernel_size, 1),
            &root.pp("conv1"),
        )?;
        let bn1 = BatchNorm2d::new(BatchNormConfig::new(stem_channels), &root.pp("bn1"))?;

        let mut in_channels = stem_channels;
        let mut stages = Vec::with_capacity(stages_spec.len());
        for (index, spec) in stages_spec.iter().enumerate() {
            let stage_path = root.pp(format!("layer{}", index + 1));
            let mut blocks = Vec::with_capacity(spec.blocks);
            for block in 0..spec.blocks {
                let stride = if block == 0 { spec.stride } else { 1 };
                blocks.push(BasicBlock::new(
                    in_channels,
                    spec.channels,
                    stride,
                    config.conv_kernel_size,
                    config.skip_kernel_size,
                    &stage_path.pp(block),
                )?);
                in_channels = spec.channels;
            }
            stages.push(blocks);
        }

        let features = config.classifier_features()?;
        let linear = Linear::new(
            LinearConfig::new(features, config.num_classes),
            &root.pp("linear"),
        )?;

        Ok(Self {
            config,
            conv1,
            bn1,
            stages,
            linear,
            features,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn depth(&self) -> usize {
        self.stages.iter().map(Vec::len).sum()
    }
}

impl fmt::Display for ResNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ResNet({}, {} blocks)", self.config.variant, self.depth())?;
        writeln!(
            f,
            "  conv1: {} -> {}, kernel {}",
            self.config.in_channels,
            self.bn1.config().num_features,
            self.config.conv_kernel_size
        )?;
        for (index, blocks) in self.stages.iter().enumerate() {
            write!(f, "  layer{}:", index + 1)?;
            for block in blocks {
                write!(f, " {block}")?;
            }
            writeln!(f)?;
        }
        writeln!(f, "  avg_pool: {}", self.config.pool_kernel_size)?;
        write!(f, "  linear: {} -> {}", self.features, self.config.num_classes)
    }
}

impl ImageClassifier for ResNet {
    fn forward_t(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_image_batch("resnet.input", images, self.config.in_channels)?;
        let mut hidden = self
            .bn1
            .forward_t(&self.conv1.forward(images)?, train)?
            .relu()?;
        for block in self.stages.iter().flatten() {
            hidden = block.forward_t(&hidden, train)?;
        }
        let pooled = hidden.avg_pool2d(self.config.pool_kernel_size)?;
        let batch = pooled.dim(0)?;
        let flat = pooled.reshape((batch, self.features))?;
        self.linear.forward(&flat)
    }

    fn num_classes(&self) -> usize {
        self.config.num_classes
    }
}
