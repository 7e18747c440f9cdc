//! Model factory keyed by [`ArchitectureVariant`].

use candle_core::Result;
use layers::{ParamPath, ParamStore};

use crate::{
    config::{ArchitectureVariant, ModelConfig},
    model::{ImageClassifier, ResNet},
};

/// Constructs a classifier for one architecture family.
pub trait ModelBuilder {
    fn variant(&self) -> ArchitectureVariant;

    /// Builds the classifier, registering its tensors under `root`.
    fn build(&self, config: &ModelConfig, root: &ParamPath) -> Result<Box<dyn ImageClassifier>>;
}

#[derive(Debug, Clone, Copy)]
pub struct ResNetBuilder {
    variant: ArchitectureVariant,
}

impl ResNetBuilder {
    pub fn new(variant: ArchitectureVariant) -> Self {
        Self { variant }
    }
}

impl ModelBuilder for ResNetBuilder {
    fn variant(&self) -> ArchitectureVariant {
        self.variant
    }

    fn build(&self, config: &ModelConfig, root: &ParamPath) -> Result<Box<dyn ImageClassifier>> {
        let mut config = config.clone();
        config.variant = self.variant;
        Ok(Box::new(ResNet::new(config, root)?))
    }
}

/// Every variant is currently a ResNet; the indirection keeps callers
/// independent of the concrete network type.
pub fn builder_for(variant: ArchitectureVariant) -> Box<dyn ModelBuilder> {
    match variant {
        ArchitectureVariant::ResNet18
        | ArchitectureVariant::ResNet34
        | ArchitectureVariant::Custom => Box::new(ResNetBuilder::new(variant)),
    }
}

/// A freshly built classifier together with the store holding its tensors.
pub struct BuiltModel {
    pub classifier: Box<dyn ImageClassifier>,
    pub params: ParamStore,
    pub total_params: usize,
}

impl std::fmt::Debug for BuiltModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltModel")
            .field("tensors", &self.params.len())
            .field("total_params", &self.total_params)
            .finish()
    }
}

/// Builds the configured model and counts its trainable scalars.
pub fn build_model(config: &ModelConfig) -> Result<BuiltModel> {
    config.validate()?;
    let params = ParamStore::new();
    let root = params.root(&config.device, config.dtype);
    let classifier = builder_for(config.variant).build(config, &root)?;
    let total_params = params.trainable_count();
    Ok(BuiltModel {
        classifier,
        params,
        total_params,
    })
}
