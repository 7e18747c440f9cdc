pub mod block;
pub mod builder;
pub mod config;
pub mod model;

pub use block::BasicBlock;
pub use builder::{build_model, builder_for, BuiltModel, ModelBuilder, ResNetBuilder};
pub use config::{ArchitectureVariant, ModelConfig, StageSpec};
pub use model::{ImageClassifier, ResNet};
