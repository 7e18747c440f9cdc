//! Building blocks for image classifiers.
//!
//! Layers register their tensors in a shared [`ParamStore`] under
//! PyTorch-style dotted names (`layer1.0.conv1.weight`) so that optimizers,
//! weight initialisation and checkpointing can walk them uniformly.

pub mod checks;
pub mod conv;
pub mod init;
pub mod linear;
pub mod norm;
pub mod params;

pub use conv::{Conv2d, Conv2dConfig};
pub use init::WeightInit;
pub use linear::{Linear, LinearConfig};
pub use norm::{BatchNorm2d, BatchNormConfig};
pub use params::{NamedParam, ParamKind, ParamPath, ParamStore};
