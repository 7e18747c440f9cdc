//! Named parameter registry shared by every layer of a model.
//!
//! Layers never own free-floating tensors: they ask a [`ParamPath`] for a
//! [`Var`] and the store keeps a handle under the fully qualified name. The
//! store distinguishes trainable parameters from buffers (batch-norm running
//! statistics) so optimizers and parameter counts only see the former while
//! checkpoints carry both.

use std::sync::{Arc, Mutex, MutexGuard};

use candle_core::{DType, Device, Error, Result, Tensor, Var};

/// Role of a registered tensor inside its layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    ConvWeight,
    LinearWeight,
    Bias,
    NormScale,
    NormShift,
    /// Non-trainable statistics tracked during training.
    RunningStat,
}

impl ParamKind {
    pub fn is_trainable(self) -> bool {
        !matches!(self, ParamKind::RunningStat)
    }

    /// Weight matrices of linear and convolutional layers.
    pub fn is_weight_matrix(self) -> bool {
        matches!(self, ParamKind::ConvWeight | ParamKind::LinearWeight)
    }
}

#[derive(Debug, Clone)]
pub struct NamedParam {
    pub name: String,
    pub kind: ParamKind,
    pub var: Var,
}

impl NamedParam {
    pub fn elem_count(&self) -> usize {
        self.var.as_tensor().elem_count()
    }
}

/// Cheaply clonable handle to the registry; clones share storage.
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    entries: Arc<Mutex<Vec<NamedParam>>>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root path used by model builders to register top-level layers.
    pub fn root(&self, device: &Device, dtype: DType) -> ParamPath {
        ParamPath {
            store: self.clone(),
            prefix: Vec::new(),
            device: device.clone(),
            dtype,
        }
    }

    /// Registers `tensor` under `name`, rejecting duplicate names.
    pub fn register(&self, name: String, kind: ParamKind, tensor: &Tensor) -> Result<Var> {
        let mut entries = self.lock();
        if entries.iter().any(|entry| entry.name == name) {
            return Err(Error::Msg(format!("parameter '{name}' registered twice")));
        }
        let var = Var::from_tensor(tensor)?;
        entries.push(NamedParam {
            name,
            kind,
            var: var.clone(),
        });
        Ok(var)
    }

    /// Every registered tensor in registration order.
    pub fn all(&self) -> Vec<NamedParam> {
        self.lock().clone()
    }

    /// Parameters updated by the optimizer.
    pub fn trainable(&self) -> Vec<NamedParam> {
        self.lock()
            .iter()
            .filter(|entry| entry.kind.is_trainable())
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<NamedParam> {
        self.lock().iter().find(|entry| entry.name == name).cloned()
    }

    /// Total number of trainable scalars.
    pub fn trainable_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|entry| entry.kind.is_trainable())
            .map(NamedParam::elem_count)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<NamedParam>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Dotted naming scope used while building a model.
#[derive(Debug, Clone)]
pub struct ParamPath {
    store: ParamStore,
    prefix: Vec<String>,
    device: Device,
    dtype: DType,
}

impl ParamPath {
    /// Descends into a child scope (`layer1`, `0`, `conv1`, ...).
    pub fn pp(&self, segment: impl ToString) -> Self {
        let mut prefix = self.prefix.clone();
        prefix.push(segment.to_string());
        Self {
            store: self.store.clone(),
            prefix,
            device: self.device.clone(),
            dtype: self.dtype,
        }
    }

    pub fn qualified(&self, leaf: &str) -> String {
        if self.prefix.is_empty() {
            leaf.to_string()
        } else {
            format!("{}.{}", self.prefix.join("."), leaf)
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn store(&self) -> &ParamStore {
        &self.store
    }

    /// Registers `tensor` as `<prefix>.<leaf>`, casting it to the path dtype.
    pub fn var(&self, leaf: &str, kind: ParamKind, tensor: Tensor) -> Result<Var> {
        let tensor = if tensor.dtype() == self.dtype {
            tensor
        } else {
            tensor.to_dtype(self.dtype)?
        };
        self.store.register(self.qualified(leaf), kind, &tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_produce_dotted_names() -> Result<()> {
        let store = ParamStore::new();
        let root = store.root(&Device::Cpu, DType::F32);
        let block = root.pp("layer1").pp(0).pp("conv1");
        assert_eq!(block.qualified("weight"), "layer1.0.conv1.weight");
        assert_eq!(root.qualified("weight"), "weight");

        block.var(
            "weight",
            ParamKind::ConvWeight,
            Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?,
        )?;
        assert!(store.get("layer1.0.conv1.weight").is_some());
        Ok(())
    }

    #[test]
    fn buffers_are_excluded_from_trainable_count() -> Result<()> {
        let store = ParamStore::new();
        let path = store.root(&Device::Cpu, DType::F32).pp("bn");
        path.var(
            "weight",
            ParamKind::NormScale,
            Tensor::ones(4, DType::F32, &Device::Cpu)?,
        )?;
        path.var(
            "running_mean",
            ParamKind::RunningStat,
            Tensor::zeros(4, DType::F32, &Device::Cpu)?,
        )?;

        assert_eq!(store.len(), 2);
        assert_eq!(store.trainable().len(), 1);
        assert_eq!(store.trainable_count(), 4);
        Ok(())
    }

    #[test]
    fn duplicate_names_are_rejected() -> Result<()> {
        let store = ParamStore::new();
        let path = store.root(&Device::Cpu, DType::F32);
        let tensor = Tensor::zeros(1, DType::F32, &Device::Cpu)?;
        path.var("bias", ParamKind::Bias, tensor.clone())?;
        assert!(path.var("bias", ParamKind::Bias, tensor).is_err());
        Ok(())
    }
}
