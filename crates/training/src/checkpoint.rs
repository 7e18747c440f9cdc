//! Best-accuracy checkpoints keyed by run name.
//!
//! A checkpoint is a single safetensors file holding every named model
//! tensor (parameters and batch-norm buffers). Run provenance lives in the
//! string metadata of the same file so weights and bookkeeping can never
//! drift apart.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use candle_core::{Device, Tensor};
use hex::encode as hex_encode;
use layers::ParamStore;
use safetensors::SafeTensors;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::TrainingError;

pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_FILENAME: &str = "checkpoint.pth";
pub const DEFAULT_SUMMARIES_DIR: &str = "./summaries";

const META_VERSION: &str = "format_version";
const META_ACC: &str = "acc";
const META_EPOCH: &str = "epoch";
const META_CONFIG: &str = "config";
const META_CONFIG_SHA: &str = "config_sha256";

/// Bookkeeping stored next to the weights.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub accuracy: f64,
    pub epoch: usize,
    pub config: Value,
}

#[derive(Debug)]
pub struct LoadedCheckpoint {
    pub record: CheckpointRecord,
    pub tensors: HashMap<String, Tensor>,
}

/// Location of the checkpoint for one run: `<summaries>/<run>/checkpoint.pth`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    summaries_dir: PathBuf,
    run_name: String,
}

impl CheckpointStore {
    pub fn new(summaries_dir: impl Into<PathBuf>, run_name: impl Into<String>) -> Self {
        Self {
            summaries_dir: summaries_dir.into(),
            run_name: run_name.into(),
        }
    }

    pub fn run_dir(&self) -> PathBuf {
        self.summaries_dir.join(&self.run_name)
    }

    pub fn path(&self) -> PathBuf {
        self.run_dir().join(CHECKPOINT_FILENAME)
    }

    pub fn exists(&self) -> bool {
        self.path().is_file()
    }

    /// Overwrites the run's checkpoint with `params` and `record`.
    pub fn save(&self, params: &ParamStore, record: &CheckpointRecord) -> Result<PathBuf, TrainingError> {
        let dir = self.run_dir();
        fs::create_dir_all(&dir).map_err(|err| {
            TrainingError::CheckpointSave(format!(
                "failed to create checkpoint directory {}: {err}",
                dir.display()
            ))
        })?;

        let named: Vec<(String, Tensor)> = params
            .all()
            .into_iter()
            .map(|param| (param.name, param.var.as_tensor().clone()))
            .collect();
        if named.is_empty() {
            return Err(TrainingError::CheckpointSave(
                "model contains no tensors to checkpoint".into(),
            ));
        }

        let metadata = encode_metadata(record)?;
        let bytes = safetensors::serialize(
            named.iter().map(|(name, tensor)| (name.as_str(), tensor)),
            &Some(metadata),
        )
        .map_err(|err| {
            TrainingError::CheckpointSave(format!("failed to serialize model weights: {err}"))
        })?;

        let path = self.path();
        let staging = dir.join(format!("{CHECKPOINT_FILENAME}.tmp"));
        fs::write(&staging, &bytes).map_err(|err| {
            TrainingError::CheckpointSave(format!("failed to write {}: {err}", staging.display()))
        })?;
        fs::rename(&staging, &path).map_err(|err| {
            TrainingError::CheckpointSave(format!(
                "failed to move {} into place: {err}",
                path.display()
            ))
        })?;
        Ok(path)
    }
}

/// Reads a checkpoint written by [`CheckpointStore::save`].
pub fn load_checkpoint(path: &Path, device: &Device) -> Result<LoadedCheckpoint, TrainingError> {
    if !path.is_file() {
        return Err(TrainingError::CheckpointLoad(format!(
            "checkpoint not found at {}",
            path.display()
        )));
    }
    let bytes = fs::read(path).map_err(|err| {
        TrainingError::CheckpointLoad(format!("failed to read {}: {err}", path.display()))
    })?;
    let (_, header) = SafeTensors::read_metadata(&bytes).map_err(|err| {
        TrainingError::CheckpointLoad(format!(
            "{} is not a safetensors checkpoint: {err}",
            path.display()
        ))
    })?;
    let metadata = header.metadata().as_ref().ok_or_else(|| {
        TrainingError::CheckpointLoad(format!("{} carries no run metadata", path.display()))
    })?;
    let record = decode_metadata(metadata)?;

    let tensors = candle_core::safetensors::load_buffer(&bytes, device).map_err(|err| {
        TrainingError::CheckpointLoad(format!(
            "failed to decode tensors from {}: {err}",
            path.display()
        ))
    })?;
    Ok(LoadedCheckpoint { record, tensors })
}

/// Copies `tensors` into `params`; every name must match in both directions.
pub fn apply_model_weights(
    params: &ParamStore,
    mut tensors: HashMap<String, Tensor>,
) -> Result<(), TrainingError> {
    for param in params.all() {
        let tensor = tensors.remove(&param.name).ok_or_else(|| {
            TrainingError::CheckpointLoad(format!("checkpoint missing tensor {}", param.name))
        })?;
        let current = param.var.as_tensor();
        if tensor.dims() != current.dims() {
            return Err(TrainingError::CheckpointLoad(format!(
                "shape mismatch for {}: checkpoint {:?}, model {:?}",
                param.name,
                tensor.dims(),
                current.dims()
            )));
        }
        let tensor = tensor
            .to_dtype(current.dtype())
            .and_then(|t| t.to_device(current.device()))
            .map_err(|err| TrainingError::CheckpointLoad(err.to_string()))?;
        param
            .var
            .set(&tensor)
            .map_err(|err| TrainingError::CheckpointLoad(err.to_string()))?;
    }

    if !tensors.is_empty() {
        let mut extra: Vec<_> = tensors.into_keys().collect();
        extra.sort();
        return Err(TrainingError::CheckpointLoad(format!(
            "checkpoint contains unexpected tensors: {}",
            extra.join(", ")
        )));
    }
    Ok(())
}

fn encode_metadata(record: &CheckpointRecord) -> Result<HashMap<String, String>, TrainingError> {
    let config = serde_json::to_string(&record.config).map_err(|err| {
        TrainingError::CheckpointSave(format!("failed to serialize config: {err}"))
    })?;
    let mut metadata = HashMap::new();
    metadata.insert(META_VERSION.to_string(), CHECKPOINT_VERSION.to_string());
    metadata.insert(META_ACC.to_string(), record.accuracy.to_string());
    metadata.insert(META_EPOCH.to_string(), record.epoch.to_string());
    metadata.insert(META_CONFIG_SHA.to_string(), fingerprint(&config));
    metadata.insert(META_CONFIG.to_string(), config);
    Ok(metadata)
}

fn decode_metadata(metadata: &HashMap<String, String>) -> Result<CheckpointRecord, TrainingError> {
    let field = |key: &str| {
        metadata.get(key).ok_or_else(|| {
            TrainingError::CheckpointLoad(format!("checkpoint metadata missing '{key}'"))
        })
    };

    let version: u32 = field(META_VERSION)?
        .parse()
        .map_err(|_| TrainingError::CheckpointLoad("malformed format_version".into()))?;
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::CheckpointLoad(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    let accuracy: f64 = field(META_ACC)?
        .parse()
        .map_err(|_| TrainingError::CheckpointLoad("malformed acc".into()))?;
    let epoch: usize = field(META_EPOCH)?
        .parse()
        .map_err(|_| TrainingError::CheckpointLoad("malformed epoch".into()))?;

    let config_text = field(META_CONFIG)?;
    if fingerprint(config_text) != *field(META_CONFIG_SHA)? {
        return Err(TrainingError::CheckpointLoad(
            "config fingerprint does not match stored config".into(),
        ));
    }
    let config = serde_json::from_str(config_text)
        .map_err(|err| TrainingError::CheckpointLoad(format!("malformed config: {err}")))?;

    Ok(CheckpointRecord {
        accuracy,
        epoch,
        config,
    })
}

fn fingerprint(text: &str) -> String {
    hex_encode(Sha256::digest(text.as_bytes()))
}
