use std::{
    fs,
    path::{Path, PathBuf},
};

use candle_core::Device;
use model::{ArchitectureVariant, ModelConfig};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Keys every run block must spell out; checked in this order.
pub const REQUIRED_FIELDS: [&str; 12] = [
    "batch_size",
    "num_workers",
    "data_augmentation",
    "data_normalize",
    "optim",
    "lr",
    "momentum",
    "weight_decay",
    "lr_sched",
    "max_epochs",
    "grad_clip",
    "resume_ckpt",
];

const DEFAULT_SEED: u64 = 42;
const DEFAULT_DATA_DIR: &str = "./data";

/// A parsed configuration document: run name → parameter block.
#[derive(Debug, Clone)]
pub struct ConfigDocument {
    path: PathBuf,
    runs: Map<String, Value>,
}

impl ConfigDocument {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let parsed: Value = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") => toml::from_str(&contents)?,
            Some("yaml") | Some("yml") | None => serde_yaml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigParse(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        let runs = match parsed {
            Value::Object(runs) => runs,
            other => {
                return Err(TrainingError::ConfigParse(format!(
                    "{}: top level must map run names to parameter blocks, found {}",
                    path.display(),
                    json_kind(&other)
                )));
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            runs,
        })
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, TrainingError> {
        match serde_yaml::from_str::<Value>(contents)? {
            Value::Object(runs) => Ok(Self {
                path: PathBuf::from("<inline>"),
                runs,
            }),
            other => Err(TrainingError::ConfigParse(format!(
                "top level must map run names to parameter blocks, found {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_names(&self) -> Vec<&str> {
        self.runs.keys().map(String::as_str).collect()
    }

    /// Replaces (or adds) `key` in the block for `run_name` before resolution.
    pub fn apply_override(
        &mut self,
        run_name: &str,
        key: &str,
        value: Value,
    ) -> Result<(), TrainingError> {
        let available: Vec<String> = self.runs.keys().cloned().collect();
        let block = self
            .runs
            .get_mut(run_name)
            .ok_or_else(|| TrainingError::ConfigKey {
                run: run_name.to_string(),
                available,
            })?;
        let fields = block.as_object_mut().ok_or_else(|| {
            TrainingError::ConfigParse(format!("run '{}' must be a mapping", run_name))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(TrainingError::ConfigParse(
                "override key must not be empty".into(),
            ));
        }
        fields.insert(key.to_string(), value);
        Ok(())
    }

    /// Selects and validates the block stored under `run_name`.
    pub fn resolve(&self, run_name: &str) -> Result<RunConfig, TrainingError> {
        let block = self
            .runs
            .get(run_name)
            .ok_or_else(|| TrainingError::ConfigKey {
                run: run_name.to_string(),
                available: self.runs.keys().cloned().collect(),
            })?;
        let fields = block.as_object().ok_or_else(|| {
            TrainingError::ConfigParse(format!(
                "run '{}' must be a mapping, found {}",
                run_name,
                json_kind(block)
            ))
        })?;

        for field in REQUIRED_FIELDS {
            if !fields.contains_key(field) {
                return Err(TrainingError::MissingField {
                    run: run_name.to_string(),
                    field: field.to_string(),
                });
            }
        }

        let mut config: RunConfig = serde_json::from_value(Value::Object(fields.clone()))
            .map_err(|err| TrainingError::ConfigParse(format!("run '{}': {}", run_name, err)))?;
        config.run_name = run_name.to_string();
        config.source = fields.clone();
        if config.architecture_variant().ok() == Some(ArchitectureVariant::Custom) {
            for field in ["num_blocks", "channels"] {
                if !fields.contains_key(field) {
                    return Err(TrainingError::missing_field(run_name, field));
                }
            }
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

/// Learning-rate schedule selected by `lr_sched`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleKind {
    CosineAnnealingLR,
    /// Any other name; the run keeps a constant learning rate.
    Unrecognized(String),
}

impl<'de> Deserialize<'de> for ScheduleKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(match name.as_str() {
            "CosineAnnealingLR" => ScheduleKind::CosineAnnealingLR,
            _ => ScheduleKind::Unrecognized(name),
        })
    }
}

/// Flat, typed view over one run block.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub batch_size: usize,
    pub num_workers: usize,
    pub data_augmentation: bool,
    pub data_normalize: bool,
    pub optim: OptimizerKind,
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub lr_sched: ScheduleKind,
    pub max_epochs: usize,
    /// `None` when the key holds a falsy value.
    #[serde(default, deserialize_with = "falsy_threshold")]
    pub grad_clip: Option<f64>,
    #[serde(default)]
    pub weights_init_type: Option<String>,
    #[serde(default, deserialize_with = "falsy_path")]
    pub resume_ckpt: Option<PathBuf>,

    #[serde(default = "default_architecture")]
    pub architecture: String,
    #[serde(default)]
    pub num_blocks: Option<Vec<usize>>,
    #[serde(default)]
    pub channels: Option<Vec<usize>>,
    #[serde(default = "default_conv_kernel")]
    pub conv_kernel_size: usize,
    #[serde(default = "default_skip_kernel")]
    pub skip_kernel_size: usize,
    #[serde(default = "default_pool_kernel")]
    pub pool_kernel_size: usize,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Fetch the dataset archive into `data_dir` when the batches are absent.
    #[serde(default = "default_download")]
    pub download: bool,
    #[serde(default = "default_log_every")]
    pub log_every_n_batches: usize,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,

    /// Trainable parameter count, recorded once the budget gate has passed.
    #[serde(default)]
    pub total_params: Option<usize>,

    #[serde(skip)]
    run_name: String,
    #[serde(skip)]
    source: Map<String, Value>,
}

impl RunConfig {
    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }
        if self.lr.is_nan() || self.lr <= 0.0 {
            errors.push(format!("lr must be greater than 0 (got {})", self.lr));
        }
        if self.momentum < 0.0 {
            errors.push(format!("momentum must be >= 0 (got {})", self.momentum));
        }
        if self.weight_decay < 0.0 {
            errors.push(format!(
                "weight_decay must be >= 0 (got {})",
                self.weight_decay
            ));
        }
        if let Some(clip) = self.grad_clip {
            if clip < 0.0 {
                errors.push(format!("grad_clip must be >= 0 (got {})", clip));
            }
        }
        if self.log_every_n_batches == 0 {
            errors.push("log_every_n_batches must be greater than 0".to_string());
        }
        if self.num_classes == 0 {
            errors.push("num_classes must be greater than 0".to_string());
        }
        match ArchitectureVariant::from_name(&self.architecture) {
            None => errors.push(format!(
                "architecture must be one of resnet18, resnet34, custom (got '{}')",
                self.architecture
            )),
            Some(ArchitectureVariant::Custom) => {
                if let (Some(blocks), Some(channels)) = (&self.num_blocks, &self.channels) {
                    if blocks.len() != channels.len() {
                        errors.push(format!(
                            "num_blocks ({}) and channels ({}) must have the same length",
                            blocks.len(),
                            channels.len()
                        ));
                    }
                }
            }
            Some(_) => {}
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }
        Ok(())
    }

    pub fn architecture_variant(&self) -> Result<ArchitectureVariant, TrainingError> {
        ArchitectureVariant::from_name(&self.architecture).ok_or_else(|| {
            TrainingError::validation(vec![format!(
                "unknown architecture '{}'",
                self.architecture
            )])
        })
    }

    /// Model factory configuration for this run.
    pub fn model_config(&self, device: &Device) -> Result<ModelConfig, TrainingError> {
        let variant = self.architecture_variant()?;
        let mut config = match variant {
            ArchitectureVariant::ResNet18 => ModelConfig::resnet18(device),
            ArchitectureVariant::ResNet34 => ModelConfig::resnet34(device),
            ArchitectureVariant::Custom => {
                let num_blocks = self
                    .num_blocks
                    .clone()
                    .ok_or_else(|| TrainingError::missing_field(&self.run_name, "num_blocks"))?;
                let channels = self
                    .channels
                    .clone()
                    .ok_or_else(|| TrainingError::missing_field(&self.run_name, "channels"))?;
                ModelConfig::custom(num_blocks, channels, device)
            }
        };
        config.conv_kernel_size = self.conv_kernel_size;
        config.skip_kernel_size = self.skip_kernel_size;
        config.pool_kernel_size = self.pool_kernel_size;
        config.num_classes = self.num_classes;
        Ok(config)
    }

    /// Copy of this configuration with the budget-checked parameter count.
    pub fn with_total_params(&self, total_params: usize) -> Self {
        let mut config = self.clone();
        config.total_params = Some(total_params);
        config
    }

    /// The run block as read from disk, plus `total_params` when recorded.
    pub fn snapshot(&self) -> Value {
        let mut fields = self.source.clone();
        if let Some(total) = self.total_params {
            fields.insert("total_params".to_string(), Value::from(total));
        }
        Value::Object(fields)
    }

    /// Evaluation batches are a quarter of the training batch size.
    pub fn eval_batch_size(&self) -> usize {
        (self.batch_size / 4).max(1)
    }
}

fn default_architecture() -> String {
    ArchitectureVariant::Custom.name().to_string()
}

fn default_conv_kernel() -> usize {
    3
}

fn default_skip_kernel() -> usize {
    1
}

fn default_pool_kernel() -> usize {
    4
}

fn default_num_classes() -> usize {
    10
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

fn default_download() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

fn default_log_every() -> usize {
    1
}

/// `0`, `false`, `null` and `""` disable clipping.
fn falsy_threshold<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null | Value::Bool(false) => Ok(None),
        Value::String(text) if text.trim().is_empty() => Ok(None),
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .map(|value| (value != 0.0).then_some(value))
            .map_err(|_| de::Error::custom(format!("grad_clip '{}' is not a number", text))),
        Value::Number(number) => {
            let value = number
                .as_f64()
                .ok_or_else(|| de::Error::custom("grad_clip is out of range"))?;
            Ok((value != 0.0).then_some(value))
        }
        other => Err(de::Error::custom(format!(
            "grad_clip must be a number or falsy, found {}",
            json_kind(&other)
        ))),
    }
}

/// `""`, `false` and `null` mean "do not resume".
fn falsy_path<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<PathBuf>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null | Value::Bool(false) => Ok(None),
        Value::String(text) if text.trim().is_empty() => Ok(None),
        Value::String(text) => Ok(Some(PathBuf::from(text))),
        other => Err(de::Error::custom(format!(
            "resume_ckpt must be a path or falsy, found {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigParse(String),
    #[error("run '{run}' not found in config (available: {})", .available.join(", "))]
    ConfigKey { run: String, available: Vec<String> },
    #[error("run '{run}' is missing required field '{field}'")]
    MissingField { run: String, field: String },
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("model has {total_params} parameters, exceeding the budget of {ceiling}")]
    BudgetExceeded { total_params: usize, ceiling: usize },
    #[error("failed to load checkpoint: {0}")]
    CheckpointLoad(String),
    #[error("failed to save checkpoint: {0}")]
    CheckpointSave(String),
    #[error("trainer initialization failed: {0}")]
    Initialization(String),
    #[error("training failed: {0}")]
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn missing_field(run: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingField {
            run: run.into(),
            field: field.into(),
        }
    }

    /// True when the run stopped at the parameter budget gate.
    pub fn is_budget_rejection(&self) -> bool {
        matches!(self, Self::BudgetExceeded { .. })
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigParse(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigParse(value.to_string())
    }
}

impl From<serde_yaml::Error> for TrainingError {
    fn from(value: serde_yaml::Error) -> Self {
        TrainingError::ConfigParse(value.to_string())
    }
}

impl From<candle_core::Error> for TrainingError {
    fn from(value: candle_core::Error) -> Self {
        TrainingError::Runtime(value.to_string())
    }
}
