use std::{fs, path::Path};

use super::Result;
use crate::TrainingError;

/// Directory the binary CIFAR-10 archive extracts to.
pub const CIFAR_DIR: &str = "cifar-10-batches-bin";

const CHANNELS: usize = 3;
const SIDE: usize = 32;
const IMAGE_BYTES: usize = CHANNELS * SIDE * SIDE;
const RECORD_BYTES: usize = 1 + IMAGE_BYTES;
const NUM_CLASSES: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CifarSplit {
    Train,
    Test,
}

impl CifarSplit {
    /// Batch file names for this split.
    pub fn files(self) -> Vec<String> {
        match self {
            CifarSplit::Train => (1..=5).map(|i| format!("data_batch_{i}.bin")).collect(),
            CifarSplit::Test => vec!["test_batch.bin".to_string()],
        }
    }
}

/// In-memory labelled images stored as CHW bytes.
#[derive(Debug, Clone)]
pub struct ImageDataset {
    pixels: Vec<u8>,
    labels: Vec<u8>,
    channels: usize,
    height: usize,
    width: usize,
}

impl ImageDataset {
    pub fn new(
        pixels: Vec<u8>,
        labels: Vec<u8>,
        channels: usize,
        height: usize,
        width: usize,
    ) -> Result<Self> {
        let image_len = channels * height * width;
        if image_len == 0 {
            return Err(TrainingError::initialization(
                "image dimensions must be non-zero",
            ));
        }
        if pixels.len() != labels.len() * image_len {
            return Err(TrainingError::initialization(format!(
                "expected {} pixel bytes for {} images of {}x{}x{}, found {}",
                labels.len() * image_len,
                labels.len(),
                channels,
                height,
                width,
                pixels.len()
            )));
        }
        Ok(Self {
            pixels,
            labels,
            channels,
            height,
            width,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.channels, self.height, self.width)
    }

    pub fn image(&self, index: usize) -> &[u8] {
        let len = self.channels * self.height * self.width;
        &self.pixels[index * len..(index + 1) * len]
    }

    pub fn label(&self, index: usize) -> u8 {
        self.labels[index]
    }
}

/// Loads one split from `<data_dir>/cifar-10-batches-bin/`.
pub fn load_cifar10(data_dir: impl AsRef<Path>, split: CifarSplit) -> Result<ImageDataset> {
    let root = data_dir.as_ref().join(CIFAR_DIR);
    let mut pixels = Vec::new();
    let mut labels = Vec::new();
    for file in split.files() {
        let path = root.join(&file);
        let bytes = read_batch(&path)?;
        let (mut batch_pixels, mut batch_labels) = parse_cifar_records(&bytes, &path)?;
        pixels.append(&mut batch_pixels);
        labels.append(&mut batch_labels);
    }
    ImageDataset::new(pixels, labels, CHANNELS, SIDE, SIDE)
}

fn read_batch(path: &Path) -> Result<Vec<u8>> {
    if !path.is_file() {
        return Err(TrainingError::initialization(format!(
            "CIFAR-10 batch {} not found; extract the binary archive (cifar-10-binary.tar.gz) into {}",
            path.display(),
            path.parent()
                .and_then(Path::parent)
                .map(|dir| dir.display().to_string())
                .unwrap_or_else(|| ".".to_string())
        )));
    }
    fs::read(path).map_err(|err| {
        TrainingError::initialization(format!("failed to read {}: {}", path.display(), err))
    })
}

/// Splits `label | 3072 pixel bytes` records into pixels and labels.
pub fn parse_cifar_records(bytes: &[u8], source: &Path) -> Result<(Vec<u8>, Vec<u8>)> {
    if bytes.is_empty() || bytes.len() % RECORD_BYTES != 0 {
        return Err(TrainingError::initialization(format!(
            "{} is truncated: {} bytes is not a multiple of {}",
            source.display(),
            bytes.len(),
            RECORD_BYTES
        )));
    }
    let records = bytes.len() / RECORD_BYTES;
    let mut pixels = Vec::with_capacity(records * IMAGE_BYTES);
    let mut labels = Vec::with_capacity(records);
    for (index, record) in bytes.chunks_exact(RECORD_BYTES).enumerate() {
        let label = record[0];
        if label >= NUM_CLASSES {
            return Err(TrainingError::initialization(format!(
                "{}: record {} has label {} outside 0..{}",
                source.display(),
                index,
                label,
                NUM_CLASSES
            )));
        }
        labels.push(label);
        pixels.extend_from_slice(&record[1..]);
    }
    Ok((pixels, labels))
}
