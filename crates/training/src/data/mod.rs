//! Image data pipeline: CIFAR-10 fetch/cache and reader, per-example
//! transforms and a shuffled batch loader.

mod cifar;
mod download;
mod loader;
mod transforms;

use candle_core::Tensor;
use futures::future::BoxFuture;

use crate::TrainingError;

pub use cifar::{load_cifar10, parse_cifar_records, CifarSplit, ImageDataset, CIFAR_DIR};
pub use download::{
    cifar_batches_present, ensure_cifar10, ensure_cifar10_from, unpack_archive, DatasetSource,
    CIFAR_ARCHIVE, CIFAR_URL,
};
pub use loader::ImageDataLoader;
pub use transforms::{ImageBuffer, Transform, TransformPipeline, CIFAR_MEAN, CIFAR_STD};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Batch returned by image loaders.
#[derive(Debug)]
pub struct ImageBatch {
    /// `(batch, channels, height, width)` f32 images.
    pub images: Tensor,
    /// `(batch,)` u32 class indices.
    pub labels: Tensor,
    pub batch_index: usize,
    pub epoch: usize,
}

impl ImageBatch {
    pub fn len(&self) -> usize {
        self.labels.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Asynchronous-compatible loader abstraction.
pub trait DataLoader: Send {
    /// Rewinds to the beginning of `epoch`, reshuffling if the loader shuffles.
    fn start_epoch(&mut self, epoch: usize) -> Result<()>;

    /// Next batch of the current epoch, or `None` once it is exhausted.
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<ImageBatch>>>;

    /// Examples visited per epoch.
    fn num_examples(&self) -> usize;

    /// Batches yielded per epoch, counting a final partial batch.
    fn num_batches(&self) -> usize;
}

impl<L: DataLoader + ?Sized> DataLoader for Box<L> {
    fn start_epoch(&mut self, epoch: usize) -> Result<()> {
        (**self).start_epoch(epoch)
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<ImageBatch>>> {
        (**self).next_batch()
    }

    fn num_examples(&self) -> usize {
        (**self).num_examples()
    }

    fn num_batches(&self) -> usize {
        (**self).num_batches()
    }
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn start_epoch(&mut self, epoch: usize) -> Result<()> {
        self.inner.start_epoch(epoch)
    }

    pub fn next_batch(&mut self) -> Result<Option<ImageBatch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn num_examples(&self) -> usize {
        self.inner.num_examples()
    }

    pub fn num_batches(&self) -> usize {
        self.inner.num_batches()
    }
}
