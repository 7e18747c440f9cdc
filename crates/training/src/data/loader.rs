use std::{sync::Arc, thread};

use candle_core::{Device, Tensor};
use futures::future::BoxFuture;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use super::{DataLoader, ImageBatch, ImageBuffer, ImageDataset, Result, TransformPipeline};
use crate::TrainingError;

/// Batches an [`ImageDataset`], applying a transform pipeline per example.
///
/// Every example is visited once per epoch and the final partial batch is
/// kept. Augmentation randomness is derived from `(seed, epoch, batch,
/// worker)`, so a run is reproducible for a fixed worker count.
pub struct ImageDataLoader {
    dataset: Arc<ImageDataset>,
    pipeline: TransformPipeline,
    device: Device,
    batch_size: usize,
    shuffle: bool,
    num_workers: usize,
    seed: u64,
    epoch: usize,
    order: Vec<usize>,
    cursor: usize,
    batch_index: usize,
}

impl ImageDataLoader {
    pub fn new(
        dataset: Arc<ImageDataset>,
        pipeline: TransformPipeline,
        device: Device,
        batch_size: usize,
        shuffle: bool,
        num_workers: usize,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        let mut loader = Self {
            dataset,
            pipeline,
            device,
            batch_size,
            shuffle,
            num_workers,
            seed,
            epoch: 0,
            order: Vec::new(),
            cursor: 0,
            batch_index: 0,
        };
        loader.reset(0);
        Ok(loader)
    }

    fn reset(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.order = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            self.order.shuffle(&mut rng);
        }
        self.cursor = 0;
        self.batch_index = 0;
    }

    fn build_batch(&mut self) -> Result<Option<ImageBatch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        let batch_index = self.batch_index;

        let workers = self.num_workers.clamp(1, indices.len());
        let chunk = indices.len().div_ceil(workers);
        let chunks: Vec<&[usize]> = indices.chunks(chunk).collect();

        let processed: Vec<Result<Vec<ImageBuffer>>> = if chunks.len() == 1 {
            vec![self.transform_chunk(chunks[0], batch_index, 0)]
        } else {
            thread::scope(|scope| {
                let handles: Vec<_> = chunks
                    .iter()
                    .enumerate()
                    .map(|(worker, part)| {
                        let this = &*self;
                        scope.spawn(move || this.transform_chunk(part, batch_index, worker))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle
                            .join()
                            .unwrap_or_else(|_| Err(TrainingError::runtime("data worker panicked")))
                    })
                    .collect()
            })
        };

        let (channels, height, width) = match processed.first() {
            Some(Ok(images)) => images
                .first()
                .map(|image| (image.channels, image.height, image.width))
                .unwrap_or_else(|| self.dataset.dims()),
            _ => self.dataset.dims(),
        };
        let mut pixels = Vec::with_capacity(indices.len() * channels * height * width);
        for part in processed {
            for image in part? {
                pixels.extend_from_slice(&image.data);
            }
        }
        let labels: Vec<u32> = indices
            .iter()
            .map(|&index| u32::from(self.dataset.label(index)))
            .collect();

        let batch = indices.len();
        let images = Tensor::from_vec(pixels, (batch, channels, height, width), &self.device)
            .map_err(|err| {
                TrainingError::runtime(format!("failed to materialize image tensor: {}", err))
            })?;
        let labels = Tensor::from_vec(labels, batch, &self.device).map_err(|err| {
            TrainingError::runtime(format!("failed to materialize label tensor: {}", err))
        })?;

        self.cursor = end;
        self.batch_index += 1;
        Ok(Some(ImageBatch {
            images,
            labels,
            batch_index,
            epoch: self.epoch,
        }))
    }

    fn transform_chunk(
        &self,
        indices: &[usize],
        batch_index: usize,
        worker: usize,
    ) -> Result<Vec<ImageBuffer>> {
        let mut rng = StdRng::seed_from_u64(worker_seed(self.seed, self.epoch, batch_index, worker));
        let (channels, height, width) = self.dataset.dims();
        indices
            .iter()
            .map(|&index| {
                let image =
                    ImageBuffer::from_bytes(self.dataset.image(index), channels, height, width);
                self.pipeline.apply(image, &mut rng)
            })
            .collect()
    }
}

/// SplitMix64-style mixing of the loader coordinates into one seed.
fn worker_seed(seed: u64, epoch: usize, batch: usize, worker: usize) -> u64 {
    let mut state = seed;
    for part in [epoch as u64, batch as u64, worker as u64] {
        state = state
            .wrapping_add(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(part);
        state = (state ^ (state >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        state = (state ^ (state >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        state ^= state >> 31;
    }
    state
}

impl DataLoader for ImageDataLoader {
    fn start_epoch(&mut self, epoch: usize) -> Result<()> {
        self.reset(epoch);
        Ok(())
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<ImageBatch>>> {
        Box::pin(async move { self.build_batch() })
    }

    fn num_examples(&self) -> usize {
        self.dataset.len()
    }

    fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::BlockingDataLoader;

    fn dataset(len: usize) -> Arc<ImageDataset> {
        let pixels: Vec<u8> = (0..len).flat_map(|i| vec![i as u8; 3 * 4 * 4]).collect();
        let labels: Vec<u8> = (0..len).map(|i| (i % 10) as u8).collect();
        Arc::new(ImageDataset::new(pixels, labels, 3, 4, 4).unwrap())
    }

    fn drain(loader: &mut BlockingDataLoader<ImageDataLoader>) -> Result<Vec<u32>> {
        let mut labels = Vec::new();
        while let Some(batch) = loader.next_batch()? {
            labels.extend(batch.labels.to_vec1::<u32>().unwrap());
        }
        Ok(labels)
    }

    #[test]
    fn keeps_partial_final_batch() -> Result<()> {
        let loader = ImageDataLoader::new(
            dataset(10),
            TransformPipeline::default(),
            Device::Cpu,
            4,
            false,
            0,
            1,
        )?;
        assert_eq!(loader.num_batches(), 3);
        let mut loader = BlockingDataLoader::new(loader);
        let mut sizes = Vec::new();
        while let Some(batch) = loader.next_batch()? {
            assert_eq!(batch.images.dims()[1..], [3, 4, 4]);
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        Ok(())
    }

    #[test]
    fn shuffled_epochs_visit_every_example_once() -> Result<()> {
        let loader = ImageDataLoader::new(
            dataset(20),
            TransformPipeline::default(),
            Device::Cpu,
            3,
            true,
            3,
            42,
        )?;
        let mut loader = BlockingDataLoader::new(loader);
        loader.start_epoch(0)?;
        let first = drain(&mut loader)?;
        loader.start_epoch(1)?;
        let second = drain(&mut loader)?;

        let mut sorted = first.clone();
        sorted.sort_unstable();
        let mut expected: Vec<u32> = (0..20).map(|i| i % 10).collect();
        expected.sort_unstable();
        assert_eq!(sorted, expected);
        assert_eq!(second.len(), 20);
        assert_eq!(first.len(), loader.num_examples());
        assert_eq!(loader.num_batches(), 7);

        loader.start_epoch(0)?;
        assert_eq!(drain(&mut loader)?, first);
        Ok(())
    }

    #[test]
    fn worker_count_does_not_change_pixels_without_randomness() -> Result<()> {
        let mut outputs = Vec::new();
        for workers in [0, 4] {
            let loader = ImageDataLoader::new(
                dataset(8),
                TransformPipeline::for_evaluation(true),
                Device::Cpu,
                8,
                false,
                workers,
                0,
            )?;
            let mut loader = BlockingDataLoader::new(loader);
            let batch = loader.next_batch()?.unwrap();
            outputs.push(batch.images.flatten_all().unwrap().to_vec1::<f32>().unwrap());
        }
        assert_eq!(outputs[0], outputs[1]);
        Ok(())
    }
}
