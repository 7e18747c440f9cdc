use rand::Rng;

use super::Result;
use crate::TrainingError;

/// Per-channel mean of the CIFAR-10 training images.
pub const CIFAR_MEAN: [f32; 3] = [0.4914, 0.4822, 0.4465];
/// Per-channel standard deviation used alongside [`CIFAR_MEAN`].
pub const CIFAR_STD: [f32; 3] = [0.2023, 0.1994, 0.2010];

/// A single CHW float image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuffer {
    pub data: Vec<f32>,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageBuffer {
    /// Scales bytes into `[0, 1]`.
    pub fn from_bytes(bytes: &[u8], channels: usize, height: usize, width: usize) -> Self {
        Self {
            data: bytes.iter().map(|b| f32::from(*b) / 255.0).collect(),
            channels,
            height,
            width,
        }
    }

    fn at(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[(c * self.height + y) * self.width + x]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// Zero-pads every side by `padding`, then crops a random `size` square.
    RandomCrop { size: usize, padding: usize },
    /// Mirrors the image left-right with probability `p`.
    RandomHorizontalFlip { p: f64 },
    Normalize { mean: Vec<f32>, std: Vec<f32> },
}

impl Transform {
    pub fn cifar_normalize() -> Self {
        Transform::Normalize {
            mean: CIFAR_MEAN.to_vec(),
            std: CIFAR_STD.to_vec(),
        }
    }

    pub fn apply<R: Rng + ?Sized>(&self, image: ImageBuffer, rng: &mut R) -> Result<ImageBuffer> {
        match self {
            Transform::RandomCrop { size, padding } => random_crop(image, *size, *padding, rng),
            Transform::RandomHorizontalFlip { p } => {
                if rng.gen_bool(p.clamp(0.0, 1.0)) {
                    Ok(flip_horizontal(image))
                } else {
                    Ok(image)
                }
            }
            Transform::Normalize { mean, std } => normalize(image, mean, std),
        }
    }
}

fn random_crop<R: Rng + ?Sized>(
    image: ImageBuffer,
    size: usize,
    padding: usize,
    rng: &mut R,
) -> Result<ImageBuffer> {
    let padded_h = image.height + 2 * padding;
    let padded_w = image.width + 2 * padding;
    if size > padded_h || size > padded_w {
        return Err(TrainingError::runtime(format!(
            "crop size {} exceeds padded image {}x{}",
            size, padded_h, padded_w
        )));
    }
    let top = rng.gen_range(0..=padded_h - size);
    let left = rng.gen_range(0..=padded_w - size);

    let mut data = Vec::with_capacity(image.channels * size * size);
    for c in 0..image.channels {
        for y in 0..size {
            for x in 0..size {
                let src_y = (top + y).checked_sub(padding).filter(|v| *v < image.height);
                let src_x = (left + x).checked_sub(padding).filter(|v| *v < image.width);
                data.push(match (src_y, src_x) {
                    (Some(sy), Some(sx)) => image.at(c, sy, sx),
                    _ => 0.0,
                });
            }
        }
    }
    Ok(ImageBuffer {
        data,
        channels: image.channels,
        height: size,
        width: size,
    })
}

fn flip_horizontal(mut image: ImageBuffer) -> ImageBuffer {
    for row in image.data.chunks_exact_mut(image.width) {
        row.reverse();
    }
    image
}

fn normalize(mut image: ImageBuffer, mean: &[f32], std: &[f32]) -> Result<ImageBuffer> {
    if mean.len() != image.channels || std.len() != image.channels {
        return Err(TrainingError::runtime(format!(
            "normalize expects {} channel statistics, got mean {} / std {}",
            image.channels,
            mean.len(),
            std.len()
        )));
    }
    let plane = image.height * image.width;
    for (c, values) in image.data.chunks_exact_mut(plane).enumerate() {
        for value in values {
            *value = (*value - mean[c]) / std[c];
        }
    }
    Ok(image)
}

/// Ordered list of transforms applied to every example of a stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformPipeline {
    transforms: Vec<Transform>,
}

impl TransformPipeline {
    pub fn new(transforms: Vec<Transform>) -> Self {
        Self { transforms }
    }

    /// Crop + flip when `augment`, then normalisation when `normalize`.
    pub fn for_training(augment: bool, normalize: bool) -> Self {
        let mut transforms = Vec::new();
        if augment {
            transforms.push(Transform::RandomCrop {
                size: 32,
                padding: 4,
            });
            transforms.push(Transform::RandomHorizontalFlip { p: 0.5 });
        }
        if normalize {
            transforms.push(Transform::cifar_normalize());
        }
        Self { transforms }
    }

    /// Evaluation images are never augmented.
    pub fn for_evaluation(normalize: bool) -> Self {
        Self::for_training(false, normalize)
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    pub fn apply<R: Rng + ?Sized>(&self, mut image: ImageBuffer, rng: &mut R) -> Result<ImageBuffer> {
        for transform in &self.transforms {
            image = transform.apply(image, rng)?;
        }
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn ramp(channels: usize, side: usize) -> ImageBuffer {
        ImageBuffer {
            data: (0..channels * side * side).map(|v| v as f32).collect(),
            channels,
            height: side,
            width: side,
        }
    }

    #[test]
    fn pipelines_follow_flags() {
        assert!(TransformPipeline::for_training(false, false).transforms().is_empty());
        let train = TransformPipeline::for_training(true, true);
        assert_eq!(train.transforms().len(), 3);
        assert!(matches!(train.transforms()[0], Transform::RandomCrop { size: 32, padding: 4 }));
        assert_eq!(train.transforms()[2], Transform::cifar_normalize());
        assert_eq!(TransformPipeline::for_evaluation(true).transforms().len(), 1);
    }

    #[test]
    fn crop_keeps_shape_and_source_pixels() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let image = ramp(3, 32);
        for _ in 0..10 {
            let cropped = Transform::RandomCrop { size: 32, padding: 4 }.apply(image.clone(), &mut rng)?;
            assert_eq!(cropped.data.len(), image.data.len());
            assert!(cropped
                .data
                .iter()
                .all(|v| *v == 0.0 || image.data.contains(v)));
        }
        Ok(())
    }

    #[test]
    fn certain_flip_mirrors_rows() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let flipped = Transform::RandomHorizontalFlip { p: 1.0 }.apply(ramp(1, 3), &mut rng)?;
        assert_eq!(&flipped.data[..3], &[2.0, 1.0, 0.0]);
        let kept = Transform::RandomHorizontalFlip { p: 0.0 }.apply(ramp(1, 3), &mut rng)?;
        assert_eq!(kept, ramp(1, 3));
        Ok(())
    }

    #[test]
    fn normalize_uses_channel_statistics() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let image = ImageBuffer::from_bytes(&[255, 0, 255, 0, 255, 0], 3, 1, 2);
        let normalized = Transform::cifar_normalize().apply(image, &mut rng)?;
        let expected = (1.0 - CIFAR_MEAN[0]) / CIFAR_STD[0];
        assert!((normalized.data[0] - expected).abs() < 1e-6);
        let expected = (0.0 - CIFAR_MEAN[2]) / CIFAR_STD[2];
        assert!((normalized.data[5] - expected).abs() < 1e-6);
        Ok(())
    }
}
