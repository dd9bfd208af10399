//! Batched, epoch-cycling image pipelines.
//!
//! A [`DataPipeline`] is a cheap handle over a scanned [`ImageFolder`]. Calling
//! [`DataPipeline::batches`] starts a lazy, infinite [`BatchStream`] that decodes
//! images on demand, resizes them to the configured geometry, applies the
//! pipeline's augmentation, rescales pixel values by 1/255, and reshuffles the
//! sample order at every epoch boundary.

use crate::config::ImageSize;
use crate::data::augment::Augmentation;
use crate::data::folder::ImageFolder;
use crate::error::MlError;
use candle_core::{DType, Device, Tensor};
use image::RgbImage;
use image::imageops::FilterType;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::path::Path;
use std::sync::Arc;

/// Fixed pixel rescale applied to every sample.
pub const RESCALE: f32 = 1.0 / 255.0;

/// The three pipelines a session trains, validates and tests with.
#[derive(Debug, Clone)]
pub struct DataPipelines {
    pub train: DataPipeline,
    pub validation: DataPipeline,
    pub test: DataPipeline,
}

/// One mini-batch: `images` is `[B, 3, H, W]` in `[0, 1]`, `labels` is `[B]` of 0/1.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Tensor,
}

impl Batch {
    /// Assemble a batch from already-decoded RGB images.
    pub fn from_images(
        images: &[RgbImage],
        labels: &[f32],
        device: &Device,
    ) -> Result<Self, MlError> {
        if images.is_empty() || images.len() != labels.len() {
            return Err(MlError::invalid_input(format!(
                "batch needs matching non-empty images and labels, got {} and {}",
                images.len(),
                labels.len()
            )));
        }
        let (width, height) = images[0].dimensions();
        let (w, h) = (width as usize, height as usize);
        let plane = w * h;
        let mut data = vec![0f32; images.len() * 3 * plane];
        for (i, img) in images.iter().enumerate() {
            if img.dimensions() != (width, height) {
                return Err(MlError::invalid_input(format!(
                    "image {i} is {:?}, expected {:?}",
                    img.dimensions(),
                    (width, height)
                )));
            }
            let base = i * 3 * plane;
            for (x, y, pixel) in img.enumerate_pixels() {
                let offset = y as usize * w + x as usize;
                for c in 0..3 {
                    data[base + c * plane + offset] = f32::from(pixel[c]) * RESCALE;
                }
            }
        }
        let images = Tensor::from_vec(data, (images.len(), 3, h, w), device)?;
        let labels = Tensor::from_slice(labels, labels.len(), device)?;
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.elem_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn label_values(&self) -> Result<Vec<f32>, MlError> {
        Ok(self.labels.to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }

    /// Convert up to `limit` images back to 8-bit RGB.
    pub fn to_images(&self, limit: usize) -> Result<Vec<RgbImage>, MlError> {
        let (b, _c, h, w) = self.images.dims4()?;
        let n = b.min(limit);
        if n == 0 {
            return Ok(Vec::new());
        }
        let values = self.images.narrow(0, 0, n)?.flatten_all()?.to_vec1::<f32>()?;
        let plane = h * w;
        Ok((0..n)
            .map(|i| {
                let base = i * 3 * plane;
                RgbImage::from_fn(w as u32, h as u32, |x, y| {
                    let offset = y as usize * w + x as usize;
                    let px = |c: usize| (values[base + c * plane + offset] * 255.0).round().clamp(0.0, 255.0) as u8;
                    image::Rgb([px(0), px(1), px(2)])
                })
            })
            .collect())
    }
}

/// Handle producing batches from a class-folder corpus.
#[derive(Debug, Clone)]
pub struct DataPipeline {
    folder: Arc<ImageFolder>,
    batch_size: usize,
    img_size: ImageSize,
    augmentation: Augmentation,
    shuffle: bool,
    seed: Option<u64>,
    device: Device,
}

impl DataPipeline {
    pub fn new(
        folder: ImageFolder,
        batch_size: usize,
        img_size: ImageSize,
        augmentation: Augmentation,
        device: Device,
    ) -> Result<Self, MlError> {
        if batch_size == 0 {
            return Err(MlError::invalid_input("batch_size must be at least 1"));
        }
        Ok(Self {
            folder: Arc::new(folder),
            batch_size,
            img_size,
            augmentation,
            shuffle: true,
            seed: None,
            device,
        })
    }

    /// Scan `dir` and wrap it in a pipeline.
    pub fn from_directory(
        dir: &Path,
        batch_size: usize,
        img_size: ImageSize,
        augmentation: Augmentation,
        device: Device,
    ) -> Result<Self, MlError> {
        let folder = ImageFolder::scan(dir)?;
        Self::new(folder, batch_size, img_size, augmentation, device)
    }

    /// Fix the shuffle/augmentation seed so every stream replays identically.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn folder(&self) -> &ImageFolder {
        &self.folder
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn img_size(&self) -> ImageSize {
        self.img_size
    }

    pub fn augmentation(&self) -> &Augmentation {
        &self.augmentation
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of samples in one epoch.
    pub fn len(&self) -> usize {
        self.folder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folder.is_empty()
    }

    /// Batches per epoch; the last one may be short.
    pub fn steps_per_epoch(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    /// Start a fresh infinite stream at epoch 0.
    pub fn batches(&self) -> BatchStream {
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut stream = BatchStream {
            pipeline: self.clone(),
            order: (0..self.len()).collect(),
            cursor: 0,
            epoch: 0,
            rng,
        };
        stream.reshuffle();
        stream
    }

    /// Decode, resize and augment the samples at `indices` into one batch.
    pub fn load_batch(&self, indices: &[usize], rng: &mut StdRng) -> Result<Batch, MlError> {
        let mut images = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        for &index in indices {
            images.push(self.load_sample(index, rng)?);
            labels.push(self.folder.samples[index].label as f32);
        }
        tracing::debug!(samples = indices.len(), "Decoded batch");
        Batch::from_images(&images, &labels, &self.device)
    }

    fn load_sample(&self, index: usize, rng: &mut StdRng) -> Result<RgbImage, MlError> {
        let sample = self.folder.samples.get(index).ok_or_else(|| {
            MlError::invalid_input(format!("sample index {index} out of range"))
        })?;
        let decoded = image::open(&sample.path).map_err(|e| {
            MlError::dataset(format!("failed to decode {}: {e}", sample.path.display()))
        })?;
        let (w, h) = (self.img_size.width as u32, self.img_size.height as u32);
        let resized = if decoded.width() == w && decoded.height() == h {
            decoded
        } else {
            decoded.resize_exact(w, h, FilterType::Nearest)
        };
        let mut rgb = resized.to_rgb8();
        if !self.augmentation.is_identity() {
            self.augmentation.apply(&mut rgb, rng);
        }
        Ok(rgb)
    }
}

/// Infinite stream of batches cycling through epochs.
pub struct BatchStream {
    pipeline: DataPipeline,
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
    rng: StdRng,
}

impl BatchStream {
    /// Epochs fully consumed so far.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn next_batch(&mut self) -> Result<Batch, MlError> {
        if self.order.is_empty() {
            return Err(MlError::dataset("pipeline has no samples"));
        }
        if self.cursor >= self.order.len() {
            self.epoch += 1;
            self.cursor = 0;
            self.reshuffle();
        }
        let end = (self.cursor + self.pipeline.batch_size).min(self.order.len());
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = end;
        self.pipeline.load_batch(&indices, &mut self.rng)
    }

    fn reshuffle(&mut self) {
        if self.pipeline.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }
}

impl Iterator for BatchStream {
    type Item = Result<Batch, MlError>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::TempDir;

    fn write_corpus(root: &Path, per_class: usize, size: u32) {
        for (label, class) in ["benign", "malignant"].iter().enumerate() {
            let dir = root.join(class);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                let img = RgbImage::from_fn(size, size, |x, y| {
                    Rgb([(x * 30 + i as u32) as u8, (y * 30) as u8, (label * 200) as u8])
                });
                img.save(dir.join(format!("{i}.png"))).unwrap();
            }
        }
    }

    fn pipeline(root: &Path, batch: usize, augmentation: Augmentation) -> DataPipeline {
        DataPipeline::from_directory(
            root,
            batch,
            ImageSize::new(4, 4),
            augmentation,
            Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn test_steps_per_epoch_rounds_up() {
        let dir = TempDir::new().unwrap();
        write_corpus(dir.path(), 5, 4);
        let p = pipeline(dir.path(), 4, Augmentation::none());
        assert_eq!(p.len(), 10);
        assert_eq!(p.steps_per_epoch(), 3);
    }

    #[test]
    fn test_stream_cycles_epochs_with_short_tail() {
        let dir = TempDir::new().unwrap();
        write_corpus(dir.path(), 5, 4);
        let p = pipeline(dir.path(), 4, Augmentation::none()).with_seed(Some(3));
        let mut stream = p.batches();

        let sizes: Vec<usize> = (0..4).map(|_| stream.next_batch().unwrap().len()).collect();
        assert_eq!(sizes, vec![4, 4, 2, 4]);
        assert_eq!(stream.epoch(), 1);
    }

    #[test]
    fn test_batch_shape_and_range() {
        let dir = TempDir::new().unwrap();
        write_corpus(dir.path(), 2, 8);
        let p = pipeline(dir.path(), 3, Augmentation::none());
        let batch = p.batches().next().unwrap().unwrap();
        assert_eq!(batch.images.dims(), &[3, 3, 4, 4]);
        let values = batch.images.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
        let labels = batch.label_values().unwrap();
        assert!(labels.iter().all(|l| *l == 0.0 || *l == 1.0));
    }

    #[test]
    fn test_seeded_streams_replay() {
        let dir = TempDir::new().unwrap();
        write_corpus(dir.path(), 4, 4);
        let p = pipeline(dir.path(), 8, Augmentation::standard()).with_seed(Some(11));
        let a = p.batches().next_batch().unwrap();
        let b = p.batches().next_batch().unwrap();
        let diff = (a.images - b.images)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_to_images_inverts_rescale() {
        let img = RgbImage::from_fn(2, 3, |x, y| Rgb([x as u8 * 100, y as u8 * 50, 7]));
        let batch = Batch::from_images(&[img.clone()], &[1.0], &Device::Cpu).unwrap();
        let back = batch.to_images(4).unwrap();
        assert_eq!(back, vec![img]);
    }

    #[test]
    fn test_from_images_rejects_mismatched_sizes() {
        let a = RgbImage::new(2, 2);
        let b = RgbImage::new(3, 2);
        assert!(Batch::from_images(&[a, b], &[0.0, 1.0], &Device::Cpu).is_err());
    }
}
