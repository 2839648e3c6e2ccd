//! Image datasets for distillation, evaluation and calibration.
//!
//! A dataset is a pair of pre-decoded tensors:
//!
//! | Tensor   | DType | Shape            |
//! |----------|-------|------------------|
//! | `images` | f32   | `[N, C, H, W]`   |
//! | `labels` | u32   | `[N]`            |
//!
//! On disk a data directory holds one safetensors file per partition,
//! `train.safetensors` and `validation.safetensors`. Batches are produced in
//! the stored order; there is no shuffling.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use slimnet_core::{device::ensure_same_device, CoreError, CoreResult};

pub const TRAIN_FILE: &str = "train.safetensors";
pub const VALIDATION_FILE: &str = "validation.safetensors";
const IMAGES_KEY: &str = "images";
const LABELS_KEY: &str = "labels";

// ── Batch ─────────────────────────────────────────────────────────────────────

/// One labeled mini-batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `f32 [B, C, H, W]`
    pub images: Tensor,
    /// `u32 [B]`
    pub labels: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check the batch is non-empty, has one label per image and lives on `device`.
    pub fn validate(&self, device: &Device) -> CoreResult<()> {
        if self.is_empty() {
            return Err(CoreError::EmptyBatch);
        }
        let labels = self.labels.dims1()?;
        if labels != self.len() {
            return Err(CoreError::ModelShapeMismatch(format!(
                "batch has {} images but {labels} labels",
                self.len()
            )));
        }
        ensure_same_device(self.images.device(), device)?;
        ensure_same_device(self.labels.device(), device)
    }
}

// ── ImageDataset ──────────────────────────────────────────────────────────────

/// A labeled image partition held in memory.
#[derive(Debug, Clone)]
pub struct ImageDataset {
    images: Tensor,
    labels: Tensor,
}

impl ImageDataset {
    pub fn new(images: Tensor, labels: Tensor) -> CoreResult<Self> {
        let (n, _, _, _) = images.dims4().map_err(|_| {
            CoreError::ModelShapeMismatch(format!("images must be [N, C, H, W], got {:?}", images.dims()))
        })?;
        let m = labels
            .dims1()
            .map_err(|_| CoreError::ModelShapeMismatch(format!("labels must be [N], got {:?}", labels.dims())))?;
        if n != m {
            return Err(CoreError::ModelShapeMismatch(format!("{n} images but {m} labels")));
        }
        ensure_same_device(images.device(), labels.device())?;
        Ok(Self { images: images.to_dtype(DType::F32)?, labels: labels.to_dtype(DType::U32)? })
    }

    pub fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn images(&self) -> &Tensor {
        &self.images
    }

    pub fn labels(&self) -> &Tensor {
        &self.labels
    }

    pub fn device(&self) -> &Device {
        self.images.device()
    }

    pub fn channels(&self) -> usize {
        self.images.dims()[1]
    }

    /// `(height, width)`
    pub fn image_size(&self) -> (usize, usize) {
        let d = self.images.dims();
        (d[2], d[3])
    }

    /// Number of classes implied by the labels (`max + 1`).
    pub fn num_classes(&self) -> CoreResult<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        Ok(self.labels.max(0)?.to_scalar::<u32>()? as usize + 1)
    }

    /// Fixed-order batches of `batch_size`; the last one may be shorter.
    pub fn batches(&self, batch_size: usize) -> CoreResult<Batches<'_>> {
        if batch_size == 0 {
            return Err(CoreError::hyperparameter("batch_size", "must be > 0"));
        }
        Ok(Batches { dataset: self, batch_size, offset: 0 })
    }

    /// Samples `start..start + len` as one batch.
    pub fn slice(&self, start: usize, len: usize) -> CoreResult<Batch> {
        Ok(Batch { images: self.images.narrow(0, start, len)?, labels: self.labels.narrow(0, start, len)? })
    }

    pub fn to_device(&self, device: &Device) -> CoreResult<Self> {
        Ok(Self { images: self.images.to_device(device)?, labels: self.labels.to_device(device)? })
    }

    pub fn save(&self, path: &Path) -> CoreResult<()> {
        let tensors: HashMap<&str, Tensor> =
            [(IMAGES_KEY, self.images.clone()), (LABELS_KEY, self.labels.clone())].into_iter().collect();
        candle_core::safetensors::save(&tensors, path).map_err(|e| CoreError::serialization(path, e))?;
        info!(path = %path.display(), samples = self.len(), "Dataset partition written");
        Ok(())
    }

    pub fn load(path: &Path, device: &Device) -> CoreResult<Self> {
        let mut tensors =
            candle_core::safetensors::load(path, device).map_err(|e| CoreError::serialization(path, e))?;
        let images = tensors
            .remove(IMAGES_KEY)
            .ok_or_else(|| CoreError::serialization(path, format!("missing '{IMAGES_KEY}' tensor")))?;
        let labels = tensors
            .remove(LABELS_KEY)
            .ok_or_else(|| CoreError::serialization(path, format!("missing '{LABELS_KEY}' tensor")))?;
        let dataset = Self::new(images, labels)?;
        info!(path = %path.display(), samples = dataset.len(), "Dataset partition loaded");
        Ok(dataset)
    }
}

/// Iterator returned by [`ImageDataset::batches`].
pub struct Batches<'a> {
    dataset: &'a ImageDataset,
    batch_size: usize,
    offset: usize,
}

impl Iterator for Batches<'_> {
    type Item = CoreResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let total = self.dataset.len();
        if self.offset >= total {
            return None;
        }
        let len = self.batch_size.min(total - self.offset);
        let start = self.offset;
        self.offset += len;
        Some(self.dataset.slice(start, len))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.dataset.len().saturating_sub(self.offset);
        let n = left.div_ceil(self.batch_size);
        (n, Some(n))
    }
}

// ── Splits ────────────────────────────────────────────────────────────────────

/// Train and validation partitions of one dataset.
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: ImageDataset,
    pub validation: ImageDataset,
}

impl DatasetSplits {
    /// Load `train.safetensors` and `validation.safetensors` from `dir`.
    pub fn load_dir(dir: &Path, device: &Device) -> CoreResult<Self> {
        let train = ImageDataset::load(&dir.join(TRAIN_FILE), device)?;
        let validation = ImageDataset::load(&dir.join(VALIDATION_FILE), device)?;
        if train.channels() != validation.channels() || train.image_size() != validation.image_size() {
            return Err(CoreError::ModelShapeMismatch(format!(
                "train images are {:?} but validation images are {:?}",
                &train.images.dims()[1..],
                &validation.images.dims()[1..]
            )));
        }
        Ok(Self { train, validation })
    }

    /// Write both partitions into `dir`, creating it if needed.
    pub fn save_dir(&self, dir: &Path) -> CoreResult<()> {
        std::fs::create_dir_all(dir)?;
        self.train.save(&dir.join(TRAIN_FILE))?;
        self.validation.save(&dir.join(VALIDATION_FILE))
    }

    /// Class count across both partitions.
    pub fn num_classes(&self) -> CoreResult<usize> {
        Ok(self.train.num_classes()?.max(self.validation.num_classes()?))
    }

    pub fn synthetic(spec: &SyntheticSpec, device: &Device) -> CoreResult<Self> {
        spec.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(spec.seed);
        let train = synthesize(spec, spec.train_samples, &mut rng, device)?;
        let validation = synthesize(spec, spec.validation_samples, &mut rng, device)?;
        info!(
            classes = spec.num_classes,
            train = spec.train_samples,
            validation = spec.validation_samples,
            image_size = spec.image_size,
            seed = spec.seed,
            "Synthetic dataset generated"
        );
        Ok(Self { train, validation })
    }
}

// ── Synthetic data ────────────────────────────────────────────────────────────

/// Parameters of the deterministic synthetic generator.
///
/// Each class has its own per-channel brightness; pixels are that brightness
/// plus uniform noise, so a small network can separate the classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticSpec {
    pub num_classes: usize,
    pub train_samples: usize,
    pub validation_samples: usize,
    pub channels: usize,
    pub image_size: usize,
    pub seed: u64,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            num_classes: 2,
            train_samples: 100,
            validation_samples: 20,
            channels: 3,
            image_size: 32,
            seed: 42,
        }
    }
}

impl SyntheticSpec {
    pub fn validate(&self) -> CoreResult<()> {
        if self.num_classes < 2 {
            return Err(CoreError::hyperparameter("num_classes", "need at least 2 classes"));
        }
        if self.train_samples == 0 || self.validation_samples == 0 {
            return Err(CoreError::EmptyDataset("synthetic partitions must be non-empty".to_string()));
        }
        if self.channels == 0 || self.image_size == 0 {
            return Err(CoreError::hyperparameter("image_size", "channels and image size must be > 0"));
        }
        Ok(())
    }

    /// Mean brightness of `channel` for images of `class`.
    fn brightness(&self, class: usize, channel: usize) -> f32 {
        let step = ((class + channel) % self.num_classes) as f32 / (self.num_classes - 1) as f32;
        0.2 + 0.6 * step
    }
}

const NOISE: f32 = 0.15;

fn synthesize(spec: &SyntheticSpec, samples: usize, rng: &mut ChaCha8Rng, device: &Device) -> CoreResult<ImageDataset> {
    let plane = spec.image_size * spec.image_size;
    let mut pixels = Vec::with_capacity(samples * spec.channels * plane);
    let mut labels = Vec::with_capacity(samples);
    for i in 0..samples {
        let class = i % spec.num_classes;
        labels.push(class as u32);
        for c in 0..spec.channels {
            let mean = spec.brightness(class, c);
            pixels.extend((0..plane).map(|_| (mean + rng.gen_range(-NOISE..NOISE)).clamp(0.0, 1.0)));
        }
    }
    let images = Tensor::from_vec(pixels, (samples, spec.channels, spec.image_size, spec.image_size), device)?;
    let labels = Tensor::from_vec(labels, samples, device)?;
    ImageDataset::new(images, labels)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
