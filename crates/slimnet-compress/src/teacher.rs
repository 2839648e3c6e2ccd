//! Teacher model wrapper.
//!
//! Wraps a frozen [`Sequential`] so the distiller can query soft targets
//! without any path for gradients to flow back into the teacher.

use std::path::Path;

use candle_core::{Device, Tensor};
use tracing::info;

use slimnet_core::{Classifier, CoreResult, Sequential};

use crate::dataset::ImageDataset;
use crate::distiller::{train_supervised, DistillConfig, TrainingStats};
use crate::presets::ConvNetConfig;
use crate::student::TrainableStudent;

/// A pretrained classifier that is never updated.
#[derive(Debug, Clone)]
pub struct Teacher {
    model: Sequential,
}

impl Teacher {
    pub fn new(model: Sequential) -> Self {
        Self { model }
    }

    /// Load a teacher from a float artifact written by `train-teacher`.
    pub fn load(path: &Path, device: &Device) -> CoreResult<Self> {
        let model = Sequential::load(path, device)?;
        info!(
            path = %path.display(),
            classes = model.num_classes(),
            params = model.parameter_count(),
            "Teacher model loaded"
        );
        Ok(Self { model })
    }

    pub fn save(&self, path: &Path) -> CoreResult<()> {
        self.model.save(path)
    }

    pub fn model(&self) -> &Sequential {
        &self.model
    }
}

impl Classifier for Teacher {
    fn logits(&self, images: &Tensor) -> CoreResult<Tensor> {
        Ok(self.model.forward(images)?.detach())
    }

    fn num_classes(&self) -> usize {
        self.model.num_classes()
    }

    fn device(&self) -> &Device {
        self.model.device()
    }
}

/// Train a fresh network on hard labels only and freeze it into a [`Teacher`].
///
/// Uses the epochs, batch size and learning rate from `config`; temperature and
/// alpha are ignored.
pub fn pretrain_teacher(
    arch: &ConvNetConfig,
    data: &ImageDataset,
    config: &DistillConfig,
    device: &Device,
) -> CoreResult<(Teacher, TrainingStats)> {
    info!(widths = ?arch.widths, epochs = config.epochs, "Pre-training teacher on labels");
    let net = TrainableStudent::new(arch, device)?;
    let (net, stats) = train_supervised(net, data, config)?;
    Ok((Teacher::new(net.freeze()?), stats))
}
