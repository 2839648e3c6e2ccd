//! `slimnet synth`: write a seeded synthetic dataset to disk.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::Device;

use slimnet_compress::{DatasetSplits, SyntheticSpec};

use crate::config::AppConfig;

pub fn run(
    output: &Path,
    classes: Option<usize>,
    train: Option<usize>,
    validation: Option<usize>,
    image_size: Option<usize>,
    seed: Option<u64>,
    config: &AppConfig,
) -> Result<()> {
    let base = &config.data.spec;
    let spec = SyntheticSpec {
        num_classes: classes.unwrap_or(base.num_classes),
        train_samples: train.unwrap_or(base.train_samples),
        validation_samples: validation.unwrap_or(base.validation_samples),
        channels: base.channels,
        image_size: image_size.unwrap_or(base.image_size),
        seed: seed.unwrap_or(base.seed),
    };

    let splits = DatasetSplits::synthetic(&spec, &Device::Cpu).context("Failed to generate dataset")?;
    splits
        .save_dir(output)
        .with_context(|| format!("Failed to write dataset to {}", output.display()))?;

    println!(
        "\nDataset written to {}\n\
         Classes: {}\n\
         Train: {} images, validation: {} images ({}x{}x{})",
        output.display(),
        spec.num_classes,
        spec.train_samples,
        spec.validation_samples,
        spec.channels,
        spec.image_size,
        spec.image_size,
    );
    Ok(())
}
