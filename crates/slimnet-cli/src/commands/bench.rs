//! `slimnet bench`: latency and on-disk size of a saved artifact.

use std::path::Path;

use anyhow::{Context, Result};

use slimnet_compress::{benchmark::benchmark, integrity::verify_artifact};
use slimnet_core::{Classifier, DeployedModel};

use crate::commands::{resolve_device, DeviceArgs};
use crate::config::AppConfig;

#[allow(clippy::too_many_arguments)]
pub fn run(
    artifact: &Path,
    sha256: Option<&str>,
    channels: usize,
    image_size: usize,
    runs: Option<usize>,
    warmup: Option<usize>,
    device_args: &DeviceArgs,
    config: &AppConfig,
) -> Result<()> {
    if let Some(expected) = sha256 {
        verify_artifact(artifact, expected)?;
    }

    let device = resolve_device(device_args, config)?;
    let model = DeployedModel::load(artifact, &device)
        .with_context(|| format!("Failed to load {}", artifact.display()))?;

    let mut cfg = config.benchmark.clone();
    if let Some(r) = runs {
        cfg.runs = r;
    }
    if let Some(w) = warmup {
        cfg.warmup = w;
    }

    let result = benchmark(&model, artifact, (channels, image_size, image_size), &cfg)?;

    println!(
        "\n{} ({} model, {} classes)\n\
         Latency: {:.3} ms (mean of {} runs after {} warm-up)\n\
         Size:    {:.3} MB ({} bytes)",
        artifact.display(),
        model.format(),
        model.num_classes(),
        result.latency_ms,
        result.runs,
        result.warmup,
        result.size_mb,
        result.size_bytes,
    );
    Ok(())
}
