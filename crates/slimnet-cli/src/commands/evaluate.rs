//! `slimnet evaluate`: accuracy of a saved artifact on the validation split.

use std::path::Path;

use anyhow::{Context, Result};

use slimnet_compress::{evaluate, integrity::verify_artifact};
use slimnet_core::{Classifier, DeployedModel};

use crate::commands::{load_data, resolve_device, DataArgs, DeviceArgs};
use crate::config::AppConfig;

pub fn run(
    artifact: &Path,
    sha256: Option<&str>,
    batch_size: Option<usize>,
    data_args: &DataArgs,
    device_args: &DeviceArgs,
    config: &AppConfig,
) -> Result<()> {
    if let Some(expected) = sha256 {
        verify_artifact(artifact, expected)?;
    }

    let device = resolve_device(device_args, config)?;
    let model = DeployedModel::load(artifact, &device)
        .with_context(|| format!("Failed to load {}", artifact.display()))?;
    let data = load_data(data_args, config, &device)?;

    let batch_size = batch_size.unwrap_or(config.training.batch_size);
    let accuracy = evaluate(&model, &data.validation, batch_size)?;

    println!(
        "\n{} ({} model, {} classes)\nAccuracy: {}",
        artifact.display(),
        model.format(),
        model.num_classes(),
        accuracy,
    );
    Ok(())
}
