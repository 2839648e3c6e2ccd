//! `slimnet train-teacher`: fit a teacher network on labels and save it as a
//! float artifact that `slimnet compress --teacher` can read.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use slimnet_compress::{evaluate, export, pretrain_teacher, ArchPreset};

use crate::commands::{load_data, resolve_device, DataArgs, DeviceArgs};
use crate::config::{output_file, AppConfig};

#[allow(clippy::too_many_arguments)]
pub fn run(
    data_args: &DataArgs,
    device_args: &DeviceArgs,
    preset: Option<ArchPreset>,
    epochs: Option<usize>,
    batch_size: Option<usize>,
    learning_rate: Option<f64>,
    output: Option<PathBuf>,
    config: &AppConfig,
) -> Result<()> {
    let device = resolve_device(device_args, config)?;
    let data = load_data(data_args, config, &device)?;
    let classes = data.num_classes()?;

    let preset = preset.unwrap_or(config.model.teacher_preset);
    let mut train = config.training.clone();
    if let Some(e) = epochs {
        train.epochs = e;
    }
    if let Some(b) = batch_size {
        train.batch_size = b;
    }
    if let Some(lr) = learning_rate {
        train.learning_rate = lr;
    }

    let arch = preset.config(data.train.channels(), classes);
    info!(preset = %preset, classes, epochs = train.epochs, "Training teacher");
    let (teacher, stats) = pretrain_teacher(&arch, &data.train, &train, &device).context("Teacher training failed")?;

    let accuracy = evaluate(&teacher, &data.validation, train.batch_size)?;
    let path = output.unwrap_or_else(|| output_file(config, "teacher.safetensors"));
    let artifact = export(teacher.model(), &path).context("Failed to save teacher")?;

    println!(
        "\nTeacher training complete!\n\
         Output: {}\n\
         Validation accuracy: {:.4} ({:.2}%)\n\
         Final loss: {:.4}\n\
         Elapsed: {:.1} s ({:.0} samples/s)\n\
         SHA-256: {}",
        artifact.path.display(),
        accuracy.fraction(),
        accuracy.percent(),
        stats.final_loss().unwrap_or(f32::NAN),
        stats.elapsed_secs,
        stats.samples_per_sec,
        artifact.sha256,
    );
    Ok(())
}
