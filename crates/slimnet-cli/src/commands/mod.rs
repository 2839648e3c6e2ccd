//! Subcommand implementations and the helpers they share.

pub mod bench;
pub mod compress;
pub mod evaluate;
pub mod synth;
pub mod train_teacher;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use candle_core::Device;
use clap::Args;
use tracing::info;

use slimnet_compress::DatasetSplits;
use slimnet_core::{select_device, DeviceKind};

use crate::config::{expand_path, AppConfig};

/// Where the images come from. Shared by every command that reads data.
#[derive(Debug, Clone, Args)]
pub struct DataArgs {
    /// Directory containing `train.safetensors` and `validation.safetensors`.
    #[arg(long, value_name = "DIR", conflicts_with = "synthetic")]
    pub data: Option<PathBuf>,

    /// Generate a seeded synthetic dataset instead of reading one from disk.
    #[arg(long)]
    pub synthetic: bool,

    /// Seed for the synthetic generator (overrides config).
    #[arg(long, requires = "synthetic")]
    pub seed: Option<u64>,

    /// Side length of synthetic images (overrides config).
    #[arg(long, requires = "synthetic")]
    pub image_size: Option<usize>,
}

/// Device override shared by every command.
#[derive(Debug, Clone, Args)]
pub struct DeviceArgs {
    /// Compute device: "cpu" or "accelerated" (overrides config).
    #[arg(long, value_name = "KIND")]
    pub device: Option<DeviceKind>,
}

pub fn resolve_device(args: &DeviceArgs, cfg: &AppConfig) -> Result<Device> {
    let kind = args.device.unwrap_or(cfg.device.kind);
    let device = select_device(kind, cfg.device.ordinal).context("Failed to select compute device")?;
    info!(requested = %kind, device = slimnet_core::device::device_name(&device), "Device ready");
    Ok(device)
}

/// Load or generate the train/validation partitions.
pub fn load_data(args: &DataArgs, cfg: &AppConfig, device: &Device) -> Result<DatasetSplits> {
    let from_dir = args.data.clone().or_else(|| cfg.data.dir.as_deref().map(expand_path));
    if args.synthetic || (cfg.data.synthetic && args.data.is_none()) {
        let mut spec = cfg.data.spec.clone();
        if let Some(seed) = args.seed {
            spec.seed = seed;
        }
        if let Some(size) = args.image_size {
            spec.image_size = size;
        }
        return DatasetSplits::synthetic(&spec, device).context("Failed to generate synthetic dataset");
    }
    match from_dir {
        Some(dir) => DatasetSplits::load_dir(&dir, device)
            .with_context(|| format!("Failed to load dataset from {}", dir.display())),
        None => bail!("No dataset given. Pass --data DIR or --synthetic, or set data.dir in the config."),
    }
}
