use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;

use commands::{compress::CompressArgs, DataArgs, DeviceArgs};
use config::load_config;
use slimnet_compress::ArchPreset;

/// slimnet: distill, prune and quantize image classifiers
#[derive(Debug, Parser)]
#[command(name = "slimnet", version, about, long_about = None, arg_required_else_help = true)]
struct Cli {
    /// Path to a custom configuration file (TOML).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log format: "pretty" (default) or "json".
    #[arg(long, global = true, default_value = "pretty", value_name = "FORMAT")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Distill a student from a teacher, prune it, quantize it to int8,
    /// export it and report accuracy, latency and size.
    Compress(CompressArgs),

    /// Train a teacher network on labels and save it as a float artifact.
    TrainTeacher {
        #[command(flatten)]
        data: DataArgs,

        #[command(flatten)]
        device: DeviceArgs,

        /// Architecture preset: tiny, small or base (overrides config).
        #[arg(long, value_name = "PRESET")]
        preset: Option<ArchPreset>,

        #[arg(long)]
        epochs: Option<usize>,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        learning_rate: Option<f64>,

        /// Destination file (default: <output.dir>/teacher.safetensors).
        #[arg(long, short = 'o', value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Measure arg-max accuracy of a saved artifact on the validation split.
    Evaluate {
        /// Float or quantized artifact.
        artifact: PathBuf,

        /// Refuse to load unless the file has this SHA-256 digest.
        #[arg(long, value_name = "HEX")]
        sha256: Option<String>,

        #[arg(long)]
        batch_size: Option<usize>,

        #[command(flatten)]
        data: DataArgs,

        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Measure single-image latency and on-disk size of a saved artifact.
    Bench {
        /// Float or quantized artifact.
        artifact: PathBuf,

        /// Refuse to load unless the file has this SHA-256 digest.
        #[arg(long, value_name = "HEX")]
        sha256: Option<String>,

        /// Input channels.
        #[arg(long, default_value_t = 3)]
        channels: usize,

        /// Input side length in pixels.
        #[arg(long, default_value_t = 224)]
        image_size: usize,

        #[arg(long)]
        runs: Option<usize>,

        #[arg(long)]
        warmup: Option<usize>,

        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Write a seeded synthetic dataset (train + validation) to a directory.
    Synth {
        /// Output directory.
        #[arg(long, short = 'o', value_name = "DIR")]
        output: PathBuf,

        #[arg(long)]
        classes: Option<usize>,

        /// Training images.
        #[arg(long)]
        train: Option<usize>,

        /// Validation images.
        #[arg(long)]
        validation: Option<usize>,

        #[arg(long)]
        image_size: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialise tracing
    init_tracing(&cli.log_format);

    // Load configuration
    let cfg = load_config(cli.config.as_ref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Compress(args) => {
            commands::compress::run(&args, &cfg)?;
        }
        Commands::TrainTeacher { data, device, preset, epochs, batch_size, learning_rate, output } => {
            commands::train_teacher::run(&data, &device, preset, epochs, batch_size, learning_rate, output, &cfg)?;
        }
        Commands::Evaluate { artifact, sha256, batch_size, data, device } => {
            commands::evaluate::run(&artifact, sha256.as_deref(), batch_size, &data, &device, &cfg)?;
        }
        Commands::Bench { artifact, sha256, channels, image_size, runs, warmup, device } => {
            commands::bench::run(&artifact, sha256.as_deref(), channels, image_size, runs, warmup, &device, &cfg)?;
        }
        Commands::Synth { output, classes, train, validation, image_size, seed } => {
            commands::synth::run(&output, classes, train, validation, image_size, seed, &cfg)?;
        }
    }

    Ok(())
}

fn init_tracing(log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry
            .with(fmt::layer().json())
            .init();
    } else {
        registry
            .with(fmt::layer().pretty())
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn compress_flags_parse() {
        let cli = Cli::try_parse_from([
            "slimnet",
            "compress",
            "--synthetic",
            "--pretrain-teacher",
            "--student-preset",
            "tiny",
            "--sparsity",
            "0.5",
            "--observer",
            "batch_average",
            "--fuse",
            "features.0,features.1,features.2",
        ])
        .unwrap();
        let Commands::Compress(args) = cli.command else { panic!("expected compress") };
        assert!(args.data.synthetic);
        assert_eq!(args.student_preset, Some(ArchPreset::Tiny));
        assert_eq!(args.sparsity, Some(0.5));
        assert_eq!(args.fuse.len(), 1);
    }

    #[test]
    fn compress_needs_a_teacher_source() {
        assert!(Cli::try_parse_from(["slimnet", "compress", "--synthetic"]).is_err());
        assert!(Cli::try_parse_from(["slimnet", "compress", "--synthetic", "--teacher", "t.safetensors"]).is_ok());
        assert!(Cli::try_parse_from([
            "slimnet",
            "compress",
            "--synthetic",
            "--teacher",
            "t.safetensors",
            "--pretrain-teacher"
        ])
        .is_err());
    }

    #[test]
    fn data_dir_and_synthetic_conflict() {
        let res = Cli::try_parse_from(["slimnet", "evaluate", "model.safetensors", "--data", "d", "--synthetic"]);
        assert!(res.is_err());
    }

    #[test]
    fn unknown_preset_is_rejected() {
        let res = Cli::try_parse_from(["slimnet", "train-teacher", "--synthetic", "--preset", "huge"]);
        assert!(res.is_err());
    }
}
