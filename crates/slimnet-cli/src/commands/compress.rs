//! `slimnet compress`: run the full distill → prune → quantize → export →
//! benchmark pipeline and print the headline metrics.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use slimnet_compress::{
    pretrain_teacher, run_pipeline, ArchPreset, FusionPlan, ObserverMethod, PipelineConfig, Teacher,
    TrainableStudent,
};
use slimnet_core::Classifier;

use crate::commands::{load_data, resolve_device, DataArgs, DeviceArgs};
use crate::config::{output_file, AppConfig};

#[derive(Debug, Clone, Args)]
pub struct CompressArgs {
    #[command(flatten)]
    pub data: DataArgs,

    #[command(flatten)]
    pub device: DeviceArgs,

    /// Float teacher artifact written by `slimnet train-teacher`.
    #[arg(long, value_name = "FILE", required_unless_present = "pretrain_teacher")]
    pub teacher: Option<PathBuf>,

    /// Train a teacher on the labels first instead of loading one.
    #[arg(long, conflicts_with = "teacher")]
    pub pretrain_teacher: bool,

    /// Architecture used when a teacher has to be trained (overrides config).
    #[arg(long, value_name = "PRESET")]
    pub teacher_preset: Option<ArchPreset>,

    /// Student architecture: tiny, small or base (overrides config).
    #[arg(long, value_name = "PRESET")]
    pub student_preset: Option<ArchPreset>,

    /// Softmax temperature for the distillation term.
    #[arg(long)]
    pub temperature: Option<f64>,

    /// Weight of the distillation term, in [0, 1].
    #[arg(long)]
    pub alpha: Option<f64>,

    #[arg(long)]
    pub epochs: Option<usize>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    /// AdamW learning rate.
    #[arg(long)]
    pub learning_rate: Option<f64>,

    /// Fraction of convolution weights to zero, in [0, 1).
    #[arg(long)]
    pub sparsity: Option<f64>,

    /// Maximum number of validation batches used to calibrate activation ranges.
    #[arg(long)]
    pub calibration_batches: Option<usize>,

    /// Activation range observer: min_max or batch_average.
    #[arg(long)]
    pub observer: Option<ObserverMethod>,

    /// Comma-separated layer names to fuse, e.g. `features.0,features.1,features.2`.
    /// Repeat for several runs. Without it every fusable run is found automatically.
    #[arg(long = "fuse", value_name = "NAMES")]
    pub fuse: Vec<String>,

    /// Timed inference runs.
    #[arg(long)]
    pub runs: Option<usize>,

    /// Untimed warm-up runs.
    #[arg(long)]
    pub warmup: Option<usize>,

    /// Destination of the quantized artifact (default: <output.dir>/student_int8.safetensors).
    #[arg(long, short = 'o', value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Also write the full run report as JSON.
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,
}

impl CompressArgs {
    /// Merge flags over the loaded config.
    fn pipeline_config(&self, cfg: &AppConfig) -> PipelineConfig {
        let mut distill = cfg.training.clone();
        if let Some(t) = self.temperature {
            distill.temperature = t;
        }
        if let Some(a) = self.alpha {
            distill.alpha = a;
        }
        if let Some(e) = self.epochs {
            distill.epochs = e;
        }
        if let Some(b) = self.batch_size {
            distill.batch_size = b;
        }
        if let Some(lr) = self.learning_rate {
            distill.learning_rate = lr;
        }

        let mut quantize = cfg.quantization.clone();
        if let Some(n) = self.calibration_batches {
            quantize.calibration_batches = n;
        }
        if let Some(o) = self.observer {
            quantize.observer = o;
        }
        if !self.fuse.is_empty() {
            quantize.fusion = FusionPlan::Explicit(
                self.fuse
                    .iter()
                    .map(|run| run.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                    .collect(),
            );
        }

        let mut benchmark = cfg.benchmark.clone();
        if let Some(r) = self.runs {
            benchmark.runs = r;
        }
        if let Some(w) = self.warmup {
            benchmark.warmup = w;
        }

        PipelineConfig {
            distill,
            sparsity: self.sparsity.unwrap_or(cfg.pruning.sparsity),
            quantize,
            benchmark,
            output: self.output.clone().unwrap_or_else(|| output_file(cfg, "student_int8.safetensors")),
        }
    }
}

pub fn run(args: &CompressArgs, config: &AppConfig) -> Result<()> {
    let device = resolve_device(&args.device, config)?;
    let data = load_data(&args.data, config, &device)?;
    let classes = data.num_classes()?;
    let pipeline = args.pipeline_config(config);
    pipeline.validate()?;

    let teacher = match &args.teacher {
        Some(path) => {
            let teacher = Teacher::load(path, &device)
                .with_context(|| format!("Failed to load teacher from {}", path.display()))?;
            if teacher.num_classes() != classes {
                warn!(
                    teacher_classes = teacher.num_classes(),
                    dataset_classes = classes,
                    "Teacher head does not match the dataset; distillation will fail"
                );
            }
            teacher
        }
        None => {
            let preset = args.teacher_preset.unwrap_or(config.model.teacher_preset);
            info!(preset = %preset, "Training teacher on labels");
            let arch = preset.config(data.train.channels(), classes);
            let (teacher, stats) = pretrain_teacher(&arch, &data.train, &pipeline.distill, &device)
                .context("Teacher training failed")?;
            info!(final_loss = ?stats.final_loss(), "Teacher ready");
            teacher
        }
    };

    let preset = args.student_preset.unwrap_or(config.model.student_preset);
    let arch = preset.config(data.train.channels(), classes);
    info!(preset = %preset, approx_params = arch.approx_params(), "Building student");
    let student = TrainableStudent::new(&arch, &device).context("Failed to build student")?;

    let report = run_pipeline(&teacher, student, &data, &pipeline)?;

    if let Some(path) = &args.report {
        report.write_json(path).with_context(|| format!("Failed to write report to {}", path.display()))?;
    }

    let m = &report.metrics;
    println!(
        "\nCompression complete!\n\
         Artifact: {} ({})\n\
         SHA-256: {}\n\
         \n\
         Student accuracy:   {}\n\
         Pruned accuracy:    {}\n\
         Quantized accuracy: {}\n\
         Sparsity: {}/{} weights ({:.2}%)\n\
         \n\
         Accuracy: {:.4} ({:.2}%)\n\
         Latency:  {:.3} ms\n\
         Size:     {:.3} MB",
        report.artifact.path.display(),
        report.artifact.format,
        report.artifact.sha256,
        report.student_accuracy,
        report.pruned_accuracy,
        report.quantized_accuracy,
        report.pruning.pruned,
        report.pruning.total,
        report.pruning.global_sparsity() * 100.0,
        m.accuracy(),
        m.accuracy_percent(),
        m.latency_ms(),
        m.size_mb(),
    );
    Ok(())
}
