//! End-to-end compression pipeline.
//!
//! ```text
//! distill ─▶ evaluate ─▶ prune ─▶ quantize ─▶ export ─▶ benchmark
//! ```
//!
//! Each stage takes ownership of the previous stage's model and hands a new
//! one on; only evaluation borrows. The first failure aborts the run and is
//! reported together with the stage it happened in. Nothing is written to the
//! output path unless quantization succeeded.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use slimnet_core::{CoreError, DeployedModel};

use crate::benchmark::{benchmark, BenchmarkConfig, BenchmarkResult};
use crate::dataset::DatasetSplits;
use crate::distiller::{DistillConfig, Distiller, TrainingStats};
use crate::evaluator::{evaluate, Accuracy};
use crate::export::{export, ExportReport};
use crate::pruner::{MagnitudePruner, PruneReport};
use crate::quantizer::{QuantizeConfig, Quantizer};
use crate::student::TrainableStudent;
use crate::teacher::Teacher;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Distill,
    Evaluate,
    Prune,
    Quantize,
    Export,
    Benchmark,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Distill => "distill",
            Self::Evaluate => "evaluate",
            Self::Prune => "prune",
            Self::Quantize => "quantize",
            Self::Export => "export",
            Self::Benchmark => "benchmark",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A [`CoreError`] tagged with the pipeline stage that raised it.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: CoreError,
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, PipelineError>;
}

impl<T> AtStage<T> for Result<T, CoreError> {
    fn at(self, stage: Stage) -> Result<T, PipelineError> {
        self.map_err(|source| PipelineError { stage, source })
    }
}

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub distill: DistillConfig,
    /// Fraction of convolution weights to zero, in `[0, 1)`.
    pub sparsity: f64,
    pub quantize: QuantizeConfig,
    pub benchmark: BenchmarkConfig,
    /// Destination of the quantized artifact.
    pub output: PathBuf,
}

impl PipelineConfig {
    /// Check every stage's settings before any work starts.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.distill.validate().at(Stage::Distill)?;
        MagnitudePruner::new(self.sparsity).at(Stage::Prune)?;
        self.quantize.validate().at(Stage::Quantize)?;
        self.benchmark.validate().at(Stage::Benchmark)
    }
}

// ── Reports ───────────────────────────────────────────────────────────────────

/// The three headline numbers of a run. Fixed once built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    accuracy: f64,
    latency_ms: f64,
    size_mb: f64,
}

impl MetricsReport {
    pub fn new(accuracy: f64, latency_ms: f64, size_mb: f64) -> Self {
        Self { accuracy, latency_ms, size_mb }
    }

    /// Top-1 accuracy of the deployed model, in `[0, 1]`.
    pub fn accuracy(&self) -> f64 {
        self.accuracy
    }

    pub fn accuracy_percent(&self) -> f64 {
        self.accuracy * 100.0
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency_ms
    }

    pub fn size_mb(&self) -> f64 {
        self.size_mb
    }
}

impl fmt::Display for MetricsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "accuracy {:.4} ({:.2}%) | latency {:.3} ms | size {:.3} MB",
            self.accuracy,
            self.accuracy_percent(),
            self.latency_ms,
            self.size_mb
        )
    }
}

/// Everything a run measured, serialisable to JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub metrics: MetricsReport,
    pub training: TrainingStats,
    /// Distilled student before pruning.
    pub student_accuracy: Accuracy,
    pub pruned_accuracy: Accuracy,
    pub quantized_accuracy: Accuracy,
    pub pruning: PruneReport,
    pub artifact: ExportReport,
    pub benchmark: BenchmarkResult,
}

impl PipelineReport {
    /// Write the report as pretty-printed JSON.
    pub fn write_json(&self, path: &Path) -> Result<(), CoreError> {
        let file = std::fs::File::create(path).map_err(|e| CoreError::serialization(path, e))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        info!(path = %path.display(), "Report written");
        Ok(())
    }
}

// ── Run ───────────────────────────────────────────────────────────────────────

/// Distill `student` from `teacher`, then prune, quantize, export and benchmark it.
pub fn run_pipeline(
    teacher: &Teacher,
    student: TrainableStudent,
    data: &DatasetSplits,
    config: &PipelineConfig,
) -> Result<PipelineReport, PipelineError> {
    config.validate()?;
    let eval_batch = config.distill.batch_size;

    info!(stage = %Stage::Distill, "Pipeline stage");
    let distiller = Distiller::new(teacher, config.distill.clone()).at(Stage::Distill)?;
    let (student, training) = distiller.distill(student, &data.train).at(Stage::Distill)?;

    info!(stage = %Stage::Evaluate, "Pipeline stage");
    let student_accuracy = evaluate(&student, &data.validation, eval_batch).at(Stage::Evaluate)?;
    info!(accuracy = %student_accuracy, "Distilled student");

    info!(stage = %Stage::Prune, "Pipeline stage");
    let frozen = student.freeze().at(Stage::Prune)?;
    drop(student);
    let pruner = MagnitudePruner::new(config.sparsity).at(Stage::Prune)?;
    let (pruned, pruning) = pruner.prune(frozen).at(Stage::Prune)?;
    let pruned_accuracy = evaluate(&pruned, &data.validation, eval_batch).at(Stage::Evaluate)?;
    info!(accuracy = %pruned_accuracy, "Pruned student");

    info!(stage = %Stage::Quantize, "Pipeline stage");
    let quantizer = Quantizer::new(config.quantize.clone()).at(Stage::Quantize)?;
    let calibration = data.validation.batches(eval_batch).at(Stage::Quantize)?;
    let quantized = quantizer.quantize(pruned, calibration).at(Stage::Quantize)?;
    let quantized_accuracy = evaluate(&quantized, &data.validation, eval_batch).at(Stage::Evaluate)?;
    info!(accuracy = %quantized_accuracy, "Quantized student");

    info!(stage = %Stage::Export, "Pipeline stage");
    let artifact = export(&quantized, &config.output).at(Stage::Export)?;
    drop(quantized);

    info!(stage = %Stage::Benchmark, "Pipeline stage");
    let deployed = DeployedModel::load(&artifact.path, data.validation.device()).at(Stage::Benchmark)?;
    let (h, w) = data.validation.image_size();
    let shape = (data.validation.channels(), h, w);
    let bench = benchmark(&deployed, &artifact.path, shape, &config.benchmark).at(Stage::Benchmark)?;

    let metrics = MetricsReport::new(quantized_accuracy.fraction(), bench.latency_ms, bench.size_mb);
    info!(%metrics, "Pipeline complete");

    Ok(PipelineReport {
        metrics,
        training,
        student_accuracy,
        pruned_accuracy,
        quantized_accuracy,
        pruning,
        artifact,
        benchmark: bench,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PipelineConfig {
        PipelineConfig {
            distill: DistillConfig::default(),
            sparsity: 0.4,
            quantize: QuantizeConfig::default(),
            benchmark: BenchmarkConfig::default(),
            output: PathBuf::from("student.safetensors"),
        }
    }

    #[test]
    fn validation_names_the_failing_stage() {
        let cfg = PipelineConfig { sparsity: 1.0, ..config() };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.stage, Stage::Prune);
        assert!(matches!(err.source, CoreError::InvalidSparsity { .. }));

        let cfg = PipelineConfig { distill: DistillConfig { alpha: 2.0, ..Default::default() }, ..config() };
        assert_eq!(cfg.validate().unwrap_err().stage, Stage::Distill);

        let cfg = PipelineConfig { benchmark: BenchmarkConfig { runs: 0, warmup: 5 }, ..config() };
        assert_eq!(cfg.validate().unwrap_err().stage, Stage::Benchmark);

        assert!(config().validate().is_ok());
    }

    #[test]
    fn error_message_includes_stage() {
        let err = PipelineError { stage: Stage::Quantize, source: CoreError::EmptyCalibrationSet };
        assert!(err.to_string().starts_with("quantize stage failed"));
    }

    #[test]
    fn metrics_display() {
        let m = MetricsReport::new(0.875, 1.5, 0.25);
        assert_eq!(m.accuracy_percent(), 87.5);
        assert!(m.to_string().contains("87.50%"));
    }
}
