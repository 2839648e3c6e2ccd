//! Latency and size measurement of a deployed model.
//!
//! Latency is wall-clock time of single-sample forward passes on a constant
//! input, averaged over the timed runs. Warm-up runs happen first and are not
//! timed. The number is an estimate: repeated benchmarks of the same model
//! differ within measurement noise.

use std::path::Path;
use std::time::{Duration, Instant};

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use slimnet_core::{Classifier, CoreError, CoreResult};

const INPUT_FILL: f32 = 0.5;
const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    /// Timed forward passes. Must be >= 1.
    pub runs: usize,
    /// Untimed passes before timing starts.
    pub warmup: usize,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self { runs: 50, warmup: 5 }
    }
}

impl BenchmarkConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.runs == 0 {
            return Err(CoreError::hyperparameter("runs", "must be >= 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    /// Mean single-sample latency in milliseconds.
    pub latency_ms: f64,
    /// Artifact size in MiB.
    pub size_mb: f64,
    pub size_bytes: u64,
    pub runs: usize,
    pub warmup: usize,
}

/// Mean latency in milliseconds of `model` on a `[1, C, H, W]` input filled with 0.5.
pub fn measure_latency<M: Classifier + ?Sized>(
    model: &M,
    image_shape: (usize, usize, usize),
    config: &BenchmarkConfig,
) -> CoreResult<f64> {
    config.validate()?;
    let (c, h, w) = image_shape;
    let input = Tensor::full(INPUT_FILL, (1, c, h, w), model.device())?;

    for _ in 0..config.warmup {
        run_once(model, &input)?;
    }

    let mut total = Duration::ZERO;
    for _ in 0..config.runs {
        let start = Instant::now();
        run_once(model, &input)?;
        total += start.elapsed();
    }

    // Clock resolution can round a very fast pass down to zero.
    let mean_ms = (total.as_secs_f64() * 1000.0 / config.runs as f64).max(f64::MIN_POSITIVE);
    debug!(runs = config.runs, warmup = config.warmup, mean_ms, "Latency measured");
    Ok(mean_ms)
}

/// Forward once and copy the logits to the host so asynchronous devices finish.
fn run_once<M: Classifier + ?Sized>(model: &M, input: &Tensor) -> CoreResult<()> {
    let logits = model.logits(input)?;
    let _ = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(())
}

/// Size of the artifact on disk in bytes. Missing or empty files are an error.
pub fn artifact_size(path: &Path) -> CoreResult<u64> {
    let meta = std::fs::metadata(path).map_err(|e| CoreError::serialization(path, e))?;
    if meta.len() == 0 {
        return Err(CoreError::serialization(path, "artifact is empty"));
    }
    Ok(meta.len())
}

pub fn bytes_to_mib(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MIB
}

/// Measure latency of `model` and size of the artifact it was saved to.
pub fn benchmark<M: Classifier + ?Sized>(
    model: &M,
    artifact: &Path,
    image_shape: (usize, usize, usize),
    config: &BenchmarkConfig,
) -> CoreResult<BenchmarkResult> {
    let size_bytes = artifact_size(artifact)?;
    let latency_ms = measure_latency(model, image_shape, config)?;
    let result = BenchmarkResult {
        latency_ms,
        size_mb: bytes_to_mib(size_bytes),
        size_bytes,
        runs: config.runs,
        warmup: config.warmup,
    };
    info!(
        artifact = %artifact.display(),
        latency_ms = result.latency_ms,
        size_mb = result.size_mb,
        "Benchmark complete"
    );
    Ok(result)
}
