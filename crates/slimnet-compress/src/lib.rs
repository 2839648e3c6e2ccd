//! # slimnet-compress
//!
//! Compresses a large image classifier into a small deployable one:
//!
//! 1. **Distill**: a trainable student is fitted to a blend of ground-truth
//!    labels and the frozen teacher's temperature-softened outputs.
//! 2. **Prune**: the smallest-magnitude convolution weights across the whole
//!    network are zeroed.
//! 3. **Quantize**: batch norms are folded into convolutions, activation
//!    ranges are calibrated, and weights and activations move to 8 bits.
//! 4. **Measure**: top-1 accuracy, single-sample latency and artifact size.
//!
//! ## Usage
//!
//! ```text
//! slimnet train-teacher --synthetic --output teacher.safetensors
//! slimnet compress \
//!   --teacher     teacher.safetensors \
//!   --synthetic \
//!   --student     tiny \
//!   --temperature 4.0 --alpha 0.7 --epochs 3 \
//!   --sparsity    0.4 \
//!   --output      student.int8.safetensors
//! ```

pub mod benchmark;
pub mod dataset;
pub mod distiller;
pub mod evaluator;
pub mod export;
pub mod integrity;
pub mod pipeline;
pub mod presets;
pub mod pruner;
pub mod quantizer;
pub mod student;
pub mod teacher;

pub use benchmark::{BenchmarkConfig, BenchmarkResult};
pub use dataset::{Batch, DatasetSplits, ImageDataset, SyntheticSpec};
pub use distiller::{DistillConfig, Distiller, TrainingStats};
pub use evaluator::{evaluate, Accuracy};
pub use export::{export, ExportReport};
pub use pipeline::{run_pipeline, MetricsReport, PipelineConfig, PipelineError, PipelineReport, Stage};
pub use presets::{ArchPreset, ConvNetConfig};
pub use pruner::{MagnitudePruner, PruneReport};
pub use quantizer::{FusionPlan, ObserverMethod, QuantizeConfig, Quantizer};
pub use student::TrainableStudent;
pub use teacher::{pretrain_teacher, Teacher};
