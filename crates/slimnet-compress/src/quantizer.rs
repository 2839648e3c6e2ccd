//! Post-training 8-bit quantization.
//!
//! Three steps, each its own type so they can only run in order:
//!
//! ```text
//! Sequential ──fuse──▶ FusedModel ──calibrate──▶ CalibratedModel ──convert──▶ QuantizedModel
//! ```
//!
//! * **fuse**: fold `Conv2d → BatchNorm2d [→ Relu]` (and `Conv2d → Relu`) into
//!   one convolution.
//! * **calibrate**: run representative batches through the fused float model
//!   and record the input range of every `Conv2d` and `Linear`.
//! * **convert**: per-output-channel `u8` weights, per-tensor `u8` activation
//!   parameters from the recorded ranges; biases stay f32.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use slimnet_core::{
    device::ensure_same_device, BatchNormLayer, Classifier, Conv2dLayer, CoreError, CoreResult, Layer, LayerKind, NamedLayer,
    QParams, QuantizedLayer, QuantizedModel, QuantizedOp, QuantizedWeight, Sequential,
};

use crate::dataset::Batch;
use crate::distiller::progress_bar;

// ── Configuration ─────────────────────────────────────────────────────────────

/// How activation ranges are accumulated over calibration batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserverMethod {
    /// Running minimum and maximum over every batch.
    #[default]
    MinMax,
    /// Mean of the per-batch minima and maxima.
    BatchAverage,
}

impl ObserverMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MinMax => "min_max",
            Self::BatchAverage => "batch_average",
        }
    }
}

impl FromStr for ObserverMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "min_max" | "minmax" => Ok(Self::MinMax),
            "batch_average" | "average" => Ok(Self::BatchAverage),
            other => Err(CoreError::hyperparameter(
                "observer",
                format!("unknown observer '{other}', valid values: min_max, batch_average"),
            )),
        }
    }
}

impl fmt::Display for ObserverMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which layer runs to fuse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionPlan {
    /// Fuse every `Conv2d → BatchNorm2d [→ Relu]` and `Conv2d → Relu` run found.
    #[default]
    Auto,
    /// Fuse exactly these runs of layer names, each starting with a `Conv2d`.
    Explicit(Vec<Vec<String>>),
}

/// Settings for the whole fuse → calibrate → convert pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizeConfig {
    pub observer: ObserverMethod,
    /// Upper bound on batches run during calibration; at least one is required.
    pub calibration_batches: usize,
    pub fusion: FusionPlan,
}

impl Default for QuantizeConfig {
    fn default() -> Self {
        Self { observer: ObserverMethod::MinMax, calibration_batches: 1, fusion: FusionPlan::Auto }
    }
}

impl QuantizeConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.calibration_batches == 0 {
            return Err(CoreError::hyperparameter("calibration_batches", "must be >= 1"));
        }
        Ok(())
    }
}

// ── Fuse ──────────────────────────────────────────────────────────────────────

/// A float model whose batch norms have been folded into convolutions.
#[derive(Debug, Clone)]
pub struct FusedModel {
    model: Sequential,
    fused: Vec<Vec<String>>,
}

impl FusedModel {
    pub fn fuse(model: Sequential, plan: &FusionPlan) -> CoreResult<Self> {
        let runs = match plan {
            FusionPlan::Auto => discover_runs(&model),
            FusionPlan::Explicit(patterns) => resolve_patterns(&model, patterns)?,
        };

        let starts: Vec<usize> = runs.iter().map(|r| r[0]).collect();
        let skipped: HashSet<usize> = runs.iter().flat_map(|r| r[1..].iter().copied()).collect();
        let fused_names: Vec<Vec<String>> = runs
            .iter()
            .map(|r| r.iter().map(|&i| model.layers()[i].name.clone()).collect())
            .collect();

        let device = model.device().clone();
        let layers = model.into_layers();
        let mut out = Vec::with_capacity(layers.len());
        let mut run_iter = runs.iter();
        for (i, named) in layers.iter().enumerate() {
            if skipped.contains(&i) {
                continue;
            }
            if starts.contains(&i) {
                let run = run_iter.next().ok_or_else(|| CoreError::FusionPatternMismatch {
                    pattern: named.name.clone(),
                    reason: "fusion runs out of order".to_string(),
                })?;
                out.push(fold_run(&layers, run)?);
            } else {
                out.push(named.clone());
            }
        }

        for run in &fused_names {
            debug!(pattern = %run.join(" → "), "Fused");
        }
        info!(runs = fused_names.len(), layers = out.len(), "Fusion done");

        Ok(Self { model: Sequential::new(out, device)?, fused: fused_names })
    }

    pub fn model(&self) -> &Sequential {
        &self.model
    }

    /// Names of each fused run, in model order.
    pub fn fused_runs(&self) -> &[Vec<String>] {
        &self.fused
    }

    /// Record activation ranges from up to `max_batches` of `batches`.
    pub fn calibrate<I>(self, batches: I, method: ObserverMethod, max_batches: usize) -> CoreResult<CalibratedModel>
    where
        I: IntoIterator<Item = CoreResult<Batch>>,
    {
        if max_batches == 0 {
            return Err(CoreError::hyperparameter("calibration_batches", "must be >= 1"));
        }
        let mut observers: Vec<Option<Observer>> = self
            .model
            .layers()
            .iter()
            .map(|l| matches!(l.layer.kind(), LayerKind::Conv2d | LayerKind::Linear).then(|| Observer::new(method)))
            .collect();

        let pb = progress_bar(max_batches as u64, "Calibrating");
        let mut seen = 0usize;
        for batch in batches.into_iter().take(max_batches) {
            let batch = batch?;
            if batch.is_empty() {
                return Err(CoreError::EmptyBatch);
            }
            ensure_same_device(batch.images.device(), self.model.device())?;

            let mut x = batch.images;
            for (named, observer) in self.model.layers().iter().zip(observers.iter_mut()) {
                if let Some(obs) = observer {
                    obs.observe(&x)?;
                }
                x = named.layer.forward(&x)?;
            }
            seen += 1;
            pb.inc(1);
        }
        pb.finish_with_message(format!("Calibrated on {seen} batch(es)"));

        if seen == 0 {
            return Err(CoreError::EmptyCalibrationSet);
        }

        let inputs = observers.into_iter().map(|o| o.map(|o| o.qparams())).collect::<Vec<_>>();
        for (named, qp) in self.model.layers().iter().zip(inputs.iter()) {
            if let Some(qp) = qp {
                debug!(layer = %named.name, scale = qp.scale, zero_point = qp.zero_point, "Activation range");
            }
        }
        info!(batches = seen, observer = %method, "Calibration done");
        Ok(CalibratedModel { model: self.model, inputs })
    }
}

/// Every `Conv2d → BatchNorm2d [→ Relu]` and `Conv2d → Relu` run, as layer indices.
fn discover_runs(model: &Sequential) -> Vec<Vec<usize>> {
    let kinds: Vec<LayerKind> = model.layers().iter().map(|l| l.layer.kind()).collect();
    let mut runs = Vec::new();
    let mut i = 0;
    while i < kinds.len() {
        let already_relu = matches!(&model.layers()[i].layer, Layer::Conv2d(c) if c.fused_relu);
        if kinds[i] != LayerKind::Conv2d {
            i += 1;
            continue;
        }
        let mut run = vec![i];
        let mut j = i + 1;
        if kinds.get(j) == Some(&LayerKind::BatchNorm2d) {
            run.push(j);
            j += 1;
        }
        if !already_relu && kinds.get(j) == Some(&LayerKind::Relu) {
            run.push(j);
            j += 1;
        }
        if run.len() > 1 {
            runs.push(run);
        }
        i = j.max(i + 1);
    }
    runs
}

/// Check named patterns against the model and turn them into index runs.
fn resolve_patterns(model: &Sequential, patterns: &[Vec<String>]) -> CoreResult<Vec<Vec<usize>>> {
    let mut claimed = HashSet::new();
    let mut runs = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        let mismatch = |reason: String| CoreError::FusionPatternMismatch { pattern: pattern.join(", "), reason };

        if pattern.len() < 2 {
            return Err(mismatch("a fusion pattern needs at least two layers".to_string()));
        }
        let mut run = Vec::with_capacity(pattern.len());
        for name in pattern {
            let idx = model.position(name).ok_or_else(|| mismatch(format!("no layer named '{name}'")))?;
            if !claimed.insert(idx) {
                return Err(mismatch(format!("layer '{name}' is already part of another pattern")));
            }
            if let Some(&prev) = run.last() {
                if idx != prev + 1 {
                    return Err(mismatch(format!("'{name}' does not directly follow the previous layer")));
                }
            }
            run.push(idx);
        }

        let kinds: Vec<LayerKind> = run.iter().map(|&i| model.layers()[i].layer.kind()).collect();
        let fusable = matches!(
            kinds.as_slice(),
            [LayerKind::Conv2d, LayerKind::BatchNorm2d]
                | [LayerKind::Conv2d, LayerKind::BatchNorm2d, LayerKind::Relu]
                | [LayerKind::Conv2d, LayerKind::Relu]
        );
        if !fusable {
            let found: Vec<&str> = kinds.iter().map(LayerKind::as_str).collect();
            return Err(mismatch(format!(
                "layer kinds [{}] are not conv2d, batch_norm2d, relu or conv2d, relu",
                found.join(", ")
            )));
        }
        if kinds.last() == Some(&LayerKind::Relu) {
            if let Layer::Conv2d(c) = &model.layers()[run[0]].layer {
                if c.fused_relu {
                    return Err(mismatch("convolution already has a fused relu".to_string()));
                }
            }
        }
        runs.push(run);
    }
    runs.sort_by_key(|r| r[0]);
    Ok(runs)
}

/// Collapse one run into a single convolution named after the run's first layer.
fn fold_run(layers: &[NamedLayer], run: &[usize]) -> CoreResult<NamedLayer> {
    let head = &layers[run[0]];
    let Layer::Conv2d(conv) = &head.layer else {
        return Err(CoreError::FusionPatternMismatch {
            pattern: head.name.clone(),
            reason: "fusion run must start with a convolution".to_string(),
        });
    };
    let mut fused = conv.clone();
    for &i in &run[1..] {
        match &layers[i].layer {
            Layer::BatchNorm2d(bn) => fused = fold_batch_norm(&fused, bn, &layers[i].name)?,
            Layer::Relu => fused.fused_relu = true,
            other => {
                return Err(CoreError::FusionPatternMismatch {
                    pattern: layers[i].name.clone(),
                    reason: format!("cannot fuse a {} layer", other.kind().as_str()),
                })
            }
        }
    }
    Ok(NamedLayer::new(head.name.clone(), Layer::Conv2d(fused)))
}

/// `w' = w·γ/√(σ²+ε)`, `b' = (b−μ)·γ/√(σ²+ε) + β`
fn fold_batch_norm(conv: &Conv2dLayer, bn: &BatchNormLayer, bn_name: &str) -> CoreResult<Conv2dLayer> {
    let out = conv.out_channels();
    let channels = bn.gamma.dim(0)?;
    if channels != out {
        return Err(CoreError::FusionPatternMismatch {
            pattern: bn_name.to_string(),
            reason: format!("batch norm has {channels} channels but the convolution outputs {out}"),
        });
    }
    let (scale, shift) = bn.affine_terms()?;
    let weight = conv.weight.broadcast_mul(&scale.reshape((out, 1, 1, 1))?)?;
    let bias = match &conv.bias {
        Some(b) => ((b * &scale)? + &shift)?,
        None => shift,
    };
    Ok(Conv2dLayer { weight, bias: Some(bias), ..conv.clone() })
}

// ── Calibrate ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Observer {
    method: ObserverMethod,
    min: f32,
    max: f32,
    sum_min: f64,
    sum_max: f64,
    batches: usize,
}

impl Observer {
    fn new(method: ObserverMethod) -> Self {
        Self { method, min: f32::INFINITY, max: f32::NEG_INFINITY, sum_min: 0.0, sum_max: 0.0, batches: 0 }
    }

    fn observe(&mut self, x: &Tensor) -> CoreResult<()> {
        let flat = x.to_dtype(DType::F32)?.flatten_all()?;
        let lo = flat.min(0)?.to_scalar::<f32>()?;
        let hi = flat.max(0)?.to_scalar::<f32>()?;
        self.min = self.min.min(lo);
        self.max = self.max.max(hi);
        self.sum_min += lo as f64;
        self.sum_max += hi as f64;
        self.batches += 1;
        Ok(())
    }

    fn range(&self) -> (f32, f32) {
        if self.batches == 0 {
            return (0.0, 0.0);
        }
        match self.method {
            ObserverMethod::MinMax => (self.min, self.max),
            ObserverMethod::BatchAverage => (
                (self.sum_min / self.batches as f64) as f32,
                (self.sum_max / self.batches as f64) as f32,
            ),
        }
    }

    fn qparams(&self) -> QParams {
        let (lo, hi) = self.range();
        QParams::from_range(lo, hi)
    }
}

/// A fused float model with activation parameters for every quantizable op.
#[derive(Debug, Clone)]
pub struct CalibratedModel {
    model: Sequential,
    inputs: Vec<Option<QParams>>,
}

impl CalibratedModel {
    pub fn model(&self) -> &Sequential {
        &self.model
    }

    /// Input activation parameters of the layer called `name`, if it is quantizable.
    pub fn input_qparams(&self, name: &str) -> Option<QParams> {
        self.model.position(name).and_then(|i| self.inputs[i])
    }

    /// Produce the 8-bit model. Float weights are dropped.
    pub fn convert(self) -> CoreResult<QuantizedModel> {
        let device = self.model.device().clone();
        let mut layers = Vec::with_capacity(self.inputs.len());
        for (named, input) in self.model.into_layers().into_iter().zip(self.inputs) {
            let NamedLayer { name, layer } = named;
            let missing = || CoreError::EmptyCalibrationSet;
            let q = match layer {
                Layer::Conv2d(c) => QuantizedLayer::Op {
                    op: QuantizedOp::Conv2d {
                        weight: QuantizedWeight::quantize_per_channel(&c.weight)?,
                        bias: c.bias,
                        stride: c.stride,
                        padding: c.padding,
                        relu: c.fused_relu,
                    },
                    input: input.ok_or_else(missing)?,
                },
                Layer::Linear(l) => QuantizedLayer::Op {
                    op: QuantizedOp::Linear { weight: QuantizedWeight::quantize_per_channel(&l.weight)?, bias: l.bias },
                    input: input.ok_or_else(missing)?,
                },
                Layer::Relu => QuantizedLayer::Relu,
                Layer::MaxPool2d { kernel } => QuantizedLayer::MaxPool2d { kernel },
                Layer::GlobalAvgPool => QuantizedLayer::GlobalAvgPool,
                Layer::BatchNorm2d(_) => {
                    return Err(CoreError::FusionPatternMismatch {
                        pattern: name,
                        reason: "batch norm left unfused; it has no quantized form".to_string(),
                    })
                }
            };
            layers.push((name, q));
        }
        let model = QuantizedModel::new(layers, device)?;
        info!(layers = model.layers().len(), "Converted to 8-bit");
        Ok(model)
    }
}

// ── Facade ────────────────────────────────────────────────────────────────────

/// Runs fuse, calibrate and convert with one configuration.
#[derive(Debug, Clone)]
pub struct Quantizer {
    config: QuantizeConfig,
}

impl Quantizer {
    pub fn new(config: QuantizeConfig) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &QuantizeConfig {
        &self.config
    }

    pub fn quantize<I>(&self, model: Sequential, calibration: I) -> CoreResult<QuantizedModel>
    where
        I: IntoIterator<Item = CoreResult<Batch>>,
    {
        FusedModel::fuse(model, &self.config.fusion)?
            .calibrate(calibration, self.config.observer, self.config.calibration_batches)?
            .convert()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    use crate::dataset::{DatasetSplits, SyntheticSpec};
    use crate::presets::ArchPreset;
    use crate::student::TrainableStudent;

    fn frozen() -> Sequential {
        TrainableStudent::new(&ArchPreset::Tiny.config(3, 2), &Device::Cpu).unwrap().freeze().unwrap()
    }

    fn splits() -> DatasetSplits {
        let spec = SyntheticSpec { train_samples: 4, validation_samples: 6, image_size: 8, ..Default::default() };
        DatasetSplits::synthetic(&spec, &Device::Cpu).unwrap()
    }

    fn names(p: &[&str]) -> Vec<String> {
        p.iter().map(|s| s.to_string()).collect()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b).unwrap().abs().unwrap().flatten_all().unwrap().max(0).unwrap().to_scalar::<f32>().unwrap()
    }

    #[test]
    fn auto_fusion_removes_batch_norm_and_relu() {
        let fused = FusedModel::fuse(frozen(), &FusionPlan::Auto).unwrap();
        let kinds: Vec<LayerKind> = fused.model().layers().iter().map(|l| l.layer.kind()).collect();
        assert!(!kinds.contains(&LayerKind::BatchNorm2d));
        assert!(!kinds.contains(&LayerKind::Relu));
        assert_eq!(fused.fused_runs().len(), 2);
        assert_eq!(fused.fused_runs()[0], names(&["features.0", "features.1", "features.2"]));
    }

    #[test]
    fn fusion_preserves_outputs() {
        let model = frozen();
        let x = splits().validation.images().clone();
        let before = model.forward(&x).unwrap();
        let fused = FusedModel::fuse(model, &FusionPlan::Auto).unwrap();
        let after = fused.model().forward(&x).unwrap();
        assert!(max_abs_diff(&before, &after) < 1e-4);
    }

    #[test]
    fn explicit_patterns_fuse_only_what_is_named() {
        let plan = FusionPlan::Explicit(vec![names(&["features.0", "features.1"])]);
        let fused = FusedModel::fuse(frozen(), &plan).unwrap();
        let kinds: Vec<LayerKind> = fused.model().layers().iter().map(|l| l.layer.kind()).collect();
        assert_eq!(kinds.iter().filter(|k| **k == LayerKind::BatchNorm2d).count(), 1);
    }

    #[test]
    fn mismatched_patterns_are_rejected() {
        let bad = [
            vec![names(&["features.0", "nope"])],
            vec![names(&["features.0", "features.2"])],
            vec![names(&["features.1", "features.2"])],
            vec![names(&["features.0"])],
            vec![names(&["features.0", "features.1"]), names(&["features.1", "features.2"])],
        ];
        for patterns in bad {
            let result = FusedModel::fuse(frozen(), &FusionPlan::Explicit(patterns.clone()));
            assert!(
                matches!(result, Err(CoreError::FusionPatternMismatch { .. })),
                "{patterns:?} should not fuse"
            );
        }
    }

    #[test]
    fn empty_calibration_set_is_rejected() {
        let fused = FusedModel::fuse(frozen(), &FusionPlan::Auto).unwrap();
        let none: Vec<CoreResult<Batch>> = Vec::new();
        assert!(matches!(
            fused.calibrate(none, ObserverMethod::MinMax, 1),
            Err(CoreError::EmptyCalibrationSet)
        ));
    }

    #[test]
    fn calibrated_ranges_include_zero() {
        let data = splits();
        let fused = FusedModel::fuse(frozen(), &FusionPlan::Auto).unwrap();
        let calibrated = fused.calibrate(data.validation.batches(3).unwrap(), ObserverMethod::BatchAverage, 2).unwrap();
        let qp = calibrated.input_qparams("features.0").unwrap();
        // Images are in [0, 1], so zero maps to the bottom of the range.
        assert_eq!(qp.zero_point, 0);
        assert!(calibrated.input_qparams("classifier").is_some());
        assert!(calibrated.input_qparams("pool").is_none());
    }

    #[test]
    fn unfused_batch_norm_fails_conversion() {
        let data = splits();
        let plan = FusionPlan::Explicit(vec![]);
        let calibrated = FusedModel::fuse(frozen(), &plan)
            .unwrap()
            .calibrate(data.validation.batches(6).unwrap(), ObserverMethod::MinMax, 1)
            .unwrap();
        assert!(matches!(calibrated.convert(), Err(CoreError::FusionPatternMismatch { .. })));
    }

    #[test]
    fn quantized_model_tracks_float_model() {
        let data = splits();
        let model = frozen();
        let x = data.validation.images().clone();
        let reference = model.forward(&x).unwrap();

        let quantizer = Quantizer::new(QuantizeConfig::default()).unwrap();
        let q = quantizer.quantize(model, data.validation.batches(6).unwrap()).unwrap();
        assert_eq!(q.num_classes(), 2);
        let out = q.logits(&x).unwrap();
        assert_eq!(out.dims(), reference.dims());
        assert!(max_abs_diff(&reference, &out) < 0.1);
    }

    #[test]
    fn observer_method_parse() {
        assert_eq!("min_max".parse::<ObserverMethod>().unwrap(), ObserverMethod::MinMax);
        assert_eq!("batch-average".parse::<ObserverMethod>().unwrap(), ObserverMethod::BatchAverage);
        assert!("histogram".parse::<ObserverMethod>().is_err());
    }

    #[test]
    fn zero_calibration_batches_is_rejected() {
        let cfg = QuantizeConfig { calibration_batches: 0, ..Default::default() };
        assert!(Quantizer::new(cfg).is_err());
    }
}
