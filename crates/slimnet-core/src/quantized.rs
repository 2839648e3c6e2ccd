//! 8-bit affine quantized inference.
//!
//! Weights are stored as `u8` with one `(scale, zero_point)` pair per output
//! channel; activations are fake-quantized per tensor at the input of every
//! quantized op using parameters derived during calibration. Kernels run in
//! f32 on the dequantized values, and the last op's output is returned in f32.
//!
//! ```text
//! q  = clamp(round(x / scale) + zero_point, 0, 255)
//! x̂ = (q - zero_point) * scale
//! ```

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    artifact::{read_artifact, write_artifact, ArtifactFormat},
    error::{CoreError, CoreResult},
    layers::{conv2d_forward, global_avg_pool, linear_forward, take_tensor},
    model::Classifier,
};

// ── Affine parameters ─────────────────────────────────────────────────────────

/// Per-tensor (or per-channel) affine quantization parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QParams {
    pub scale: f32,
    pub zero_point: u8,
}

impl QParams {
    pub const QMIN: f32 = 0.0;
    pub const QMAX: f32 = 255.0;

    /// Derive parameters covering `[min, max]`.
    ///
    /// The range is widened to include zero so that zero (and therefore every
    /// pruned weight) is exactly representable.
    pub fn from_range(min: f32, max: f32) -> Self {
        let min = min.min(0.0);
        let max = max.max(0.0);
        let span = max - min;
        if !span.is_finite() || span <= f32::EPSILON {
            return Self { scale: 1.0, zero_point: 0 };
        }
        let scale = span / (Self::QMAX - Self::QMIN);
        let zero_point = (Self::QMIN - min / scale).round().clamp(Self::QMIN, Self::QMAX) as u8;
        Self { scale, zero_point }
    }

    pub fn quantize(&self, x: f32) -> u8 {
        ((x / self.scale).round() + self.zero_point as f32).clamp(Self::QMIN, Self::QMAX) as u8
    }

    pub fn dequantize(&self, q: u8) -> f32 {
        (q as f32 - self.zero_point as f32) * self.scale
    }

    /// Quantize then dequantize every element of `x`.
    pub fn fake_quantize(&self, x: &Tensor) -> CoreResult<Tensor> {
        let scale = self.scale as f64;
        let zp = self.zero_point as f64;
        let q = x.affine(1.0 / scale, zp)?.round()?.clamp(Self::QMIN, Self::QMAX)?;
        Ok(q.affine(scale, -zp * scale)?)
    }
}

// ── Per-channel weights ───────────────────────────────────────────────────────

/// A weight tensor quantized per output channel (dimension 0).
#[derive(Debug, Clone)]
pub struct QuantizedWeight {
    /// `u8`, same shape as the float weight.
    values: Tensor,
    /// `f32 [out]`
    scales: Tensor,
    /// `u8 [out]`
    zero_points: Tensor,
}

impl QuantizedWeight {
    /// Quantize `weight` per output channel. The float tensor is not retained.
    pub fn quantize_per_channel(weight: &Tensor) -> CoreResult<Self> {
        let dims = weight.dims().to_vec();
        let device = weight.device();
        let rows = weight.flatten_from(1)?.to_dtype(DType::F32)?.to_vec2::<f32>()?;

        let mut values = Vec::with_capacity(weight.elem_count());
        let mut scales = Vec::with_capacity(rows.len());
        let mut zero_points = Vec::with_capacity(rows.len());
        for row in &rows {
            let (min, max) = row
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            let qp = QParams::from_range(min, max);
            values.extend(row.iter().map(|&v| qp.quantize(v)));
            scales.push(qp.scale);
            zero_points.push(qp.zero_point);
        }

        let out = rows.len();
        Ok(Self {
            values: Tensor::from_vec(values, dims, device)?,
            scales: Tensor::from_vec(scales, out, device)?,
            zero_points: Tensor::from_vec(zero_points, out, device)?,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.values.dims()[0]
    }

    /// Parameters of output channel `channel`.
    pub fn channel_qparams(&self, channel: usize) -> CoreResult<QParams> {
        Ok(QParams {
            scale: self.scales.get(channel)?.to_scalar::<f32>()?,
            zero_point: self.zero_points.get(channel)?.to_scalar::<u8>()?,
        })
    }

    /// Raw quantized values.
    pub fn values(&self) -> &Tensor {
        &self.values
    }

    /// Expand back to f32 for the kernel.
    pub fn dequantize(&self) -> CoreResult<Tensor> {
        let mut bshape = vec![1usize; self.values.rank()];
        bshape[0] = self.out_channels();
        let zp = self.zero_points.to_dtype(DType::F32)?.reshape(bshape.as_slice())?;
        let scale = self.scales.reshape(bshape.as_slice())?;
        Ok(self.values.to_dtype(DType::F32)?.broadcast_sub(&zp)?.broadcast_mul(&scale)?)
    }

    fn collect_tensors(&self, prefix: &str, out: &mut HashMap<String, Tensor>) {
        out.insert(format!("{prefix}.weight_q"), self.values.clone());
        out.insert(format!("{prefix}.weight_scale"), self.scales.clone());
        out.insert(format!("{prefix}.weight_zero_point"), self.zero_points.clone());
    }

    fn from_tensors(prefix: &str, tensors: &mut HashMap<String, Tensor>) -> CoreResult<Self> {
        Ok(Self {
            values: take_tensor(tensors, prefix, "weight_q")?,
            scales: take_tensor(tensors, prefix, "weight_scale")?,
            zero_points: take_tensor(tensors, prefix, "weight_zero_point")?,
        })
    }
}

// ── Layers ────────────────────────────────────────────────────────────────────

/// An op whose weights are stored in 8 bits.
#[derive(Debug, Clone)]
pub enum QuantizedOp {
    Conv2d {
        weight: QuantizedWeight,
        bias: Option<Tensor>,
        stride: usize,
        padding: usize,
        relu: bool,
    },
    Linear {
        weight: QuantizedWeight,
        bias: Option<Tensor>,
    },
}

impl QuantizedOp {
    fn weight(&self) -> &QuantizedWeight {
        match self {
            Self::Conv2d { weight, .. } | Self::Linear { weight, .. } => weight,
        }
    }

    fn bias(&self) -> Option<&Tensor> {
        match self {
            Self::Conv2d { bias, .. } | Self::Linear { bias, .. } => bias.as_ref(),
        }
    }
}

/// One step of a [`QuantizedModel`].
#[derive(Debug, Clone)]
pub enum QuantizedLayer {
    /// Quantized op with the calibrated parameters of its input activation.
    Op { op: QuantizedOp, input: QParams },
    Relu,
    MaxPool2d { kernel: usize },
    GlobalAvgPool,
}

impl QuantizedLayer {
    fn forward(&self, x: &Tensor) -> CoreResult<Tensor> {
        match self {
            Self::Op { op, input } => {
                let x = input.fake_quantize(x)?;
                let w = op.weight().dequantize()?;
                match op {
                    QuantizedOp::Conv2d { stride, padding, relu, .. } => {
                        let y = conv2d_forward(&x, &w, op.bias(), *stride, *padding)?;
                        if *relu {
                            Ok(y.relu()?)
                        } else {
                            Ok(y)
                        }
                    }
                    QuantizedOp::Linear { .. } => linear_forward(&x, &w, op.bias()),
                }
            }
            Self::Relu => Ok(x.relu()?),
            Self::MaxPool2d { kernel } => Ok(x.max_pool2d(*kernel)?),
            Self::GlobalAvgPool => global_avg_pool(x),
        }
    }

    fn spec(&self, name: &str) -> QuantizedLayerSpec {
        let name = name.to_string();
        match self {
            Self::Op { op: QuantizedOp::Conv2d { bias, stride, padding, relu, .. }, input } => {
                QuantizedLayerSpec::Conv2d {
                    name,
                    input: *input,
                    bias: bias.is_some(),
                    stride: *stride,
                    padding: *padding,
                    relu: *relu,
                }
            }
            Self::Op { op: QuantizedOp::Linear { bias, .. }, input } => {
                QuantizedLayerSpec::Linear { name, input: *input, bias: bias.is_some() }
            }
            Self::Relu => QuantizedLayerSpec::Relu { name },
            Self::MaxPool2d { kernel } => QuantizedLayerSpec::MaxPool2d { name, kernel: *kernel },
            Self::GlobalAvgPool => QuantizedLayerSpec::GlobalAvgPool { name },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum QuantizedLayerSpec {
    Conv2d { name: String, input: QParams, bias: bool, stride: usize, padding: usize, relu: bool },
    Linear { name: String, input: QParams, bias: bool },
    Relu { name: String },
    MaxPool2d { name: String, kernel: usize },
    GlobalAvgPool { name: String },
}

// ── Model ─────────────────────────────────────────────────────────────────────

/// Inference-only classifier with 8-bit weights and activations.
#[derive(Debug, Clone)]
pub struct QuantizedModel {
    layers: Vec<(String, QuantizedLayer)>,
    num_classes: usize,
    device: Device,
}

impl QuantizedModel {
    /// Assemble a model. The last layer must be a quantized linear head.
    pub fn new(layers: Vec<(String, QuantizedLayer)>, device: Device) -> CoreResult<Self> {
        let num_classes = match layers.last() {
            Some((_, QuantizedLayer::Op { op: QuantizedOp::Linear { weight, .. }, .. })) => weight.out_channels(),
            _ => {
                return Err(CoreError::ModelShapeMismatch(
                    "quantized model must end with a linear classifier head".to_string(),
                ))
            }
        };
        Ok(Self { layers, num_classes, device })
    }

    pub fn layers(&self) -> &[(String, QuantizedLayer)] {
        &self.layers
    }

    pub fn forward(&self, x: &Tensor) -> CoreResult<Tensor> {
        let mut x = x.clone();
        for (_, layer) in &self.layers {
            x = layer.forward(&x)?;
        }
        Ok(x)
    }

    pub fn save(&self, path: &Path) -> CoreResult<()> {
        let mut tensors = HashMap::new();
        let mut specs = Vec::with_capacity(self.layers.len());
        for (name, layer) in &self.layers {
            if let QuantizedLayer::Op { op, .. } = layer {
                op.weight().collect_tensors(name, &mut tensors);
                if let Some(b) = op.bias() {
                    tensors.insert(format!("{name}.bias"), b.clone());
                }
            }
            specs.push(layer.spec(name));
        }
        write_artifact(path, &tensors, ArtifactFormat::Quantized, serde_json::to_string(&specs)?)?;
        info!(path = %path.display(), layers = self.layers.len(), "Quantized model saved");
        Ok(())
    }

    pub fn load(path: &Path, device: &Device) -> CoreResult<Self> {
        let raw = read_artifact(path, device)?;
        if raw.format != ArtifactFormat::Quantized {
            return Err(CoreError::serialization(path, format!("expected a quantized artifact, found {}", raw.format)));
        }
        Self::from_parts(&raw.architecture, raw.tensors, device)
    }

    pub(crate) fn from_parts(
        architecture: &str,
        mut tensors: HashMap<String, Tensor>,
        device: &Device,
    ) -> CoreResult<Self> {
        let specs: Vec<QuantizedLayerSpec> = serde_json::from_str(architecture)?;
        let mut layers = Vec::with_capacity(specs.len());
        for spec in specs {
            let entry = match spec {
                QuantizedLayerSpec::Conv2d { name, input, bias, stride, padding, relu } => {
                    let op = QuantizedOp::Conv2d {
                        weight: QuantizedWeight::from_tensors(&name, &mut tensors)?,
                        bias: if bias { Some(take_tensor(&mut tensors, &name, "bias")?) } else { None },
                        stride,
                        padding,
                        relu,
                    };
                    (name, QuantizedLayer::Op { op, input })
                }
                QuantizedLayerSpec::Linear { name, input, bias } => {
                    let op = QuantizedOp::Linear {
                        weight: QuantizedWeight::from_tensors(&name, &mut tensors)?,
                        bias: if bias { Some(take_tensor(&mut tensors, &name, "bias")?) } else { None },
                    };
                    (name, QuantizedLayer::Op { op, input })
                }
                QuantizedLayerSpec::Relu { name } => (name, QuantizedLayer::Relu),
                QuantizedLayerSpec::MaxPool2d { name, kernel } => (name, QuantizedLayer::MaxPool2d { kernel }),
                QuantizedLayerSpec::GlobalAvgPool { name } => (name, QuantizedLayer::GlobalAvgPool),
            };
            layers.push(entry);
        }
        Self::new(layers, device.clone())
    }
}

impl Classifier for QuantizedModel {
    fn logits(&self, images: &Tensor) -> CoreResult<Tensor> {
        self.forward(images)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
