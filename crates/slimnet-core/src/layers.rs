//! Plain-tensor layers of a deployed image classifier.
//!
//! Layers here hold detached tensors, never `Var`s: they are the frozen form
//! a trained network takes once it leaves the optimiser. Each layer carries a
//! unique name which doubles as the tensor-name prefix in artifacts
//! (`features.0.weight`, `classifier.bias`, ...).

use std::collections::HashMap;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

// ── Layer kinds ───────────────────────────────────────────────────────────────

/// Discriminant of a [`Layer`], used by fusion patterns and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Conv2d,
    BatchNorm2d,
    Relu,
    MaxPool2d,
    GlobalAvgPool,
    Linear,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conv2d => "conv2d",
            Self::BatchNorm2d => "batch_norm2d",
            Self::Relu => "relu",
            Self::MaxPool2d => "max_pool2d",
            Self::GlobalAvgPool => "global_avg_pool",
            Self::Linear => "linear",
        }
    }
}

/// 2-D convolution with square kernels.
///
/// `fused_relu` is set by the fusion pass when a trailing ReLU was folded in.
#[derive(Debug, Clone)]
pub struct Conv2dLayer {
    /// `[out_channels, in_channels, k, k]`
    pub weight: Tensor,
    /// `[out_channels]`
    pub bias: Option<Tensor>,
    pub stride: usize,
    pub padding: usize,
    pub fused_relu: bool,
}

impl Conv2dLayer {
    pub fn out_channels(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn forward(&self, x: &Tensor) -> CoreResult<Tensor> {
        let y = conv2d_forward(x, &self.weight, self.bias.as_ref(), self.stride, self.padding)?;
        if self.fused_relu {
            Ok(y.relu()?)
        } else {
            Ok(y)
        }
    }
}

/// Batch normalisation in inference form (running statistics only).
#[derive(Debug, Clone)]
pub struct BatchNormLayer {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub running_mean: Tensor,
    pub running_var: Tensor,
    pub eps: f64,
}

impl BatchNormLayer {
    /// Per-channel `(scale, shift)` such that `bn(x) = x * scale + shift`.
    pub fn affine_terms(&self) -> CoreResult<(Tensor, Tensor)> {
        let inv_std = self.running_var.affine(1.0, self.eps)?.sqrt()?.recip()?;
        let scale = (&self.gamma * &inv_std)?;
        let shift = (&self.beta - (&self.running_mean * &scale)?)?;
        Ok((scale, shift))
    }

    pub fn forward(&self, x: &Tensor) -> CoreResult<Tensor> {
        let (scale, shift) = self.affine_terms()?;
        let c = scale.dim(0)?;
        let y = x
            .broadcast_mul(&scale.reshape((1, c, 1, 1))?)?
            .broadcast_add(&shift.reshape((1, c, 1, 1))?)?;
        Ok(y)
    }
}

/// Fully-connected layer, `y = x Wᵀ + b`.
#[derive(Debug, Clone)]
pub struct LinearLayer {
    /// `[out_features, in_features]`
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl LinearLayer {
    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn forward(&self, x: &Tensor) -> CoreResult<Tensor> {
        linear_forward(x, &self.weight, self.bias.as_ref())
    }
}

/// One step of a [`crate::Sequential`] model.
#[derive(Debug, Clone)]
pub enum Layer {
    Conv2d(Conv2dLayer),
    BatchNorm2d(BatchNormLayer),
    Relu,
    MaxPool2d { kernel: usize },
    GlobalAvgPool,
    Linear(LinearLayer),
}

impl Layer {
    pub fn kind(&self) -> LayerKind {
        match self {
            Self::Conv2d(_) => LayerKind::Conv2d,
            Self::BatchNorm2d(_) => LayerKind::BatchNorm2d,
            Self::Relu => LayerKind::Relu,
            Self::MaxPool2d { .. } => LayerKind::MaxPool2d,
            Self::GlobalAvgPool => LayerKind::GlobalAvgPool,
            Self::Linear(_) => LayerKind::Linear,
        }
    }

    pub fn forward(&self, x: &Tensor) -> CoreResult<Tensor> {
        match self {
            Self::Conv2d(conv) => conv.forward(x),
            Self::BatchNorm2d(bn) => bn.forward(x),
            Self::Relu => Ok(x.relu()?),
            Self::MaxPool2d { kernel } => Ok(x.max_pool2d(*kernel)?),
            Self::GlobalAvgPool => global_avg_pool(x),
            Self::Linear(linear) => linear.forward(x),
        }
    }

    /// Number of scalar parameters (running statistics included).
    pub fn parameter_count(&self) -> usize {
        let bias = |b: &Option<Tensor>| b.as_ref().map(|t| t.elem_count()).unwrap_or(0);
        match self {
            Self::Conv2d(c) => c.weight.elem_count() + bias(&c.bias),
            Self::BatchNorm2d(bn) => 4 * bn.gamma.elem_count(),
            Self::Linear(l) => l.weight.elem_count() + bias(&l.bias),
            Self::Relu | Self::MaxPool2d { .. } | Self::GlobalAvgPool => 0,
        }
    }
}

/// A layer together with its unique name.
#[derive(Debug, Clone)]
pub struct NamedLayer {
    pub name: String,
    pub layer: Layer,
}

impl NamedLayer {
    pub fn new(name: impl Into<String>, layer: Layer) -> Self {
        Self { name: name.into(), layer }
    }

    /// Architecture descriptor stored in artifact metadata.
    pub fn spec(&self) -> LayerSpec {
        let name = self.name.clone();
        match &self.layer {
            Layer::Conv2d(c) => LayerSpec::Conv2d {
                name,
                stride: c.stride,
                padding: c.padding,
                bias: c.bias.is_some(),
                fused_relu: c.fused_relu,
            },
            Layer::BatchNorm2d(bn) => LayerSpec::BatchNorm2d { name, eps: bn.eps },
            Layer::Relu => LayerSpec::Relu { name },
            Layer::MaxPool2d { kernel } => LayerSpec::MaxPool2d { name, kernel: *kernel },
            Layer::GlobalAvgPool => LayerSpec::GlobalAvgPool { name },
            Layer::Linear(l) => LayerSpec::Linear { name, bias: l.bias.is_some() },
        }
    }

    /// Insert this layer's tensors into `out`, keyed `<name>.<param>`.
    pub fn collect_tensors(&self, out: &mut HashMap<String, Tensor>) {
        let key = |param: &str| format!("{}.{}", self.name, param);
        match &self.layer {
            Layer::Conv2d(Conv2dLayer { weight, bias, .. })
            | Layer::Linear(LinearLayer { weight, bias }) => {
                out.insert(key("weight"), weight.clone());
                if let Some(b) = bias {
                    out.insert(key("bias"), b.clone());
                }
            }
            Layer::BatchNorm2d(bn) => {
                out.insert(key("gamma"), bn.gamma.clone());
                out.insert(key("beta"), bn.beta.clone());
                out.insert(key("running_mean"), bn.running_mean.clone());
                out.insert(key("running_var"), bn.running_var.clone());
            }
            Layer::Relu | Layer::MaxPool2d { .. } | Layer::GlobalAvgPool => {}
        }
    }

    /// Rebuild a layer from its descriptor, removing its tensors from `tensors`.
    pub fn from_spec(spec: &LayerSpec, tensors: &mut HashMap<String, Tensor>) -> CoreResult<Self> {
        let name = spec.name();
        let layer = match spec {
            LayerSpec::Conv2d { stride, padding, bias, fused_relu, .. } => Layer::Conv2d(Conv2dLayer {
                weight: take_tensor(tensors, name, "weight")?,
                bias: if *bias { Some(take_tensor(tensors, name, "bias")?) } else { None },
                stride: *stride,
                padding: *padding,
                fused_relu: *fused_relu,
            }),
            LayerSpec::BatchNorm2d { eps, .. } => Layer::BatchNorm2d(BatchNormLayer {
                gamma: take_tensor(tensors, name, "gamma")?,
                beta: take_tensor(tensors, name, "beta")?,
                running_mean: take_tensor(tensors, name, "running_mean")?,
                running_var: take_tensor(tensors, name, "running_var")?,
                eps: *eps,
            }),
            LayerSpec::Relu { .. } => Layer::Relu,
            LayerSpec::MaxPool2d { kernel, .. } => Layer::MaxPool2d { kernel: *kernel },
            LayerSpec::GlobalAvgPool { .. } => Layer::GlobalAvgPool,
            LayerSpec::Linear { bias, .. } => Layer::Linear(LinearLayer {
                weight: take_tensor(tensors, name, "weight")?,
                bias: if *bias { Some(take_tensor(tensors, name, "bias")?) } else { None },
            }),
        };
        Ok(Self::new(name, layer))
    }

    /// Move every tensor of this layer to `device`.
    pub fn to_device(&self, device: &Device) -> CoreResult<Self> {
        let mv = |t: &Tensor| t.to_device(device);
        let mv_opt = |t: &Option<Tensor>| t.as_ref().map(|t| t.to_device(device)).transpose();
        let layer = match &self.layer {
            Layer::Conv2d(c) => Layer::Conv2d(Conv2dLayer {
                weight: mv(&c.weight)?,
                bias: mv_opt(&c.bias)?,
                ..c.clone()
            }),
            Layer::BatchNorm2d(bn) => Layer::BatchNorm2d(BatchNormLayer {
                gamma: mv(&bn.gamma)?,
                beta: mv(&bn.beta)?,
                running_mean: mv(&bn.running_mean)?,
                running_var: mv(&bn.running_var)?,
                eps: bn.eps,
            }),
            Layer::Linear(l) => Layer::Linear(LinearLayer { weight: mv(&l.weight)?, bias: mv_opt(&l.bias)? }),
            other => other.clone(),
        };
        Ok(Self::new(self.name.clone(), layer))
    }
}

// ── Serialized descriptor ─────────────────────────────────────────────────────

/// JSON description of one layer, stored in the artifact header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerSpec {
    Conv2d { name: String, stride: usize, padding: usize, bias: bool, fused_relu: bool },
    BatchNorm2d { name: String, eps: f64 },
    Relu { name: String },
    MaxPool2d { name: String, kernel: usize },
    GlobalAvgPool { name: String },
    Linear { name: String, bias: bool },
}

impl LayerSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::Conv2d { name, .. }
            | Self::BatchNorm2d { name, .. }
            | Self::Relu { name }
            | Self::MaxPool2d { name, .. }
            | Self::GlobalAvgPool { name }
            | Self::Linear { name, .. } => name,
        }
    }
}

// ── Kernels shared with the quantized model ──────────────────────────────────

pub(crate) fn conv2d_forward(
    x: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    stride: usize,
    padding: usize,
) -> CoreResult<Tensor> {
    let y = x.conv2d(weight, padding, stride, 1, 1)?;
    match bias {
        Some(b) => {
            let c = b.dim(0)?;
            Ok(y.broadcast_add(&b.reshape((1, c, 1, 1))?)?)
        }
        None => Ok(y),
    }
}

pub(crate) fn linear_forward(x: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> CoreResult<Tensor> {
    let y = x.matmul(&weight.t()?)?;
    match bias {
        Some(b) => Ok(y.broadcast_add(b)?),
        None => Ok(y),
    }
}

/// `[B, C, H, W]` → `[B, C]`
pub(crate) fn global_avg_pool(x: &Tensor) -> CoreResult<Tensor> {
    Ok(x.mean((2, 3))?)
}

pub(crate) fn take_tensor(
    tensors: &mut HashMap<String, Tensor>,
    layer: &str,
    param: &str,
) -> CoreResult<Tensor> {
    let key = format!("{layer}.{param}");
    tensors.remove(&key).ok_or_else(|| CoreError::SerializationFailure {
        path: key.clone(),
        reason: "tensor missing from artifact".to_string(),
    })
}
