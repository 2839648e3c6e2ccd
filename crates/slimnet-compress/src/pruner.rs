//! Global magnitude pruning.
//!
//! All convolution weights in the model are pooled into a single ranking by
//! absolute value and the smallest `floor(p · N)` of them are set to zero.
//! Ties keep their storage order (layer order, then row-major index), so
//! existing zeros are always among the first to go. Biases, batch norm and
//! linear layers are left alone. No mask is kept: pruning is a one-way edit of
//! the weights.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use slimnet_core::{CoreError, CoreResult, Layer, Sequential};

/// Zero count of one pruned layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSparsity {
    pub name: String,
    pub zeros: usize,
    pub count: usize,
}

impl LayerSparsity {
    pub fn fraction(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.zeros as f64 / self.count as f64
        }
    }
}

/// What a pruning pass did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneReport {
    /// Number of convolution weights considered.
    pub total: usize,
    /// `floor(p · total)` weights set to zero.
    pub pruned: usize,
    /// Largest magnitude among the pruned weights (0 when nothing was pruned).
    pub threshold: f32,
    /// Zeros per convolution layer after pruning.
    pub per_layer: Vec<LayerSparsity>,
}

impl PruneReport {
    /// Fraction of convolution weights that are zero after pruning.
    pub fn global_sparsity(&self) -> f64 {
        let zeros: usize = self.per_layer.iter().map(|l| l.zeros).sum();
        if self.total == 0 {
            0.0
        } else {
            zeros as f64 / self.total as f64
        }
    }
}

/// Global L1 (magnitude) pruner over convolution weights.
#[derive(Debug, Clone, Copy)]
pub struct MagnitudePruner {
    sparsity: f64,
}

impl MagnitudePruner {
    /// `sparsity` must lie in `[0, 1)`.
    pub fn new(sparsity: f64) -> CoreResult<Self> {
        if !(0.0..1.0).contains(&sparsity) {
            return Err(CoreError::InvalidSparsity { sparsity, reason: "must be in [0, 1)".to_string() });
        }
        Ok(Self { sparsity })
    }

    pub fn sparsity(&self) -> f64 {
        self.sparsity
    }

    pub fn prune(&self, mut model: Sequential) -> CoreResult<(Sequential, PruneReport)> {
        // Flatten every conv weight, remembering which layer each run of values came from.
        let mut owners: Vec<(usize, Vec<usize>)> = Vec::new();
        let mut values: Vec<f32> = Vec::new();
        for (idx, named) in model.layers().iter().enumerate() {
            if let Layer::Conv2d(conv) = &named.layer {
                let flat = conv.weight.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
                owners.push((idx, conv.weight.dims().to_vec()));
                values.extend(flat);
            }
        }
        if owners.is_empty() {
            return Err(CoreError::InvalidSparsity {
                sparsity: self.sparsity,
                reason: "model has no convolution layers to prune".to_string(),
            });
        }

        let total = values.len();
        let k = (self.sparsity * total as f64).floor() as usize;

        let mut order: Vec<usize> = (0..total).collect();
        order.sort_by(|&a, &b| values[a].abs().total_cmp(&values[b].abs()));
        let threshold = if k == 0 { 0.0 } else { values[order[k - 1]].abs() };
        for &i in &order[..k] {
            values[i] = 0.0;
        }

        let mut per_layer = Vec::with_capacity(owners.len());
        let mut offset = 0;
        for (idx, dims) in owners {
            let count: usize = dims.iter().product();
            let chunk = values[offset..offset + count].to_vec();
            offset += count;
            let zeros = chunk.iter().filter(|v| **v == 0.0).count();

            let named = &mut model.layers_mut()[idx];
            if let Layer::Conv2d(conv) = &mut named.layer {
                let (device, dtype) = (conv.weight.device().clone(), conv.weight.dtype());
                conv.weight = Tensor::from_vec(chunk, dims, &device)?.to_dtype(dtype)?;
            }
            debug!(layer = %named.name, zeros, count, "Layer pruned");
            per_layer.push(LayerSparsity { name: named.name.clone(), zeros, count });
        }

        let report = PruneReport { total, pruned: k, threshold, per_layer };
        info!(
            sparsity = self.sparsity,
            total,
            pruned = k,
            threshold,
            global = report.global_sparsity(),
            "Global magnitude pruning done"
        );
        Ok((model, report))
    }
}
