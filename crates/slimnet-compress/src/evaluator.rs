//! Top-1 accuracy over a labeled partition.

use std::fmt;

use candle_core::{DType, D};
use serde::{Deserialize, Serialize};
use tracing::debug;

use slimnet_core::{device::ensure_same_device, Classifier, CoreError, CoreResult};

use crate::dataset::ImageDataset;

/// Correct predictions out of a total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accuracy {
    pub correct: usize,
    pub total: usize,
}

impl Accuracy {
    /// `correct / total` in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    pub fn percent(&self) -> f64 {
        self.fraction() * 100.0
    }
}

impl fmt::Display for Accuracy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4} ({:.2}%, {}/{})", self.fraction(), self.percent(), self.correct, self.total)
    }
}

/// Arg-max accuracy of `model` on `data`, evaluated in batches of `batch_size`.
///
/// Read-only: the model is only borrowed and no gradients are tracked.
pub fn evaluate<M: Classifier + ?Sized>(model: &M, data: &ImageDataset, batch_size: usize) -> CoreResult<Accuracy> {
    if data.is_empty() {
        return Err(CoreError::EmptyDataset("validation partition has no samples".to_string()));
    }
    ensure_same_device(model.device(), data.device())?;

    let mut correct = 0usize;
    let mut total = 0usize;
    for batch in data.batches(batch_size)? {
        let batch = batch?;
        let logits = model.logits(&batch.images)?;
        let (rows, classes) = logits.dims2()?;
        if rows != batch.len() || classes != model.num_classes() {
            return Err(CoreError::ModelShapeMismatch(format!(
                "model returned [{rows}, {classes}] logits for a batch of {}",
                batch.len()
            )));
        }
        let predicted = logits.argmax(D::Minus1)?;
        let hits = predicted.eq(&batch.labels)?.to_dtype(DType::U32)?.sum_all()?.to_scalar::<u32>()?;
        correct += hits as usize;
        total += batch.len();
    }

    let accuracy = Accuracy { correct, total };
    debug!(correct, total, fraction = accuracy.fraction(), "Evaluated");
    Ok(accuracy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    /// Predicts a fixed class for every input.
    struct Constant {
        class: usize,
        classes: usize,
        device: Device,
    }

    impl Classifier for Constant {
        fn logits(&self, images: &Tensor) -> CoreResult<Tensor> {
            let b = images.dim(0)?;
            let mut row = vec![0f32; self.classes];
            row[self.class] = 1.0;
            let rows: Vec<f32> = row.iter().copied().cycle().take(b * self.classes).collect();
            Ok(Tensor::from_vec(rows, (b, self.classes), &self.device)?)
        }

        fn num_classes(&self) -> usize {
            self.classes
        }

        fn device(&self) -> &Device {
            &self.device
        }
    }

    fn dataset(labels: &[u32]) -> ImageDataset {
        let n = labels.len();
        let images = Tensor::zeros((n, 1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        ImageDataset::new(images, Tensor::new(labels, &Device::Cpu).unwrap()).unwrap()
    }

    fn constant(class: usize) -> Constant {
        Constant { class, classes: 2, device: Device::Cpu }
    }

    #[test]
    fn all_correct_is_one() {
        let acc = evaluate(&constant(1), &dataset(&[1, 1, 1]), 2).unwrap();
        assert_eq!(acc, Accuracy { correct: 3, total: 3 });
        assert_eq!(acc.fraction(), 1.0);
    }

    #[test]
    fn none_correct_is_zero() {
        let acc = evaluate(&constant(0), &dataset(&[1, 1, 1, 1]), 3).unwrap();
        assert_eq!(acc.fraction(), 0.0);
    }

    #[test]
    fn partial_accuracy_and_percent() {
        let acc = evaluate(&constant(0), &dataset(&[0, 1, 0, 1]), 4).unwrap();
        assert_eq!(acc.fraction(), 0.5);
        assert_eq!(acc.percent(), 50.0);
    }

    #[test]
    fn repeated_evaluation_is_identical() {
        let data = dataset(&[0, 1, 1, 0, 1]);
        let a = evaluate(&constant(1), &data, 2).unwrap();
        let b = evaluate(&constant(1), &data, 2).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_dataset_is_rejected() {
        assert!(matches!(
            evaluate(&constant(0), &dataset(&[]), 2),
            Err(CoreError::EmptyDataset(_))
        ));
    }
}
