//! Knowledge-distillation trainer.
//!
//! For every batch the frozen teacher produces soft targets and the student is
//! updated with one AdamW step on the blended loss
//!
//! ```text
//! loss = α · T² · KL(softmax(t / T) ‖ softmax(s / T))  +  (1 − α) · CE(s, y)
//! ```
//!
//! where `t` and `s` are teacher and student logits, `T` the temperature and
//! `y` the ground-truth labels. Both terms are batch means. Batches are visited
//! in dataset order and student state carries over between epochs.

use std::time::Instant;

use candle_core::{Tensor, D};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use slimnet_core::{device::ensure_same_device, Classifier, CoreError, CoreResult};

use crate::dataset::{Batch, ImageDataset};
use crate::student::TrainableStudent;
use crate::teacher::Teacher;

// ── Config ────────────────────────────────────────────────────────────────────

/// Hyper-parameters for a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistillConfig {
    /// Softening temperature applied to both logit sets. Must be > 0.
    pub temperature: f64,
    /// Weight of the soft (teacher) term, in `[0, 1]`.
    pub alpha: f64,
    /// Number of full passes over the training partition.
    pub epochs: usize,
    /// Number of images per batch.
    pub batch_size: usize,
    /// AdamW learning rate.
    pub learning_rate: f64,
    /// AdamW decoupled weight decay.
    pub weight_decay: f64,
}

impl Default for DistillConfig {
    fn default() -> Self {
        Self {
            temperature: 4.0,
            alpha: 0.7,
            epochs: 3,
            batch_size: 32,
            learning_rate: 1e-3,
            weight_decay: 0.01,
        }
    }
}

impl DistillConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return Err(CoreError::hyperparameter("temperature", format!("must be > 0, got {}", self.temperature)));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(CoreError::hyperparameter("alpha", format!("must be in [0, 1], got {}", self.alpha)));
        }
        if self.epochs == 0 {
            return Err(CoreError::hyperparameter("epochs", "must be >= 1"));
        }
        if self.batch_size == 0 {
            return Err(CoreError::hyperparameter("batch_size", "must be > 0"));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(CoreError::hyperparameter("learning_rate", format!("must be > 0, got {}", self.learning_rate)));
        }
        if self.weight_decay < 0.0 {
            return Err(CoreError::hyperparameter("weight_decay", "must be >= 0"));
        }
        Ok(())
    }
}

// ── Training statistics ───────────────────────────────────────────────────────

/// Summary returned after training completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingStats {
    /// Mean loss of each epoch, in order.
    pub epoch_losses: Vec<f32>,
    pub total_steps: usize,
    pub elapsed_secs: f64,
    pub samples_per_sec: f64,
}

impl TrainingStats {
    pub fn final_loss(&self) -> Option<f32> {
        self.epoch_losses.last().copied()
    }
}

// ── Loss ──────────────────────────────────────────────────────────────────────

/// Blended distillation loss for one batch, as a scalar tensor ready for
/// `backward()`.
///
/// `teacher_logits` is detached before use. The KL term is clamped at zero to
/// absorb float round-off.
pub fn distillation_loss(
    student_logits: &Tensor,
    teacher_logits: &Tensor,
    labels: &Tensor,
    temperature: f64,
    alpha: f64,
) -> CoreResult<Tensor> {
    let (batch, classes) = student_logits.dims2()?;
    let (t_batch, t_classes) = teacher_logits.dims2()?;
    if batch == 0 {
        return Err(CoreError::EmptyBatch);
    }
    if (t_batch, t_classes) != (batch, classes) {
        return Err(CoreError::ModelShapeMismatch(format!(
            "student logits are [{batch}, {classes}] but teacher logits are [{t_batch}, {t_classes}]"
        )));
    }
    let n_labels = labels.dims1()?;
    if n_labels != batch {
        return Err(CoreError::ModelShapeMismatch(format!("{n_labels} labels for a batch of {batch}")));
    }
    ensure_same_device(student_logits.device(), teacher_logits.device())?;
    ensure_same_device(student_logits.device(), labels.device())?;

    let inv_t = 1.0 / temperature;
    let log_p_student = candle_nn::ops::log_softmax(&student_logits.affine(inv_t, 0.0)?, D::Minus1)?;
    let log_p_teacher = candle_nn::ops::log_softmax(&teacher_logits.detach().affine(inv_t, 0.0)?, D::Minus1)?;
    let p_teacher = log_p_teacher.exp()?;

    // KL(p_t ‖ p_s) = Σ p_t · (log p_t − log p_s), summed over classes, mean over batch.
    let kl = (p_teacher * (log_p_teacher - log_p_student)?)?.sum(D::Minus1)?.mean_all()?;
    // relu maps NaN to 0, so non-finite logits must be caught before clamping round-off.
    let kl_value = kl.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?;
    if !kl_value.is_finite() {
        return Err(CoreError::NonFiniteLoss(kl_value));
    }
    let kl = kl.relu()?;
    let soft = kl.affine(alpha * temperature * temperature, 0.0)?;
    let hard = candle_nn::loss::cross_entropy(student_logits, labels)?.affine(1.0 - alpha, 0.0)?;
    Ok((soft + hard)?)
}

/// Plain cross-entropy, used for supervised pre-training.
pub fn hard_loss(student_logits: &Tensor, labels: &Tensor) -> CoreResult<Tensor> {
    Ok(candle_nn::loss::cross_entropy(student_logits, labels)?)
}

/// Read a scalar loss back, failing if it is NaN or infinite.
pub fn finite_loss(loss: &Tensor) -> CoreResult<f32> {
    let value = loss.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CoreError::NonFiniteLoss(value))
    }
}

// ── Distiller ─────────────────────────────────────────────────────────────────

/// Trains a student against a frozen teacher.
pub struct Distiller<'t> {
    teacher: &'t Teacher,
    config: DistillConfig,
}

impl<'t> Distiller<'t> {
    pub fn new(teacher: &'t Teacher, config: DistillConfig) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self { teacher, config })
    }

    pub fn config(&self) -> &DistillConfig {
        &self.config
    }

    /// Run all epochs over `data`, consuming the student and handing back the
    /// trained one.
    pub fn distill(
        &self,
        student: TrainableStudent,
        data: &ImageDataset,
    ) -> CoreResult<(TrainableStudent, TrainingStats)> {
        if self.teacher.num_classes() != student.num_classes() {
            return Err(CoreError::ModelShapeMismatch(format!(
                "teacher predicts {} classes but student predicts {}",
                self.teacher.num_classes(),
                student.num_classes()
            )));
        }
        ensure_same_device(self.teacher.device(), student.device())?;

        info!(
            samples = data.len(),
            epochs = self.config.epochs,
            batch_size = self.config.batch_size,
            lr = self.config.learning_rate,
            temperature = self.config.temperature,
            alpha = self.config.alpha,
            "Distilling student"
        );

        let (t, a) = (self.config.temperature, self.config.alpha);
        run_epochs(student, data, &self.config, "Distillation", |student, batch| {
            let teacher_logits = self.teacher.logits(&batch.images)?;
            let student_logits = student.forward_t(&batch.images, true)?;
            distillation_loss(&student_logits, &teacher_logits, &batch.labels, t, a)
        })
    }
}

/// Train on hard labels only.
pub fn train_supervised(
    net: TrainableStudent,
    data: &ImageDataset,
    config: &DistillConfig,
) -> CoreResult<(TrainableStudent, TrainingStats)> {
    config.validate()?;
    run_epochs(net, data, config, "Supervised training", |net, batch| {
        hard_loss(&net.forward_t(&batch.images, true)?, &batch.labels)
    })
}

/// Shared epoch loop: one AdamW step per batch on whatever `loss_fn` returns.
fn run_epochs<F>(
    student: TrainableStudent,
    data: &ImageDataset,
    config: &DistillConfig,
    label: &str,
    mut loss_fn: F,
) -> CoreResult<(TrainableStudent, TrainingStats)>
where
    F: FnMut(&TrainableStudent, &Batch) -> CoreResult<Tensor>,
{
    if data.is_empty() {
        return Err(CoreError::EmptyDataset("training partition has no samples".to_string()));
    }
    ensure_same_device(data.device(), student.device())?;
    let classes = data.num_classes()?;
    if classes > student.num_classes() {
        return Err(CoreError::ModelShapeMismatch(format!(
            "labels reach class {} but the model predicts {} classes",
            classes - 1,
            student.num_classes()
        )));
    }

    let params = ParamsAdamW {
        lr: config.learning_rate,
        weight_decay: config.weight_decay,
        ..Default::default()
    };
    let mut optimizer = AdamW::new(student.trainable_vars(), params)?;

    let batches_per_epoch = data.len().div_ceil(config.batch_size);
    let pb = progress_bar((batches_per_epoch * config.epochs) as u64, label);

    let start = Instant::now();
    let mut step = 0usize;
    let mut epoch_losses = Vec::with_capacity(config.epochs);

    for epoch in 0..config.epochs {
        let mut loss_sum = 0.0f64;
        let mut batches = 0usize;
        for batch in data.batches(config.batch_size)? {
            let batch = batch?;
            batch.validate(student.device())?;

            let loss = loss_fn(&student, &batch)?;
            let value = finite_loss(&loss)?;
            optimizer.backward_step(&loss)?;

            loss_sum += value as f64;
            batches += 1;
            step += 1;
            debug!(epoch = epoch + 1, step, loss = value, "Step");
            pb.set_message(format!("epoch {}/{} loss {value:.4}", epoch + 1, config.epochs));
            pb.inc(1);
        }

        let mean = (loss_sum / batches.max(1) as f64) as f32;
        epoch_losses.push(mean);
        info!(epoch = epoch + 1, loss = mean, "Epoch complete");
    }

    let elapsed = start.elapsed().as_secs_f64();
    let mean_last = epoch_losses.last().copied().unwrap_or(f32::NAN);
    pb.finish_with_message(format!("{label} complete, final loss {mean_last:.4}"));

    let samples = (data.len() * config.epochs) as f64;
    let stats = TrainingStats {
        epoch_losses,
        total_steps: step,
        elapsed_secs: elapsed,
        samples_per_sec: if elapsed > 0.0 { samples / elapsed } else { 0.0 },
    };
    Ok((student, stats))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

pub(crate) fn progress_bar(total: u64, label: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░");
    pb.set_style(style);
    pb.set_message(label.to_string());
    pb
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetSplits, SyntheticSpec};
    use crate::presets::ArchPreset;
    use candle_core::{DType, Device};

    fn logits(rows: &[[f32; 3]]) -> Tensor {
        Tensor::from_vec(rows.concat(), (rows.len(), 3), &Device::Cpu).unwrap()
    }

    fn labels(v: &[u32]) -> Tensor {
        Tensor::new(v, &Device::Cpu).unwrap()
    }

    #[test]
    fn loss_is_finite_and_non_negative() {
        let s = logits(&[[2.0, -1.0, 0.5], [0.0, 0.0, 0.0], [-3.0, 4.0, 1.0]]);
        let t = logits(&[[1.0, 0.0, -1.0], [5.0, -5.0, 0.0], [0.2, 0.1, 0.3]]);
        let y = labels(&[0, 1, 2]);
        for &(temp, alpha) in &[(1.0, 0.0), (4.0, 0.7), (10.0, 1.0), (0.5, 0.5)] {
            let loss = distillation_loss(&s, &t, &y, temp, alpha).unwrap();
            let v = finite_loss(&loss).unwrap();
            assert!(v >= 0.0, "T={temp} alpha={alpha} loss={v}");
        }
    }

    #[test]
    fn soft_term_vanishes_when_student_matches_teacher() {
        let s = logits(&[[2.0, -1.0, 0.5], [0.3, 0.1, -0.2]]);
        let y = labels(&[0, 1]);
        let v = finite_loss(&distillation_loss(&s, &s, &y, 4.0, 1.0).unwrap()).unwrap();
        assert!(v.abs() < 1e-5, "{v}");
    }

    #[test]
    fn alpha_zero_equals_cross_entropy() {
        let s = logits(&[[2.0, -1.0, 0.5], [0.3, 0.1, -0.2]]);
        let t = logits(&[[0.0, 1.0, 0.0], [1.0, 0.0, 0.0]]);
        let y = labels(&[2, 0]);
        let a = finite_loss(&distillation_loss(&s, &t, &y, 4.0, 0.0).unwrap()).unwrap();
        let b = finite_loss(&hard_loss(&s, &y).unwrap()).unwrap();
        assert!((a - b).abs() < 1e-6);
    }

    #[test]
    fn class_count_mismatch_is_rejected() {
        let s = logits(&[[1.0, 2.0, 3.0]]);
        let t = Tensor::zeros((1, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            distillation_loss(&s, &t, &labels(&[0]), 4.0, 0.5),
            Err(CoreError::ModelShapeMismatch(_))
        ));
    }

    #[test]
    fn label_count_mismatch_is_rejected() {
        let s = logits(&[[1.0, 2.0, 3.0]]);
        assert!(matches!(
            distillation_loss(&s, &s, &labels(&[0, 1]), 4.0, 0.5),
            Err(CoreError::ModelShapeMismatch(_))
        ));
    }

    #[test]
    fn nan_loss_is_reported() {
        let nan = Tensor::new(f32::NAN, &Device::Cpu).unwrap();
        assert!(matches!(finite_loss(&nan), Err(CoreError::NonFiniteLoss(_))));
    }

    #[test]
    fn nan_teacher_logits_are_not_clamped_away() {
        let s = logits(&[[2.0, -1.0, 0.5], [0.3, 0.1, -0.2]]);
        let t = logits(&[[f32::NAN, 0.0, 1.0], [f32::NAN, f32::NAN, f32::NAN]]);
        let y = labels(&[0, 1]);
        let err = distillation_loss(&s, &t, &y, 4.0, 0.7).unwrap_err();
        assert!(matches!(err, CoreError::NonFiniteLoss(_)), "{err}");
    }

    #[test]
    fn infinite_teacher_logits_are_reported() {
        let s = logits(&[[2.0, -1.0, 0.5]]);
        let t = logits(&[[f32::INFINITY, 0.0, f32::NEG_INFINITY]]);
        let err = distillation_loss(&s, &t, &labels(&[0]), 4.0, 0.7).unwrap_err();
        assert!(matches!(err, CoreError::NonFiniteLoss(_)), "{err}");
    }

    #[test]
    fn invalid_hyperparameters_are_rejected() {
        let bad = [
            DistillConfig { temperature: 0.0, ..Default::default() },
            DistillConfig { temperature: -1.0, ..Default::default() },
            DistillConfig { alpha: 1.5, ..Default::default() },
            DistillConfig { alpha: -0.1, ..Default::default() },
            DistillConfig { epochs: 0, ..Default::default() },
            DistillConfig { batch_size: 0, ..Default::default() },
            DistillConfig { learning_rate: 0.0, ..Default::default() },
        ];
        for cfg in bad {
            assert!(matches!(cfg.validate(), Err(CoreError::InvalidHyperparameter { .. })), "{cfg:?}");
        }
        assert!(DistillConfig::default().validate().is_ok());
    }

    #[test]
    fn distill_runs_every_epoch() {
        let spec = SyntheticSpec { train_samples: 12, validation_samples: 2, image_size: 8, ..Default::default() };
        let splits = DatasetSplits::synthetic(&spec, &Device::Cpu).unwrap();
        let teacher_net = TrainableStudent::new(&ArchPreset::Small.config(3, 2), &Device::Cpu).unwrap();
        let teacher = Teacher::new(teacher_net.freeze().unwrap());
        let student = TrainableStudent::new(&ArchPreset::Tiny.config(3, 2), &Device::Cpu).unwrap();

        let config = DistillConfig { epochs: 2, batch_size: 5, ..Default::default() };
        let distiller = Distiller::new(&teacher, config).unwrap();
        let (_, stats) = distiller.distill(student, &splits.train).unwrap();

        assert_eq!(stats.epoch_losses.len(), 2);
        assert_eq!(stats.total_steps, 6);
        assert!(stats.epoch_losses.iter().all(|l| l.is_finite() && *l >= 0.0));
    }

    #[test]
    fn distill_rejects_mismatched_heads() {
        let spec = SyntheticSpec { train_samples: 4, validation_samples: 2, image_size: 8, ..Default::default() };
        let splits = DatasetSplits::synthetic(&spec, &Device::Cpu).unwrap();
        let teacher_net = TrainableStudent::new(&ArchPreset::Tiny.config(3, 3), &Device::Cpu).unwrap();
        let teacher = Teacher::new(teacher_net.freeze().unwrap());
        let student = TrainableStudent::new(&ArchPreset::Tiny.config(3, 2), &Device::Cpu).unwrap();
        let distiller = Distiller::new(&teacher, DistillConfig::default()).unwrap();
        assert!(matches!(
            distiller.distill(student, &splits.train),
            Err(CoreError::ModelShapeMismatch(_))
        ));
    }
}
