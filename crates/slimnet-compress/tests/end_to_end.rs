use candle_core::Device;
use tempfile::TempDir;

use slimnet_compress::{
    evaluate, pretrain_teacher, run_pipeline, ArchPreset, BenchmarkConfig, DatasetSplits, DistillConfig,
    PipelineConfig, QuantizeConfig, Stage, SyntheticSpec, TrainableStudent,
};
use slimnet_core::{ArtifactFormat, Classifier, CoreError, DeployedModel};

fn scenario(image_size: usize) -> (DatasetSplits, DistillConfig) {
    let spec = SyntheticSpec {
        num_classes: 2,
        train_samples: 100,
        validation_samples: 20,
        channels: 3,
        image_size,
        seed: 7,
    };
    let data = DatasetSplits::synthetic(&spec, &Device::Cpu).unwrap();
    let distill = DistillConfig { temperature: 4.0, alpha: 0.7, epochs: 3, batch_size: 20, ..Default::default() };
    (data, distill)
}

fn run(image_size: usize) {
    let (data, distill) = scenario(image_size);
    let (teacher, _) = pretrain_teacher(
        &ArchPreset::Small.config(3, 2),
        &data.train,
        &DistillConfig { epochs: 15, learning_rate: 5e-3, ..distill.clone() },
        &Device::Cpu,
    )
    .unwrap();
    // Classes differ in per-channel brightness, so a trained teacher should be near perfect.
    let teacher_acc = evaluate(&teacher, &data.validation, 20).unwrap();
    assert!(teacher_acc.fraction() >= 0.8, "teacher accuracy {teacher_acc}");

    let dir = TempDir::new().unwrap();
    let output = dir.path().join("student.int8.safetensors");
    let config = PipelineConfig {
        distill,
        sparsity: 0.4,
        quantize: QuantizeConfig::default(),
        benchmark: BenchmarkConfig { runs: 3, warmup: 1 },
        output: output.clone(),
    };
    let student = TrainableStudent::new(&ArchPreset::Tiny.config(3, 2), &Device::Cpu).unwrap();
    let report = run_pipeline(&teacher, student, &data, &config).unwrap();

    let metrics = report.metrics;
    assert!((0.0..=1.0).contains(&metrics.accuracy()));
    assert!(metrics.latency_ms() > 0.0);
    assert!(metrics.size_mb() > 0.0);
    assert!(std::fs::metadata(&output).unwrap().len() > 0);

    assert_eq!(report.training.epoch_losses.len(), 3);
    assert!(report.training.epoch_losses.iter().all(|l| l.is_finite() && *l >= 0.0));
    assert_eq!(report.pruning.pruned, (0.4 * report.pruning.total as f64).floor() as usize);
    assert_eq!(report.artifact.format, ArtifactFormat::Quantized);

    let deployed = DeployedModel::load(&output, &Device::Cpu).unwrap();
    assert_eq!(deployed.format(), ArtifactFormat::Quantized);
    assert_eq!(deployed.num_classes(), 2);
    let again = evaluate(&deployed, &data.validation, 20).unwrap();
    assert_eq!(again, report.quantized_accuracy);

    let json = dir.path().join("report.json");
    report.write_json(&json).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&json).unwrap()).unwrap();
    assert!(parsed["metrics"]["latency_ms"].as_f64().unwrap() > 0.0);
}

#[test]
fn compress_small_images_end_to_end() {
    run(16);
}

#[test]
#[ignore = "full-resolution run takes minutes on CPU"]
fn compress_full_resolution_end_to_end() {
    run(224);
}

#[test]
fn mismatched_heads_fail_in_distill_stage() {
    let (data, distill) = scenario(8);
    let teacher_net = TrainableStudent::new(&ArchPreset::Tiny.config(3, 3), &Device::Cpu).unwrap();
    let teacher = slimnet_compress::Teacher::new(teacher_net.freeze().unwrap());
    let student = TrainableStudent::new(&ArchPreset::Tiny.config(3, 2), &Device::Cpu).unwrap();

    let dir = TempDir::new().unwrap();
    let output = dir.path().join("never.safetensors");
    let config = PipelineConfig {
        distill,
        sparsity: 0.4,
        quantize: QuantizeConfig::default(),
        benchmark: BenchmarkConfig::default(),
        output: output.clone(),
    };
    let err = run_pipeline(&teacher, student, &data, &config).unwrap_err();
    assert_eq!(err.stage, Stage::Distill);
    assert!(matches!(err.source, CoreError::ModelShapeMismatch(_)));
    assert!(!output.exists());
}
