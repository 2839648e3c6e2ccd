use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use slimnet_compress::{ArchPreset, BenchmarkConfig, DistillConfig, QuantizeConfig, SyntheticSpec};
use slimnet_core::DeviceKind;

/// Full runtime configuration loaded from TOML + env vars.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub model: ModelConfig,
    pub data: DataConfig,
    pub training: DistillConfig,
    pub pruning: PruningConfig,
    pub quantization: QuantizeConfig,
    pub benchmark: BenchmarkConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    pub ordinal: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelConfig {
    pub teacher_preset: ArchPreset,
    pub student_preset: ArchPreset,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self { teacher_preset: ArchPreset::Base, student_preset: ArchPreset::Tiny }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory holding `train.safetensors` and `validation.safetensors`.
    pub dir: Option<String>,
    /// Generate data instead of reading `dir`.
    pub synthetic: bool,
    #[serde(rename = "synthetic_spec")]
    pub spec: SyntheticSpec,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PruningConfig {
    pub sparsity: f64,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self { sparsity: 0.4 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { dir: "./output".to_string() }
    }
}

/// Load configuration from:
/// 1. Built-in defaults
/// 2. `config/default.toml` (if present)
/// 3. A custom config file path (if provided)
/// 4. Environment variables prefixed with `SLIMNET_`
///
/// CLI flags are applied on top by each command.
pub fn load_config(config_file: Option<&PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder()
        // Layer 1: defaults baked in
        .add_source(Config::try_from(&AppConfig::default())?)
        // Layer 2: project default.toml
        .add_source(File::with_name("config/default").required(false));

    // Layer 3: optional user-supplied config file
    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    // Layer 4: environment variables (SLIMNET_TRAINING__EPOCHS, SLIMNET_PRUNING__SPARSITY, ...)
    builder = builder.add_source(
        Environment::with_prefix("SLIMNET")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// Expand a leading `~` to the home directory.
pub fn expand_path(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if raw == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(raw)
}

/// `<output.dir>/<file_name>` with `~` expanded.
pub fn output_file(cfg: &AppConfig, file_name: &str) -> PathBuf {
    expand_path(&cfg.output.dir).join(Path::new(file_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use slimnet_compress::ObserverMethod;
    use tempfile::TempDir;

    // ── load_config defaults ──────────────────────────────────────────────────

    #[test]
    fn test_default_training_values() {
        let cfg = load_config(None).unwrap();
        assert!((cfg.training.temperature - 4.0).abs() < f64::EPSILON);
        assert!((cfg.training.alpha - 0.7).abs() < f64::EPSILON);
        assert_eq!(cfg.training.epochs, 3);
    }

    #[test]
    fn test_default_presets() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.model.teacher_preset, ArchPreset::Base);
        assert_eq!(cfg.model.student_preset, ArchPreset::Tiny);
    }

    #[test]
    fn test_default_quantization_and_benchmark() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.quantization.calibration_batches, 1);
        assert_eq!(cfg.quantization.observer, ObserverMethod::MinMax);
        assert_eq!(cfg.benchmark.warmup, 5);
        assert!(cfg.benchmark.runs >= 1);
    }

    #[test]
    fn test_default_device_is_cpu() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.device.kind, DeviceKind::Cpu);
    }

    // ── load_config from a custom file ────────────────────────────────────────

    #[test]
    fn test_custom_config_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("custom.toml");
        std::fs::write(
            &file,
            "[training]\nepochs = 7\nbatch_size = 16\n\n[pruning]\nsparsity = 0.25\n\n[quantization]\nobserver = \"batch_average\"\n",
        )
        .unwrap();

        let cfg = load_config(Some(&file)).unwrap();
        assert_eq!(cfg.training.epochs, 7);
        assert_eq!(cfg.training.batch_size, 16);
        assert!((cfg.training.temperature - 4.0).abs() < f64::EPSILON);
        assert!((cfg.pruning.sparsity - 0.25).abs() < f64::EPSILON);
        assert_eq!(cfg.quantization.observer, ObserverMethod::BatchAverage);
    }

    #[test]
    fn test_missing_custom_file_errors() {
        let missing = PathBuf::from("/nonexistent/slimnet.toml");
        assert!(load_config(Some(&missing)).is_err());
    }

    // ── expand_path ───────────────────────────────────────────────────────────

    #[test]
    fn test_expand_absolute_path_unchanged() {
        assert_eq!(expand_path("/absolute/output"), PathBuf::from("/absolute/output"));
    }

    #[test]
    fn test_expand_tilde_produces_non_tilde_prefix() {
        let path = expand_path("~/slimnet/output");
        let s = path.to_string_lossy();
        assert!(!s.starts_with('~'), "Expanded path must not start with '~', got: {s}");
        assert!(s.ends_with("slimnet/output"), "got: {s}");
    }

    #[test]
    fn test_expand_relative_path_unchanged() {
        assert_eq!(expand_path("relative/path"), PathBuf::from("relative/path"));
    }

    #[test]
    fn test_output_file_joins_dir() {
        let cfg = AppConfig::default();
        assert_eq!(output_file(&cfg, "student.safetensors"), PathBuf::from("./output/student.safetensors"));
    }
}
