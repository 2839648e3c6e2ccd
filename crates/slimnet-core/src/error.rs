use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Empty batch: a batch must contain at least one sample")]
    EmptyBatch,

    #[error("Invalid hyperparameter `{name}`: {reason}")]
    InvalidHyperparameter { name: String, reason: String },

    #[error("Model shape mismatch: {0}")]
    ModelShapeMismatch(String),

    #[error("Empty dataset: {0}")]
    EmptyDataset(String),

    #[error("Invalid sparsity {sparsity}: {reason}")]
    InvalidSparsity { sparsity: f64, reason: String },

    #[error("Fusion pattern mismatch for [{pattern}]: {reason}")]
    FusionPatternMismatch { pattern: String, reason: String },

    #[error("Empty calibration set: at least one calibration batch is required")]
    EmptyCalibrationSet,

    #[error("Device placement mismatch: {left} vs {right}")]
    DevicePlacementMismatch { left: String, right: String },

    #[error("Serialization failure for '{path}': {reason}")]
    SerializationFailure { path: String, reason: String },

    #[error("Loss is not finite: {0}")]
    NonFiniteLoss(f32),
}

impl CoreError {
    /// Shorthand for [`CoreError::InvalidHyperparameter`].
    pub fn hyperparameter(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidHyperparameter { name: name.to_string(), reason: reason.into() }
    }

    /// Shorthand for [`CoreError::SerializationFailure`].
    pub fn serialization(path: &std::path::Path, reason: impl ToString) -> Self {
        Self::SerializationFailure {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
