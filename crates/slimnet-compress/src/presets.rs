//! Architecture size presets for teacher and student networks.
//!
//! Every preset is a plain convolutional classifier:
//!
//! ```text
//! [Conv2d 3x3 pad 1 → BatchNorm2d → Relu → MaxPool2d(2)] × len(widths)
//!   → GlobalAvgPool → Linear
//! ```
//!
//! | Preset  | Widths         | Typical role |
//! |---------|----------------|--------------|
//! | `tiny`  | 8, 16          | student      |
//! | `small` | 16, 32         | student      |
//! | `base`  | 32, 64, 128    | teacher      |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use slimnet_core::CoreError;

/// Network size preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchPreset {
    Tiny,
    Small,
    Base,
}

impl ArchPreset {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tiny => "tiny",
            Self::Small => "small",
            Self::Base => "base",
        }
    }

    /// Channel width of each convolutional stage.
    pub fn widths(&self) -> &'static [usize] {
        match self {
            Self::Tiny => &[8, 16],
            Self::Small => &[16, 32],
            Self::Base => &[32, 64, 128],
        }
    }

    pub fn config(&self, in_channels: usize, num_classes: usize) -> ConvNetConfig {
        ConvNetConfig { in_channels, widths: self.widths().to_vec(), num_classes }
    }
}

impl FromStr for ArchPreset {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tiny" => Ok(Self::Tiny),
            "small" => Ok(Self::Small),
            "base" => Ok(Self::Base),
            other => Err(CoreError::hyperparameter(
                "preset",
                format!("unknown preset '{other}', valid values: tiny, small, base"),
            )),
        }
    }
}

impl fmt::Display for ArchPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Concrete shape of a convolutional classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvNetConfig {
    pub in_channels: usize,
    pub widths: Vec<usize>,
    pub num_classes: usize,
}

impl ConvNetConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.in_channels == 0 {
            return Err(CoreError::hyperparameter("in_channels", "must be > 0"));
        }
        if self.widths.is_empty() || self.widths.contains(&0) {
            return Err(CoreError::hyperparameter("widths", "need at least one stage and every width > 0"));
        }
        if self.num_classes < 2 {
            return Err(CoreError::hyperparameter("num_classes", "a classifier needs at least 2 classes"));
        }
        Ok(())
    }

    /// Width of the feature vector fed to the classifier head.
    pub fn feature_width(&self) -> usize {
        self.widths.last().copied().unwrap_or(self.in_channels)
    }

    /// Approximate number of scalar parameters (weights, biases, batch norm affine terms).
    pub fn approx_params(&self) -> usize {
        let mut total = 0;
        let mut c_in = self.in_channels;
        for &w in &self.widths {
            total += w * c_in * 9 + w; // conv
            total += 2 * w; // bn gamma, beta
            c_in = w;
        }
        total + self.feature_width() * self.num_classes + self.num_classes
    }
}
