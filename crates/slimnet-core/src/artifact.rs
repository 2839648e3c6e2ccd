//! Single-file model artifacts.
//!
//! An artifact is a safetensors file whose header metadata carries two extra
//! keys:
//!
//! | Key | Value |
//! |-----|-------|
//! | `slimnet.format` | `"float"` or `"quantized"` |
//! | `slimnet.architecture` | JSON array of layer descriptors |
//!
//! The file is only meaningful to this runtime; it is not meant as a portable
//! interchange format.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use candle_core::{Device, Tensor};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

pub const FORMAT_KEY: &str = "slimnet.format";
pub const ARCHITECTURE_KEY: &str = "slimnet.architecture";

/// Numeric representation of the stored model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    Float,
    Quantized,
}

impl ArtifactFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Quantized => "quantized",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "float" => Some(Self::Float),
            "quantized" => Some(Self::Quantized),
            _ => None,
        }
    }
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tensors plus header metadata, as read back from disk.
#[derive(Debug)]
pub struct RawArtifact {
    pub format: ArtifactFormat,
    pub architecture: String,
    pub tensors: HashMap<String, Tensor>,
}

/// Write `tensors` to `path` with the format and architecture in the header.
pub fn write_artifact(
    path: &Path,
    tensors: &HashMap<String, Tensor>,
    format: ArtifactFormat,
    architecture: String,
) -> CoreResult<()> {
    let metadata: HashMap<String, String> = [
        (FORMAT_KEY.to_string(), format.as_str().to_string()),
        (ARCHITECTURE_KEY.to_string(), architecture),
    ]
    .into_iter()
    .collect();

    safetensors::serialize_to_file(tensors.iter(), &Some(metadata), path)
        .map_err(|e| CoreError::serialization(path, e))?;

    debug!(path = %path.display(), tensors = tensors.len(), %format, "Artifact written");
    Ok(())
}

/// Read an artifact written by [`write_artifact`], placing tensors on `device`.
pub fn read_artifact(path: &Path, device: &Device) -> CoreResult<RawArtifact> {
    let bytes = std::fs::read(path).map_err(|e| CoreError::serialization(path, e))?;
    if bytes.is_empty() {
        return Err(CoreError::serialization(path, "file is empty"));
    }

    let (_, header) = SafeTensors::read_metadata(&bytes).map_err(|e| CoreError::serialization(path, e))?;
    let metadata = header.metadata().clone().unwrap_or_default();

    let format = metadata
        .get(FORMAT_KEY)
        .and_then(|s| ArtifactFormat::parse(s))
        .ok_or_else(|| CoreError::serialization(path, format!("missing or unknown '{FORMAT_KEY}'")))?;
    let architecture = metadata
        .get(ARCHITECTURE_KEY)
        .cloned()
        .ok_or_else(|| CoreError::serialization(path, format!("missing '{ARCHITECTURE_KEY}'")))?;

    let tensors = candle_core::safetensors::load_buffer(&bytes, device)?;
    debug!(path = %path.display(), tensors = tensors.len(), %format, "Artifact read");

    Ok(RawArtifact { format, architecture, tensors })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use tempfile::TempDir;

    #[test]
    fn roundtrip_preserves_metadata_and_tensors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert("a.weight".to_string(), Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap());
        tensors.insert("a.q".to_string(), Tensor::zeros(4, DType::U8, &Device::Cpu).unwrap());

        write_artifact(&path, &tensors, ArtifactFormat::Quantized, "[]".to_string()).unwrap();
        let raw = read_artifact(&path, &Device::Cpu).unwrap();

        assert_eq!(raw.format, ArtifactFormat::Quantized);
        assert_eq!(raw.architecture, "[]");
        assert_eq!(raw.tensors["a.weight"].dims(), &[2, 3]);
        assert_eq!(raw.tensors["a.q"].dtype(), DType::U8);
    }

    #[test]
    fn missing_file_is_serialization_failure() {
        let err = read_artifact(Path::new("/nonexistent/model.safetensors"), &Device::Cpu).unwrap_err();
        assert!(matches!(err, CoreError::SerializationFailure { .. }));
    }

    #[test]
    fn empty_file_is_serialization_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.safetensors");
        std::fs::write(&path, b"").unwrap();
        let err = read_artifact(&path, &Device::Cpu).unwrap_err();
        assert!(matches!(err, CoreError::SerializationFailure { .. }));
    }

    #[test]
    fn format_parse() {
        assert_eq!(ArtifactFormat::parse("float"), Some(ArtifactFormat::Float));
        assert_eq!(ArtifactFormat::parse("quantized"), Some(ArtifactFormat::Quantized));
        assert_eq!(ArtifactFormat::parse("int4"), None);
    }
}
