//! Artifact export.
//!
//! The deployed model is written to a temporary file in the destination
//! directory, then persisted over the final path in one rename. A failed
//! export therefore never leaves a half-written artifact behind.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use slimnet_core::{ArtifactFormat, CoreError, CoreResult, QuantizedModel, Sequential};

use crate::benchmark::{artifact_size, bytes_to_mib};
use crate::integrity::sha256_file;

/// A model that can be written as a single artifact.
pub trait Exportable {
    fn format(&self) -> ArtifactFormat;
    fn save(&self, path: &Path) -> CoreResult<()>;
}

impl Exportable for Sequential {
    fn format(&self) -> ArtifactFormat {
        ArtifactFormat::Float
    }

    fn save(&self, path: &Path) -> CoreResult<()> {
        Sequential::save(self, path)
    }
}

impl Exportable for QuantizedModel {
    fn format(&self) -> ArtifactFormat {
        ArtifactFormat::Quantized
    }

    fn save(&self, path: &Path) -> CoreResult<()> {
        QuantizedModel::save(self, path)
    }
}

/// Where an artifact ended up and what it contains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportReport {
    pub path: PathBuf,
    pub format: ArtifactFormat,
    pub size_bytes: u64,
    pub sha256: String,
}

impl ExportReport {
    pub fn size_mb(&self) -> f64 {
        bytes_to_mib(self.size_bytes)
    }
}

/// Write `model` to `path` atomically and report its size and digest.
pub fn export<M: Exportable + ?Sized>(model: &M, path: &Path) -> CoreResult<ExportReport> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|e| CoreError::serialization(&dir, e))?;

    let tmp = tempfile::Builder::new()
        .prefix(".slimnet-")
        .suffix(".tmp")
        .tempfile_in(&dir)
        .map_err(|e| CoreError::serialization(&dir, e))?;
    model.save(tmp.path())?;
    tmp.persist(path).map_err(|e| CoreError::serialization(path, e.error))?;

    let size_bytes = artifact_size(path)?;
    let sha256 = sha256_file(path)?;
    info!(
        path = %path.display(),
        format = %model.format(),
        size_mb = bytes_to_mib(size_bytes),
        sha256 = %sha256,
        "Artifact exported"
    );
    Ok(ExportReport { path: path.to_path_buf(), format: model.format(), size_bytes, sha256 })
}
