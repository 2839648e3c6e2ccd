use std::fs::File;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

use slimnet_core::{CoreError, CoreResult};

/// Compute the SHA-256 hex digest of a file on disk.
pub fn sha256_file(path: &Path) -> CoreResult<String> {
    let mut file = File::open(path).map_err(|e| CoreError::serialization(path, e))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Verify that the artifact at `path` matches the expected SHA-256 hex string.
pub fn verify_artifact(path: &Path, expected_sha256: &str) -> CoreResult<()> {
    let actual = sha256_file(path)?;
    debug!(
        path = %path.display(),
        expected = expected_sha256,
        actual = %actual,
        "Verifying artifact integrity"
    );
    if actual.eq_ignore_ascii_case(expected_sha256) {
        Ok(())
    } else {
        Err(CoreError::serialization(path, format!("SHA-256 mismatch: expected {expected_sha256}, got {actual}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn hello_file(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();
        path
    }

    #[test]
    fn sha256_known_value() {
        let dir = TempDir::new().unwrap();
        assert_eq!(sha256_file(&hello_file(&dir)).unwrap(), HELLO_SHA256);
    }

    #[test]
    fn verify_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        assert!(verify_artifact(&hello_file(&dir), &HELLO_SHA256.to_uppercase()).is_ok());
    }

    #[test]
    fn verify_mismatch_fails() {
        let dir = TempDir::new().unwrap();
        let result = verify_artifact(&hello_file(&dir), &"0".repeat(64));
        assert!(matches!(result, Err(CoreError::SerializationFailure { .. })));
    }

    #[test]
    fn missing_file_fails() {
        assert!(sha256_file(Path::new("/nonexistent/artifact.safetensors")).is_err());
    }
}
