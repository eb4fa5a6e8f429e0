//! Durable JSON documents
//!
//! Every persisted document is wrapped in a checksummed envelope and written
//! with the atomic-replace pattern:
//! 1. Write to a temp file next to the target
//! 2. fsync the temp file
//! 3. Rename over the target (atomic on POSIX)
//! 4. fsync the parent directory
//!
//! A reader either sees the previous document or the new one, never a torn
//! write. The CRC32 catches on-disk corruption.

use crc32fast::Hasher;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// Current envelope format version.
const ENVELOPE_VERSION: u32 = 1;

/// Result type for durable document operations
pub type DurableResult<T> = Result<T, DurableError>;

/// Durable document errors
#[derive(Debug, Error)]
pub enum DurableError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization failed: {0}")]
    Serialize(String),

    #[error("document {path} corrupted: {reason}")]
    Corrupted { path: String, reason: String },
}

impl DurableError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        DurableError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    fn corrupted(path: &Path, reason: impl Into<String>) -> Self {
        DurableError::Corrupted {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    checksum: u32,
    payload: String,
}

/// Computes a CRC32 checksum over the provided data.
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Serialize `value` and atomically replace the document at `path`.
pub fn write_document<T: Serialize>(path: &Path, value: &T) -> DurableResult<()> {
    let payload = serde_json::to_string(value).map_err(|e| DurableError::Serialize(e.to_string()))?;
    let envelope = Envelope {
        version: ENVELOPE_VERSION,
        checksum: compute_checksum(payload.as_bytes()),
        payload,
    };
    let bytes = serde_json::to_vec(&envelope).map_err(|e| DurableError::Serialize(e.to_string()))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| DurableError::io(parent, e))?;
    }

    let temp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .map_err(|e| DurableError::io(&temp_path, e))?;
    file.write_all(&bytes).map_err(|e| DurableError::io(&temp_path, e))?;
    file.sync_all().map_err(|e| DurableError::io(&temp_path, e))?;

    fs::rename(&temp_path, path).map_err(|e| DurableError::io(path, e))?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Read and verify the document at `path`. Returns `None` if absent.
pub fn read_document<T: DeserializeOwned>(path: &Path) -> DurableResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).map_err(|e| DurableError::io(path, e))?;
    let envelope: Envelope = serde_json::from_slice(&bytes)
        .map_err(|e| DurableError::corrupted(path, format!("unreadable envelope: {}", e)))?;

    if envelope.version != ENVELOPE_VERSION {
        return Err(DurableError::corrupted(
            path,
            format!("unsupported envelope version {}", envelope.version),
        ));
    }
    if compute_checksum(envelope.payload.as_bytes()) != envelope.checksum {
        return Err(DurableError::corrupted(path, "checksum mismatch"));
    }

    serde_json::from_str(&envelope.payload)
        .map(Some)
        .map_err(|e| DurableError::corrupted(path, format!("unreadable payload: {}", e)))
}

/// Remove a document if present.
pub fn remove_document(path: &Path) -> DurableResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DurableError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        count: u32,
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        let doc = Doc { name: "cache".into(), count: 3 };

        write_document(&path, &doc).unwrap();
        let back: Option<Doc> = read_document(&path).unwrap();
        assert_eq!(back, Some(doc));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_missing_document_is_none() {
        let dir = TempDir::new().unwrap();
        let back: Option<Doc> = read_document(&dir.path().join("absent.json")).unwrap();
        assert!(back.is_none());
    }

    #[test]
    fn test_corruption_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        write_document(&path, &Doc { name: "a".into(), count: 1 }).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        fs::write(&path, raw.replace("\\\"a\\\"", "\\\"b\\\"")).unwrap();

        let result: DurableResult<Option<Doc>> = read_document(&path);
        assert!(matches!(result, Err(DurableError::Corrupted { .. })));
    }

    #[test]
    fn test_checksum_deterministic() {
        assert_eq!(compute_checksum(b"topology"), compute_checksum(b"topology"));
        assert_ne!(compute_checksum(b"topology"), compute_checksum(b"topologz"));
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        assert!(remove_document(&dir.path().join("nothing.json")).is_ok());
    }
}
