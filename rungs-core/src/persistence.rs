//! Atomic JSON persistence for checkpoint metadata and run snapshots.

use std::io;
use std::path::Path;

/// Serialize `data` as pretty JSON and write it atomically to `path`.
///
/// The bytes go to a `.tmp` sibling first and are renamed into place, so a
/// reader never observes a partial file. Parent directories are created.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON from `path`; `Ok(None)` when the file is absent.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Progress {
        iteration: u64,
        timesteps_total: f64,
    }

    #[test]
    fn test_atomic_write_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(".tune_metadata.json");
        let data = Progress {
            iteration: 7,
            timesteps_total: 70.0,
        };

        atomic_write_json(&path, &data).unwrap();
        let loaded: Option<Progress> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(data));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_load_json_missing_file() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<Progress> = load_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_load_json_invalid_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        let err = load_json::<Progress>(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
