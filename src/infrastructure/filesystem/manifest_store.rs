use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::common::error::FleetError;
use crate::common::result::FleetResult;
use crate::domain::entities::manifest::Manifest;

/// Manifest store related errors
#[derive(Debug, Error)]
pub enum ManifestStoreError {
    #[error("Manifest file read failed: {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Manifest file write failed: {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Backup operation failed: {0}")]
    BackupFailed(std::io::Error),

    #[error("Seed download failed from {url}: {source}")]
    DownloadFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl From<ManifestStoreError> for FleetError {
    fn from(error: ManifestStoreError) -> Self {
        match error {
            ManifestStoreError::ReadFailed { path, source }
            | ManifestStoreError::WriteFailed { path, source } => {
                FleetError::filesystem_error_with_source("Manifest I/O failed", Some(path), source)
            }
            ManifestStoreError::BackupFailed(source) => {
                FleetError::filesystem_error_with_source("Manifest backup failed", None, source)
            }
            ManifestStoreError::DownloadFailed { url, source } => {
                FleetError::config_error_with_source(format!("Failed to download {url}"), source)
            }
        }
    }
}

/// Reads and writes the canonical manifest JSON.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    backup_suffix: String,
}

impl Default for ManifestStore {
    fn default() -> Self {
        Self {
            backup_suffix: ".bak".to_string(),
        }
    }
}

impl ManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Missing file yields an empty manifest; anything unreadable is an error.
    pub fn load(&self, path: &Path) -> FleetResult<Manifest> {
        if !path.exists() {
            debug!(path = %path.display(), "no manifest on disk, starting empty");
            return Ok(Manifest::new());
        }
        let contents = fs::read_to_string(path).map_err(|source| ManifestStoreError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            FleetError::manifest_parse_with_source(
                format!("{}: {e}", path.display()),
                Some(path.to_path_buf()),
                e,
            )
        })
    }

    /// Write atomically, keeping the previous file as `<file>.bak`.
    pub fn save(&self, path: &Path, manifest: &Manifest) -> FleetResult<()> {
        let write_failed = |source| ManifestStoreError::WriteFailed {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_failed)?;
        }
        if path.exists() {
            fs::copy(path, self.backup_path(path)).map_err(ManifestStoreError::BackupFailed)?;
        }

        let staging = path.with_extension("json.tmp");
        fs::write(&staging, manifest.freeze()).map_err(write_failed)?;
        fs::rename(&staging, path).map_err(write_failed)?;
        debug!(path = %path.display(), repos = manifest.len(), "manifest saved");
        Ok(())
    }

    pub fn backup_path(&self, path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(&self.backup_suffix);
        path.with_file_name(name)
    }

    /// Read a seed manifest from a local file or an http(s) URL.
    pub async fn read_seed(&self, descriptor: &str) -> FleetResult<Manifest> {
        if descriptor.starts_with("http://") || descriptor.starts_with("https://") {
            let download_failed = |source| ManifestStoreError::DownloadFailed {
                url: descriptor.to_string(),
                source,
            };
            let body = reqwest::get(descriptor)
                .await
                .and_then(|response| response.error_for_status())
                .map_err(download_failed)?
                .text()
                .await
                .map_err(download_failed)?;
            return Manifest::from_json(&body);
        }

        let path = Path::new(descriptor);
        if !path.is_file() {
            return Err(FleetError::filesystem_error(
                "Seed manifest not found",
                Some(path.to_path_buf()),
            ));
        }
        self.load(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = ManifestStore::new()
            .load(&temp_dir.path().join("manifest.json"))
            .unwrap();
        assert!(manifest.is_empty());
    }

    #[test]
    fn test_load_malformed_is_hard_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("manifest.json");
        fs::write(&path, "not json").unwrap();

        let result = ManifestStore::new().load(&path);
        assert!(matches!(result, Err(FleetError::ManifestParse { .. })));
    }

    #[test]
    fn test_save_round_trip_and_backup() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("manifest.json");
        let store = ManifestStore::new();

        let mut manifest = Manifest::new();
        manifest.add("core", "acme/core", None);
        store.save(&path, &manifest).unwrap();
        assert!(!store.backup_path(&path).exists());

        manifest.add("docs", "acme/docs", Some("main"));
        store.save(&path, &manifest).unwrap();

        assert_eq!(store.load(&path).unwrap(), manifest);
        assert_eq!(fs::read_to_string(&path).unwrap(), manifest.freeze());

        let backup = store.backup_path(&path);
        assert_eq!(backup.file_name().unwrap(), "manifest.json.bak");
        assert_eq!(store.load(&backup).unwrap().len(), 1);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_read_seed_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("seed.json");
        fs::write(&path, r#"{"repos":{"core":{"repo":"acme/core"}}}"#).unwrap();

        let store = ManifestStore::new();
        let seed = store.read_seed(path.to_str().unwrap()).await.unwrap();
        assert_eq!(seed.len(), 1);

        let missing = store
            .read_seed(temp_dir.path().join("nope.json").to_str().unwrap())
            .await;
        assert!(matches!(missing, Err(FleetError::FileSystem { .. })));
    }
}
