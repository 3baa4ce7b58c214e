//! Durable snapshot storage.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::MetricSnapshot;

/// Cache I/O errors. Never fatal: the runtime logs them and carries on.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Reading, writing or renaming a cache file failed.
    #[error("cache io error on '{}': {source}", path.display())]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A cache file could not be encoded or decoded.
    #[error("cache file '{}' is not valid: {source}", path.display())]
    Json {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// Cache key would escape the cache directory.
    #[error("invalid cache key '{0}'")]
    InvalidKey(String),
}

/// One persisted collector result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Fingerprint of the configuration that produced the snapshot.
    pub fingerprint: String,
    /// Start of the tick that produced the snapshot.
    pub collected_at: DateTime<Utc>,
    /// The snapshot itself.
    pub snapshot: MetricSnapshot,
}

/// Key to entry persistence.
///
/// The store does no expiry of its own; staleness is decided by the caller
/// comparing fingerprints.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Read the entry stored under `key`, if any.
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Replace the entry stored under `key`.
    async fn store(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError>;
}

/// One JSON file per key inside a base directory.
///
/// Writes go to a uniquely named temporary file that is renamed over the target,
/// so readers see either the previous or the new file, never a partial one.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    dir: PathBuf,
}

impl FileCacheStore {
    /// Store files under `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Base directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `key`.
    pub fn path(&self, key: &str) -> Result<PathBuf, CacheError> {
        let plain = !key.is_empty()
            && key != "."
            && key != ".."
            && !key.contains(['/', '\\'])
            && !key.starts_with('.');
        if !plain {
            return Err(CacheError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(key))
    }
}

#[async_trait::async_trait]
impl CacheStore for FileCacheStore {
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.path(key)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { path, source }),
        };

        let entry = serde_json::from_slice(&bytes).map_err(|source| CacheError::Json {
            path: path.clone(),
            source,
        })?;
        Ok(Some(entry))
    }

    async fn store(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        let path = self.path(key)?;
        let bytes = serde_json::to_vec(entry).map_err(|source| CacheError::Json {
            path: path.clone(),
            source,
        })?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| CacheError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let tmp = self.dir.join(format!(".{key}.{}.tmp", uuid::Uuid::new_v4()));
        if let Err(source) = tokio::fs::write(&tmp, &bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(CacheError::Io { path: tmp, source });
        }

        if let Err(source) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(CacheError::Io { path, source });
        }

        tracing::trace!(path = %path.display(), bytes = bytes.len(), "Cache entry written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Labels;

    fn entry(fingerprint: &str, value: f64) -> CacheEntry {
        let mut snapshot = MetricSnapshot::new();
        snapshot
            .gauge("azure_devops_agentpool_size", "Agents per pool")
            .add(Labels::new().with("agentPoolID", 9), value);
        CacheEntry {
            fingerprint: fingerprint.to_string(),
            collected_at: DateTime::parse_from_rfc3339("2024-05-01T12:00:00.123456789Z")
                .unwrap()
                .with_timezone(&Utc),
            snapshot,
        }
    }

    #[tokio::test]
    async fn test_missing_entry_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path());
        assert!(store.load("project.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_then_load_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path().join("nested"));

        let written = entry("abc", 1.0 / 3.0);
        store.store("agentpool.json", &written).await.unwrap();

        let read = store.load("agentpool.json").await.unwrap().unwrap();
        assert_eq!(read, written);
    }

    #[tokio::test]
    async fn test_store_replaces_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path());

        store.store("build.json", &entry("one", 1.0)).await.unwrap();
        store.store("build.json", &entry("two", 2.0)).await.unwrap();

        let read = store.load("build.json").await.unwrap().unwrap();
        assert_eq!(read.fingerprint, "two");

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(files, vec!["build.json".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("query.json"), b"{ truncated").unwrap();

        let store = FileCacheStore::new(dir.path());
        let err = store.load("query.json").await.unwrap_err();
        assert!(matches!(err, CacheError::Json { .. }));
    }

    #[tokio::test]
    async fn test_key_cannot_escape_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path());

        for key in ["", "..", "../x.json", "a/b.json", ".hidden"] {
            assert!(matches!(
                store.store(key, &entry("x", 0.0)).await,
                Err(CacheError::InvalidKey(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_unwritable_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let store = FileCacheStore::new(blocker.join("cache"));
        let err = store.store("project.json", &entry("x", 0.0)).await.unwrap_err();
        assert!(matches!(err, CacheError::Io { .. }));
    }
}
