//! Durable object storage for oversized results and reports.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GapError, Result};

/// Address of a stored object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Store-relative key
    pub key: String,
    /// Addressable location of the object
    pub uri: String,
    /// Size in bytes
    pub size: u64,
}

/// Key-addressed blob storage.
///
/// Keys are `/`-separated relative paths. Listing is by prefix, and keys
/// sort lexicographically in write order when built with [`object_timestamp`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes `bytes` under `key`, replacing any previous object.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<ObjectRef>;

    /// Reads the object stored under `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Returns the greatest key under `prefix`, if any.
    async fn latest(&self, prefix: &str) -> Result<Option<ObjectRef>>;
}

/// Timestamp component for object keys: sortable and filesystem-safe.
pub fn object_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%S%.6fZ").to_string()
}

/// Key for an offloaded query result.
pub fn query_result_key(collection_key: &str, at: DateTime<Utc>) -> String {
    format!(
        "gaps/{}/{}-{}.json",
        collection_key,
        object_timestamp(at),
        uuid::Uuid::new_v4()
    )
}

/// Key for a completeness report.
pub fn report_key(collection_key: &str, at: DateTime<Utc>) -> String {
    format!("reports/{}/{}.json", collection_key, object_timestamp(at))
}

/// Prefix under which a collection's reports are stored.
pub fn report_prefix(collection_key: &str) -> String {
    format!("reports/{}/", collection_key)
}

/// Object store rooted in a local directory.
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Creates a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(GapError::validation(format!("invalid object key: {}", key)));
        }
        Ok(self.root.join(relative))
    }

    fn object_ref(&self, key: &str, path: &Path, size: u64) -> ObjectRef {
        ObjectRef {
            key: key.to_string(),
            uri: format!("file://{}", path.display()),
            size,
        }
    }
}

fn unavailable(err: std::io::Error, key: &str) -> GapError {
    match err.kind() {
        std::io::ErrorKind::NotFound => GapError::NotFound(format!("object {}", key)),
        _ => GapError::DownstreamUnavailable(format!("object store {}: {}", key, err)),
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<ObjectRef> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| unavailable(e, key))?;
        }

        // Write-then-rename so readers never observe a partial object.
        let staging = path.with_extension("partial");
        tokio::fs::write(&staging, &bytes)
            .await
            .map_err(|e| unavailable(e, key))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| unavailable(e, key))?;

        tracing::debug!(key, size = bytes.len(), "object stored");
        Ok(self.object_ref(key, &path, bytes.len() as u64))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path).await.map_err(|e| unavailable(e, key))
    }

    async fn latest(&self, prefix: &str) -> Result<Option<ObjectRef>> {
        let dir_key = prefix.trim_end_matches('/');
        let dir = self.resolve(dir_key)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable(e, prefix)),
        };

        let mut best: Option<(String, u64)> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| unavailable(e, prefix))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".partial") {
                continue;
            }
            let metadata = entry.metadata().await.map_err(|e| unavailable(e, prefix))?;
            if !metadata.is_file() {
                continue;
            }
            if best.as_ref().map_or(true, |(current, _)| name > *current) {
                best = Some((name, metadata.len()));
            }
        }

        Ok(best.map(|(name, size)| {
            let key = format!("{}/{}", dir_key, name);
            self.object_ref(&key, &dir.join(&name), size)
        }))
    }
}
