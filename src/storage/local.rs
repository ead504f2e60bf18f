//! Local Disk File Storage
//!
//! Each connection maps to a root directory; paths are resolved below it.

use crate::cache::entry::normalize_path;
use crate::domain::ports::{FileInfo, FileStorage};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Configuration for local storage
#[derive(Debug, Clone)]
pub struct LocalStorageConfig {
    /// Directory holding one subdirectory per unmapped connection
    pub base_path: PathBuf,
    /// Explicit roots for named connections
    pub roots: HashMap<String, PathBuf>,
    /// Whether to sync writes to disk
    pub sync_writes: bool,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./storage"),
            roots: HashMap::new(),
            sync_writes: false,
        }
    }
}

/// `FileStorage` over the local filesystem
pub struct LocalFileStorage {
    config: LocalStorageConfig,
}

impl LocalFileStorage {
    /// Storage rooted at `base_path/<connection>`
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self::with_config(LocalStorageConfig {
            base_path: base_path.into(),
            ..Default::default()
        })
    }

    pub fn with_config(config: LocalStorageConfig) -> Self {
        Self { config }
    }

    /// Map a connection to an explicit root directory
    pub fn with_root(mut self, connection: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.config.roots.insert(connection.into(), root.into());
        self
    }

    /// Root directory of a connection
    pub fn root_for(&self, connection: &str) -> PathBuf {
        self.config
            .roots
            .get(connection)
            .cloned()
            .unwrap_or_else(|| self.config.base_path.join(connection))
    }

    /// Resolve a storage path, refusing anything that escapes the root
    fn resolve(&self, path: &str, connection: &str) -> Result<PathBuf> {
        let normalized = normalize_path(path);
        if normalized.split('/').any(|seg| seg == "..") {
            return Err(Error::storage_io(normalized, "path escapes connection root"));
        }
        let mut full = self.root_for(connection);
        if !normalized.is_empty() {
            full.push(&normalized);
        }
        Ok(full)
    }
}

fn io_error(path: &str, e: std::io::Error) -> Error {
    Error::storage_io(normalize_path(path), e)
}

fn relative_path(root: &Path, full: &Path) -> Option<String> {
    let rel = full.strip_prefix(root).ok()?;
    Some(normalize_path(&rel.to_string_lossy()))
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn exists(&self, path: &str, connection: &str) -> Result<bool> {
        let full = self.resolve(path, connection)?;
        match fs::metadata(&full).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(path, e)),
        }
    }

    async fn list(&self, path: &str, connection: &str, recursive: bool) -> Result<Vec<FileInfo>> {
        let root = self.root_for(connection);
        let start = self.resolve(path, connection)?;
        let mut files = Vec::new();
        let mut pending = vec![start];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(&dir.to_string_lossy(), e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error(&dir.to_string_lossy(), e))?
            {
                let full = entry.path();
                let meta = match entry.metadata().await {
                    Ok(meta) => meta,
                    Err(e) => {
                        debug!(path = %full.display(), error = %e, "skipping unreadable entry");
                        continue;
                    }
                };
                if meta.is_dir() {
                    if recursive {
                        pending.push(full);
                    }
                    continue;
                }
                let Some(rel) = relative_path(&root, &full) else {
                    continue;
                };
                let modified = meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                files.push(FileInfo {
                    path: rel,
                    size: meta.len(),
                    modified,
                });
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn delete(&self, path: &str, connection: &str) -> Result<()> {
        let full = self.resolve(path, connection)?;
        fs::remove_file(&full).await.map_err(|e| io_error(path, e))
    }

    async fn size(&self, path: &str, connection: &str) -> Result<u64> {
        let full = self.resolve(path, connection)?;
        let meta = fs::metadata(&full).await.map_err(|e| io_error(path, e))?;
        Ok(meta.len())
    }

    async fn read(&self, path: &str, connection: &str) -> Result<Bytes> {
        let full = self.resolve(path, connection)?;
        let data = fs::read(&full).await.map_err(|e| io_error(path, e))?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, path: &str, connection: &str, data: Bytes) -> Result<()> {
        let full = self.resolve(path, connection)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await.map_err(|e| io_error(path, e))?;
        }
        let mut file = fs::File::create(&full).await.map_err(|e| io_error(path, e))?;
        file.write_all(&data).await.map_err(|e| io_error(path, e))?;
        if self.config.sync_writes {
            file.sync_all().await.map_err(|e| io_error(path, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_read_delete() {
        let temp = TempDir::new().unwrap();
        let storage = LocalFileStorage::new(temp.path());

        storage
            .write("cache/a-258-x.jpg", "local", Bytes::from("data"))
            .await
            .unwrap();
        assert!(temp.path().join("local/cache/a-258-x.jpg").exists());
        assert!(storage.exists("/cache/a-258-x.jpg", "local").await.unwrap());
        assert_eq!(storage.size("cache/a-258-x.jpg", "local").await.unwrap(), 4);
        assert_eq!(
            storage.read("cache/a-258-x.jpg", "local").await.unwrap(),
            Bytes::from("data")
        );

        storage.delete("cache/a-258-x.jpg", "local").await.unwrap();
        assert!(!storage.exists("cache/a-258-x.jpg", "local").await.unwrap());
        assert_matches!(
            storage.read("cache/a-258-x.jpg", "local").await,
            Err(Error::StorageIo { .. })
        );
    }

    #[tokio::test]
    async fn test_list_recursive() {
        let temp = TempDir::new().unwrap();
        let storage = LocalFileStorage::new(temp.path());
        for path in ["cache/a.jpg", "cache/sub/b.jpg", "other/c.jpg"] {
            storage.write(path, "local", Bytes::from("x")).await.unwrap();
        }

        let flat: Vec<String> = storage
            .list("cache", "local", false)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(flat, vec!["cache/a.jpg"]);

        let deep: Vec<String> = storage
            .list("cache", "local", true)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(deep, vec!["cache/a.jpg", "cache/sub/b.jpg"]);

        assert!(storage.list("missing", "local", true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_root_and_escape() {
        let temp = TempDir::new().unwrap();
        let media = temp.path().join("media");
        let storage = LocalFileStorage::new(temp.path()).with_root("s3", &media);

        storage.write("a.jpg", "s3", Bytes::from("x")).await.unwrap();
        assert!(media.join("a.jpg").exists());

        assert_matches!(
            storage.read("../secret", "s3").await,
            Err(Error::StorageIo { .. })
        );
    }
}
