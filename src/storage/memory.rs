//! In-Memory Adapters
//!
//! DashMap-backed `MetadataStore` and `FileStorage` used by tests and
//! embedders. Both expose call counters and failure switches so tests can
//! assert which storage calls happened and inject outages.

use crate::cache::entry::{normalize_path, CacheEntry, EntryLocation};
use crate::domain::ports::{is_under, FileInfo, FileStorage, MetadataStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

// =============================================================================
// Memory Metadata Store
// =============================================================================

#[derive(Debug, Default)]
struct CallCounters {
    find_one: AtomicU64,
    find_all: AtomicU64,
    upsert: AtomicU64,
    delete: AtomicU64,
    count: AtomicU64,
}

/// Metadata rows in a DashMap keyed by `tenant:connection:path`
pub struct MemoryMetadataStore {
    rows: DashMap<String, CacheEntry>,
    calls: CallCounters,
    available: AtomicBool,
    failing_paths: RwLock<HashSet<String>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            calls: CallCounters::default(),
            available: AtomicBool::new(true),
            failing_paths: RwLock::new(HashSet::new()),
        }
    }

    /// Set availability (for testing)
    ///
    /// While unavailable every call fails with `MetadataStoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Make reads and writes of one path fail (for testing)
    pub fn fail_path(&self, path: &str) {
        self.failing_paths.write().insert(normalize_path(path));
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn reset_counters(&self) {
        self.calls.find_one.store(0, Ordering::Relaxed);
        self.calls.find_all.store(0, Ordering::Relaxed);
        self.calls.upsert.store(0, Ordering::Relaxed);
        self.calls.delete.store(0, Ordering::Relaxed);
        self.calls.count.store(0, Ordering::Relaxed);
    }

    pub fn find_one_calls(&self) -> u64 {
        self.calls.find_one.load(Ordering::Relaxed)
    }

    pub fn find_all_calls(&self) -> u64 {
        self.calls.find_all.load(Ordering::Relaxed)
    }

    pub fn upsert_calls(&self) -> u64 {
        self.calls.upsert.load(Ordering::Relaxed)
    }

    pub fn delete_calls(&self) -> u64 {
        self.calls.delete.load(Ordering::Relaxed)
    }

    pub fn count_calls(&self) -> u64 {
        self.calls.count.load(Ordering::Relaxed)
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::MetadataStoreUnavailable("memory store offline".into()))
        }
    }

    fn check_path(&self, location: &EntryLocation) -> Result<()> {
        self.check_available()?;
        let path = location.path();
        if self.failing_paths.read().contains(&path) {
            return Err(Error::MetadataStoreUnavailable(format!("injected failure for {}", path)));
        }
        Ok(())
    }

    fn partition(&self, tenant: &str, connection: &str) -> Vec<CacheEntry> {
        self.rows
            .iter()
            .filter(|r| r.location.tenant == tenant && r.location.connection == connection)
            .map(|r| r.value().clone())
            .collect()
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn find_one(&self, location: &EntryLocation) -> Result<Option<CacheEntry>> {
        self.calls.find_one.fetch_add(1, Ordering::Relaxed);
        self.check_path(location)?;
        Ok(self.rows.get(&location.storage_key()).map(|r| r.value().clone()))
    }

    async fn find_all_for(&self, tenant: &str, connection: &str) -> Result<Vec<CacheEntry>> {
        self.calls.find_all.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;
        Ok(self.partition(tenant, connection))
    }

    async fn upsert(&self, entry: &CacheEntry) -> Result<()> {
        self.calls.upsert.fetch_add(1, Ordering::Relaxed);
        self.check_path(&entry.location)?;
        self.rows.insert(entry.location.storage_key(), entry.clone());
        Ok(())
    }

    async fn delete(&self, location: &EntryLocation) -> Result<bool> {
        self.calls.delete.fetch_add(1, Ordering::Relaxed);
        self.check_path(location)?;
        Ok(self.rows.remove(&location.storage_key()).is_some())
    }

    async fn count_for(&self, tenant: &str, connection: &str) -> Result<u64> {
        self.calls.count.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;
        Ok(self
            .rows
            .iter()
            .filter(|r| r.location.tenant == tenant && r.location.connection == connection)
            .count() as u64)
    }
}

// =============================================================================
// Memory File Storage
// =============================================================================

#[derive(Debug, Clone)]
struct StoredFile {
    data: Bytes,
    modified: DateTime<Utc>,
}

/// Files in a DashMap keyed by `connection:path`
pub struct MemoryFileStorage {
    files: DashMap<String, StoredFile>,
    reads: AtomicU64,
    failing_deletes: RwLock<HashSet<String>>,
}

impl MemoryFileStorage {
    pub fn new() -> Self {
        Self {
            files: DashMap::new(),
            reads: AtomicU64::new(0),
            failing_deletes: RwLock::new(HashSet::new()),
        }
    }

    fn storage_key(path: &str, connection: &str) -> String {
        format!("{}:{}", connection, normalize_path(path))
    }

    /// Store a file with an explicit modification time
    pub fn put_at(&self, path: &str, connection: &str, data: Bytes, modified: DateTime<Utc>) {
        self.files
            .insert(Self::storage_key(path, connection), StoredFile { data, modified });
    }

    /// Store a file modified now
    pub fn put(&self, path: &str, connection: &str, data: Bytes) {
        self.put_at(path, connection, data, Utc::now());
    }

    /// Rewind or advance a file's modification time (for testing)
    pub fn set_modified(&self, path: &str, connection: &str, modified: DateTime<Utc>) -> bool {
        match self.files.get_mut(&Self::storage_key(path, connection)) {
            Some(mut file) => {
                file.modified = modified;
                true
            }
            None => false,
        }
    }

    /// Make deleting one path fail (for testing)
    pub fn fail_delete(&self, path: &str) {
        self.failing_deletes.write().insert(normalize_path(path));
    }

    /// Number of `read` calls served
    pub fn read_calls(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Default for MemoryFileStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileStorage for MemoryFileStorage {
    async fn exists(&self, path: &str, connection: &str) -> Result<bool> {
        Ok(self.files.contains_key(&Self::storage_key(path, connection)))
    }

    async fn list(&self, path: &str, connection: &str, recursive: bool) -> Result<Vec<FileInfo>> {
        let prefix = normalize_path(path);
        let conn_prefix = format!("{}:", connection);

        let mut listed: Vec<FileInfo> = self
            .files
            .iter()
            .filter_map(|r| {
                let file_path = r.key().strip_prefix(&conn_prefix)?;
                let directory = file_path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
                let included = if recursive {
                    is_under(directory, &prefix)
                } else {
                    directory == prefix
                };
                included.then(|| FileInfo {
                    path: file_path.to_string(),
                    size: r.data.len() as u64,
                    modified: r.modified,
                })
            })
            .collect();
        listed.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(listed)
    }

    async fn delete(&self, path: &str, connection: &str) -> Result<()> {
        let normalized = normalize_path(path);
        if self.failing_deletes.read().contains(&normalized) {
            return Err(Error::storage_io(normalized, "injected delete failure"));
        }
        match self.files.remove(&Self::storage_key(path, connection)) {
            Some(_) => Ok(()),
            None => Err(Error::storage_io(normalized, "no such file")),
        }
    }

    async fn size(&self, path: &str, connection: &str) -> Result<u64> {
        self.files
            .get(&Self::storage_key(path, connection))
            .map(|f| f.data.len() as u64)
            .ok_or_else(|| Error::storage_io(normalize_path(path), "no such file"))
    }

    async fn read(&self, path: &str, connection: &str) -> Result<Bytes> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.files
            .get(&Self::storage_key(path, connection))
            .map(|f| f.data.clone())
            .ok_or_else(|| Error::storage_io(normalize_path(path), "no such file"))
    }

    async fn write(&self, path: &str, connection: &str, data: Bytes) -> Result<()> {
        self.put(path, connection, data);
        Ok(())
    }
}
