//! JSON File Metadata Store
//!
//! Keeps every row in memory and rewrites a single JSON document after each
//! mutation. Meant for the CLI and small single-node deployments.

use crate::cache::entry::{CacheEntry, EntryLocation};
use crate::domain::ports::MetadataStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Current on-disk format version
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoredDocument {
    version: u32,
    entries: Vec<CacheEntry>,
}

/// `MetadataStore` persisted as one JSON file
pub struct JsonMetadataStore {
    path: PathBuf,
    rows: RwLock<BTreeMap<String, CacheEntry>>,
    /// Serializes file rewrites
    write_lock: Mutex<()>,
}

impl JsonMetadataStore {
    /// Open a store, loading existing rows if the file exists
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let rows = match fs::read(&path).await {
            Ok(raw) => {
                let doc: StoredDocument = serde_json::from_slice(&raw)?;
                if doc.version != FORMAT_VERSION {
                    return Err(Error::Configuration(format!(
                        "unsupported metadata format version {} in {}",
                        doc.version,
                        path.display()
                    )));
                }
                doc.entries
                    .into_iter()
                    .map(|e| (e.location.storage_key(), e))
                    .collect()
            }
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(Error::storage_io(path.to_string_lossy(), e)),
        };

        info!(path = %path.display(), entries = rows.len(), "opened metadata store");
        Ok(Self {
            path,
            rows: RwLock::new(rows),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Rewrite the file from the current rows via a temp file and rename
    async fn persist(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let doc = StoredDocument {
            version: FORMAT_VERSION,
            entries: self.rows.read().values().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&doc)?;

        let unavailable = |e: std::io::Error| {
            Error::MetadataStoreUnavailable(format!("{}: {}", self.path.display(), e))
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(unavailable)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await.map_err(unavailable)?;
        fs::rename(&tmp, &self.path).await.map_err(unavailable)?;
        debug!(path = %self.path.display(), entries = doc.entries.len(), "metadata persisted");
        Ok(())
    }

    fn partition(&self, tenant: &str, connection: &str) -> Vec<CacheEntry> {
        self.rows
            .read()
            .values()
            .filter(|e| e.location.tenant == tenant && e.location.connection == connection)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn find_one(&self, location: &EntryLocation) -> Result<Option<CacheEntry>> {
        Ok(self.rows.read().get(&location.storage_key()).cloned())
    }

    async fn find_all_for(&self, tenant: &str, connection: &str) -> Result<Vec<CacheEntry>> {
        Ok(self.partition(tenant, connection))
    }

    async fn upsert(&self, entry: &CacheEntry) -> Result<()> {
        self.rows
            .write()
            .insert(entry.location.storage_key(), entry.clone());
        self.persist().await
    }

    async fn delete(&self, location: &EntryLocation) -> Result<bool> {
        let removed = self.rows.write().remove(&location.storage_key()).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn count_for(&self, tenant: &str, connection: &str) -> Result<u64> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|e| e.location.tenant == tenant && e.location.connection == connection)
            .count() as u64)
    }
}
