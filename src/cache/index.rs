//! Request-Scoped Cache Index
//!
//! In-memory projection of metadata rows, nested as
//! `tenant -> connection -> directory -> filename -> entry`. Each
//! (tenant, connection) partition is populated once per request by one of
//! two loaders:
//!
//! - **Eager**: one bulk read of every row; lookups never touch the store.
//! - **Selective**: no bulk read; a lookup miss reads the single row and
//!   promotes it into the map.
//!
//! The loader is chosen by comparing an entry-count estimate with a
//! threshold. Metadata store failures degrade to "nothing loaded".
//!
//! Invalidated locations stay tombstoned until a newer entry is inserted,
//! so neither a preload nor a read-through can bring the old row back
//! before the request's deletes reach the store.

use crate::cache::coalescer::WriteCoalescer;
use crate::cache::entry::{split_path, CacheEntry, EntryLocation};
use crate::cache::freshness::FreshnessPolicy;
use crate::domain::ports::MetadataStoreRef;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tracing::{debug, warn};

// =============================================================================
// Loading Strategies
// =============================================================================

/// Which loader populated a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategyKind {
    Eager,
    Selective,
}

impl fmt::Display for LoadStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadStrategyKind::Eager => write!(f, "eager"),
            LoadStrategyKind::Selective => write!(f, "selective"),
        }
    }
}

/// Strategy for populating one (tenant, connection) partition
#[async_trait]
pub trait IndexLoader: Send + Sync {
    fn kind(&self) -> LoadStrategyKind;

    /// Rows to place in the partition up front
    async fn preload(&self, store: &MetadataStoreRef, tenant: &str, connection: &str) -> Result<Vec<CacheEntry>>;

    /// Whether a lookup miss reads through to the store
    fn reads_through(&self) -> bool;
}

/// Bulk-loads every row for the partition
#[derive(Debug, Clone, Copy, Default)]
pub struct EagerLoader;

#[async_trait]
impl IndexLoader for EagerLoader {
    fn kind(&self) -> LoadStrategyKind {
        LoadStrategyKind::Eager
    }

    async fn preload(&self, store: &MetadataStoreRef, tenant: &str, connection: &str) -> Result<Vec<CacheEntry>> {
        let mut rows = store.find_all_for(tenant, connection).await?;
        rows.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(rows)
    }

    fn reads_through(&self) -> bool {
        false
    }
}

/// Loads nothing up front; single rows are read on demand
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectiveLoader;

#[async_trait]
impl IndexLoader for SelectiveLoader {
    fn kind(&self) -> LoadStrategyKind {
        LoadStrategyKind::Selective
    }

    async fn preload(&self, _store: &MetadataStoreRef, _tenant: &str, _connection: &str) -> Result<Vec<CacheEntry>> {
        Ok(Vec::new())
    }

    fn reads_through(&self) -> bool {
        true
    }
}

/// Pick a loader for an entry-count estimate
pub fn select_loader(entry_count: u64, threshold: u64) -> Box<dyn IndexLoader> {
    if entry_count < threshold {
        Box::new(EagerLoader)
    } else {
        Box::new(SelectiveLoader)
    }
}

// =============================================================================
// Cache Index
// =============================================================================

type DirectoryMap = BTreeMap<String, BTreeMap<String, CacheEntry>>;

struct Partition {
    loader: Box<dyn IndexLoader>,
    directories: DirectoryMap,
}

/// In-memory cache index for one request
pub struct CacheIndex {
    store: MetadataStoreRef,
    freshness: FreshnessPolicy,
    threshold: u64,
    entry_count_hint: Option<u64>,
    tenants: HashMap<String, HashMap<String, Partition>>,
    tombstones: HashSet<String>,
}

impl CacheIndex {
    pub fn new(store: MetadataStoreRef, threshold: u64) -> Self {
        Self {
            store,
            freshness: FreshnessPolicy::new(),
            threshold,
            entry_count_hint: None,
            tenants: HashMap::new(),
            tombstones: HashSet::new(),
        }
    }

    /// Use a stored entry-count estimate instead of asking the store
    pub fn with_entry_count_hint(mut self, hint: Option<u64>) -> Self {
        self.entry_count_hint = hint;
        self
    }

    fn partition(&self, tenant: &str, connection: &str) -> Option<&Partition> {
        self.tenants.get(tenant).and_then(|c| c.get(connection))
    }

    fn partition_mut(&mut self, tenant: &str, connection: &str) -> Option<&mut Partition> {
        self.tenants.get_mut(tenant).and_then(|c| c.get_mut(connection))
    }

    /// Whether a partition has been loaded in this request
    pub fn is_loaded(&self, tenant: &str, connection: &str) -> bool {
        self.partition(tenant, connection).is_some()
    }

    /// Strategy a loaded partition uses
    pub fn strategy(&self, tenant: &str, connection: &str) -> Option<LoadStrategyKind> {
        self.partition(tenant, connection).map(|p| p.loader.kind())
    }

    /// Number of entries held in memory for a partition
    pub fn len(&self, tenant: &str, connection: &str) -> usize {
        self.partition(tenant, connection)
            .map(|p| p.directories.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }

    /// Load a partition once; later calls are no-ops
    pub async fn ensure_loaded(&mut self, tenant: &str, connection: &str) -> LoadStrategyKind {
        if let Some(kind) = self.strategy(tenant, connection) {
            return kind;
        }

        let count = match self.entry_count_hint {
            Some(hint) => Some(hint),
            None => match self.store.count_for(tenant, connection).await {
                Ok(count) => Some(count),
                Err(e) => {
                    warn!(tenant, connection, error = %e, "entry count unavailable, loading selectively");
                    None
                }
            },
        };

        let mut loader: Box<dyn IndexLoader> = match count {
            Some(count) => select_loader(count, self.threshold),
            None => Box::new(SelectiveLoader),
        };

        let rows = match loader.preload(&self.store, tenant, connection).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(tenant, connection, error = %e, "index preload failed, loading selectively");
                loader = Box::new(SelectiveLoader);
                Vec::new()
            }
        };

        let mut directories = DirectoryMap::new();
        for row in rows {
            if self.tombstones.contains(&row.location.storage_key()) {
                continue;
            }
            directories
                .entry(row.location.directory.clone())
                .or_default()
                .insert(row.location.filename.clone(), row);
        }

        let kind = loader.kind();
        debug!(
            tenant,
            connection,
            strategy = %kind,
            count = ?count,
            "cache index loaded"
        );
        self.tenants
            .entry(tenant.to_string())
            .or_default()
            .insert(connection.to_string(), Partition { loader, directories });
        kind
    }

    /// Find an entry, reading through to the store under selective loading
    ///
    /// Loads the partition first if needed. Store failures are logged and
    /// reported as absent.
    pub async fn lookup(&mut self, location: &EntryLocation) -> Option<CacheEntry> {
        self.ensure_loaded(&location.tenant, &location.connection).await;
        if self.tombstones.contains(&location.storage_key()) {
            return None;
        }

        let partition = self.partition(&location.tenant, &location.connection)?;
        if let Some(entry) = partition
            .directories
            .get(&location.directory)
            .and_then(|files| files.get(&location.filename))
        {
            return Some(entry.clone());
        }
        if !partition.loader.reads_through() {
            return None;
        }

        match self.store.find_one(location).await {
            Ok(Some(entry)) => {
                debug!(location = %location, "promoted entry into index");
                self.insert(entry.clone());
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(location = %location, error = %e, "metadata lookup failed, treating as miss");
                None
            }
        }
    }

    /// Existence check for a normalized path
    ///
    /// With a known duration the entry must also be fresh; without one,
    /// existence alone is enough.
    pub async fn exists(
        &mut self,
        tenant: &str,
        connection: &str,
        normalized_path: &str,
        duration: Option<i64>,
        now: DateTime<Utc>,
    ) -> bool {
        let (directory, filename) = split_path(normalized_path);
        let location = EntryLocation {
            tenant: tenant.to_string(),
            connection: connection.to_string(),
            directory,
            filename,
        };
        match self.lookup(&location).await {
            Some(entry) => match duration {
                Some(d) => self.freshness.is_fresh(d, entry.stats.inception, now),
                None => true,
            },
            None => false,
        }
    }

    /// Place an entry in memory without touching the store
    ///
    /// Clears any tombstone left by an earlier invalidation.
    pub fn insert(&mut self, entry: CacheEntry) {
        let loc = &entry.location;
        self.tombstones.remove(&loc.storage_key());
        let partition = self
            .tenants
            .entry(loc.tenant.clone())
            .or_default()
            .entry(loc.connection.clone())
            .or_insert_with(|| Partition {
                loader: Box::new(SelectiveLoader),
                directories: DirectoryMap::new(),
            });
        partition
            .directories
            .entry(loc.directory.clone())
            .or_default()
            .insert(loc.filename.clone(), entry);
    }

    /// Drop an entry from memory without touching the store
    pub fn remove(&mut self, location: &EntryLocation) -> Option<CacheEntry> {
        let partition = self.partition_mut(&location.tenant, &location.connection)?;
        let files = partition.directories.get_mut(&location.directory)?;
        let removed = files.remove(&location.filename);
        if files.is_empty() {
            partition.directories.remove(&location.directory);
        }
        removed
    }

    /// Remove an entry and schedule its deletion from the store
    ///
    /// Later lookups in this request miss without reading the store.
    pub fn invalidate(&mut self, location: &EntryLocation, writes: &mut WriteCoalescer) -> Option<CacheEntry> {
        let removed = self.remove(location);
        self.tombstones.insert(location.storage_key());
        writes.schedule_delete(location.clone());
        debug!(location = %location, "invalidated cache entry");
        removed
    }

    /// Entries of a partition in path order
    pub fn entries(&self, tenant: &str, connection: &str) -> Vec<&CacheEntry> {
        self.partition(tenant, connection)
            .map(|p| p.directories.values().flat_map(|files| files.values()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::StatsDelta;
    use crate::domain::ports::MetadataStore;
    use crate::storage::MemoryMetadataStore;
    use chrono::Duration;
    use serde_json::Map;
    use std::sync::Arc;

    fn entry(dir: &str, file: &str, inception: DateTime<Utc>) -> CacheEntry {
        CacheEntry::from_delta(
            EntryLocation::new("t1", "local", dir, file),
            &StatsDelta::written(10, 1, None),
            Map::new(),
            inception,
        )
    }

    async fn seeded_store(n: usize) -> Arc<MemoryMetadataStore> {
        let store = Arc::new(MemoryMetadataStore::new());
        for i in 0..n {
            store
                .upsert(&entry("cache", &format!("img{}.jpg", i), Utc::now()))
                .await
                .unwrap();
        }
        store.reset_counters();
        store
    }

    #[tokio::test]
    async fn test_eager_lookup_never_reads() {
        let store = seeded_store(3).await;
        let mut index = CacheIndex::new(store.clone(), 10);

        assert_eq!(index.ensure_loaded("t1", "local").await, LoadStrategyKind::Eager);
        assert_eq!(store.find_all_calls(), 1);
        assert_eq!(index.len("t1", "local"), 3);

        let hit = index
            .lookup(&EntryLocation::new("t1", "local", "cache", "img1.jpg"))
            .await;
        assert!(hit.is_some());
        let miss = index
            .lookup(&EntryLocation::new("t1", "local", "cache", "missing.jpg"))
            .await;
        assert!(miss.is_none());
        assert_eq!(store.find_one_calls(), 0);

        // Idempotent per request
        index.ensure_loaded("t1", "local").await;
        assert_eq!(store.find_all_calls(), 1);
        assert_eq!(store.count_calls(), 1);
    }

    #[tokio::test]
    async fn test_selective_promotes_on_first_read() {
        let store = seeded_store(3).await;
        let mut index = CacheIndex::new(store.clone(), 3);

        assert_eq!(index.ensure_loaded("t1", "local").await, LoadStrategyKind::Selective);
        assert_eq!(store.find_all_calls(), 0);
        assert_eq!(index.len("t1", "local"), 0);

        let loc = EntryLocation::new("t1", "local", "cache", "img2.jpg");
        assert!(index.lookup(&loc).await.is_some());
        assert_eq!(store.find_one_calls(), 1);

        assert!(index.lookup(&loc).await.is_some());
        assert_eq!(store.find_one_calls(), 1);
        assert_eq!(index.len("t1", "local"), 1);
    }

    #[tokio::test]
    async fn test_entry_count_hint_skips_count() {
        let store = seeded_store(3).await;
        let mut index = CacheIndex::new(store.clone(), 10).with_entry_count_hint(Some(50));

        assert_eq!(index.ensure_loaded("t1", "local").await, LoadStrategyKind::Selective);
        assert_eq!(store.count_calls(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_degrades_to_empty() {
        let store = seeded_store(3).await;
        store.set_available(false);
        let mut index = CacheIndex::new(store.clone(), 10);

        assert_eq!(index.ensure_loaded("t1", "local").await, LoadStrategyKind::Selective);
        let loc = EntryLocation::new("t1", "local", "cache", "img0.jpg");
        assert!(index.lookup(&loc).await.is_none());

        // Store comes back within the request: selective reads recover
        store.set_available(true);
        assert!(index.lookup(&loc).await.is_some());
    }

    #[tokio::test]
    async fn test_exists_checks_freshness() {
        let store = Arc::new(MemoryMetadataStore::new());
        let created = Utc::now() - Duration::seconds(100);
        store.upsert(&entry("cache", "a.jpg", created)).await.unwrap();
        let mut index = CacheIndex::new(store, 10);
        let now = Utc::now();

        assert!(index.exists("t1", "local", "cache/a.jpg", Some(600), now).await);
        assert!(!index.exists("t1", "local", "cache/a.jpg", Some(60), now).await);
        assert!(index.exists("t1", "local", "cache/a.jpg", Some(-1), now).await);
        assert!(index.exists("t1", "local", "/cache/a.jpg", None, now).await);
        assert!(!index.exists("t1", "local", "cache/b.jpg", None, now).await);
    }

    #[tokio::test]
    async fn test_invalidate_schedules_delete() {
        let store = seeded_store(2).await;
        let mut index = CacheIndex::new(store.clone(), 10);
        let mut writes = WriteCoalescer::new(store.clone());
        let loc = EntryLocation::new("t1", "local", "cache", "img0.jpg");

        assert!(index.lookup(&loc).await.is_some());
        assert!(index.invalidate(&loc, &mut writes).is_some());
        assert!(index.lookup(&loc).await.is_none());
        assert_eq!(writes.pending_len(), 1);

        writes.flush(&mut index).await;
        assert!(store.find_one(&loc).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_selective_invalidate_blocks_read_through() {
        let store = seeded_store(2).await;
        let mut index = CacheIndex::new(store.clone(), 2);
        let mut writes = WriteCoalescer::new(store.clone());
        let loc = EntryLocation::new("t1", "local", "cache", "img1.jpg");

        assert_eq!(index.ensure_loaded("t1", "local").await, LoadStrategyKind::Selective);
        assert!(index.lookup(&loc).await.is_some());
        assert_eq!(store.find_one_calls(), 1);

        index.invalidate(&loc, &mut writes);
        // Row is still in the store until the flush
        assert!(index.lookup(&loc).await.is_none());
        assert!(!index.exists("t1", "local", "cache/img1.jpg", None, Utc::now()).await);
        assert_eq!(store.find_one_calls(), 1);

        // A newer entry lifts the tombstone
        index.insert(entry("cache", "img1.jpg", Utc::now()));
        assert!(index.lookup(&loc).await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_before_eager_preload() {
        let store = seeded_store(3).await;
        let mut index = CacheIndex::new(store.clone(), 10);
        let mut writes = WriteCoalescer::new(store.clone());
        let loc = EntryLocation::new("t1", "local", "cache", "img0.jpg");

        assert!(index.invalidate(&loc, &mut writes).is_none());
        assert_eq!(index.ensure_loaded("t1", "local").await, LoadStrategyKind::Eager);
        assert_eq!(index.len("t1", "local"), 2);
        assert!(index.lookup(&loc).await.is_none());
        assert_eq!(store.find_one_calls(), 0);
    }

    #[tokio::test]
    async fn test_entries_in_path_order() {
        let store = Arc::new(MemoryMetadataStore::new());
        for (dir, file) in [("b", "2.jpg"), ("a", "9.jpg"), ("b", "1.jpg")] {
            store.upsert(&entry(dir, file, Utc::now())).await.unwrap();
        }
        let mut index = CacheIndex::new(store, 10);
        index.ensure_loaded("t1", "local").await;

        let paths: Vec<String> = index.entries("t1", "local").iter().map(|e| e.path()).collect();
        assert_eq!(paths, vec!["a/9.jpg", "b/1.jpg", "b/2.jpg"]);
    }
}
