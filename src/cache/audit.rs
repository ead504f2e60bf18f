//! Cache Audit
//!
//! Reconciles stored artifacts with their metadata rows for one location:
//!
//! | File | Row | Action |
//! |------|-----|--------|
//! | expired | any | delete file and row |
//! | fresh | missing | adopt: insert a row from the file's size/mtime |
//! | fresh | present | keep |
//! | missing | present | delete orphan row |
//!
//! Files whose names are not cache keys are left alone. A failure on one
//! file or row is logged and the audit carries on.

use crate::cache::entry::{split_path, CacheEntry, EntryLocation, EntryStats};
use crate::cache::events::{CacheEvent, EvictionReason};
use crate::cache::freshness::FreshnessPolicy;
use crate::cache::index::CacheIndex;
use crate::domain::ports::{FileStorageRef, MetadataStoreRef};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Map;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Counters describing one audit run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditResult {
    /// Files listed under the location
    pub files_scanned: u64,
    /// Metadata rows found under the location
    pub db_entries: u64,
    /// Expired files deleted
    pub files_removed: u64,
    /// Rows deleted (expired or orphaned)
    pub entries_removed: u64,
    /// Rows inserted for orphaned fresh files
    pub entries_added: u64,
    /// Bytes freed by deleting files
    pub bytes_reclaimed: u64,
    /// Files left alone because their name is not a cache key
    pub files_skipped: u64,
    /// Per-item failures that were skipped
    pub errors: u64,
}

impl AuditResult {
    /// True when the audit changed nothing
    pub fn is_noop(&self) -> bool {
        self.files_removed == 0 && self.entries_removed == 0 && self.entries_added == 0
    }
}

/// Reconciles files and metadata rows
pub struct AuditEngine {
    store: MetadataStoreRef,
    files: FileStorageRef,
    freshness: FreshnessPolicy,
    tenant: String,
    event_tx: Option<broadcast::Sender<CacheEvent>>,
}

impl AuditEngine {
    pub fn new(store: MetadataStoreRef, files: FileStorageRef, tenant: impl Into<String>) -> Self {
        Self {
            store,
            files,
            freshness: FreshnessPolicy::new(),
            tenant: tenant.into(),
            event_tx: None,
        }
    }

    /// Emit audit events on a channel
    pub fn with_events(mut self, event_tx: broadcast::Sender<CacheEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Audit a location at the current time
    pub async fn audit_location(&self, connection: &str, location_path: &str) -> Result<AuditResult> {
        self.audit_location_at(connection, location_path, Utc::now()).await
    }

    /// Audit a location as of `now`
    ///
    /// Fails only if the location cannot be listed or its rows cannot be
    /// read; everything after that is per item.
    pub async fn audit_location_at(
        &self,
        connection: &str,
        location_path: &str,
        now: DateTime<Utc>,
    ) -> Result<AuditResult> {
        let mut result = AuditResult::default();

        let files = self.files.list(location_path, connection, true).await?;
        let rows = self
            .store
            .find_under(&self.tenant, connection, location_path)
            .await?;
        result.files_scanned = files.len() as u64;
        result.db_entries = rows.len() as u64;

        // Rows still in the index after the file pass have no file
        let mut index = CacheIndex::new(self.store.clone(), u64::MAX);
        for row in rows {
            index.insert(row);
        }

        for file in files {
            let (directory, filename) = split_path(&file.path);
            let location = EntryLocation {
                tenant: self.tenant.clone(),
                connection: connection.to_string(),
                directory,
                filename,
            };
            let row = index.remove(&location);

            let duration = match self.freshness.decode_duration_from_key(&location.filename) {
                Some(d) => d,
                None => {
                    debug!(path = %file.path, "not a cache artifact, skipping");
                    result.files_skipped += 1;
                    continue;
                }
            };

            if !self.freshness.is_fresh(duration, file.modified, now) {
                if let Err(e) = self.files.delete(&file.path, connection).await {
                    warn!(path = %file.path, error = %e, "failed to delete expired file");
                    result.errors += 1;
                    continue;
                }
                result.files_removed += 1;
                result.bytes_reclaimed += file.size;
                self.emit(CacheEvent::evict(&location, file.size, EvictionReason::Expired));

                if row.is_some() {
                    match self.store.delete(&location).await {
                        Ok(_) => result.entries_removed += 1,
                        Err(e) => {
                            warn!(location = %location, error = %e, "failed to delete expired row");
                            result.errors += 1;
                        }
                    }
                }
                continue;
            }

            if row.is_none() {
                let stats = EntryStats::new(file.modified, file.size, 0);
                let entry = CacheEntry::new(location.clone(), stats, Map::new());
                match self.store.upsert(&entry).await {
                    Ok(()) => {
                        result.entries_added += 1;
                        self.emit(CacheEvent::Adopted {
                            location: location.to_string(),
                            size_bytes: file.size,
                        });
                    }
                    Err(e) => {
                        warn!(location = %location, error = %e, "failed to adopt orphaned file");
                        result.errors += 1;
                    }
                }
            }
        }

        let orphans: Vec<EntryLocation> = index
            .entries(&self.tenant, connection)
            .into_iter()
            .map(|e| e.location.clone())
            .collect();
        for location in orphans {
            match self.store.delete(&location).await {
                Ok(_) => {
                    result.entries_removed += 1;
                    self.emit(CacheEvent::OrphanRemoved {
                        location: location.to_string(),
                    });
                }
                Err(e) => {
                    warn!(location = %location, error = %e, "failed to delete orphaned row");
                    result.errors += 1;
                }
            }
        }

        info!(
            connection,
            location = location_path,
            scanned = result.files_scanned,
            removed = result.files_removed,
            rows_removed = result.entries_removed,
            adopted = result.entries_added,
            reclaimed = result.bytes_reclaimed,
            "audit complete"
        );
        Ok(result)
    }
}
