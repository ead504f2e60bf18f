//! Write Coalescer
//!
//! Collects cache metadata writes during a request and applies them in one
//! batch at the end. Writes are keyed by location and merged: a later
//! artifact or deletion supersedes the earlier write, while a hit only adds
//! to whatever is already queued.
//!
//! The first scheduled write arms a one-shot flush latch. The owner calls
//! [`WriteCoalescer::flush`] at the end of the request; if the coalescer is
//! dropped with writes still pending (panic, cancelled request) the latch
//! fires from `Drop` and the writes are applied on the current runtime.

use crate::cache::entry::{CacheEntry, EntryLocation, StatsDelta};
use crate::cache::index::CacheIndex;
use crate::domain::ports::MetadataStoreRef;
use chrono::Utc;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

// =============================================================================
// Pending Writes
// =============================================================================

/// Operation queued for a location
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    /// Insert the row or update it in place
    Upsert {
        delta: StatsDelta,
        values: Map<String, Value>,
        force: bool,
    },
    /// Remove the row
    Delete,
}

/// A queued metadata write
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub location: EntryLocation,
    pub op: PendingOp,
    /// Order of the last write merged into this one
    pub sequence: u64,
}

/// Outcome of a flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl FlushReport {
    /// Rows written or removed
    pub fn applied(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

// =============================================================================
// Write Coalescer
// =============================================================================

/// Request-scoped queue of metadata writes
pub struct WriteCoalescer {
    store: MetadataStoreRef,
    pending: IndexMap<String, PendingWrite>,
    sequence: u64,
    flush_registered: bool,
}

impl WriteCoalescer {
    pub fn new(store: MetadataStoreRef) -> Self {
        Self {
            store,
            pending: IndexMap::new(),
            sequence: 0,
            flush_registered: false,
        }
    }

    /// Queue an upsert, merging with any earlier write to the same location
    pub fn schedule(
        &mut self,
        location: EntryLocation,
        delta: StatsDelta,
        values: Map<String, Value>,
        force: bool,
    ) {
        self.push(location, PendingOp::Upsert { delta, values, force });
    }

    /// Queue a deletion, superseding any earlier write to the same location
    pub fn schedule_delete(&mut self, location: EntryLocation) {
        self.push(location, PendingOp::Delete);
    }

    fn push(&mut self, location: EntryLocation, op: PendingOp) {
        if !self.flush_registered {
            self.flush_registered = true;
            debug!("registered deferred metadata flush");
        }

        self.sequence += 1;
        let key = location.storage_key();
        match self.pending.get_mut(&key) {
            Some(existing) => {
                let earlier = std::mem::replace(&mut existing.op, PendingOp::Delete);
                existing.op = merge_ops(earlier, op);
                existing.sequence = self.sequence;
                debug!(location = %existing.location, "coalesced metadata write");
            }
            None => {
                let write = PendingWrite {
                    location,
                    op,
                    sequence: self.sequence,
                };
                self.pending.insert(key, write);
            }
        }
    }

    /// Number of distinct locations waiting to be written
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the deferred flush has been armed
    pub fn is_flush_registered(&self) -> bool {
        self.flush_registered
    }

    /// Apply every pending write once and mirror the results into the index
    ///
    /// Each location is processed at most once; a second call with nothing
    /// newly scheduled does nothing.
    pub async fn flush(&mut self, index: &mut CacheIndex) -> FlushReport {
        let writes: Vec<PendingWrite> = self.pending.drain(..).map(|(_, w)| w).collect();
        apply_writes(&self.store, writes, Some(index)).await
    }
}

impl Drop for WriteCoalescer {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let writes: Vec<PendingWrite> = self.pending.drain(..).map(|(_, w)| w).collect();
        let store = self.store.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(pending = writes.len(), "request ended without flushing, applying writes in background");
                handle.spawn(async move {
                    apply_writes(&store, writes, None).await;
                });
            }
            Err(_) => {
                warn!(pending = writes.len(), "no runtime available, pending metadata writes dropped");
            }
        }
    }
}

/// Combine two writes queued for the same location
///
/// A hit only adds to the earlier write's counters, so it never displaces a
/// queued artifact or deletion. A write after a deletion must replace the
/// stored row outright.
fn merge_ops(earlier: PendingOp, later: PendingOp) -> PendingOp {
    match (earlier, later) {
        (PendingOp::Delete, PendingOp::Upsert { delta, .. }) if !delta.is_write() => PendingOp::Delete,
        (PendingOp::Delete, PendingOp::Upsert { delta, values, .. }) => PendingOp::Upsert {
            delta,
            values,
            force: true,
        },
        (PendingOp::Upsert { delta: mut kept, values, force }, PendingOp::Upsert { delta, .. })
            if !delta.is_write() =>
        {
            kept.hits += delta.hits;
            PendingOp::Upsert { delta: kept, values, force }
        }
        (
            PendingOp::Upsert { delta: earlier, force: earlier_force, .. },
            PendingOp::Upsert { mut delta, values, force },
        ) => {
            delta.hits += earlier.hits;
            PendingOp::Upsert {
                delta,
                values,
                force: force || earlier_force,
            }
        }
        (_, PendingOp::Delete) => PendingOp::Delete,
    }
}

/// Apply writes one by one; a failing row never stops the batch
async fn apply_writes(
    store: &MetadataStoreRef,
    writes: Vec<PendingWrite>,
    mut index: Option<&mut CacheIndex>,
) -> FlushReport {
    let mut report = FlushReport::default();
    if writes.is_empty() {
        return report;
    }
    let now = Utc::now();

    for write in writes {
        let location = write.location;
        match write.op {
            PendingOp::Delete => match store.delete(&location).await {
                Ok(_) => {
                    report.deleted += 1;
                    if let Some(index) = index.as_deref_mut() {
                        index.remove(&location);
                    }
                }
                Err(e) => {
                    warn!(location = %location, error = %e, "metadata delete failed");
                    report.failed += 1;
                }
            },
            PendingOp::Upsert { delta, values, force } => {
                let existing = match store.find_one(&location).await {
                    Ok(existing) => existing,
                    Err(e) => {
                        warn!(location = %location, error = %e, "metadata read failed, skipping write");
                        report.failed += 1;
                        continue;
                    }
                };

                let (entry, is_update) = match existing {
                    Some(mut entry) => {
                        entry.apply(&delta, &values, force, now);
                        (entry, true)
                    }
                    None if !delta.is_write() => {
                        debug!(location = %location, "hit recorded for a missing row, skipping");
                        report.skipped += 1;
                        continue;
                    }
                    None => (CacheEntry::from_delta(location.clone(), &delta, values, now), false),
                };

                match store.upsert(&entry).await {
                    Ok(()) => {
                        if is_update {
                            report.updated += 1;
                        } else {
                            report.inserted += 1;
                        }
                        if let Some(index) = index.as_deref_mut() {
                            index.insert(entry);
                        }
                    }
                    Err(e) => {
                        warn!(location = %location, error = %e, "metadata upsert failed");
                        report.failed += 1;
                    }
                }
            }
        }
    }

    info!(
        inserted = report.inserted,
        updated = report.updated,
        deleted = report.deleted,
        failed = report.failed,
        "flushed cache metadata"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::MetadataStore;
    use crate::storage::MemoryMetadataStore;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn loc(file: &str) -> EntryLocation {
        EntryLocation::new("t1", "local", "cache", file)
    }

    fn values(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    fn setup() -> (Arc<MemoryMetadataStore>, WriteCoalescer, CacheIndex) {
        let store = Arc::new(MemoryMetadataStore::new());
        let writes = WriteCoalescer::new(store.clone());
        let index = CacheIndex::new(store.clone(), 100);
        (store, writes, index)
    }

    #[tokio::test]
    async fn test_same_path_coalesces_to_latest() {
        let (store, mut writes, mut index) = setup();

        for width in [100u64, 200, 300] {
            writes.schedule(
                loc("a.jpg"),
                StatsDelta::written(width, 1, None),
                values(json!({ "width": width })),
                false,
            );
        }
        assert_eq!(writes.pending_len(), 1);

        let report = writes.flush(&mut index).await;
        assert_eq!(report.inserted, 1);
        assert_eq!(store.upsert_calls(), 1);

        let row = store.find_one(&loc("a.jpg")).await.unwrap().unwrap();
        assert_eq!(row.stats.size_bytes, 300);
        assert_eq!(row.value_u32("width"), Some(300));

        // Mirrored into the index
        assert!(index.lookup(&loc("a.jpg")).await.is_some());
    }

    #[tokio::test]
    async fn test_flush_is_idempotent() {
        let (store, mut writes, mut index) = setup();
        writes.schedule(loc("a.jpg"), StatsDelta::written(10, 1, None), Map::new(), false);
        writes.schedule(loc("b.jpg"), StatsDelta::written(20, 1, None), Map::new(), false);

        let first = writes.flush(&mut index).await;
        assert_eq!(first.applied(), 2);
        let second = writes.flush(&mut index).await;
        assert_eq!(second, FlushReport::default());
        assert_eq!(store.upsert_calls(), 2);
    }

    #[tokio::test]
    async fn test_latch_registers_once() {
        let (_store, mut writes, mut index) = setup();
        assert!(!writes.is_flush_registered());
        writes.schedule(loc("a.jpg"), StatsDelta::written(10, 1, None), Map::new(), false);
        assert!(writes.is_flush_registered());
        writes.schedule(loc("b.jpg"), StatsDelta::written(10, 1, None), Map::new(), false);
        assert!(writes.is_flush_registered());
        writes.flush(&mut index).await;
    }

    #[tokio::test]
    async fn test_update_merges_and_force_replaces() {
        let (store, mut writes, mut index) = setup();
        writes.schedule(loc("a.jpg"), StatsDelta::written(100, 5, None), values(json!({"width": 1})), false);
        writes.flush(&mut index).await;

        writes.schedule(loc("a.jpg"), StatsDelta::hit(), Map::new(), false);
        let report = writes.flush(&mut index).await;
        assert_eq!(report.updated, 1);
        let row = store.find_one(&loc("a.jpg")).await.unwrap().unwrap();
        assert_eq!(row.stats.hits, 1);
        assert_eq!(row.stats.size_bytes, 100);

        writes.schedule(loc("a.jpg"), StatsDelta::written(50, 2, None), values(json!({"width": 2})), true);
        writes.flush(&mut index).await;
        let row = store.find_one(&loc("a.jpg")).await.unwrap().unwrap();
        assert_eq!(row.stats.hits, 0);
        assert_eq!(row.stats.total_size_bytes, 50);
        assert_eq!(row.value_u32("width"), Some(2));
    }

    #[tokio::test]
    async fn test_hit_for_missing_row_is_skipped() {
        let (store, mut writes, mut index) = setup();
        writes.schedule(loc("gone.jpg"), StatsDelta::hit(), Map::new(), false);
        let report = writes.flush(&mut index).await;
        assert_eq!(report.skipped, 1);
        assert_eq!(store.upsert_calls(), 0);
    }

    #[tokio::test]
    async fn test_delete_then_upsert_keeps_latest() {
        let (store, mut writes, mut index) = setup();
        writes.schedule_delete(loc("a.jpg"));
        writes.schedule(loc("a.jpg"), StatsDelta::written(10, 1, None), Map::new(), true);
        assert_eq!(writes.pending_len(), 1);
        writes.flush(&mut index).await;
        assert!(store.find_one(&loc("a.jpg")).await.unwrap().is_some());
        assert_eq!(store.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_batch() {
        let (store, mut writes, mut index) = setup();
        writes.schedule(loc("a.jpg"), StatsDelta::written(10, 1, None), Map::new(), false);
        writes.schedule(loc("b.jpg"), StatsDelta::written(10, 1, None), Map::new(), false);
        store.fail_path("cache/a.jpg");

        let report = writes.flush(&mut index).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.inserted, 1);
        assert!(store.find_one(&loc("b.jpg")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_hit_does_not_displace_forced_write() {
        let (store, mut writes, mut index) = setup();
        writes.schedule(loc("a.jpg"), StatsDelta::written(100, 5, None), values(json!({"width": 1})), false);
        writes.flush(&mut index).await;
        writes.schedule(loc("a.jpg"), StatsDelta::hit(), Map::new(), false);
        writes.flush(&mut index).await;

        writes.schedule(loc("a.jpg"), StatsDelta::written(40, 2, None), values(json!({"width": 2})), true);
        writes.schedule(loc("a.jpg"), StatsDelta::hit(), Map::new(), false);
        assert_eq!(writes.pending_len(), 1);
        writes.flush(&mut index).await;

        let row = store.find_one(&loc("a.jpg")).await.unwrap().unwrap();
        assert_eq!(row.stats.size_bytes, 40);
        assert_eq!(row.stats.total_size_bytes, 40);
        assert_eq!(row.stats.hits, 1);
        assert_eq!(row.value_u32("width"), Some(2));
    }

    #[tokio::test]
    async fn test_hit_after_delete_keeps_delete() {
        let (store, mut writes, mut index) = setup();
        writes.schedule(loc("a.jpg"), StatsDelta::written(10, 1, None), Map::new(), false);
        writes.flush(&mut index).await;

        writes.schedule_delete(loc("a.jpg"));
        writes.schedule(loc("a.jpg"), StatsDelta::hit(), Map::new(), false);
        let report = writes.flush(&mut index).await;

        assert_eq!(report.deleted, 1);
        assert!(store.find_one(&loc("a.jpg")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_after_delete_replaces_row() {
        let (store, mut writes, mut index) = setup();
        writes.schedule(loc("a.jpg"), StatsDelta::written(100, 5, None), values(json!({"width": 1})), false);
        writes.flush(&mut index).await;
        writes.schedule(loc("a.jpg"), StatsDelta::hit(), Map::new(), false);
        writes.flush(&mut index).await;

        writes.schedule_delete(loc("a.jpg"));
        writes.schedule(loc("a.jpg"), StatsDelta::written(30, 1, None), values(json!({"width": 3})), false);
        let pending = writes.pending.get(&loc("a.jpg").storage_key()).map(|w| w.op.clone());
        assert_matches!(pending, Some(PendingOp::Upsert { force: true, .. }));
        writes.flush(&mut index).await;

        let row = store.find_one(&loc("a.jpg")).await.unwrap().unwrap();
        assert_eq!(row.stats.hits, 0);
        assert_eq!(row.stats.total_size_bytes, 30);
        assert_eq!(row.value_u32("width"), Some(3));
    }

    #[tokio::test]
    async fn test_drop_applies_pending_writes() {
        let store = Arc::new(MemoryMetadataStore::new());
        {
            let mut writes = WriteCoalescer::new(store.clone());
            writes.schedule(loc("a.jpg"), StatsDelta::written(10, 1, None), Map::new(), false);
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("background flush never landed");
        assert!(store.find_one(&loc("a.jpg")).await.unwrap().is_some());
    }
}
