//! Cache Events
//!
//! Events emitted by the pipeline and the audit for monitoring.

use crate::cache::coalescer::FlushReport;
use crate::cache::entry::EntryLocation;
use serde::{Deserialize, Serialize};

/// Events emitted by the cache layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CacheEvent {
    /// Fresh artifact served from the fast path
    Hit {
        key: String,
        location: String,
    },

    /// Fast path found nothing usable
    Miss {
        key: String,
    },

    /// Transformed artifact written to storage
    Stored {
        key: String,
        location: String,
        size_bytes: u64,
        processing_ms: u64,
    },

    /// Artifact removed
    Evict {
        location: String,
        size_bytes: u64,
        reason: EvictionReason,
    },

    /// Audit created a row for a fresh file that had none
    Adopted {
        location: String,
        size_bytes: u64,
    },

    /// Audit deleted a row whose file is gone
    OrphanRemoved {
        location: String,
    },

    /// Request-end write batch applied
    FlushCompleted {
        applied: u64,
        skipped: u64,
        failed: u64,
    },
}

/// Reason for eviction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Duration elapsed
    Expired,
    /// Explicit refresh request
    Refresh,
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionReason::Expired => write!(f, "expired"),
            EvictionReason::Refresh => write!(f, "refresh"),
        }
    }
}

impl CacheEvent {
    /// Create a Hit event
    pub fn hit(key: &str, location: &EntryLocation) -> Self {
        CacheEvent::Hit {
            key: key.to_string(),
            location: location.to_string(),
        }
    }

    /// Create a Miss event
    pub fn miss(key: &str) -> Self {
        CacheEvent::Miss { key: key.to_string() }
    }

    /// Create a Stored event
    pub fn stored(key: &str, location: &EntryLocation, size_bytes: u64, processing_ms: u64) -> Self {
        CacheEvent::Stored {
            key: key.to_string(),
            location: location.to_string(),
            size_bytes,
            processing_ms,
        }
    }

    /// Create an Evict event
    pub fn evict(location: &EntryLocation, size_bytes: u64, reason: EvictionReason) -> Self {
        CacheEvent::Evict {
            location: location.to_string(),
            size_bytes,
            reason,
        }
    }

    /// Create a FlushCompleted event
    pub fn flushed(report: &FlushReport) -> Self {
        CacheEvent::FlushCompleted {
            applied: report.applied(),
            skipped: report.skipped,
            failed: report.failed,
        }
    }

    /// Short event name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            CacheEvent::Hit { .. } => "hit",
            CacheEvent::Miss { .. } => "miss",
            CacheEvent::Stored { .. } => "stored",
            CacheEvent::Evict { .. } => "evict",
            CacheEvent::Adopted { .. } => "adopted",
            CacheEvent::OrphanRemoved { .. } => "orphan_removed",
            CacheEvent::FlushCompleted { .. } => "flush_completed",
        }
    }

    /// Get the cache key associated with this event (if any)
    pub fn key(&self) -> Option<&str> {
        match self {
            CacheEvent::Hit { key, .. } => Some(key),
            CacheEvent::Miss { key } => Some(key),
            CacheEvent::Stored { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Check if this is an error event
    pub fn is_error(&self) -> bool {
        matches!(self, CacheEvent::FlushCompleted { failed, .. } if *failed > 0)
    }
}
