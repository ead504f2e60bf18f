//! Cache Entry Types
//!
//! Defines where a cached artifact lives, its statistics and the opaque
//! output values recorded alongside it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// =============================================================================
// Path Normalization
// =============================================================================

/// Normalize a storage path: forward slashes, no empty or `.` segments,
/// no leading or trailing slash
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Split a path into (directory, filename) after normalizing it
pub fn split_path(path: &str) -> (String, String) {
    let normalized = normalize_path(path);
    match normalized.rsplit_once('/') {
        Some((dir, file)) => (dir.to_string(), file.to_string()),
        None => (String::new(), normalized),
    }
}

/// Join a directory and filename into a normalized path
pub fn join_path(directory: &str, filename: &str) -> String {
    normalize_path(&format!("{}/{}", directory, filename))
}

// =============================================================================
// Entry Location
// =============================================================================

/// Identity of one cached artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryLocation {
    /// Tenant id
    pub tenant: String,
    /// Storage connection / target name
    pub connection: String,
    /// Normalized directory
    pub directory: String,
    /// File name within the directory
    pub filename: String,
}

impl EntryLocation {
    pub fn new(
        tenant: impl Into<String>,
        connection: impl Into<String>,
        directory: &str,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            connection: connection.into(),
            directory: normalize_path(directory),
            filename: filename.into(),
        }
    }

    /// Build from a full path within a connection
    pub fn from_path(tenant: impl Into<String>, connection: impl Into<String>, path: &str) -> Self {
        let (directory, filename) = split_path(path);
        Self {
            tenant: tenant.into(),
            connection: connection.into(),
            directory,
            filename,
        }
    }

    /// Normalized full path within the connection
    pub fn path(&self) -> String {
        join_path(&self.directory, &self.filename)
    }

    /// Key used by stores that flatten locations into strings
    pub fn storage_key(&self) -> String {
        format!("{}:{}:{}", self.tenant, self.connection, self.path())
    }
}

impl fmt::Display for EntryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

// =============================================================================
// Entry Statistics
// =============================================================================

/// Statistics recorded for a cached artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStats {
    /// When the artifact was (re)created
    pub inception: DateTime<Utc>,
    /// Number of cache hits served
    pub hits: u64,
    /// Size of the latest artifact in bytes
    pub size_bytes: u64,
    /// Processing time of the latest transformation
    pub processing_ms: u64,
    /// Cumulative bytes written for this entry
    pub total_size_bytes: u64,
    /// Cumulative processing time for this entry
    pub total_processing_ms: u64,
    /// Source the artifact was derived from
    pub source_path: Option<String>,
}

impl EntryStats {
    /// Fresh statistics for a newly written artifact
    pub fn new(inception: DateTime<Utc>, size_bytes: u64, processing_ms: u64) -> Self {
        Self {
            inception,
            hits: 0,
            size_bytes,
            processing_ms,
            total_size_bytes: size_bytes,
            total_processing_ms: processing_ms,
            source_path: None,
        }
    }
}

/// Change to apply to an entry's statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsDelta {
    /// Hits to add
    pub hits: u64,
    /// Newly written bytes (zero when nothing was written)
    pub size_bytes: u64,
    /// Newly spent processing time
    pub processing_ms: u64,
    /// Source path, when known
    pub source_path: Option<String>,
}

impl StatsDelta {
    /// Delta for a freshly written artifact
    pub fn written(size_bytes: u64, processing_ms: u64, source_path: Option<String>) -> Self {
        Self {
            hits: 0,
            size_bytes,
            processing_ms,
            source_path,
        }
    }

    /// Delta for a served cache hit
    pub fn hit() -> Self {
        Self {
            hits: 1,
            ..Default::default()
        }
    }

    /// True when the delta records a new artifact rather than only hits
    pub fn is_write(&self) -> bool {
        self.size_bytes > 0 || self.processing_ms > 0
    }
}

// =============================================================================
// Cache Entry
// =============================================================================

/// One cached artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Where the artifact lives
    pub location: EntryLocation,
    /// Statistics blob
    pub stats: EntryStats,
    /// Opaque output variables (final width/height, format, ...)
    pub values: Map<String, Value>,
}

impl CacheEntry {
    pub fn new(location: EntryLocation, stats: EntryStats, values: Map<String, Value>) -> Self {
        Self {
            location,
            stats,
            values,
        }
    }

    /// Create an entry from a first write
    pub fn from_delta(
        location: EntryLocation,
        delta: &StatsDelta,
        values: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut stats = EntryStats::new(now, delta.size_bytes, delta.processing_ms);
        stats.hits = delta.hits;
        stats.source_path = delta.source_path.clone();
        Self::new(location, stats, values)
    }

    /// Apply a delta to an existing entry
    ///
    /// A forced write replaces statistics and values. Otherwise counters
    /// accumulate and value keys are merged. Any write means a new artifact
    /// was stored, so its age restarts at `now`; a hit keeps the inception.
    pub fn apply(&mut self, delta: &StatsDelta, values: &Map<String, Value>, force: bool, now: DateTime<Utc>) {
        if force {
            let mut stats = EntryStats::new(now, delta.size_bytes, delta.processing_ms);
            stats.hits = delta.hits;
            stats.source_path = delta
                .source_path
                .clone()
                .or_else(|| self.stats.source_path.clone());
            self.stats = stats;
            self.values = values.clone();
            return;
        }

        self.stats.hits += delta.hits;
        if delta.is_write() {
            self.stats.inception = now;
            self.stats.size_bytes = delta.size_bytes;
            self.stats.processing_ms = delta.processing_ms;
            self.stats.total_size_bytes += delta.size_bytes;
            self.stats.total_processing_ms += delta.processing_ms;
        }
        if delta.source_path.is_some() {
            self.stats.source_path = delta.source_path.clone();
        }
        for (k, v) in values {
            self.values.insert(k.clone(), v.clone());
        }
    }

    /// Normalized full path of the artifact
    pub fn path(&self) -> String {
        self.location.path()
    }

    /// Integer output value, e.g. `width`
    pub fn value_u32(&self, name: &str) -> Option<u32> {
        self.values
            .get(name)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn values(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/cache//thumbs/"), "cache/thumbs");
        assert_eq!(normalize_path("cache\\a\\b.jpg"), "cache/a/b.jpg");
        assert_eq!(normalize_path("./cache/./x"), "cache/x");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn test_split_and_join() {
        assert_eq!(split_path("/cache/a.jpg"), ("cache".into(), "a.jpg".into()));
        assert_eq!(split_path("a.jpg"), ("".into(), "a.jpg".into()));
        assert_eq!(join_path("", "a.jpg"), "a.jpg");
        assert_eq!(join_path("cache/", "a.jpg"), "cache/a.jpg");

        let loc = EntryLocation::from_path("1", "local", "cache/x/a.jpg");
        assert_eq!(loc.directory, "cache/x");
        assert_eq!(loc.filename, "a.jpg");
        assert_eq!(loc.path(), "cache/x/a.jpg");
        assert_eq!(loc.storage_key(), "1:local:cache/x/a.jpg");
    }

    #[test]
    fn test_apply_accumulates() {
        let now = Utc::now();
        let loc = EntryLocation::new("1", "local", "cache", "a.jpg");
        let mut entry = CacheEntry::from_delta(
            loc,
            &StatsDelta::written(100, 20, Some("photo.jpg".into())),
            values(json!({"width": 400})),
            now,
        );

        entry.apply(&StatsDelta::hit(), &Map::new(), false, now + Duration::seconds(5));
        assert_eq!(entry.stats.inception, now);
        entry.apply(
            &StatsDelta::written(120, 10, None),
            &values(json!({"height": 300})),
            false,
            now + Duration::seconds(10),
        );

        assert_eq!(entry.stats.inception, now + Duration::seconds(10));
        assert_eq!(entry.stats.hits, 1);
        assert_eq!(entry.stats.size_bytes, 120);
        assert_eq!(entry.stats.total_size_bytes, 220);
        assert_eq!(entry.stats.total_processing_ms, 30);
        assert_eq!(entry.stats.source_path.as_deref(), Some("photo.jpg"));
        assert_eq!(entry.value_u32("width"), Some(400));
        assert_eq!(entry.value_u32("height"), Some(300));
    }

    #[test]
    fn test_forced_apply_replaces() {
        let now = Utc::now();
        let later = now + Duration::seconds(60);
        let loc = EntryLocation::new("1", "local", "cache", "a.jpg");
        let mut entry = CacheEntry::from_delta(
            loc,
            &StatsDelta::written(100, 20, Some("photo.jpg".into())),
            values(json!({"width": 400, "height": 300})),
            now,
        );
        entry.stats.hits = 7;

        entry.apply(
            &StatsDelta::written(50, 5, None),
            &values(json!({"width": 200})),
            true,
            later,
        );

        assert_eq!(entry.stats.inception, later);
        assert_eq!(entry.stats.hits, 0);
        assert_eq!(entry.stats.total_size_bytes, 50);
        assert_eq!(entry.stats.source_path.as_deref(), Some("photo.jpg"));
        assert_eq!(entry.value_u32("width"), Some(200));
        assert_eq!(entry.value_u32("height"), None);
    }
}
