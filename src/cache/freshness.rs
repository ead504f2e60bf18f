//! Freshness Policy
//!
//! Decides whether a stored artifact is still valid for its duration.

use crate::cache::key::{CacheKey, PERPETUAL};
use chrono::{DateTime, Utc};

/// Validity rules for cached artifacts
#[derive(Debug, Clone, Copy, Default)]
pub struct FreshnessPolicy;

impl FreshnessPolicy {
    pub fn new() -> Self {
        Self
    }

    /// True if an artifact created at `created_at` is still fresh at `now`
    ///
    /// `-1` is perpetual; zero and every other negative duration are never
    /// fresh.
    pub fn is_fresh(&self, duration_seconds: i64, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if duration_seconds == PERPETUAL {
            return true;
        }
        if duration_seconds <= 0 {
            return false;
        }
        now.signed_duration_since(created_at).num_seconds() < duration_seconds
    }

    /// Duration embedded in a cache key or artifact file name
    pub fn decode_duration_from_key(&self, key_or_filename: &str) -> Option<i64> {
        CacheKey::from_filename(key_or_filename)
            .ok()
            .and_then(|key| key.duration())
    }
}
