//! Cache Metrics
//!
//! Process-wide atomic counters shared by every request, plus the
//! per-request timing record returned with each result.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

// =============================================================================
// Process-Wide Counters
// =============================================================================

/// Counters shared across requests, aligned to keep them on one cache line
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Requests served from the fast path
    pub hits: AtomicU64,
    /// Requests that ran the full stage sequence
    pub misses: AtomicU64,
    /// Fast-path evaluations that failed and fell through
    pub fast_path_errors: AtomicU64,
    /// Transformation engine invocations
    pub transformations: AtomicU64,
    /// Metadata rows written or removed by flushes
    pub writes_flushed: AtomicU64,
    /// Metadata rows that failed to flush
    pub write_failures: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<CacheMetrics>() <= 64);

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fast_path_error(&self) {
        self.fast_path_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transformation(&self) {
        self.transformations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one flush
    #[inline]
    pub fn record_flush(&self, applied: u64, failed: u64) {
        self.writes_flushed.fetch_add(applied, Ordering::Relaxed);
        self.write_failures.fetch_add(failed, Ordering::Relaxed);
    }

    /// Create a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fast_path_errors: self.fast_path_errors.load(Ordering::Relaxed),
            transformations: self.transformations.load(Ordering::Relaxed),
            writes_flushed: self.writes_flushed.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }

    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        self.snapshot().hit_ratio()
    }
}

/// Point-in-time copy of [`CacheMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub fast_path_errors: u64,
    pub transformations: u64,
    pub writes_flushed: u64,
    pub write_failures: u64,
}

impl MetricsSnapshot {
    pub fn total_requests(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_ratio(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Per-Request Timing
// =============================================================================

/// Timing of one stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageTiming {
    pub stage: String,
    pub ms: f64,
}

/// Timings collected while processing one image
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    /// Wall time of the whole `process` call
    pub total_ms: f64,
    /// Time spent evaluating the fast path
    pub fast_path_ms: f64,
    /// Stage timings in execution order
    pub stages: Vec<StageTiming>,
}

impl PerformanceMetrics {
    pub fn record_stage(&mut self, stage: &str, started: Instant) {
        self.stages.push(StageTiming {
            stage: stage.to_string(),
            ms: elapsed_ms(started),
        });
    }

    /// Timing for a named stage, if it ran
    pub fn stage_ms(&self, stage: &str) -> Option<f64> {
        self.stages.iter().find(|t| t.stage == stage).map(|t| t.ms)
    }
}

/// Milliseconds since `started`
pub fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_line_alignment() {
        assert_eq!(std::mem::align_of::<CacheMetrics>(), 64);
    }

    #[test]
    fn test_counters() {
        let metrics = CacheMetrics::new();

        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        metrics.record_transformation();
        metrics.record_flush(3, 1);

        let snap = metrics.snapshot();
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.transformations, 1);
        assert_eq!(snap.writes_flushed, 3);
        assert_eq!(snap.write_failures, 1);
        assert!((metrics.hit_ratio() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_hit_ratio_empty() {
        assert_eq!(MetricsSnapshot::default().hit_ratio(), 0.0);
    }

    #[test]
    fn test_stage_timings() {
        let mut perf = PerformanceMetrics::default();
        perf.record_stage("init", Instant::now());
        perf.record_stage("output", Instant::now());

        assert_eq!(perf.stages.len(), 2);
        assert!(perf.stage_ms("init").is_some());
        assert!(perf.stage_ms("transform").is_none());
    }
}
