//! Request Scope and Processing Context
//!
//! A `RequestScope` holds everything that lives for exactly one inbound
//! request: the cache index, the pending metadata writes and the key memo
//! table. A `ProcessingContext` is the mutable state of one image moving
//! through the stages.

use crate::cache::coalescer::{FlushReport, WriteCoalescer};
use crate::cache::entry::EntryLocation;
use crate::cache::events::CacheEvent;
use crate::cache::index::CacheIndex;
use crate::cache::key::{CacheKey, KeyDeriver, KeyFlags};
use crate::cache::metrics::{CacheMetrics, PerformanceMetrics};
use crate::cache::params::{names, ParameterSet};
use crate::config::EngineConfig;
use crate::domain::ports::{MetadataStoreRef, TransformedImage};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

// =============================================================================
// Request Scope
// =============================================================================

/// State owned by one request; never shared between requests
pub struct RequestScope {
    pub(crate) index: CacheIndex,
    pub(crate) writes: WriteCoalescer,
    memo: HashMap<String, CacheKey>,
    metrics: Arc<CacheMetrics>,
    event_tx: Option<broadcast::Sender<CacheEvent>>,
}

impl RequestScope {
    pub fn new(store: MetadataStoreRef, config: &EngineConfig, metrics: Arc<CacheMetrics>) -> Self {
        Self {
            index: CacheIndex::new(store.clone(), config.eager_load_threshold)
                .with_entry_count_hint(config.entry_count_hint),
            writes: WriteCoalescer::new(store),
            memo: HashMap::new(),
            metrics,
            event_tx: None,
        }
    }

    pub(crate) fn with_events(mut self, event_tx: broadcast::Sender<CacheEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Derive a key, reusing an earlier result for identical inputs
    pub fn derive_key(
        &mut self,
        deriver: &KeyDeriver,
        locator: &str,
        params: &ParameterSet,
        flags: &KeyFlags,
    ) -> CacheKey {
        let fingerprint = KeyDeriver::fingerprint(locator, params, flags);
        if let Some(key) = self.memo.get(&fingerprint) {
            debug!(key = %key, "memoized cache key");
            return key.clone();
        }
        let key = deriver.derive(locator, params, flags);
        self.memo.insert(fingerprint, key.clone());
        key
    }

    /// Number of memoized keys
    pub fn memoized(&self) -> usize {
        self.memo.len()
    }

    /// Metadata writes waiting for the end of the request
    pub fn pending_writes(&self) -> usize {
        self.writes.pending_len()
    }

    pub fn index(&self) -> &CacheIndex {
        &self.index
    }

    /// End the request: apply pending writes once
    pub async fn finish(mut self) -> FlushReport {
        let report = self.writes.flush(&mut self.index).await;
        self.metrics.record_flush(report.applied(), report.failed);
        if report != FlushReport::default() {
            if let Some(tx) = &self.event_tx {
                let _ = tx.send(CacheEvent::flushed(&report));
            }
        }
        report
    }
}

// =============================================================================
// Output
// =============================================================================

/// One responsive variant of an output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputVariant {
    pub width: u32,
    pub url: String,
    pub cache_key: String,
}

/// What a caller renders
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Output {
    /// Public URL of the artifact, or of the source when nothing was stored
    pub url: String,
    /// Artifact path within the connection, when one was stored
    pub path: Option<String>,
    pub format: String,
    pub mime_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub size_bytes: u64,
    /// Solid colour when a colour-fill fallback was used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<OutputVariant>,
}

/// Result of processing one image
#[derive(Debug, Clone, Serialize)]
pub struct ProcessResult {
    pub success: bool,
    pub output: Option<Output>,
    pub cache_key: Option<String>,
    pub cache_hit: bool,
    pub metrics: PerformanceMetrics,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

// =============================================================================
// Processing Context
// =============================================================================

/// Where the image comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    /// A stored source at a locator
    Locator { locator: String, fallback_used: bool },
    /// A solid colour canvas; has no static source
    ColorFill { color: String },
}

/// A responsive variant planned or produced for a request
#[derive(Debug, Clone)]
pub struct VariantPlan {
    pub width: u32,
    pub key: CacheKey,
    pub location: EntryLocation,
    pub image: Option<TransformedImage>,
}

/// Mutable state of one image moving through the pipeline
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    /// Locator as requested
    pub requested: String,
    pub params: ParameterSet,
    /// Explicit cache-bust requested
    pub refresh: bool,
    /// Responsive variants requested
    pub responsive: bool,
    /// Connection artifacts are written to
    pub connection: String,

    // Filled by preparation (fast path or init)
    pub source: Option<ResolvedSource>,
    pub format: String,
    pub key: Option<CacheKey>,
    pub location: Option<EntryLocation>,
    pub variants: Vec<VariantPlan>,

    // Filled by the full stage sequence
    pub source_bytes: Option<Bytes>,
    pub image: Option<TransformedImage>,
    pub processing_ms: u64,
    pub stored: bool,
    pub output: Option<Output>,

    pub cache_hit: bool,
    pub errors: Vec<String>,
    pub perf: PerformanceMetrics,
}

impl ProcessingContext {
    pub fn new(requested: &str, params: ParameterSet, config: &EngineConfig) -> Self {
        let connection = params
            .text(names::CONNECTION)
            .unwrap_or_else(|| config.connection.clone());
        Self {
            requested: requested.trim().to_string(),
            refresh: params.flag(names::REFRESH),
            responsive: params.flag(names::RESPONSIVE) && !config.responsive_widths.is_empty(),
            params,
            connection,
            source: None,
            format: String::new(),
            key: None,
            location: None,
            variants: Vec::new(),
            source_bytes: None,
            image: None,
            processing_ms: 0,
            stored: false,
            output: None,
            cache_hit: false,
            errors: Vec::new(),
            perf: PerformanceMetrics::default(),
        }
    }

    /// Whether the source, format and key have been worked out
    pub fn is_prepared(&self) -> bool {
        self.source.is_some()
    }

    /// Forget preparation so it is redone from scratch
    pub fn reset_preparation(&mut self) {
        self.source = None;
        self.format.clear();
        self.key = None;
        self.location = None;
        self.variants.clear();
    }

    /// Locator of the source actually used, if any
    pub fn locator(&self) -> Option<&str> {
        match &self.source {
            Some(ResolvedSource::Locator { locator, .. }) => Some(locator),
            _ => None,
        }
    }

    pub fn is_color_fill(&self) -> bool {
        matches!(self.source, Some(ResolvedSource::ColorFill { .. }))
    }

    pub fn fallback_used(&self) -> bool {
        matches!(
            self.source,
            Some(ResolvedSource::Locator { fallback_used: true, .. })
        )
    }

    /// Requested duration of the primary key
    pub fn duration(&self) -> Option<i64> {
        self.key.as_ref().and_then(CacheKey::duration)
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Convert into the caller-facing result
    pub fn into_result(self, success: bool) -> ProcessResult {
        ProcessResult {
            success,
            output: if success { self.output } else { None },
            cache_key: self.key.map(|k| k.to_string()),
            cache_hit: self.cache_hit,
            metrics: self.perf,
            errors: self.errors,
        }
    }
}
