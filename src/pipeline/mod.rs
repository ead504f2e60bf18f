//! Processing Pipeline
//!
//! Runs one image through `init -> load_source -> transform -> persist ->
//! output`, preceded by a fast path that serves fresh cached artifacts
//! without touching the source or the transformation engine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Pipeline::process                         │
//! │                                                                   │
//! │  begin_request() ──► RequestScope { CacheIndex, WriteCoalescer,   │
//! │                                     key memo }                    │
//! │        │                                                          │
//! │        ▼                                                          │
//! │  ┌───────────┐  hit                                               │
//! │  │ fast path │ ─────────────────────────────────► output          │
//! │  └───────────┘                                                    │
//! │        │ miss / error                                             │
//! │        ▼                                                          │
//! │  init ─► load_source ─► transform ─► persist ─► output            │
//! │                                         │                         │
//! │                                         ▼                         │
//! │                              WriteCoalescer::schedule             │
//! │        │                                                          │
//! │        ▼                                                          │
//! │  RequestScope::finish() ──► one flush to the MetadataStore        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod context;
pub mod fast_path;
pub mod format;
pub mod stages;

pub use context::{Output, OutputVariant, ProcessResult, ProcessingContext, RequestScope, ResolvedSource};
pub use fast_path::FastPathOutcome;
pub use stages::{default_stages, Stage, StageError, StageResult};

use crate::cache::audit::AuditEngine;
use crate::cache::events::CacheEvent;
use crate::cache::key::KeyDeriver;
use crate::cache::metrics::{elapsed_ms, CacheMetrics, MetricsSnapshot};
use crate::cache::params::{ParameterSet, TransformationalParameterFilter};
use crate::config::EngineConfig;
use crate::domain::ports::{FileStorageRef, MetadataStoreRef, ParameterClassifierRef, TransformationEngineRef};
use crate::error::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// Capacity of the event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Stage Environment
// =============================================================================

/// Collaborators shared by every request of a pipeline
pub struct StageEnv {
    pub config: EngineConfig,
    pub store: MetadataStoreRef,
    pub files: FileStorageRef,
    pub engine: TransformationEngineRef,
    pub deriver: KeyDeriver,
    pub metrics: Arc<CacheMetrics>,
    event_tx: broadcast::Sender<CacheEvent>,
}

impl StageEnv {
    /// Broadcast an event; dropped when nobody listens
    pub fn emit(&self, event: CacheEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Public URL of a path within a connection
    pub fn url_for(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        if base.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", base, path)
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// The processing pipeline
pub struct Pipeline {
    env: StageEnv,
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// Create a pipeline; the transformational set comes from the configuration
    pub fn new(
        config: EngineConfig,
        store: MetadataStoreRef,
        files: FileStorageRef,
        engine: TransformationEngineRef,
    ) -> Result<Self> {
        config.validate()?;
        let classifier: ParameterClassifierRef = Arc::new(TransformationalParameterFilter::new(
            config.transformational_parameters.iter().cloned(),
        ));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            env: StageEnv {
                config,
                store,
                files,
                engine,
                deriver: KeyDeriver::new(classifier),
                metrics: Arc::new(CacheMetrics::new()),
                event_tx,
            },
            stages: default_stages(),
        })
    }

    /// Use an externally maintained transformational parameter set
    pub fn with_classifier(mut self, classifier: ParameterClassifierRef) -> Self {
        self.env.deriver = KeyDeriver::new(classifier);
        self
    }

    /// Replace the stage sequence
    pub fn with_stages(mut self, stages: Vec<Box<dyn Stage>>) -> Self {
        self.stages = stages;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.env.config
    }

    /// Subscribe to cache events
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.env.event_tx.subscribe()
    }

    /// Process-wide counters
    pub fn metrics(&self) -> MetricsSnapshot {
        self.env.metrics.snapshot()
    }

    /// Audit engine over the pipeline's stores, emitting on its event channel
    pub fn audit_engine(&self) -> AuditEngine {
        AuditEngine::new(
            self.env.store.clone(),
            self.env.files.clone(),
            self.env.config.tenant.clone(),
        )
        .with_events(self.env.event_tx.clone())
    }

    /// Start a request
    pub fn begin_request(&self) -> RequestScope {
        RequestScope::new(self.env.store.clone(), &self.env.config, self.env.metrics.clone())
            .with_events(self.env.event_tx.clone())
    }

    /// Process one image as a complete request
    pub async fn process(&self, source: &str, params: ParameterSet) -> ProcessResult {
        let mut scope = self.begin_request();
        let result = self.process_in(&mut scope, source, params).await;
        scope.finish().await;
        result
    }

    /// Process one image inside an existing request
    ///
    /// Never fails: cache-layer problems fall back to the full stage
    /// sequence, and stage failures are reported in the result.
    pub async fn process_in(&self, scope: &mut RequestScope, source: &str, params: ParameterSet) -> ProcessResult {
        let started = Instant::now();
        let mut ctx = ProcessingContext::new(source, params, &self.env.config);

        if !ctx.refresh {
            let fp_started = Instant::now();
            let outcome = fast_path::evaluate(&self.env, scope, &mut ctx).await;
            ctx.perf.fast_path_ms = elapsed_ms(fp_started);

            match outcome {
                Ok(FastPathOutcome::Hit(output)) => {
                    self.env.metrics.record_hit();
                    ctx.cache_hit = true;
                    ctx.output = Some(output);
                    ctx.perf.total_ms = elapsed_ms(started);
                    return ctx.into_result(true);
                }
                Ok(FastPathOutcome::Miss) | Ok(FastPathOutcome::Bypassed) => {}
                Err(e) => {
                    warn!(source = %ctx.requested, error = %e, "fast path failed, running full pipeline");
                    self.env.metrics.record_fast_path_error();
                    ctx.reset_preparation();
                }
            }
        } else {
            debug!(source = %ctx.requested, "refresh requested, skipping fast path");
        }
        self.env.metrics.record_miss();

        let mut success = true;
        for stage in &self.stages {
            let stage_started = Instant::now();
            let outcome = stage.run(&self.env, scope, &mut ctx).await;
            ctx.perf.record_stage(stage.name(), stage_started);

            if let Err(e) = outcome {
                ctx.record_error(e.to_string());
                if e.critical {
                    error!(source = %ctx.requested, stage = e.stage, error = %e.error, "pipeline aborted");
                    success = false;
                    break;
                }
                warn!(source = %ctx.requested, stage = e.stage, error = %e.error, "stage failed, continuing");
            }
        }

        ctx.perf.total_ms = elapsed_ms(started);
        ctx.into_result(success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::EntryLocation;
    use crate::cache::key::CacheKey;
    use crate::config::SystemFallback;
    use crate::domain::ports::{FileStorage, MetadataStore, TransformationEngine, TransformedImage};
    use crate::engine::PassthroughEngine;
    use crate::error::Error;
    use crate::storage::{MemoryFileStorage, MemoryMetadataStore};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct CountingEngine {
        calls: AtomicU64,
    }

    impl CountingEngine {
        fn calls(&self) -> u64 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl TransformationEngine for CountingEngine {
        async fn apply(&self, source: Bytes, parameters: &ParameterSet) -> Result<TransformedImage> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            PassthroughEngine.apply(source, parameters).await
        }
    }

    struct FailingEngine;

    #[async_trait]
    impl TransformationEngine for FailingEngine {
        async fn apply(&self, _source: Bytes, _parameters: &ParameterSet) -> Result<TransformedImage> {
            Err(Error::TransformationFailure("decoder exploded".into()))
        }
    }

    struct Harness {
        pipeline: Pipeline,
        store: Arc<MemoryMetadataStore>,
        files: Arc<MemoryFileStorage>,
        engine: Arc<CountingEngine>,
    }

    fn harness(config: EngineConfig) -> Harness {
        let store = Arc::new(MemoryMetadataStore::new());
        let files = Arc::new(MemoryFileStorage::new());
        files.put("photo.jpg", "local", Bytes::from("jpeg-bytes"));
        let engine = Arc::new(CountingEngine::default());
        let pipeline = Pipeline::new(config, store.clone(), files.clone(), engine.clone()).unwrap();
        Harness {
            pipeline,
            store,
            files,
            engine,
        }
    }

    fn params() -> ParameterSet {
        ParameterSet::new().with("width", 400).with("cache", 600)
    }

    async fn row_for(h: &Harness, result: &ProcessResult) -> Option<crate::cache::entry::CacheEntry> {
        let path = result.output.as_ref()?.path.clone()?;
        let config = h.pipeline.config();
        h.store
            .find_one(&EntryLocation::from_path(config.tenant.clone(), config.connection.clone(), &path))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let h = harness(EngineConfig::default());

        let first = h.pipeline.process("photo.jpg", params()).await;
        assert!(first.success);
        assert!(!first.cache_hit);
        let key: CacheKey = first.cache_key.clone().unwrap().parse().unwrap();
        assert_eq!(key.identity(), "photo");
        assert_eq!(key.duration(), Some(600));

        let row = row_for(&h, &first).await.unwrap();
        assert!(row.stats.size_bytes > 0);
        assert_eq!(row.value_u32("width"), Some(400));
        assert!(h.files.exists(&row.path(), "local").await.unwrap());

        let second = h.pipeline.process("photo.jpg", params()).await;
        assert!(second.success);
        assert!(second.cache_hit);
        assert_eq!(second.cache_key, first.cache_key);
        assert_eq!(h.engine.calls(), 1);

        let output = second.output.unwrap();
        assert_eq!(output.width, Some(400));
        assert_eq!(output.mime_type, "image/jpeg");
        assert!(second.metrics.stages.is_empty());
    }

    #[tokio::test]
    async fn test_hits_are_counted() {
        let h = harness(EngineConfig::default());
        let first = h.pipeline.process("photo.jpg", params()).await;
        h.pipeline.process("photo.jpg", params()).await;
        h.pipeline.process("photo.jpg", params()).await;

        let row = row_for(&h, &first).await.unwrap();
        assert_eq!(row.stats.hits, 2);

        let metrics = h.pipeline.metrics();
        assert_eq!(metrics.hits, 2);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.transformations, 1);
    }

    #[tokio::test]
    async fn test_fast_path_survives_store_outage() {
        let h = harness(EngineConfig::default());
        h.pipeline.process("photo.jpg", params()).await;
        h.store.set_available(false);

        let result = h.pipeline.process("photo.jpg", params()).await;
        assert!(result.success);
        assert!(!result.cache_hit);
        assert!(result.output.is_some());
        assert_eq!(h.engine.calls(), 2);
        assert_eq!(h.pipeline.metrics().write_failures, 1);
    }

    #[tokio::test]
    async fn test_transformation_failure_is_critical() {
        let store = Arc::new(MemoryMetadataStore::new());
        let files = Arc::new(MemoryFileStorage::new());
        files.put("photo.jpg", "local", Bytes::from("jpeg-bytes"));
        let pipeline = Pipeline::new(
            EngineConfig::default(),
            store.clone(),
            files.clone(),
            Arc::new(FailingEngine),
        )
        .unwrap();

        let result = pipeline.process("photo.jpg", params()).await;
        assert!(!result.success);
        assert!(result.output.is_none());
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("transform"));
        assert!(result.metrics.stage_ms("persist").is_none());
        assert!(store.is_empty());
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_source_without_fallback_fails() {
        let h = harness(EngineConfig::default());
        let result = h.pipeline.process("nope.jpg", params()).await;
        assert!(!result.success);
        assert!(result.errors[0].contains("Source not found"));
        assert_eq!(h.engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_explicit_fallback_source() {
        let h = harness(EngineConfig::default());
        h.files.put("alt.png", "local", Bytes::from("png-bytes"));

        let result = h
            .pipeline
            .process("nope.jpg", params().with("fallback", "alt.png"))
            .await;
        assert!(result.success);
        let key: CacheKey = result.cache_key.unwrap().parse().unwrap();
        assert_eq!(key.identity(), "alt");
        assert_eq!(result.output.unwrap().format, "png");
    }

    #[tokio::test]
    async fn test_color_fill_is_not_cached() {
        let mut config = EngineConfig::default();
        config.system_fallback = Some(SystemFallback::ColorFill {
            color: "#ff0000".into(),
        });
        let h = harness(config);

        let mut scope = h.pipeline.begin_request();
        let result = h.pipeline.process_in(&mut scope, "", params()).await;
        assert!(result.success);
        assert!(!result.cache_hit);
        assert!(result.cache_key.is_none());
        assert_eq!(result.output.unwrap().color.as_deref(), Some("#ff0000"));
        assert_eq!(scope.pending_writes(), 0);
        scope.finish().await;
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_cache_zero_skips_persistence() {
        let h = harness(EngineConfig::default());
        let no_cache = ParameterSet::new().with("width", 400).with("cache", 0);

        let first = h.pipeline.process("photo.jpg", no_cache.clone()).await;
        assert!(first.success);
        assert!(first.output.unwrap().path.is_none());
        assert!(h.store.is_empty());

        let second = h.pipeline.process("photo.jpg", no_cache).await;
        assert!(!second.cache_hit);
        assert_eq!(h.engine.calls(), 2);
    }

    #[tokio::test]
    async fn test_refresh_recomputes_and_replaces() {
        let h = harness(EngineConfig::default());
        let first = h.pipeline.process("photo.jpg", params()).await;
        h.pipeline.process("photo.jpg", params()).await;

        let refreshed = h
            .pipeline
            .process("photo.jpg", params().with("refresh", true))
            .await;
        assert!(refreshed.success);
        assert!(!refreshed.cache_hit);
        assert_eq!(h.engine.calls(), 2);

        // refresh is not transformational, so the key is unchanged
        assert_eq!(refreshed.cache_key, first.cache_key);
        let row = row_for(&h, &first).await.unwrap();
        assert_eq!(row.stats.hits, 0);
        assert_eq!(row.stats.total_size_bytes, row.stats.size_bytes);
    }

    #[tokio::test]
    async fn test_stale_entry_is_recomputed_with_new_age() {
        let h = harness(EngineConfig::default());
        let first = h.pipeline.process("photo.jpg", params()).await;

        let mut row = row_for(&h, &first).await.unwrap();
        row.stats.inception = Utc::now() - Duration::seconds(1000);
        h.store.upsert(&row).await.unwrap();

        let stale = h.pipeline.process("photo.jpg", params()).await;
        assert!(stale.success);
        assert!(!stale.cache_hit);
        assert_eq!(h.engine.calls(), 2);

        let row = row_for(&h, &first).await.unwrap();
        assert!(Utc::now() - row.stats.inception < Duration::seconds(60));

        let fresh = h.pipeline.process("photo.jpg", params()).await;
        assert!(fresh.cache_hit);
        assert_eq!(h.engine.calls(), 2);
    }

    async fn refresh_then_reuse(config: EngineConfig) {
        let h = harness(config);
        let first = h.pipeline.process("photo.jpg", params()).await;
        h.pipeline.process("photo.jpg", params()).await;
        let mut row = row_for(&h, &first).await.unwrap();
        assert_eq!(row.stats.hits, 1);
        row.stats.inception = Utc::now() - Duration::seconds(300);
        h.store.upsert(&row).await.unwrap();

        let mut scope = h.pipeline.begin_request();
        let refreshed = h
            .pipeline
            .process_in(&mut scope, "photo.jpg", params().with("refresh", true))
            .await;
        assert!(refreshed.success);
        let again = h.pipeline.process_in(&mut scope, "photo.jpg", params()).await;
        assert!(again.success);
        assert!(!again.cache_hit);
        assert_eq!(scope.pending_writes(), 1);
        scope.finish().await;

        let row = row_for(&h, &first).await.unwrap();
        assert_eq!(row.stats.hits, 0);
        assert!(Utc::now() - row.stats.inception < Duration::seconds(60));
        assert_eq!(h.engine.calls(), 3);
    }

    #[tokio::test]
    async fn test_refresh_survives_second_pass_eager() {
        refresh_then_reuse(EngineConfig::default()).await;
    }

    #[tokio::test]
    async fn test_refresh_survives_second_pass_selective() {
        let mut config = EngineConfig::default();
        config.entry_count_hint = Some(u64::MAX);
        refresh_then_reuse(config).await;
    }

    #[tokio::test]
    async fn test_one_request_shares_memo_and_writes() {
        let h = harness(EngineConfig::default());
        let mut scope = h.pipeline.begin_request();

        let a = h.pipeline.process_in(&mut scope, "photo.jpg", params()).await;
        let b = h.pipeline.process_in(&mut scope, "photo.jpg", params()).await;
        assert_eq!(a.cache_key, b.cache_key);
        assert_eq!(scope.memoized(), 1);
        assert_eq!(scope.pending_writes(), 1);

        let report = scope.finish().await;
        assert_eq!(report.inserted, 1);
        assert_eq!(h.store.upsert_calls(), 1);
    }

    #[tokio::test]
    async fn test_responsive_variants_must_all_exist() {
        let mut config = EngineConfig::default();
        config.responsive_widths = vec![320, 640];
        let h = harness(config);
        let responsive = params().with("responsive", true);

        let first = h.pipeline.process("photo.jpg", responsive.clone()).await;
        assert!(first.success);
        let variants = first.output.as_ref().unwrap().variants.clone();
        assert_eq!(variants.len(), 2);
        assert_eq!(h.store.len(), 3);

        let second = h.pipeline.process("photo.jpg", responsive.clone()).await;
        assert!(second.cache_hit);
        assert_eq!(second.output.unwrap().variants, variants);

        let variant_key: CacheKey = variants[0].cache_key.parse().unwrap();
        let variant_loc = EntryLocation::new("default", "local", "cache", variant_key.filename("jpg"));
        assert!(h.store.delete(&variant_loc).await.unwrap());

        let third = h.pipeline.process("photo.jpg", responsive).await;
        assert!(!third.cache_hit);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let h = harness(EngineConfig::default());
        let mut rx = h.pipeline.subscribe();

        h.pipeline.process("photo.jpg", params()).await;
        h.pipeline.process("photo.jpg", params()).await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        assert_eq!(
            kinds,
            vec!["miss", "stored", "flush_completed", "hit", "flush_completed"]
        );
    }

    #[tokio::test]
    async fn test_audit_through_pipeline() {
        let h = harness(EngineConfig::default());
        h.pipeline.process("photo.jpg", params()).await;

        let result = h
            .pipeline
            .audit_engine()
            .audit_location("local", "cache")
            .await
            .unwrap();
        assert_eq!(result.files_scanned, 1);
        assert_eq!(result.db_entries, 1);
        assert!(result.is_noop());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.max_name_length = 0;
        let result = Pipeline::new(
            config,
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(MemoryFileStorage::new()),
            Arc::new(PassthroughEngine),
        );
        assert_matches!(result.err(), Some(Error::Configuration(_)));
    }

    #[test]
    fn test_url_for() {
        let mut config = EngineConfig::default();
        config.base_url = "https://cdn.example.com/".into();
        let h = harness(config);
        assert_eq!(
            h.pipeline.env.url_for("/cache/a.jpg"),
            "https://cdn.example.com/cache/a.jpg"
        );
    }
}
