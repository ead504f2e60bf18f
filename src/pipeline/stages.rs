//! Pipeline Stages
//!
//! `init -> load_source -> transform -> persist -> output`. A stage reports
//! a critical error to abort the sequence, or a recoverable one that is
//! recorded while the sequence carries on to `output`.

use crate::cache::entry::{EntryLocation, StatsDelta};
use crate::cache::events::{CacheEvent, EvictionReason};
use crate::cache::params::names;
use crate::domain::ports::TransformedImage;
use crate::error::{Error, Result};
use crate::pipeline::context::{Output, OutputVariant, ProcessingContext, RequestScope, ResolvedSource};
use crate::pipeline::fast_path::{candidates_for, prepare, prepare_with};
use crate::pipeline::format::mime_type;
use crate::pipeline::StageEnv;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::Instant;
use tracing::{debug, info, warn};

// =============================================================================
// Stage Error
// =============================================================================

/// Failure reported by a stage
#[derive(Debug)]
pub struct StageError {
    pub stage: &'static str,
    /// Abort the remaining stages
    pub critical: bool,
    pub error: Error,
}

impl StageError {
    pub fn critical(stage: &'static str, error: Error) -> Self {
        Self {
            stage,
            critical: true,
            error,
        }
    }

    pub fn recoverable(stage: &'static str, error: Error) -> Self {
        Self {
            stage,
            critical: false,
            error,
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.error)
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

pub type StageResult = std::result::Result<(), StageError>;

// =============================================================================
// Stage Trait
// =============================================================================

/// One step of the full processing sequence
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, env: &StageEnv, scope: &mut RequestScope, ctx: &mut ProcessingContext) -> StageResult;
}

/// The standard stage sequence
pub fn default_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(InitStage),
        Box::new(LoadSourceStage),
        Box::new(TransformStage),
        Box::new(PersistStage),
        Box::new(OutputStage),
    ]
}

// =============================================================================
// Init
// =============================================================================

/// Resolves source, format and key; applies explicit cache-busting
pub struct InitStage;

#[async_trait]
impl Stage for InitStage {
    fn name(&self) -> &'static str {
        "init"
    }

    async fn run(&self, env: &StageEnv, scope: &mut RequestScope, ctx: &mut ProcessingContext) -> StageResult {
        if !ctx.is_prepared() {
            prepare(env, scope, ctx).map_err(|e| StageError::critical(self.name(), e))?;
        }

        if ctx.refresh {
            let mut targets: Vec<_> = ctx.location.iter().cloned().collect();
            targets.extend(ctx.variants.iter().map(|v| v.location.clone()));
            for location in targets {
                let removed = scope.index.invalidate(&location, &mut scope.writes);
                let size = removed.map(|e| e.stats.size_bytes).unwrap_or(0);
                env.emit(CacheEvent::evict(&location, size, EvictionReason::Refresh));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Load Source
// =============================================================================

/// Reads the source bytes, moving down the fallback chain on failure
pub struct LoadSourceStage;

#[async_trait]
impl Stage for LoadSourceStage {
    fn name(&self) -> &'static str {
        "load_source"
    }

    async fn run(&self, env: &StageEnv, scope: &mut RequestScope, ctx: &mut ProcessingContext) -> StageResult {
        let Some(current) = ctx.source.clone() else {
            return Err(StageError::critical(
                self.name(),
                Error::Internal("source not resolved".into()),
            ));
        };
        if matches!(current, ResolvedSource::ColorFill { .. }) {
            return Ok(());
        }

        let candidates = candidates_for(env, ctx);
        let start = candidates.iter().position(|c| *c == current).unwrap_or(0);

        for candidate in candidates.into_iter().skip(start) {
            let locator = match &candidate {
                ResolvedSource::Locator { locator, .. } => Some(locator.clone()),
                ResolvedSource::ColorFill { .. } => None,
            };
            let Some(locator) = locator else {
                debug!(requested = %ctx.requested, "no readable source, using colour fill");
                prepare_with(env, scope, ctx, candidate);
                return Ok(());
            };

            match env.files.read(&locator, &env.config.source_connection).await {
                Ok(bytes) if !bytes.is_empty() => {
                    if candidate != current {
                        debug!(requested = %ctx.requested, fallback = %locator, "using fallback source");
                        prepare_with(env, scope, ctx, candidate);
                    }
                    ctx.source_bytes = Some(bytes);
                    return Ok(());
                }
                Ok(_) => warn!(locator = %locator, "source is empty"),
                Err(e) => warn!(locator = %locator, error = %e, "source unreadable"),
            }
        }

        Err(StageError::critical(
            self.name(),
            Error::SourceNotFound {
                locator: ctx.requested.clone(),
            },
        ))
    }
}

// =============================================================================
// Transform
// =============================================================================

/// Invokes the transformation engine; only reached on a cache miss
pub struct TransformStage;

fn transformation_error(e: Error) -> Error {
    match e {
        Error::TransformationFailure(_) => e,
        other => Error::TransformationFailure(other.to_string()),
    }
}

#[async_trait]
impl Stage for TransformStage {
    fn name(&self) -> &'static str {
        "transform"
    }

    async fn run(&self, env: &StageEnv, _scope: &mut RequestScope, ctx: &mut ProcessingContext) -> StageResult {
        if ctx.is_color_fill() {
            return Ok(());
        }
        let Some(source) = ctx.source_bytes.clone() else {
            return Err(StageError::critical(
                self.name(),
                Error::Internal("source bytes not loaded".into()),
            ));
        };

        let started = Instant::now();
        let image = env
            .engine
            .apply(source.clone(), &ctx.params)
            .await
            .map_err(|e| StageError::critical(self.name(), transformation_error(e)))?;
        env.metrics.record_transformation();
        ctx.image = Some(image);

        let mut failures = Vec::new();
        for variant in ctx.variants.iter_mut() {
            let params = ctx.params.with_override("width", variant.width);
            match env.engine.apply(source.clone(), &params).await {
                Ok(image) => {
                    env.metrics.record_transformation();
                    variant.image = Some(image);
                }
                Err(e) => {
                    warn!(width = variant.width, error = %e, "responsive variant failed");
                    failures.push(format!("variant {}: {}", variant.width, e));
                }
            }
        }
        ctx.processing_ms = started.elapsed().as_millis() as u64;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(StageError::recoverable(
                self.name(),
                Error::TransformationFailure(failures.join("; ")),
            ))
        }
    }
}

// =============================================================================
// Persist
// =============================================================================

/// Stores artifacts and schedules their metadata
pub struct PersistStage;

fn output_values(image: &TransformedImage, format: &str) -> Map<String, Value> {
    let mut values = Map::new();
    if let Some(width) = image.width {
        values.insert("width".into(), json!(width));
    }
    if let Some(height) = image.height {
        values.insert("height".into(), json!(height));
    }
    values.insert(names::FORMAT.into(), json!(format));
    values
}

impl PersistStage {
    async fn store(
        &self,
        env: &StageEnv,
        scope: &mut RequestScope,
        ctx: &ProcessingContext,
        location: &EntryLocation,
        key: &str,
        image: &TransformedImage,
    ) -> Result<()> {
        let path = location.path();
        env.files
            .write(&path, &location.connection, Bytes::clone(&image.bytes))
            .await?;

        let size = image.bytes.len() as u64;
        let delta = StatsDelta::written(size, ctx.processing_ms, ctx.locator().map(str::to_string));
        scope.writes.schedule(
            location.clone(),
            delta,
            output_values(image, &ctx.format),
            ctx.refresh,
        );
        env.emit(CacheEvent::stored(key, location, size, ctx.processing_ms));
        debug!(key, path = %path, size, "stored artifact");
        Ok(())
    }
}

#[async_trait]
impl Stage for PersistStage {
    fn name(&self) -> &'static str {
        "persist"
    }

    async fn run(&self, env: &StageEnv, scope: &mut RequestScope, ctx: &mut ProcessingContext) -> StageResult {
        if ctx.is_color_fill() {
            debug!("colour fill output is not cached");
            return Ok(());
        }
        let (Some(key), Some(location), Some(image)) = (ctx.key.clone(), ctx.location.clone(), ctx.image.clone())
        else {
            return Ok(());
        };
        if ctx.duration() == Some(0) {
            debug!(key = %key, "caching disabled for this request");
            return Ok(());
        }

        let key_str = key.to_string();
        if let Err(e) = self.store(env, scope, ctx, &location, &key_str, &image).await {
            warn!(key = %key_str, error = %e, "failed to store artifact");
            return Err(StageError::recoverable(self.name(), e));
        }
        ctx.stored = true;

        let variants: Vec<_> = ctx
            .variants
            .iter()
            .filter_map(|v| v.image.clone().map(|img| (v.location.clone(), v.key.to_string(), img)))
            .collect();
        let mut failed = None;
        for (location, variant_key, image) in variants {
            if let Err(e) = self.store(env, scope, ctx, &location, &variant_key, &image).await {
                warn!(key = %variant_key, error = %e, "failed to store responsive variant");
                failed = Some(e);
            }
        }
        match failed {
            Some(e) => Err(StageError::recoverable(self.name(), e)),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Output
// =============================================================================

/// Builds the caller-facing output
pub struct OutputStage;

#[async_trait]
impl Stage for OutputStage {
    fn name(&self) -> &'static str {
        "output"
    }

    async fn run(&self, env: &StageEnv, _scope: &mut RequestScope, ctx: &mut ProcessingContext) -> StageResult {
        if let Some(ResolvedSource::ColorFill { color }) = &ctx.source {
            ctx.output = Some(Output {
                url: String::new(),
                path: None,
                format: ctx.format.clone(),
                mime_type: mime_type(&ctx.format).to_string(),
                width: ctx.params.get("width").and_then(|v| v.as_i64()).and_then(|v| u32::try_from(v).ok()),
                height: ctx.params.get("height").and_then(|v| v.as_i64()).and_then(|v| u32::try_from(v).ok()),
                size_bytes: 0,
                color: Some(color.clone()),
                variants: Vec::new(),
            });
            return Ok(());
        }

        let Some(image) = &ctx.image else {
            return Err(StageError::critical(
                self.name(),
                Error::Internal("no image to output".into()),
            ));
        };

        let path = if ctx.stored {
            ctx.location.as_ref().map(|l| l.path())
        } else {
            None
        };
        let url = match (&path, ctx.locator()) {
            (Some(path), _) => env.url_for(path),
            (None, Some(locator)) => env.url_for(locator),
            (None, None) => String::new(),
        };
        let variants = if ctx.stored {
            ctx.variants
                .iter()
                .filter(|v| v.image.is_some())
                .map(|v| OutputVariant {
                    width: v.width,
                    url: env.url_for(&v.location.path()),
                    cache_key: v.key.to_string(),
                })
                .collect()
        } else {
            Vec::new()
        };

        ctx.output = Some(Output {
            url,
            path,
            format: ctx.format.clone(),
            mime_type: mime_type(&ctx.format).to_string(),
            width: image.width,
            height: image.height,
            size_bytes: image.bytes.len() as u64,
            color: None,
            variants,
        });
        info!(
            source = %ctx.requested,
            key = ?ctx.key.as_ref().map(|k| k.to_string()),
            stored = ctx.stored,
            fallback = ctx.fallback_used(),
            processing_ms = ctx.processing_ms,
            "processed image"
        );
        Ok(())
    }
}
