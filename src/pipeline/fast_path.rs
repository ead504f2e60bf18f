//! Fast Path
//!
//! Evaluated before any stage runs. Resolves the source, output format and
//! cache key, then asks the request's cache index whether a fresh artifact
//! already exists. A hit produces output straight from the stored metadata;
//! anything else, errors included, sends the request down the full stage
//! sequence.

use crate::cache::entry::{EntryLocation, StatsDelta};
use crate::cache::events::CacheEvent;
use crate::cache::key::KeyFlags;
use crate::cache::params::names;
use crate::config::SystemFallback;
use crate::error::{Error, Result};
use crate::pipeline::context::{
    Output, OutputVariant, ProcessingContext, RequestScope, ResolvedSource, VariantPlan,
};
use crate::pipeline::format::{mime_type, resolve_output_format};
use crate::pipeline::StageEnv;
use chrono::Utc;
use serde_json::Map;
use tracing::debug;

/// What the fast path decided
#[derive(Debug, Clone, PartialEq)]
pub enum FastPathOutcome {
    /// Fresh artifact found; output is ready
    Hit(Output),
    /// Nothing usable cached
    Miss,
    /// The request cannot be served from cache at all (colour fill)
    Bypassed,
}

// =============================================================================
// Source Resolution
// =============================================================================

/// Sources to try, in order: primary, explicit fallback, system fallback
///
/// Empty locators are skipped. A colour fill can only come last.
pub fn source_candidates(
    requested: &str,
    explicit_fallback: Option<&str>,
    system_fallback: Option<&SystemFallback>,
) -> Vec<ResolvedSource> {
    let mut candidates = Vec::new();
    if !requested.trim().is_empty() {
        candidates.push(ResolvedSource::Locator {
            locator: requested.trim().to_string(),
            fallback_used: false,
        });
    }
    if let Some(fallback) = explicit_fallback.map(str::trim).filter(|f| !f.is_empty()) {
        candidates.push(ResolvedSource::Locator {
            locator: fallback.to_string(),
            fallback_used: true,
        });
    }
    match system_fallback {
        Some(SystemFallback::Image { locator }) if !locator.trim().is_empty() => {
            candidates.push(ResolvedSource::Locator {
                locator: locator.trim().to_string(),
                fallback_used: true,
            });
        }
        Some(SystemFallback::ColorFill { color }) => {
            candidates.push(ResolvedSource::ColorFill { color: color.clone() });
        }
        _ => {}
    }
    candidates
}

/// Candidates for a context under the pipeline's configuration
pub(crate) fn candidates_for(env: &StageEnv, ctx: &ProcessingContext) -> Vec<ResolvedSource> {
    let explicit = ctx.params.text(names::FALLBACK);
    source_candidates(
        &ctx.requested,
        explicit.as_deref(),
        env.config.system_fallback.as_ref(),
    )
}

// =============================================================================
// Preparation
// =============================================================================

/// Resolve source, format, key and artifact locations for a context
pub(crate) fn prepare(env: &StageEnv, scope: &mut RequestScope, ctx: &mut ProcessingContext) -> Result<()> {
    let source = candidates_for(env, ctx)
        .into_iter()
        .next()
        .ok_or_else(|| Error::SourceNotFound {
            locator: ctx.requested.clone(),
        })?;
    prepare_with(env, scope, ctx, source);
    Ok(())
}

/// Prepare a context for a specific source
pub(crate) fn prepare_with(
    env: &StageEnv,
    scope: &mut RequestScope,
    ctx: &mut ProcessingContext,
    source: ResolvedSource,
) {
    let config = &env.config;
    ctx.reset_preparation();

    let (locator, fallback_used) = match &source {
        ResolvedSource::Locator { locator, fallback_used } => (Some(locator.clone()), *fallback_used),
        ResolvedSource::ColorFill { .. } => (None, false),
    };
    let Some(locator) = locator else {
        ctx.format = resolve_output_format(&ctx.params, None, config.preserve_animation);
        ctx.source = Some(source);
        return;
    };

    ctx.format = resolve_output_format(&ctx.params, Some(&locator), config.preserve_animation);
    let flags = KeyFlags::for_request(config, &ctx.params, fallback_used);
    let key = scope.derive_key(&env.deriver, &locator, &ctx.params, &flags);
    let location = EntryLocation::new(
        config.tenant.clone(),
        ctx.connection.clone(),
        &config.cache_dir,
        key.filename(&ctx.format),
    );

    if ctx.responsive {
        for &width in &config.responsive_widths {
            let params = ctx.params.with_override("width", width);
            let variant_key = scope.derive_key(&env.deriver, &locator, &params, &flags);
            let variant_location = EntryLocation::new(
                config.tenant.clone(),
                ctx.connection.clone(),
                &config.cache_dir,
                variant_key.filename(&ctx.format),
            );
            ctx.variants.push(VariantPlan {
                width,
                key: variant_key,
                location: variant_location,
                image: None,
            });
        }
    }

    ctx.key = Some(key);
    ctx.location = Some(location);
    ctx.source = Some(source);
}

// =============================================================================
// Evaluation
// =============================================================================

/// Try to serve a context from cache
pub(crate) async fn evaluate(
    env: &StageEnv,
    scope: &mut RequestScope,
    ctx: &mut ProcessingContext,
) -> Result<FastPathOutcome> {
    if !ctx.is_prepared() {
        prepare(env, scope, ctx)?;
    }
    let (Some(key), Some(location)) = (ctx.key.clone(), ctx.location.clone()) else {
        return Ok(FastPathOutcome::Bypassed);
    };

    let duration = key.duration();
    let now = Utc::now();
    let strategy = scope.index.ensure_loaded(&location.tenant, &location.connection).await;

    let mut required: Vec<&EntryLocation> = vec![&location];
    required.extend(ctx.variants.iter().map(|v| &v.location));
    for loc in required {
        if !scope
            .index
            .exists(&loc.tenant, &loc.connection, &loc.path(), duration, now)
            .await
        {
            debug!(key = %key, location = %loc, strategy = %strategy, "fast path miss");
            env.emit(CacheEvent::miss(&key.to_string()));
            return Ok(FastPathOutcome::Miss);
        }
    }

    let entry = scope
        .index
        .lookup(&location)
        .await
        .ok_or_else(|| Error::Internal(format!("cache entry for {} vanished", location)))?;
    scope.writes.schedule(location.clone(), StatsDelta::hit(), Map::new(), false);

    let path = location.path();
    let output = Output {
        url: env.url_for(&path),
        path: Some(path),
        format: ctx.format.clone(),
        mime_type: mime_type(&ctx.format).to_string(),
        width: entry.value_u32("width"),
        height: entry.value_u32("height"),
        size_bytes: entry.stats.size_bytes,
        color: None,
        variants: ctx
            .variants
            .iter()
            .map(|v| OutputVariant {
                width: v.width,
                url: env.url_for(&v.location.path()),
                cache_key: v.key.to_string(),
            })
            .collect(),
    };

    debug!(key = %key, location = %location, "fast path hit");
    env.emit(CacheEvent::hit(&key.to_string(), &location));
    Ok(FastPathOutcome::Hit(output))
}
