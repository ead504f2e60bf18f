//! Transformation Cache
//!
//! Deterministic cache keys for transformed images, the per-request index
//! over the metadata store, deferred metadata writes and the audit that
//! reconciles stored files with their metadata rows.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Cache Layer                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────────────┐   │
//! │  │  KeyDeriver  │  │  CacheIndex  │  │      WriteCoalescer          │   │
//! │  │  identity-   │  │  eager or    │  │  one pending op per          │   │
//! │  │  duration-   │  │  selective   │  │  location, flushed once      │   │
//! │  │  hash        │  │  loading     │  │  per request                 │   │
//! │  └──────────────┘  └──────┬───────┘  └──────────────┬───────────────┘   │
//! │                           │                         │                    │
//! │                           └────────────┬────────────┘                    │
//! │                                        │                                 │
//! │                              ┌─────────┴─────────┐                       │
//! │                              │   MetadataStore   │                       │
//! │                              └─────────┬─────────┘                       │
//! │                                        │                                 │
//! │                              ┌─────────┴─────────┐                       │
//! │                              │    AuditEngine    │ ◄── FileStorage       │
//! │                              └───────────────────┘                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use transform_cache::cache::{KeyDeriver, KeyFlags, ParameterSet, TransformationalParameterFilter};
//! use std::sync::Arc;
//!
//! let deriver = KeyDeriver::new(Arc::new(TransformationalParameterFilter::new(["width", "height"])));
//! let params = ParameterSet::new().with("width", 400).with("cache", 600);
//! let key = deriver.derive("uploads/photo.jpg", &params, &KeyFlags::default());
//!
//! assert_eq!(key.identity(), "photo");
//! assert_eq!(key.duration(), Some(600));
//! ```

pub mod audit;
pub mod coalescer;
pub mod color;
pub mod entry;
pub mod events;
pub mod freshness;
pub mod index;
pub mod key;
pub mod metrics;
pub mod params;

// Re-export main types
pub use audit::{AuditEngine, AuditResult};
pub use coalescer::{FlushReport, PendingOp, PendingWrite, WriteCoalescer};
pub use color::{resolve_color, Rgba};
pub use entry::{CacheEntry, EntryLocation, EntryStats, StatsDelta};
pub use events::{CacheEvent, EvictionReason};
pub use freshness::FreshnessPolicy;
pub use index::{CacheIndex, LoadStrategyKind};
pub use key::{CacheKey, KeyDeriver, KeyFlags, DURATION_SENTINEL, PERPETUAL};
pub use metrics::{CacheMetrics, MetricsSnapshot, PerformanceMetrics};
pub use params::{NameOverrides, ParamValue, ParameterSet, TransformationalParameterFilter};
