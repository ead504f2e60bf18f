//! Transform Cache - Transformation Cache Engine
//!
//! Caches the results of image transformations. A request is identified by
//! its source and the subset of parameters that change pixels; fresh
//! artifacts are served without touching the source, and everything else
//! runs through a staged pipeline whose metadata writes are applied once
//! per request.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              Processing Pipeline                             │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │    Fast Path    │  │     Stages      │  │       Request Scope         │  │
//! │  │  (index check)  │  │ init..output    │  │  (index, writes, key memo)  │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │           └────────────────────┼─────────────────────────┘                   │
//! │                                │                                             │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │      Cache Layer      │                                │
//! │                    │ keys, index, audit    │                                │
//! │                    └───────────────────────┘                                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                                   Ports                                      │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  MetadataStore  │  │   FileStorage   │  │    TransformationEngine     │  │
//! │  │  (memory, json) │  │ (memory, local) │  │       (passthrough)         │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`pipeline`]: Fast path, stage sequence and request scope
//! - [`cache`]: Cache keys, index, write coalescing and audit
//! - [`storage`]: Metadata store and file storage adapters
//! - [`domain`]: Boundary traits
//! - [`config`]: Engine configuration
//! - [`error`]: Error types and handling

pub mod cache;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod storage;

// Re-export commonly used types
pub use cache::{
    AuditEngine, AuditResult, CacheEntry, CacheEvent, CacheKey, EntryLocation, KeyDeriver,
    KeyFlags, ParamValue, ParameterSet, TransformationalParameterFilter,
};

pub use config::{EngineConfig, SystemFallback};

pub use domain::ports::{
    FileInfo, FileStorage, MetadataStore, ParameterClassifier, TransformationEngine,
    TransformedImage,
};

pub use engine::PassthroughEngine;

pub use error::{Error, FailureDisposition, Result};

pub use pipeline::{Output, Pipeline, ProcessResult, RequestScope};

pub use storage::{JsonMetadataStore, LocalFileStorage, MemoryFileStorage, MemoryMetadataStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
