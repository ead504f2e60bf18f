//! Domain Ports - Boundary traits consumed by the cache engine
//!
//! These traits define the boundaries between the cache engine and the
//! systems it depends on. Adapters implement them; the engine never reaches
//! past them.

use crate::cache::entry::{normalize_path, CacheEntry, EntryLocation};
use crate::cache::params::ParameterSet;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Metadata Store
// =============================================================================

/// Durable store of cache entry metadata rows
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Read a single row
    async fn find_one(&self, location: &EntryLocation) -> Result<Option<CacheEntry>>;

    /// Read every row for a tenant and connection
    async fn find_all_for(&self, tenant: &str, connection: &str) -> Result<Vec<CacheEntry>>;

    /// Read every row whose directory is `directory` or lies below it
    async fn find_under(
        &self,
        tenant: &str,
        connection: &str,
        directory: &str,
    ) -> Result<Vec<CacheEntry>> {
        let prefix = normalize_path(directory);
        let rows = self.find_all_for(tenant, connection).await?;
        Ok(rows
            .into_iter()
            .filter(|row| is_under(&row.location.directory, &prefix))
            .collect())
    }

    /// Insert or replace a row
    async fn upsert(&self, entry: &CacheEntry) -> Result<()>;

    /// Delete a row; returns true if it existed
    async fn delete(&self, location: &EntryLocation) -> Result<bool>;

    /// Number of rows for a tenant and connection
    async fn count_for(&self, tenant: &str, connection: &str) -> Result<u64>;
}

/// True if `directory` equals `prefix` or is nested below it
pub fn is_under(directory: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || directory == prefix
        || directory
            .strip_prefix(prefix)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
}

pub type MetadataStoreRef = Arc<dyn MetadataStore>;

// =============================================================================
// File Storage
// =============================================================================

/// A stored file as reported by a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Normalized path within the connection
    pub path: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub modified: DateTime<Utc>,
}

/// Generic file storage addressed by (path, connection)
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Check whether a file exists
    async fn exists(&self, path: &str, connection: &str) -> Result<bool>;

    /// List files below a directory
    async fn list(&self, path: &str, connection: &str, recursive: bool) -> Result<Vec<FileInfo>>;

    /// Delete a file
    async fn delete(&self, path: &str, connection: &str) -> Result<()>;

    /// Size of a file in bytes
    async fn size(&self, path: &str, connection: &str) -> Result<u64>;

    /// Read a file's contents
    async fn read(&self, path: &str, connection: &str) -> Result<Bytes>;

    /// Write a file, replacing any existing contents
    async fn write(&self, path: &str, connection: &str, data: Bytes) -> Result<()>;
}

pub type FileStorageRef = Arc<dyn FileStorage>;

// =============================================================================
// Transformation Engine
// =============================================================================

/// Output of a pixel transformation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedImage {
    /// Encoded result
    pub bytes: Bytes,
    /// Final width, when the engine reports it
    pub width: Option<u32>,
    /// Final height, when the engine reports it
    pub height: Option<u32>,
}

impl TransformedImage {
    pub fn new(bytes: Bytes) -> Self {
        Self {
            bytes,
            width: None,
            height: None,
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }
}

/// Pixel-level transformation, invoked only on a cache miss
#[async_trait]
pub trait TransformationEngine: Send + Sync {
    async fn apply(&self, source: Bytes, parameters: &ParameterSet) -> Result<TransformedImage>;
}

pub type TransformationEngineRef = Arc<dyn TransformationEngine>;

// =============================================================================
// Parameter Classifier
// =============================================================================

/// Decides which parameters affect pixel output
pub trait ParameterClassifier: Send + Sync {
    fn is_transformational(&self, name: &str) -> bool;
}

pub type ParameterClassifierRef = Arc<dyn ParameterClassifier>;
