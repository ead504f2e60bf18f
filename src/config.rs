//! Engine Configuration
//!
//! Settings consumed by the cache engine. Loaded from YAML, every field has a
//! default so a partial file is valid.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

// =============================================================================
// Defaults
// =============================================================================

/// Default cap on the cleaned identity segment of a cache key
pub const DEFAULT_MAX_NAME_LENGTH: usize = 150;

/// Entry count at or above which the index switches to selective loading
pub const DEFAULT_EAGER_LOAD_THRESHOLD: u64 = 10_000;

/// Parameters that change pixel output unless configured otherwise
pub const DEFAULT_TRANSFORMATIONAL_PARAMETERS: &[&str] = &[
    "width",
    "height",
    "crop",
    "fit",
    "gravity",
    "quality",
    "format",
    "dpr",
    "rotate",
    "flip",
    "flop",
    "blur",
    "sharpen",
    "brightness",
    "contrast",
    "saturation",
    "grayscale",
    "sepia",
    "negate",
    "trim",
    "border",
    "watermark",
    "face",
    "zoom",
    "lossless",
    "progressive",
    "strip",
];

// =============================================================================
// Fallback Source
// =============================================================================

/// Source used when the request's own locator is empty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SystemFallback {
    /// A static image that stands in for the missing source
    Image { locator: String },
    /// A solid colour canvas; has no static source and is never cached
    ColorFill { color: String },
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// Configuration for the cache engine and pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tenant id the pipeline operates for
    pub tenant: String,
    /// Storage connection cached artifacts are written to
    pub connection: String,
    /// Storage connection sources are read from
    pub source_connection: String,
    /// Directory within the connection holding cached artifacts
    pub cache_dir: String,
    /// Prefix joined with artifact paths to form output URLs
    pub base_url: String,
    /// Maximum length of the cleaned identity segment
    pub max_name_length: usize,
    /// Entry count at or above which selective loading is used
    pub eager_load_threshold: u64,
    /// Stored entry-count estimate; when absent the metadata store is asked
    pub entry_count_hint: Option<u64>,
    /// Fold the source locator into the transform hash
    pub hash_source: bool,
    /// Replace the cleaned identity with a one-way hash
    pub hash_filenames: bool,
    /// Licensing mode tag folded into the transform hash
    pub licensing_mode: String,
    /// Duration used when a request carries no `cache` parameter
    pub default_cache_duration: i64,
    /// Fallback used when neither the request nor its explicit fallback has a source
    pub system_fallback: Option<SystemFallback>,
    /// Keep animated sources in their own format
    pub preserve_animation: bool,
    /// Widths of the derived responsive variants
    pub responsive_widths: Vec<u32>,
    /// Closed set of transformational parameter names
    pub transformational_parameters: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tenant: "default".to_string(),
            connection: "local".to_string(),
            source_connection: "local".to_string(),
            cache_dir: "cache".to_string(),
            base_url: String::new(),
            max_name_length: DEFAULT_MAX_NAME_LENGTH,
            eager_load_threshold: DEFAULT_EAGER_LOAD_THRESHOLD,
            entry_count_hint: None,
            hash_source: false,
            hash_filenames: false,
            licensing_mode: "standard".to_string(),
            default_cache_duration: -1,
            system_fallback: None,
            preserve_animation: true,
            responsive_widths: Vec::new(),
            transformational_parameters: DEFAULT_TRANSFORMATIONAL_PARAMETERS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

impl EngineConfig {
    /// Parse configuration from a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    /// Reject settings the engine cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.tenant.trim().is_empty() {
            return Err(Error::Configuration("tenant must not be empty".into()));
        }
        if self.connection.trim().is_empty() || self.source_connection.trim().is_empty() {
            return Err(Error::Configuration("connection names must not be empty".into()));
        }
        if self.max_name_length == 0 {
            return Err(Error::Configuration(
                "max_name_length must be greater than zero".into(),
            ));
        }
        if self.transformational_parameters.is_empty() {
            return Err(Error::Configuration(
                "transformational_parameters must not be empty".into(),
            ));
        }
        Ok(())
    }
}
