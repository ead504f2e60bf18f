//! Cache Key Derivation
//!
//! A cache key names one transformed variant of a source image:
//!
//! ```text
//! <cleaned_identity>-<duration_tag>-<transform_hash>
//!   photo           -   258        - 3f1c...(32 hex)
//! ```
//!
//! The key is a pure function of the source locator, the transformational
//! parameters and the key flags. The only exception is a request with no
//! locator at all, which receives a random identity.

use crate::cache::color::resolve_color;
use crate::cache::params::{names, NameOverrides, ParamValue, ParameterSet};
use crate::config::EngineConfig;
use crate::domain::ports::ParameterClassifierRef;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

// =============================================================================
// Constants
// =============================================================================

/// Duration tag meaning "perpetual" or "not computable"
pub const DURATION_SENTINEL: &str = "abcdef";

/// Duration value the sentinel decodes to
pub const PERPETUAL: i64 = -1;

/// Length of the transform hash segment in hex characters
pub const TRANSFORM_HASH_LEN: usize = 32;

const FIELD_SEP: [u8; 1] = [0x1f];
const RECORD_SEP: [u8; 1] = [0x1e];

// =============================================================================
// Duration Tag
// =============================================================================

/// Encode a duration in seconds as a hex tag
///
/// `-1` and every other negative value map to the sentinel. A value whose hex
/// form collides with the sentinel gets a leading zero so it still decodes
/// to itself.
pub fn encode_duration(seconds: i64) -> String {
    if seconds < 0 {
        if seconds != PERPETUAL {
            debug!(seconds, "negative cache duration, using sentinel tag");
        }
        return DURATION_SENTINEL.to_string();
    }
    let hex = format!("{:x}", seconds);
    if hex == DURATION_SENTINEL {
        format!("0{}", hex)
    } else {
        hex
    }
}

/// Encode a requested duration parameter, falling back to `default` when absent
pub fn encode_duration_param(value: Option<&ParamValue>, default: i64) -> String {
    match value {
        None => encode_duration(default),
        Some(v) => match parse_duration(v) {
            Ok(seconds) => encode_duration(seconds),
            Err(e) => {
                debug!(error = %e, "unusable cache duration, using sentinel tag");
                DURATION_SENTINEL.to_string()
            }
        },
    }
}

/// Parse a duration parameter into seconds
pub fn parse_duration(value: &ParamValue) -> Result<i64> {
    value.as_i64().ok_or_else(|| Error::InvalidDuration {
        value: value.to_string(),
    })
}

/// Decode a duration tag; `None` if the tag is not valid hex
pub fn decode_duration_tag(tag: &str) -> Option<i64> {
    if tag == DURATION_SENTINEL {
        return Some(PERPETUAL);
    }
    if tag.is_empty() || tag.len() > 15 || !tag.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    i64::from_str_radix(tag, 16).ok()
}

// =============================================================================
// Cache Key
// =============================================================================

/// Deterministic name of one transformed variant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CacheKey {
    identity: String,
    duration_tag: String,
    transform_hash: String,
}

impl CacheKey {
    /// Cleaned source identity segment
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Hex/sentinel duration segment
    pub fn duration_tag(&self) -> &str {
        &self.duration_tag
    }

    /// Fixed-length transform hash segment
    pub fn transform_hash(&self) -> &str {
        &self.transform_hash
    }

    /// Duration in seconds this key was derived with
    pub fn duration(&self) -> Option<i64> {
        decode_duration_tag(&self.duration_tag)
    }

    /// Artifact file name for an output format
    pub fn filename(&self, format: &str) -> String {
        if format.is_empty() {
            self.to_string()
        } else {
            format!("{}.{}", self, format)
        }
    }

    /// Parse a stored artifact file name (extension optional)
    pub fn from_filename(filename: &str) -> Result<Self> {
        let stem = filename.split('.').next().unwrap_or_default();
        stem.parse()
    }
}

impl FromStr for CacheKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || Error::MalformedCacheKey { key: s.to_string() };

        let mut parts = s.rsplitn(3, '-');
        let hash = parts.next().ok_or_else(malformed)?;
        let tag = parts.next().ok_or_else(malformed)?;
        let identity = parts.next().ok_or_else(malformed)?;

        if hash.len() != TRANSFORM_HASH_LEN || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(malformed());
        }
        if decode_duration_tag(tag).is_none() {
            return Err(malformed());
        }
        if identity.is_empty() || identity.contains('-') {
            return Err(malformed());
        }

        Ok(Self {
            identity: identity.to_string(),
            duration_tag: tag.to_string(),
            transform_hash: hash.to_string(),
        })
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.identity, self.duration_tag, self.transform_hash)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for CacheKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

// =============================================================================
// Key Flags
// =============================================================================

/// Context that influences a key besides the parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFlags {
    /// Active preset identifier
    pub preset: Option<String>,
    /// Fold the source locator into the transform hash
    pub hash_source: bool,
    /// Licensing mode tag
    pub licensing_mode: String,
    /// Whether a fallback source replaced the requested one
    pub fallback_used: bool,
    /// Duration used when the parameters carry none
    pub default_duration: i64,
    /// Cap on the cleaned identity
    pub max_name_length: usize,
    /// Caller name adjustments
    pub overrides: NameOverrides,
}

impl KeyFlags {
    /// Flags for a request under a configuration
    pub fn for_request(config: &EngineConfig, params: &ParameterSet, fallback_used: bool) -> Self {
        let mut overrides = NameOverrides::from_parameters(params);
        overrides.opaque |= config.hash_filenames;
        Self {
            preset: params.text(names::PRESET),
            hash_source: config.hash_source,
            licensing_mode: config.licensing_mode.clone(),
            fallback_used,
            default_duration: config.default_cache_duration,
            max_name_length: config.max_name_length,
            overrides,
        }
    }
}

impl Default for KeyFlags {
    fn default() -> Self {
        Self::for_request(&EngineConfig::default(), &ParameterSet::new(), false)
    }
}

// =============================================================================
// Key Deriver
// =============================================================================

/// Derives cache keys; pure apart from the empty-locator fallback
#[derive(Clone)]
pub struct KeyDeriver {
    classifier: ParameterClassifierRef,
}

impl KeyDeriver {
    pub fn new(classifier: ParameterClassifierRef) -> Self {
        Self { classifier }
    }

    /// Derive the cache key for a source and parameter set
    pub fn derive(&self, locator: &str, params: &ParameterSet, flags: &KeyFlags) -> CacheKey {
        let key = CacheKey {
            identity: cleaned_identity(locator, &flags.overrides, flags.max_name_length),
            duration_tag: encode_duration_param(params.get(names::CACHE), flags.default_duration),
            transform_hash: self.transform_hash(locator, params, flags),
        };
        debug!(locator, key = %key, "derived cache key");
        key
    }

    /// Hash of every input that changes the rendered pixels
    pub fn transform_hash(&self, locator: &str, params: &ParameterSet, flags: &KeyFlags) -> String {
        let mut hasher = Sha256::new();

        // Request order must not change the key
        let mut selected: Vec<(&str, &ParamValue)> = params
            .iter()
            .filter(|(name, _)| *name != names::BACKGROUND && self.classifier.is_transformational(name))
            .collect();
        selected.sort_unstable_by(|a, b| a.0.cmp(b.0));
        for (name, value) in selected {
            field(&mut hasher, name, &value.to_string());
        }

        let background = params
            .text(names::BACKGROUND)
            .map(|raw| match resolve_color(&raw) {
                Some(rgba) => rgba.to_string(),
                None => raw,
            })
            .unwrap_or_default();
        field(&mut hasher, "background", &background);
        field(&mut hasher, "preset", flags.preset.as_deref().unwrap_or_default());
        if flags.hash_source {
            field(&mut hasher, "source", locator);
        }
        field(&mut hasher, "licensing", &flags.licensing_mode);
        field(&mut hasher, "fallback", if flags.fallback_used { "1" } else { "0" });

        truncated_hex(hasher)
    }

    /// Fingerprint of every input to `derive`, used to memoize keys per request
    pub fn fingerprint(locator: &str, params: &ParameterSet, flags: &KeyFlags) -> String {
        let mut hasher = Sha256::new();
        field(&mut hasher, "locator", locator);
        let mut entries: Vec<(&str, &ParamValue)> = params.iter().collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
        for (name, value) in entries {
            field(&mut hasher, name, &format!("{:?}", value));
        }
        field(&mut hasher, "flags", &format!("{:?}", flags));
        hex::encode(hasher.finalize())
    }
}

fn field(hasher: &mut Sha256, name: &str, value: &str) {
    hasher.update(name.as_bytes());
    hasher.update(FIELD_SEP);
    hasher.update(value.as_bytes());
    hasher.update(RECORD_SEP);
}

fn truncated_hex(hasher: Sha256) -> String {
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(TRANSFORM_HASH_LEN);
    hex
}

fn hash_str(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    truncated_hex(hasher)
}

// =============================================================================
// Identity Cleaning
// =============================================================================

/// Base name of a locator: no query, fragment or directories
fn base_name(locator: &str) -> &str {
    let end = locator.find(['?', '#']).unwrap_or(locator.len());
    let path = locator[..end].trim_end_matches(['/', '\\']);
    path.rsplit(['/', '\\']).next().unwrap_or_default()
}

fn strip_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(pos) if pos > 0 => &name[..pos],
        _ => name,
    }
}

/// Lower-case ASCII alphanumerics; every other run of characters becomes `_`
fn fold(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// Build the identity segment for a locator
pub fn cleaned_identity(locator: &str, overrides: &NameOverrides, max_len: usize) -> String {
    let name = overrides
        .filename
        .as_deref()
        .map(base_name)
        .unwrap_or_else(|| base_name(locator));
    let combined = format!(
        "{}{}{}",
        overrides.prefix.as_deref().unwrap_or_default(),
        strip_extension(name),
        overrides.suffix.as_deref().unwrap_or_default()
    );

    let decoded = urlencoding::decode(&combined)
        .map(|s| s.into_owned())
        .unwrap_or(combined);
    let mut cleaned = fold(&decoded);
    cleaned.truncate(max_len.max(1));
    let cleaned = cleaned.trim_end_matches('_').to_string();

    if cleaned.is_empty() {
        if locator.trim().is_empty() {
            let token = uuid::Uuid::new_v4().simple().to_string();
            debug!(token = %token, "empty locator, using random identity");
            return token;
        }
        return hash_str(locator);
    }

    if overrides.opaque {
        hash_str(&cleaned)
    } else {
        cleaned
    }
}
