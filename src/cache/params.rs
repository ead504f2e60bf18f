//! Request Parameters
//!
//! Strongly-typed, insertion-ordered parameter sets and the filter that
//! selects the parameters feeding the transform hash.

use crate::domain::ports::ParameterClassifier;
use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// =============================================================================
// Reserved Parameter Names
// =============================================================================

/// Parameter names the engine interprets itself
pub mod names {
    /// Cache duration in seconds
    pub const CACHE: &str = "cache";
    /// Replacement base name for the cached artifact
    pub const FILENAME: &str = "filename";
    /// Prefix prepended to the base name
    pub const PREFIX: &str = "prefix";
    /// Suffix appended to the base name
    pub const SUFFIX: &str = "suffix";
    /// Request an opaque (hashed) artifact name
    pub const HASH_FILENAME: &str = "hash_filename";
    /// Explicit fallback source locator
    pub const FALLBACK: &str = "fallback";
    /// Explicit output format
    pub const FORMAT: &str = "format";
    /// Background colour, resolved before hashing
    pub const BACKGROUND: &str = "background";
    /// Active preset identifier
    pub const PRESET: &str = "preset";
    /// Produce responsive width variants
    pub const RESPONSIVE: &str = "responsive";
    /// Bust the cache for this request
    pub const REFRESH: &str = "refresh";
    /// Override the target storage connection
    pub const CONNECTION: &str = "connection";
}

// =============================================================================
// Parameter Value
// =============================================================================

/// A scalar request parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Infer a typed value from its textual form
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(i) = trimmed.parse::<i64>() {
            return ParamValue::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if f.is_finite() {
                return ParamValue::Float(f);
            }
        }
        match trimmed {
            "true" => ParamValue::Bool(true),
            "false" => ParamValue::Bool(false),
            _ => ParamValue::Text(raw.to_string()),
        }
    }

    /// Integer view; integral floats and numeric text convert
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(i) => Some(*i),
            ParamValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            ParamValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Boolean view; accepts 1/0 and yes/no style text
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            ParamValue::Int(i) => Some(*i != 0),
            ParamValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(true),
                "false" | "no" | "off" | "0" => Some(false),
                _ => None,
            },
            ParamValue::Float(_) => None,
        }
    }

    /// Text view; only for text values
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", if *b { "1" } else { "0" }),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

// =============================================================================
// Parameter Set
// =============================================================================

/// Ordered parameter mapping; iteration follows insertion order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet {
    values: IndexMap<String, ParamValue>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert a value; replacing keeps the original position
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<ParamValue> {
        self.values.shift_remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Non-empty text view of a parameter; numbers are rendered
    pub fn text(&self, name: &str) -> Option<String> {
        self.get(name)
            .map(|v| v.to_string())
            .filter(|s| !s.trim().is_empty())
    }

    /// Boolean flag; absent or unparsable is false
    pub fn flag(&self, name: &str) -> bool {
        self.get(name).and_then(ParamValue::as_bool).unwrap_or(false)
    }

    /// Copy with one parameter replaced
    pub fn with_override(&self, name: &str, value: impl Into<ParamValue>) -> Self {
        let mut copy = self.clone();
        copy.insert(name, value);
        copy
    }

    /// Parse `key=value` pairs, inferring value types
    pub fn parse_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (name, value) = pair.split_once('=').ok_or_else(|| {
                Error::Configuration(format!("parameter '{}' is not in key=value form", pair))
            })?;
            let name = name.trim();
            if name.is_empty() {
                return Err(Error::Configuration(format!(
                    "parameter '{}' has an empty name",
                    pair
                )));
            }
            set.insert(name, ParamValue::infer(value));
        }
        Ok(set)
    }
}

impl<K: Into<String>, V: Into<ParamValue>> FromIterator<(K, V)> for ParameterSet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut set = Self::new();
        for (k, v) in iter {
            set.insert(k, v);
        }
        set
    }
}

// =============================================================================
// Transformational Parameter Filter
// =============================================================================

/// Closed set of parameter names that affect pixel output
#[derive(Debug, Clone, Default)]
pub struct TransformationalParameterFilter {
    names: HashSet<String>,
}

impl TransformationalParameterFilter {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl ParameterClassifier for TransformationalParameterFilter {
    fn is_transformational(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

// =============================================================================
// Name Overrides
// =============================================================================

/// Caller-supplied adjustments to the artifact base name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameOverrides {
    pub filename: Option<String>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    /// Replace the cleaned identity with a one-way hash
    pub opaque: bool,
}

impl NameOverrides {
    pub fn from_parameters(params: &ParameterSet) -> Self {
        Self {
            filename: params.text(names::FILENAME),
            prefix: params.text(names::PREFIX),
            suffix: params.text(names::SUFFIX),
            opaque: params.flag(names::HASH_FILENAME),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_values() {
        assert_eq!(ParamValue::infer("400"), ParamValue::Int(400));
        assert_eq!(ParamValue::infer("-1"), ParamValue::Int(-1));
        assert_eq!(ParamValue::infer("1.5"), ParamValue::Float(1.5));
        assert_eq!(ParamValue::infer("true"), ParamValue::Bool(true));
        assert_eq!(ParamValue::infer("red"), ParamValue::Text("red".into()));
        assert_eq!(ParamValue::infer("nan"), ParamValue::Text("nan".into()));
    }

    #[test]
    fn test_insertion_order_is_stable() {
        let mut params = ParameterSet::new()
            .with("width", 400)
            .with("height", 300)
            .with("quality", 80);
        params.insert("width", 500);

        let names: Vec<&str> = params.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["width", "height", "quality"]);
        assert_eq!(params.get("width"), Some(&ParamValue::Int(500)));

        params.remove("height");
        let names: Vec<&str> = params.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["width", "quality"]);
    }

    #[test]
    fn test_parse_pairs() {
        let params = ParameterSet::parse_pairs(["width=400", "cache=600", "background=red"]).unwrap();
        assert_eq!(params.len(), 3);
        assert_eq!(params.get("cache").and_then(ParamValue::as_i64), Some(600));
        assert_eq!(params.text("background").as_deref(), Some("red"));

        assert!(ParameterSet::parse_pairs(["width"]).is_err());
        assert!(ParameterSet::parse_pairs(["=3"]).is_err());
    }

    #[test]
    fn test_flag_views() {
        let params = ParameterSet::new()
            .with("a", true)
            .with("b", "yes")
            .with("c", 0)
            .with("d", "maybe");
        assert!(params.flag("a"));
        assert!(params.flag("b"));
        assert!(!params.flag("c"));
        assert!(!params.flag("d"));
        assert!(!params.flag("missing"));
    }

    #[test]
    fn test_filter_membership() {
        let filter = TransformationalParameterFilter::new(["width", "quality"]);
        assert!(filter.is_transformational("width"));
        assert!(filter.is_transformational("quality"));
        assert!(!filter.is_transformational("cache"));
    }

    #[test]
    fn test_name_overrides() {
        let params = ParameterSet::new()
            .with(names::PREFIX, "thumb")
            .with(names::HASH_FILENAME, 1);
        let overrides = NameOverrides::from_parameters(&params);
        assert_eq!(overrides.prefix.as_deref(), Some("thumb"));
        assert_eq!(overrides.filename, None);
        assert!(overrides.opaque);
    }
}
