//! Reference Transformation Engine
//!
//! Pixel work is outside this crate. `PassthroughEngine` returns the source
//! bytes untouched and reports the requested dimensions, which is enough to
//! drive the pipeline from the CLI and in tests.

use crate::cache::params::ParameterSet;
use crate::domain::ports::{TransformationEngine, TransformedImage};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;

/// Engine that copies the source through
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughEngine;

impl PassthroughEngine {
    pub fn new() -> Self {
        Self
    }
}

fn dimension(params: &ParameterSet, name: &str) -> Option<u32> {
    params
        .get(name)
        .and_then(|v| v.as_i64())
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v > 0)
}

#[async_trait]
impl TransformationEngine for PassthroughEngine {
    async fn apply(&self, source: Bytes, parameters: &ParameterSet) -> Result<TransformedImage> {
        if source.is_empty() {
            return Err(Error::TransformationFailure("source is empty".into()));
        }
        let mut image = TransformedImage::new(source);
        image.width = dimension(parameters, "width");
        image.height = dimension(parameters, "height");
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_passthrough() {
        let engine = PassthroughEngine::new();
        let params = ParameterSet::new().with("width", 400).with("height", "auto");

        let out = engine.apply(Bytes::from("pixels"), &params).await.unwrap();
        assert_eq!(out.bytes, Bytes::from("pixels"));
        assert_eq!(out.width, Some(400));
        assert_eq!(out.height, None);
    }

    #[tokio::test]
    async fn test_empty_source_fails() {
        let engine = PassthroughEngine::new();
        assert_matches!(
            engine.apply(Bytes::new(), &ParameterSet::new()).await,
            Err(Error::TransformationFailure(_))
        );
    }
}
