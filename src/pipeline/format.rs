//! Output Format Resolution

use crate::cache::params::{names, ParameterSet};

/// Format used when neither the request nor the source names one
pub const DEFAULT_FORMAT: &str = "jpg";

/// Canonical extension for a format name
pub fn normalize_format(format: &str) -> String {
    let lower = format.trim().trim_start_matches('.').to_ascii_lowercase();
    match lower.as_str() {
        "jpeg" | "jpe" | "jfif" => "jpg".to_string(),
        "tif" => "tiff".to_string(),
        _ => lower,
    }
}

/// Extension of a source locator, ignoring query and fragment
pub fn source_extension(locator: &str) -> Option<String> {
    let end = locator.find(['?', '#']).unwrap_or(locator.len());
    let name = locator[..end].rsplit(['/', '\\']).next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(normalize_format(ext))
}

/// Pick the output format for a request
///
/// SVG sources always pass through as SVG, and GIF sources keep their
/// format while animation is preserved. Otherwise an explicit `format`
/// (other than `auto`) wins over the source's own extension.
pub fn resolve_output_format(params: &ParameterSet, locator: Option<&str>, preserve_animation: bool) -> String {
    let source_ext = locator.and_then(source_extension);

    match source_ext.as_deref() {
        Some("svg") => return "svg".to_string(),
        Some("gif") if preserve_animation => return "gif".to_string(),
        _ => {}
    }

    if let Some(explicit) = params.text(names::FORMAT) {
        let explicit = normalize_format(&explicit);
        if explicit != "auto" {
            return explicit;
        }
    }

    source_ext.unwrap_or_else(|| DEFAULT_FORMAT.to_string())
}

/// MIME type reported for an output format
pub fn mime_type(format: &str) -> &'static str {
    match format {
        "jpg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "svg" => "image/svg+xml",
        "tiff" => "image/tiff",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_extension() {
        assert_eq!(source_extension("uploads/photo.JPEG"), Some("jpg".into()));
        assert_eq!(source_extension("https://cdn/x/a.png?v=2"), Some("png".into()));
        assert_eq!(source_extension("uploads/.hidden"), None);
        assert_eq!(source_extension("uploads/noext"), None);
    }

    #[test]
    fn test_explicit_format_wins() {
        let params = ParameterSet::new().with("format", "webp");
        assert_eq!(resolve_output_format(&params, Some("a.jpg"), true), "webp");

        let auto = ParameterSet::new().with("format", "auto");
        assert_eq!(resolve_output_format(&auto, Some("a.png"), true), "png");
        assert_eq!(resolve_output_format(&ParameterSet::new(), None, true), DEFAULT_FORMAT);
    }

    #[test]
    fn test_format_preserving_sources() {
        let params = ParameterSet::new().with("format", "webp");
        assert_eq!(resolve_output_format(&params, Some("logo.svg"), true), "svg");
        assert_eq!(resolve_output_format(&params, Some("anim.gif"), true), "gif");
        assert_eq!(resolve_output_format(&params, Some("anim.gif"), false), "webp");
    }

    #[test]
    fn test_mime_type() {
        assert_eq!(mime_type("jpg"), "image/jpeg");
        assert_eq!(mime_type("svg"), "image/svg+xml");
        assert_eq!(mime_type("xyz"), "application/octet-stream");
    }
}
