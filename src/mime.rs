//! Content-Type resolution.

use std::path::Path;

pub const FALLBACK_TYPE: &str = "application/octet-stream";

/// `Content-Type` for a file, keyed by its lowercased extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => ext.to_ascii_lowercase(),
        None => return FALLBACK_TYPE,
    };
    mime_guess::from_ext(&ext).first_raw().unwrap_or(FALLBACK_TYPE)
}

/// File suffix for an upload named only by its `Content-Type`.
///
/// Image subtypes keep their name (`image/png` → `.png`); everything
/// unrecognized lands on `.dat`.
pub fn upload_suffix(content_type: Option<&str>) -> String {
    let content_type = match content_type {
        Some(ct) => ct,
        None => return ".dat".to_string(),
    };
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    if essence == "application/octet-stream" {
        ".bin".to_string()
    } else if essence == "text/plain" {
        ".txt".to_string()
    } else if let Some(subtype) = essence.strip_prefix("image/") {
        format!(".{subtype}")
    } else {
        ".dat".to_string()
    }
}
