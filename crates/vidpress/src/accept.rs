//! File acceptance checks run before any probing.

use std::path::Path;
use thiserror::Error;

/// Extensions accepted regardless of the reported MIME type
pub const ACCEPTED_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "webm", "avi"];

/// Error returned when a file is not an accepted video type
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Unsupported format: {name} (accepted: video/* or .{})", ACCEPTED_EXTENSIONS.join(", ."))]
pub struct UnsupportedFormat {
    pub name: String,
}

/// Lowercased extension of a file name, if any
pub fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
}

/// Accept a file if its MIME type is `video/*` or its extension is allow-listed
pub fn check_accepted(name: &str, mime: Option<&str>) -> Result<(), UnsupportedFormat> {
    let mime_ok = mime
        .map(|m| m.trim().to_lowercase().starts_with("video/"))
        .unwrap_or(false);

    let ext_ok = extension_of(name)
        .map(|ext| ACCEPTED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false);

    if mime_ok || ext_ok {
        Ok(())
    } else {
        Err(UnsupportedFormat {
            name: name.to_string(),
        })
    }
}
