//! The user's selected input
//!
//! A [`SourceAsset`] only exists once its bytes are in memory and its
//! metadata is known to be usable for planning.

use crate::accept::{check_accepted, extension_of, UnsupportedFormat};
use crate::probe::{MetadataProbe, ProbeError, VideoMetadata};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Why a selected file could not become a [`SourceAsset`]
#[derive(Debug, Error)]
pub enum AcceptError {
    #[error(transparent)]
    Unsupported(#[from] UnsupportedFormat),

    /// The file could not be read at all
    #[error("Could not read file: {0}")]
    Unreadable(#[from] std::io::Error),

    /// The probe failed or timed out
    #[error("Metadata read failed: {0}")]
    MetadataReadFailure(#[from] ProbeError),

    /// The probe answered with values planning cannot use
    #[error("Invalid metadata: duration {duration_secs}s, resolution {width}x{height}")]
    InvalidMetadata {
        duration_secs: f64,
        width: u32,
        height: u32,
    },
}

impl AcceptError {
    pub fn user_message(&self) -> String {
        match self {
            AcceptError::Unsupported(e) => e.to_string(),
            AcceptError::Unreadable(_) => {
                "The file could not be read. Check the path and permissions.".to_string()
            }
            AcceptError::MetadataReadFailure(_) | AcceptError::InvalidMetadata { .. } => {
                "Could not read the video's duration or resolution; the file may be corrupted."
                    .to_string()
            }
        }
    }
}

/// A selected, probed video held in memory
#[derive(Debug, Clone)]
pub struct SourceAsset {
    name: String,
    bytes: Arc<[u8]>,
    metadata: VideoMetadata,
}

impl SourceAsset {
    /// Build an asset, rejecting metadata that planning cannot use
    pub fn new(
        name: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
        metadata: VideoMetadata,
    ) -> Result<Self, AcceptError> {
        let valid = metadata.duration_secs.is_finite()
            && metadata.duration_secs > 0.0
            && metadata.width > 0
            && metadata.height > 0;
        if !valid {
            return Err(AcceptError::InvalidMetadata {
                duration_secs: metadata.duration_secs,
                width: metadata.width,
                height: metadata.height,
            });
        }

        Ok(Self {
            name: name.into(),
            bytes: bytes.into(),
            metadata,
        })
    }

    /// Accept, read and probe a file on disk
    ///
    /// The type check runs first so unsupported files never reach the probe.
    pub async fn open(
        path: &Path,
        mime: Option<&str>,
        probe: &dyn MetadataProbe,
    ) -> Result<Self, AcceptError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());

        check_accepted(&name, mime)?;

        let bytes = tokio::fs::read(path).await?;
        debug!(path = %path.display(), bytes = bytes.len(), "read source file");

        let metadata = probe.probe(path).await?;
        let asset = Self::new(name, bytes, metadata)?;
        info!(
            name = %asset.name,
            size = asset.size_bytes(),
            duration = asset.metadata.duration_secs,
            width = asset.metadata.width,
            height = asset.metadata.height,
            "source accepted"
        );
        Ok(asset)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared view of the raw bytes
    pub fn bytes(&self) -> &Arc<[u8]> {
        &self.bytes
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn metadata(&self) -> VideoMetadata {
        self.metadata
    }

    pub fn duration_secs(&self) -> f64 {
        self.metadata.duration_secs
    }

    pub fn width(&self) -> u32 {
        self.metadata.width
    }

    pub fn height(&self) -> u32 {
        self.metadata.height
    }

    /// Engine storage name for the input, keeping the original extension
    pub fn input_name(&self) -> String {
        let ext = extension_of(&self.name)
            .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| "mp4".to_string());
        format!("input.{}", ext)
    }

    /// Default export name: `<stem>_compressed.mp4`
    pub fn default_output_name(&self) -> String {
        let stem = Path::new(&self.name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "video".to_string());
        format!("{}_compressed.mp4", stem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProbe;
    use std::io::Write;

    fn meta(duration_secs: f64, width: u32, height: u32) -> VideoMetadata {
        VideoMetadata {
            duration_secs,
            width,
            height,
        }
    }

    #[test]
    fn test_rejects_unusable_metadata() {
        for bad in [
            meta(0.0, 1920, 1080),
            meta(-1.0, 1920, 1080),
            meta(f64::NAN, 1920, 1080),
            meta(10.0, 0, 1080),
            meta(10.0, 1920, 0),
        ] {
            assert!(matches!(
                SourceAsset::new("clip.mp4", vec![0u8; 4], bad),
                Err(AcceptError::InvalidMetadata { .. })
            ));
        }
    }

    #[test]
    fn test_names() {
        let asset = SourceAsset::new("Holiday Trip.MOV", vec![0u8; 4], meta(5.0, 640, 360)).unwrap();
        assert_eq!(asset.input_name(), "input.mov");
        assert_eq!(asset.default_output_name(), "Holiday Trip_compressed.mp4");
        assert_eq!(asset.size_bytes(), 4);

        let odd = SourceAsset::new("noext", vec![0u8; 1], meta(5.0, 640, 360)).unwrap();
        assert_eq!(odd.input_name(), "input.mp4");
        assert_eq!(odd.default_output_name(), "noext_compressed.mp4");
    }

    #[tokio::test]
    async fn test_open_reads_and_probes() {
        let mut file = tempfile::Builder::new().suffix(".mp4").tempfile().unwrap();
        file.write_all(&[1u8; 64]).unwrap();

        let probe = FakeProbe::returning(12.0, 1280, 720);
        let asset = SourceAsset::open(file.path(), None, &probe).await.unwrap();
        assert_eq!(asset.size_bytes(), 64);
        assert_eq!(asset.width(), 1280);
        assert!((asset.duration_secs() - 12.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_open_rejects_before_probing() {
        let file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        let probe = FakeProbe::failing();
        let err = SourceAsset::open(file.path(), Some("text/plain"), &probe)
            .await
            .unwrap_err();
        assert!(matches!(err, AcceptError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_open_surfaces_probe_failure_as_corrupt() {
        let file = tempfile::Builder::new().suffix(".mkv").tempfile().unwrap();
        let probe = FakeProbe::failing();
        let err = SourceAsset::open(file.path(), None, &probe).await.unwrap_err();
        assert!(matches!(err, AcceptError::MetadataReadFailure(_)));
        assert!(err.user_message().contains("corrupted"));
    }

    #[tokio::test]
    async fn test_open_missing_file_is_unreadable() {
        let probe = FakeProbe::returning(1.0, 2, 2);
        let err = SourceAsset::open(Path::new("/nonexistent/vidpress/clip.mp4"), None, &probe)
            .await
            .unwrap_err();
        assert!(matches!(err, AcceptError::Unreadable(_)));
    }
}
