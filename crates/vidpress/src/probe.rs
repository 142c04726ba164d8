//! Metadata probing for selected sources.
//!
//! The probe reads duration and resolution before any planning happens. The
//! default implementation shells out to `ffprobe` and parses its JSON output,
//! giving up after a bounded wait so malformed input cannot hang the UI.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The probe did not answer within the allotted time.
    #[error("Metadata probe timed out after {0:?}")]
    TimedOut(Duration),

    /// ffprobe ran but reported a failure.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Output could not be parsed or lacked required fields.
    #[error("Failed to parse probe output: {0}")]
    ParseError(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Duration and resolution of a video source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
}

/// Reads duration and resolution from a video source.
#[async_trait]
pub trait MetadataProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<VideoMetadata, ProbeError>;
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub duration: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Parses ffprobe JSON output into [`VideoMetadata`].
///
/// Uses the first video stream for the resolution. The container duration is
/// preferred; the stream duration is the fallback.
pub fn parse_ffprobe_output(json_str: &str) -> Result<VideoMetadata, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let video = ffprobe
        .streams
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| ProbeError::ParseError("no video stream".to_string()))?;

    let parse_secs = |d: &Option<String>| d.as_ref().and_then(|d| d.parse::<f64>().ok());
    let duration_secs = ffprobe
        .format
        .as_ref()
        .and_then(|f| parse_secs(&f.duration))
        .or_else(|| parse_secs(&video.duration))
        .filter(|d| d.is_finite() && *d > 0.0)
        .ok_or_else(|| ProbeError::ParseError("missing or zero duration".to_string()))?;

    let width = video.width.unwrap_or(0);
    let height = video.height.unwrap_or(0);
    if width == 0 || height == 0 {
        return Err(ProbeError::ParseError(format!(
            "invalid resolution {}x{}",
            width, height
        )));
    }

    Ok(VideoMetadata {
        duration_secs,
        width,
        height,
    })
}

/// [`MetadataProbe`] backed by the `ffprobe` binary.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    program: PathBuf,
    timeout: Duration,
}

impl FfprobeProbe {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn from_config(cfg: &crate::config::ProbeConfig) -> Self {
        Self::new(&cfg.ffprobe_path, Duration::from_secs(cfg.timeout_secs))
    }
}

#[async_trait]
impl MetadataProbe for FfprobeProbe {
    async fn probe(&self, path: &Path) -> Result<VideoMetadata, ProbeError> {
        let mut cmd = Command::new(&self.program);
        cmd.args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .kill_on_drop(true);

        debug!(path = %path.display(), "probing metadata");

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(path = %path.display(), timeout = ?self.timeout, "metadata probe timed out");
                return Err(ProbeError::TimedOut(self.timeout));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ffprobe_output(&stdout)
    }
}
