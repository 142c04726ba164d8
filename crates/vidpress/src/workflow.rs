//! Workflow state machine
//!
//! `Idle -> Configuring -> Running -> Succeeded | Failed`, with
//! `Succeeded | Failed -> Configuring` on retry and
//! `Configuring | Succeeded | Failed -> Idle` on discard. A running
//! compression only leaves `Running` when it completes or is abandoned.
//!
//! Long work is split so a UI can keep drawing: [`Workflow::start`] hands
//! out a [`RunTicket`], the caller drives [`RunTicket::run`] wherever it
//! likes and reports back through [`Workflow::finish`].

use crate::asset::{AcceptError, SourceAsset};
use crate::blob::BlobStore;
use crate::engine::EngineState;
use crate::heuristic::is_highly_compressed;
use crate::probe::MetadataProbe;
use crate::session::{CompressionResult, SessionController, SessionError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Quick ratio presets offered next to the 1-100 control
pub const RATIO_PRESETS: [u8; 4] = [30, 50, 70, 90];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Idle,
    Configuring,
    Running,
    Succeeded,
    Failed,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Idle => "idle",
            WorkflowState::Configuring => "configuring",
            WorkflowState::Running => "running",
            WorkflowState::Succeeded => "succeeded",
            WorkflowState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnreadableFile,
    UnsupportedFormat,
    CompressionError,
    EngineUnavailable,
}

/// Why a run failed or a selected file was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

/// Which bytes the preview shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewMode {
    Original,
    Compressed,
}

/// Error type for workflow operations
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Cannot {action} while {}", .state.as_str())]
    InvalidTransition {
        action: &'static str,
        state: WorkflowState,
    },

    /// The engine is not ready; the message says what to do
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    /// A cancelled run has not released the engine yet; nothing failed
    #[error("The previous compression is still stopping; try again in a moment")]
    SessionBusy,

    #[error("Invalid export file name: {0:?}")]
    InvalidExportName(String),

    /// The compressed bytes were already released
    #[error("Compressed output is no longer available")]
    OutputReleased,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One started compression, to be driven outside the workflow
pub struct RunTicket {
    id: u64,
    controller: Arc<SessionController>,
    asset: SourceAsset,
    ratio_percent: u8,
}

impl RunTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn run(&self) -> Result<CompressionResult, SessionError> {
        self.controller.run(&self.asset, self.ratio_percent).await
    }
}

pub struct Workflow {
    controller: Arc<SessionController>,
    probe: Arc<dyn MetadataProbe>,
    state: WorkflowState,
    asset: Option<SourceAsset>,
    ratio_percent: u8,
    default_ratio: u8,
    highly_compressed: bool,
    result: Option<CompressionResult>,
    export_name: String,
    preview: PreviewMode,
    failure: Option<Failure>,
    /// Id of the ticket whose outcome `finish` will accept
    current_run: Option<u64>,
    next_run: u64,
}

impl Workflow {
    pub fn new(
        controller: Arc<SessionController>,
        probe: Arc<dyn MetadataProbe>,
        default_ratio: u8,
    ) -> Self {
        let default_ratio = default_ratio.clamp(1, 100);
        Self {
            controller,
            probe,
            state: WorkflowState::Idle,
            asset: None,
            ratio_percent: default_ratio,
            default_ratio,
            highly_compressed: false,
            result: None,
            export_name: String::new(),
            preview: PreviewMode::Original,
            failure: None,
            current_run: None,
            next_run: 0,
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn asset(&self) -> Option<&SourceAsset> {
        self.asset.as_ref()
    }

    pub fn ratio_percent(&self) -> u8 {
        self.ratio_percent
    }

    pub fn result(&self) -> Option<&CompressionResult> {
        self.result.as_ref()
    }

    pub fn export_name(&self) -> &str {
        &self.export_name
    }

    pub fn preview(&self) -> PreviewMode {
        self.preview
    }

    pub fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }

    pub fn probe(&self) -> &Arc<dyn MetadataProbe> {
        &self.probe
    }

    /// The source already looks highly compressed; advisory only
    pub fn highly_compressed_warning(&self) -> bool {
        self.highly_compressed
    }

    /// The output came out no smaller than the input; advisory only
    pub fn size_increase_warning(&self) -> bool {
        self.result
            .as_ref()
            .is_some_and(|r| r.size_outcome().is_increase())
    }

    pub fn progress_percent(&self) -> u8 {
        self.controller.progress_percent()
    }

    fn blobs(&self) -> &Arc<BlobStore> {
        self.controller.blobs()
    }

    fn invalid(&self, action: &'static str) -> WorkflowError {
        WorkflowError::InvalidTransition {
            action,
            state: self.state,
        }
    }

    fn release_result(&mut self) {
        if let Some(result) = self.result.take() {
            if self.blobs().revoke(&result.blob) {
                debug!(blob = %result.blob.id(), "released compressed output");
            }
        }
        self.preview = PreviewMode::Original;
    }

    fn fail(&mut self, kind: FailureKind, message: String) {
        warn!(?kind, %message, "workflow failed");
        self.failure = Some(Failure { kind, message });
        self.state = WorkflowState::Failed;
    }

    /// Select a file; enters `Configuring` once it is accepted and probed
    ///
    /// A rejected file leaves the workflow in `Idle` with the reason attached
    /// as [`Workflow::failure`].
    pub async fn select(&mut self, path: &Path, mime: Option<&str>) -> Result<(), WorkflowError> {
        if self.state == WorkflowState::Running {
            return Err(self.invalid("select a file"));
        }
        let opened = SourceAsset::open(path, mime, self.probe.as_ref()).await;
        self.accept(opened)
    }

    /// Second half of [`Workflow::select`], for callers that open the file
    /// themselves (see [`Workflow::probe`])
    pub fn accept(&mut self, opened: Result<SourceAsset, AcceptError>) -> Result<(), WorkflowError> {
        if self.state == WorkflowState::Running {
            return Err(self.invalid("select a file"));
        }
        self.release_result();
        self.asset = None;
        self.failure = None;

        match opened {
            Ok(asset) => {
                self.highly_compressed = is_highly_compressed(
                    asset.size_bytes(),
                    asset.duration_secs(),
                    asset.width(),
                    asset.height(),
                );
                self.export_name = asset.default_output_name();
                self.ratio_percent = self.default_ratio;
                self.asset = Some(asset);
                self.state = WorkflowState::Configuring;
            }
            Err(e) => {
                self.highly_compressed = false;
                let kind = match e {
                    AcceptError::Unsupported(_) => FailureKind::UnsupportedFormat,
                    AcceptError::Unreadable(_)
                    | AcceptError::MetadataReadFailure(_)
                    | AcceptError::InvalidMetadata { .. } => FailureKind::UnreadableFile,
                };
                let message = e.user_message();
                warn!(error = %e, "file rejected");
                self.failure = Some(Failure { kind, message });
                self.state = WorkflowState::Idle;
            }
        }
        Ok(())
    }

    /// Set the target ratio, clamped to 1..=100
    pub fn set_ratio(&mut self, ratio_percent: u8) -> Result<(), WorkflowError> {
        if self.state != WorkflowState::Configuring {
            return Err(self.invalid("change the ratio"));
        }
        self.ratio_percent = ratio_percent.clamp(1, 100);
        Ok(())
    }

    pub fn adjust_ratio(&mut self, delta: i16) -> Result<(), WorkflowError> {
        let next = (self.ratio_percent as i16 + delta).clamp(1, 100) as u8;
        self.set_ratio(next)
    }

    /// Apply one of [`RATIO_PRESETS`] by index
    pub fn apply_preset(&mut self, index: usize) -> Result<(), WorkflowError> {
        match RATIO_PRESETS.get(index) {
            Some(&ratio) => self.set_ratio(ratio),
            None => Ok(()),
        }
    }

    /// Enter `Running` and hand out the work to drive
    ///
    /// Refused while the engine is not ready or a cancelled run still holds
    /// the session; the workflow then stays in `Configuring`.
    pub fn start(&mut self) -> Result<RunTicket, WorkflowError> {
        if self.state != WorkflowState::Configuring {
            return Err(self.invalid("start compression"));
        }
        let manager = self.controller.manager();
        if manager.state() != EngineState::Ready {
            let message = manager.error_message().unwrap_or_else(|| {
                "The compression engine is still loading; try again in a moment.".to_string()
            });
            return Err(WorkflowError::EngineUnavailable(message));
        }
        if self.controller.is_busy() {
            return Err(WorkflowError::SessionBusy);
        }
        let asset = match &self.asset {
            Some(asset) => asset.clone(),
            None => return Err(self.invalid("start compression")),
        };

        self.release_result();
        self.failure = None;
        self.next_run += 1;
        self.current_run = Some(self.next_run);
        self.state = WorkflowState::Running;
        info!(run = self.next_run, ratio = self.ratio_percent, "compression started");

        Ok(RunTicket {
            id: self.next_run,
            controller: Arc::clone(&self.controller),
            asset,
            ratio_percent: self.ratio_percent,
        })
    }

    /// Report a ticket's outcome
    ///
    /// Outcomes of tickets that were cancelled or superseded are ignored, and
    /// any output they produced is released.
    pub fn finish(&mut self, ticket_id: u64, outcome: Result<CompressionResult, SessionError>) {
        if self.state != WorkflowState::Running || self.current_run != Some(ticket_id) {
            if let Ok(result) = outcome {
                self.blobs().revoke(&result.blob);
            }
            debug!(run = ticket_id, "ignoring outcome of a superseded run");
            return;
        }
        self.current_run = None;

        match outcome {
            Ok(result) => {
                self.export_name = result.output_name.clone();
                self.preview = PreviewMode::Compressed;
                self.result = Some(result);
                self.state = WorkflowState::Succeeded;
            }
            // neither is a compression error: the run never started or was cancelled
            Err(SessionError::Abandoned | SessionError::Busy) => {
                self.state = WorkflowState::Configuring;
            }
            Err(e @ SessionError::EngineNotReady) => {
                self.fail(FailureKind::EngineUnavailable, e.user_message());
            }
            Err(e) => {
                self.fail(FailureKind::CompressionError, e.user_message());
            }
        }
    }

    /// Start and drive a compression to completion
    pub async fn compress(&mut self) -> Result<(), WorkflowError> {
        let ticket = self.start()?;
        let outcome = ticket.run().await;
        self.finish(ticket.id(), outcome);
        Ok(())
    }

    /// Best-effort cancel: abandons the run and returns to `Configuring`
    ///
    /// The engine is terminated; the caller must reload it (see
    /// [`crate::engine::EngineManager::reload`]) before the next start.
    pub fn cancel(&mut self) -> Result<(), WorkflowError> {
        if self.state != WorkflowState::Running {
            return Err(self.invalid("cancel"));
        }
        self.controller.abandon();
        self.current_run = None;
        self.state = WorkflowState::Configuring;
        Ok(())
    }

    /// Back to `Configuring` with the same file
    pub fn retry(&mut self) -> Result<(), WorkflowError> {
        let can_retry = matches!(self.state, WorkflowState::Succeeded | WorkflowState::Failed)
            && self.asset.is_some();
        if !can_retry {
            return Err(self.invalid("retry"));
        }
        self.release_result();
        self.failure = None;
        self.state = WorkflowState::Configuring;
        Ok(())
    }

    /// Drop the file and any output
    pub fn discard(&mut self) -> Result<(), WorkflowError> {
        if self.state == WorkflowState::Running {
            return Err(self.invalid("discard"));
        }
        self.release_result();
        self.asset = None;
        self.failure = None;
        self.highly_compressed = false;
        self.export_name.clear();
        self.ratio_percent = self.default_ratio;
        self.state = WorkflowState::Idle;
        Ok(())
    }

    pub fn toggle_preview(&mut self) -> Result<PreviewMode, WorkflowError> {
        if self.state != WorkflowState::Succeeded {
            return Err(self.invalid("toggle the preview"));
        }
        self.preview = match self.preview {
            PreviewMode::Original => PreviewMode::Compressed,
            PreviewMode::Compressed => PreviewMode::Original,
        };
        Ok(self.preview)
    }

    /// Bytes the preview currently shows
    pub fn preview_bytes(&self) -> Option<Arc<[u8]>> {
        match self.preview {
            PreviewMode::Original => self.asset.as_ref().map(|a| Arc::clone(a.bytes())),
            PreviewMode::Compressed => self
                .result
                .as_ref()
                .and_then(|r| self.blobs().get(&r.blob)),
        }
    }

    /// Edit the export file name; must be a bare file name
    pub fn set_export_name(&mut self, name: &str) -> Result<(), WorkflowError> {
        if self.state != WorkflowState::Succeeded {
            return Err(self.invalid("rename the export"));
        }
        let trimmed = name.trim();
        let bare = !trimmed.is_empty()
            && trimmed != "."
            && trimmed != ".."
            && !trimmed.contains(|c| c == '/' || c == '\\');
        if !bare {
            return Err(WorkflowError::InvalidExportName(name.to_string()));
        }
        self.export_name = trimmed.to_string();
        Ok(())
    }

    /// Write the compressed output into `dir` under the export name
    pub async fn save(&self, dir: &Path) -> Result<PathBuf, WorkflowError> {
        if self.state != WorkflowState::Succeeded {
            return Err(self.invalid("save"));
        }
        let bytes = self
            .result
            .as_ref()
            .and_then(|r| self.blobs().get(&r.blob))
            .ok_or(WorkflowError::OutputReleased)?;

        let path = dir.join(&self.export_name);
        tokio::fs::write(&path, &bytes[..]).await?;
        info!(path = %path.display(), bytes = bytes.len(), "saved compressed output");
        Ok(path)
    }
}
