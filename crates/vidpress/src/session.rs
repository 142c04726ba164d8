//! Compression session controller
//!
//! Runs one compression at a time against the loaded engine. Every run is
//! tagged with a fresh token; progress events are applied only while their
//! token is the active one, so a superseded or abandoned run can never move
//! the displayed progress.

use crate::asset::SourceAsset;
use crate::blob::{BlobHandle, BlobStore};
use crate::engine::{build_exec_args, Engine, EngineError, EngineEvent, EngineManager, LogKind};
use crate::heuristic::{compare_sizes, SizeOutcome};
use crate::planner::{plan, EncodeParameters};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Storage name of the engine's output
pub const OUTPUT_NAME: &str = "output.mp4";

/// Interval of the cosmetic elapsed-time ticker
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Progress never shows 100 while the engine is still running
const MAX_RUNNING_PERCENT: f64 = 99.0;

/// Error type for compression sessions
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Engine is not ready")]
    EngineNotReady,

    #[error("A compression is already running")]
    Busy,

    /// The engine was terminated under the running session
    #[error("Compression was abandoned")]
    Abandoned,

    /// Writing, running or reading back failed inside the engine
    #[error("Compression failed: {0}")]
    CompressionFailed(#[source] EngineError),
}

impl SessionError {
    /// Text for the user; engine detail stays in the logs
    pub fn user_message(&self) -> String {
        match self {
            SessionError::EngineNotReady => {
                "The compression engine is not ready yet.".to_string()
            }
            SessionError::Busy => "A compression is already running.".to_string(),
            SessionError::Abandoned => "Compression was cancelled.".to_string(),
            SessionError::CompressionFailed(_) => {
                "Compression failed. Please try again, or try a different ratio.".to_string()
            }
        }
    }
}

/// Where the active session is in its run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retired,
}

/// Output of a successful session
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionResult {
    pub blob: BlobHandle,
    pub output_size: u64,
    pub input_size: u64,
    /// Export name, `<stem>_compressed.mp4` until the user edits it
    pub output_name: String,
    /// Wall-clock time from start to end instant
    pub elapsed: Duration,
    pub params: EncodeParameters,
}

impl CompressionResult {
    pub fn size_outcome(&self) -> SizeOutcome {
        compare_sizes(self.input_size, self.output_size)
    }
}

#[derive(Debug)]
struct ActiveSession {
    token: Uuid,
    status: SessionStatus,
    duration_secs: f64,
    fraction: f64,
    processed_secs: f64,
    ticks: u64,
}

#[derive(Debug, Default)]
struct Shared {
    active: Mutex<Option<ActiveSession>>,
    /// Token of the last retired session, until the next one begins
    retired: Mutex<Option<Uuid>>,
}

impl Shared {
    fn begin(&self, token: Uuid, duration_secs: f64) {
        *self.retired.lock() = None;
        *self.active.lock() = Some(ActiveSession {
            token,
            status: SessionStatus::Pending,
            duration_secs,
            fraction: 0.0,
            processed_secs: 0.0,
            ticks: 0,
        });
    }

    fn set_status(&self, token: Uuid, status: SessionStatus) {
        if let Some(s) = self.active.lock().as_mut().filter(|s| s.token == token) {
            s.status = status;
        }
    }

    /// Clear the active session if it is still `token`'s
    fn retire(&self, token: Uuid) -> bool {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|s| s.token == token) {
            *active = None;
            *self.retired.lock() = Some(token);
            true
        } else {
            false
        }
    }

    fn retire_any(&self) -> Option<Uuid> {
        let token = self.active.lock().take().map(|s| s.token)?;
        *self.retired.lock() = Some(token);
        Some(token)
    }

    fn apply(&self, token: Uuid, event: &EngineEvent) -> bool {
        let mut active = self.active.lock();
        let Some(session) = active.as_mut().filter(|s| s.token == token) else {
            return false;
        };
        match event {
            EngineEvent::Progress {
                fraction,
                processed_secs,
            } => {
                if fraction.is_finite() {
                    session.fraction = *fraction;
                }
                if processed_secs.is_finite() {
                    session.processed_secs = *processed_secs;
                }
            }
            EngineEvent::Log { kind, message } => match kind {
                LogKind::Stderr => trace!(%token, "{}", message),
                LogKind::Stdout | LogKind::Info => debug!(%token, "{}", message),
            },
        }
        true
    }

    fn tick(&self, token: Uuid) -> bool {
        match self.active.lock().as_mut().filter(|s| s.token == token) {
            Some(session) => {
                session.ticks += 1;
                true
            }
            None => false,
        }
    }
}

/// Retires the session however `run` ends, including when its future is dropped
struct SessionGuard {
    shared: Arc<Shared>,
    token: Uuid,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if self.shared.retire(self.token) {
            debug!(token = %self.token, "session retired");
        }
    }
}

/// Runs compression sessions against the engine owned by an [`EngineManager`]
pub struct SessionController {
    manager: Arc<EngineManager>,
    blobs: Arc<BlobStore>,
    permit: Arc<Semaphore>,
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(manager: Arc<EngineManager>, blobs: Arc<BlobStore>) -> Self {
        Self {
            manager,
            blobs,
            permit: Arc::new(Semaphore::new(1)),
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn manager(&self) -> &Arc<EngineManager> {
        &self.manager
    }

    pub fn blobs(&self) -> &Arc<BlobStore> {
        &self.blobs
    }

    /// Whether a session currently holds the run permit
    pub fn is_busy(&self) -> bool {
        self.permit.available_permits() == 0
    }

    /// Token of the active session
    pub fn active_token(&self) -> Option<Uuid> {
        self.shared.active.lock().as_ref().map(|s| s.token)
    }

    /// Status of the active session, or `Retired` once the last one ended
    pub fn status(&self) -> Option<SessionStatus> {
        if let Some(session) = self.shared.active.lock().as_ref() {
            return Some(session.status);
        }
        let retired = *self.shared.retired.lock();
        retired.map(|_| SessionStatus::Retired)
    }

    /// Compress `asset` to roughly `ratio_percent` of its size
    pub async fn run(
        &self,
        asset: &SourceAsset,
        ratio_percent: u8,
    ) -> Result<CompressionResult, SessionError> {
        let engine = self.manager.engine().ok_or(SessionError::EngineNotReady)?;
        let _permit = Arc::clone(&self.permit)
            .try_acquire_owned()
            .map_err(|_| SessionError::Busy)?;

        let token = Uuid::new_v4();
        let started = Instant::now();
        self.shared.begin(token, asset.duration_secs());

        let events = self.manager.subscribe();
        let _guard = SessionGuard {
            shared: Arc::clone(&self.shared),
            token,
            tasks: vec![
                tokio::spawn(forward_events(Arc::clone(&self.shared), token, events)),
                tokio::spawn(run_ticker(Arc::clone(&self.shared), token)),
            ],
        };

        match self.execute(engine.as_ref(), asset, ratio_percent, token).await {
            Ok((bytes, params)) => {
                let elapsed = started.elapsed();
                let output_size = bytes.len() as u64;
                let blob = self.blobs.create(bytes);
                self.shared.set_status(token, SessionStatus::Succeeded);
                info!(
                    %token,
                    input_size = asset.size_bytes(),
                    output_size,
                    elapsed_secs = elapsed.as_secs_f64(),
                    "compression finished"
                );
                Ok(CompressionResult {
                    blob,
                    output_size,
                    input_size: asset.size_bytes(),
                    output_name: asset.default_output_name(),
                    elapsed,
                    params,
                })
            }
            Err(EngineError::Terminated) => {
                self.shared.set_status(token, SessionStatus::Failed);
                warn!(%token, "compression abandoned");
                Err(SessionError::Abandoned)
            }
            Err(e) => {
                self.shared.set_status(token, SessionStatus::Failed);
                error!(%token, error = %e, "compression failed");
                Err(SessionError::CompressionFailed(e))
            }
        }
    }

    async fn execute(
        &self,
        engine: &dyn Engine,
        asset: &SourceAsset,
        ratio_percent: u8,
        token: Uuid,
    ) -> Result<(Vec<u8>, EncodeParameters), EngineError> {
        let input = asset.input_name();
        engine.write_file(&input, asset.bytes()).await?;

        let params = plan(
            asset.size_bytes(),
            asset.duration_secs(),
            ratio_percent,
            asset.width(),
            asset.height(),
        );
        let args = build_exec_args(
            &params,
            &input,
            OUTPUT_NAME,
            self.manager.thread_hint(),
            asset.width(),
            asset.height(),
        );

        info!(
            %token,
            ratio_percent,
            bitrate_kbps = params.video_bitrate_kbps,
            scale = ?params.scale,
            "starting compression"
        );
        self.shared.set_status(token, SessionStatus::Running);
        engine.exec(&args).await?;

        // shared views are copied before anything keeps them
        let bytes = engine.read_file(OUTPUT_NAME).await?.into_owned();

        for name in [input.as_str(), OUTPUT_NAME] {
            if let Err(e) = engine.delete_file(name).await {
                debug!(%token, name, error = %e, "engine file cleanup failed");
            }
        }

        Ok((bytes, params))
    }

    /// Apply an engine event tagged with `token`
    ///
    /// Events for any token other than the active one are dropped. Returns
    /// whether the event was applied.
    pub fn apply_event(&self, token: Uuid, event: &EngineEvent) -> bool {
        self.shared.apply(token, event)
    }

    /// Progress of the active session, 0..=99
    ///
    /// 0 with no active session. Uses the engine's fraction when it reports
    /// one, otherwise processed time against the source duration.
    pub fn progress_percent(&self) -> u8 {
        let active = self.shared.active.lock();
        let Some(session) = active.as_ref() else {
            return 0;
        };

        let percent = if session.fraction > 0.0 && session.fraction <= 1.0 {
            (session.fraction * 100.0).round()
        } else if session.duration_secs > 0.0 {
            (session.processed_secs / session.duration_secs * 100.0).round()
        } else {
            0.0
        };
        percent.clamp(0.0, MAX_RUNNING_PERCENT) as u8
    }

    /// Elapsed time from the cosmetic ticker; the result's `elapsed` is authoritative
    pub fn display_elapsed(&self) -> Duration {
        let ticks = self
            .shared
            .active
            .lock()
            .as_ref()
            .map(|s| s.ticks)
            .unwrap_or(0);
        TICK_INTERVAL * ticks as u32
    }

    /// Give up on the running session
    ///
    /// The engine has no way to interrupt a job short of being terminated, so
    /// this terminates it: the running `run` returns
    /// [`SessionError::Abandoned`] and the engine must be reloaded before the
    /// next session.
    pub fn abandon(&self) {
        if let Some(token) = self.shared.retire_any() {
            warn!(%token, "abandoning compression; engine will be reloaded");
        }
        self.manager.terminate();
    }
}

async fn forward_events(
    shared: Arc<Shared>,
    token: Uuid,
    mut events: broadcast::Receiver<EngineEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                shared.apply(token, &event);
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!(%token, skipped, "engine events lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn run_ticker(shared: Arc<Shared>, token: Uuid) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    // first tick completes immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        if !shared.tick(token) {
            break;
        }
    }
}
