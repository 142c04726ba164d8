//! Engine boundary for vidpress
//!
//! The encoding engine is an external collaborator. This module defines the
//! contract it must satisfy, the events it emits, and the lifecycle manager
//! that owns an instance of it.

pub mod args;
pub mod capabilities;
pub mod ffmpeg;
pub mod manager;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

pub use args::build_exec_args;
pub use capabilities::{Capability, CapabilityProbe, HostCapabilities, NativeHost};
pub use ffmpeg::{banner_major_version, FfmpegEngine, FfmpegFactory};
pub use manager::{EngineManager, EngineSettings, EngineState, LoadError};

/// Error type for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// An operation was attempted before a successful load
    #[error("Engine is not loaded")]
    NotLoaded,

    /// The instance was terminated; it cannot be reused
    #[error("Engine was terminated")]
    Terminated,

    /// The core could not be acquired from the given source
    #[error("Engine core unavailable: {0}")]
    CoreUnavailable(String),

    /// A working-storage file name that would escape the engine's storage
    #[error("Invalid engine file name: {0}")]
    InvalidName(String),

    /// The job ran and failed
    #[error("Engine job failed (exit code {code:?}): {detail}")]
    ExecFailed { code: Option<i32>, detail: String },

    /// IO error talking to the engine
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which build of the engine core to load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreVariant {
    /// Multi-worker build; requires the accelerated-mode capabilities
    MultiThread,
    /// Single-threaded build; always available, slower
    SingleThread,
}

impl CoreVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoreVariant::MultiThread => "multi-thread",
            CoreVariant::SingleThread => "single-thread",
        }
    }
}

/// A place the engine core can be acquired from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreSource {
    /// Short name used in logs and aggregated errors ("primary", "fallback")
    pub label: String,
    /// Engine-specific location, e.g. a binary path
    pub location: String,
}

impl CoreSource {
    pub fn new(label: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            location: location.into(),
        }
    }
}

/// Kind of a log line emitted by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Stdout,
    Stderr,
    Info,
}

/// Fire-and-forget notification emitted while the engine works
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// `fraction` is in 0..=1 (0 when the engine cannot tell);
    /// `processed_secs` is media time processed so far
    Progress { fraction: f64, processed_secs: f64 },
    Log { kind: LogKind, message: String },
}

/// Bytes read back from engine storage
///
/// `Shared` views may be aliased by the engine and must be copied before
/// being handed to anything that keeps them.
#[derive(Debug, Clone)]
pub enum FileData {
    Owned(Vec<u8>),
    Shared(Arc<[u8]>),
}

impl FileData {
    pub fn len(&self) -> usize {
        match self {
            FileData::Owned(v) => v.len(),
            FileData::Shared(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take ownership, copying shared views into a fresh buffer
    pub fn into_owned(self) -> Vec<u8> {
        match self {
            FileData::Owned(v) => v,
            FileData::Shared(s) => s.to_vec(),
        }
    }
}

/// Event sender handed to one engine instance
///
/// Every sink is stamped with the generation of the instance it belongs to.
/// Once the manager moves to a new generation (terminate or reload), events
/// from older instances are dropped here.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<EngineEvent>,
    generation: u64,
    current: Arc<AtomicU64>,
}

impl EventSink {
    pub(crate) fn new(
        tx: broadcast::Sender<EngineEvent>,
        generation: u64,
        current: Arc<AtomicU64>,
    ) -> Self {
        Self {
            tx,
            generation,
            current,
        }
    }

    /// A sink not attached to any manager, for driving an engine directly
    pub fn detached() -> (Self, broadcast::Receiver<EngineEvent>) {
        let (tx, rx) = broadcast::channel(256);
        (Self::new(tx, 0, Arc::new(AtomicU64::new(0))), rx)
    }

    /// Whether this sink's instance is still the manager's current one
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    pub fn emit(&self, event: EngineEvent) {
        if !self.is_current() {
            return;
        }
        // No subscribers is fine; events are notifications only
        let _ = self.tx.send(event);
    }

    pub fn progress(&self, fraction: f64, processed_secs: f64) {
        self.emit(EngineEvent::Progress {
            fraction,
            processed_secs,
        });
    }

    pub fn log(&self, kind: LogKind, message: impl Into<String>) {
        self.emit(EngineEvent::Log {
            kind,
            message: message.into(),
        });
    }
}

/// The external encoding engine
///
/// All operations are asynchronous. `exec` may run for an unbounded time;
/// `terminate` must make an in-flight `exec` return promptly with
/// [`EngineError::Terminated`] and leaves the instance unusable.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Acquire the engine core from `core`
    async fn load(&self, core: &CoreSource) -> Result<(), EngineError>;

    /// Put `data` into the engine's working storage under `name`
    async fn write_file(&self, name: &str, data: &[u8]) -> Result<(), EngineError>;

    /// Run one job with the given argument vector
    async fn exec(&self, args: &[String]) -> Result<(), EngineError>;

    /// Read a file back from working storage
    async fn read_file(&self, name: &str) -> Result<FileData, EngineError>;

    /// Remove a file from working storage
    async fn delete_file(&self, name: &str) -> Result<(), EngineError>;

    /// Release every resource held by this instance; idempotent
    fn terminate(&self);
}

/// Creates fresh engine instances; a terminated instance is never reused
pub trait EngineFactory: Send + Sync {
    fn create(&self, variant: CoreVariant, events: EventSink) -> Arc<dyn Engine>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_data_copies_shared_views() {
        let shared: Arc<[u8]> = Arc::from(vec![1u8, 2, 3]);
        let data = FileData::Shared(Arc::clone(&shared));
        assert_eq!(data.len(), 3);
        let owned = data.into_owned();
        assert_eq!(owned, vec![1, 2, 3]);
        // the original view is untouched and still shared only with us
        assert_eq!(Arc::strong_count(&shared), 1);
    }

    #[tokio::test]
    async fn test_sink_drops_events_from_stale_generation() {
        let (tx, mut rx) = broadcast::channel(8);
        let current = Arc::new(AtomicU64::new(1));
        let old = EventSink::new(tx.clone(), 1, Arc::clone(&current));

        old.progress(0.5, 1.0);
        current.store(2, Ordering::SeqCst);
        old.progress(0.9, 2.0);

        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::Progress {
                fraction: 0.5,
                processed_secs: 1.0
            }
        );
        assert!(rx.try_recv().is_err());
    }
}
