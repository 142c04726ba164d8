//! vidpress
//!
//! Target-size video compression: plans encoder parameters from a size ratio,
//! drives an external encoding engine through one session at a time, and
//! tracks the user-facing workflow around it.

pub mod accept;
pub mod asset;
pub mod blob;
pub mod engine;
pub mod heuristic;
pub mod planner;
pub mod probe;
pub mod session;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use vidpress_config as config;
pub use vidpress_config::Config;
pub use accept::{check_accepted, UnsupportedFormat, ACCEPTED_EXTENSIONS};
pub use asset::{AcceptError, SourceAsset};
pub use blob::{BlobHandle, BlobStore};
pub use engine::{
    CoreSource, CoreVariant, Engine, EngineError, EngineEvent, EngineFactory, EngineManager,
    EngineSettings, EngineState, EventSink, FfmpegFactory, FileData, HostCapabilities, LoadError,
    LogKind, NativeHost,
};
pub use heuristic::{compare_sizes, is_highly_compressed, SizeOutcome};
pub use planner::{plan, EncodeParameters, ScaleDirective};
pub use probe::{FfprobeProbe, MetadataProbe, ProbeError, VideoMetadata};
pub use session::{CompressionResult, SessionController, SessionError, SessionStatus};
pub use workflow::{
    Failure, FailureKind, PreviewMode, RunTicket, Workflow, WorkflowError, WorkflowState,
    RATIO_PRESETS,
};
