//! Scripted engine and probe doubles for tests

use crate::engine::{
    CoreSource, CoreVariant, Engine, EngineError, EngineFactory, EventSink, FileData,
};
use crate::probe::{MetadataProbe, ProbeError, VideoMetadata};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

#[derive(Debug, Clone)]
pub(crate) enum LoadBehavior {
    Succeed,
    Fail(&'static str),
    Hang,
}

/// What every engine created by a [`FakeFactory`] will do
#[derive(Debug, Clone)]
pub(crate) struct Script {
    pub primary: LoadBehavior,
    pub fallback: LoadBehavior,
    /// (fraction, processed seconds) emitted at the start of `exec`
    pub progress: Vec<(f64, f64)>,
    /// `Some(detail)` makes `exec` fail with that detail
    pub exec_failure: Option<&'static str>,
    /// Written to `output.mp4` when `exec` succeeds
    pub output: Vec<u8>,
    /// Hand the output back as a shared view instead of an owned buffer
    pub shared_output: bool,
    /// `exec` waits for [`FakeFactory::release`] (or terminate) before finishing
    pub hold_exec: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            primary: LoadBehavior::Succeed,
            fallback: LoadBehavior::Succeed,
            progress: Vec::new(),
            exec_failure: None,
            output: vec![0u8; 1_000],
            shared_output: false,
            hold_exec: false,
        }
    }
}

pub(crate) struct FakeEngine {
    pub variant: CoreVariant,
    script: Script,
    sink: EventSink,
    release: Arc<Notify>,
    terminated: watch::Sender<bool>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    pub loads: Mutex<Vec<String>>,
    pub exec_args: Mutex<Vec<Vec<String>>>,
    pub deleted: Mutex<Vec<String>>,
    pub last_shared: Mutex<Option<Arc<[u8]>>>,
}

impl FakeEngine {
    pub fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Emit a progress event from this instance, whatever its state
    pub fn emit_progress(&self, fraction: f64, processed_secs: f64) {
        self.sink.progress(fraction, processed_secs);
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn load(&self, core: &CoreSource) -> Result<(), EngineError> {
        self.loads.lock().push(core.label.clone());
        let behavior = if core.label == "primary" {
            &self.script.primary
        } else {
            &self.script.fallback
        };
        match behavior {
            LoadBehavior::Succeed => Ok(()),
            LoadBehavior::Fail(why) => Err(EngineError::CoreUnavailable(why.to_string())),
            LoadBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    async fn write_file(&self, name: &str, data: &[u8]) -> Result<(), EngineError> {
        if self.is_terminated() {
            return Err(EngineError::Terminated);
        }
        self.files.lock().insert(name.to_string(), data.to_vec());
        Ok(())
    }

    async fn exec(&self, args: &[String]) -> Result<(), EngineError> {
        let mut terminated = self.terminated.subscribe();
        if *terminated.borrow() {
            return Err(EngineError::Terminated);
        }
        self.exec_args.lock().push(args.to_vec());

        for &(fraction, secs) in &self.script.progress {
            self.sink.progress(fraction, secs);
            tokio::task::yield_now().await;
        }

        if self.script.hold_exec {
            tokio::select! {
                _ = self.release.notified() => {}
                _ = terminated.changed() => return Err(EngineError::Terminated),
            }
        }

        if let Some(detail) = self.script.exec_failure {
            return Err(EngineError::ExecFailed {
                code: Some(1),
                detail: detail.to_string(),
            });
        }

        let output = args.last().cloned().unwrap_or_default();
        self.files.lock().insert(output, self.script.output.clone());
        Ok(())
    }

    async fn read_file(&self, name: &str) -> Result<FileData, EngineError> {
        let bytes = self.files.lock().get(name).cloned().ok_or_else(|| {
            EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                name.to_string(),
            ))
        })?;
        if self.script.shared_output {
            let shared: Arc<[u8]> = Arc::from(bytes);
            *self.last_shared.lock() = Some(Arc::clone(&shared));
            Ok(FileData::Shared(shared))
        } else {
            Ok(FileData::Owned(bytes))
        }
    }

    async fn delete_file(&self, name: &str) -> Result<(), EngineError> {
        self.files.lock().remove(name);
        self.deleted.lock().push(name.to_string());
        Ok(())
    }

    fn terminate(&self) {
        self.terminated.send_replace(true);
        self.files.lock().clear();
    }
}

/// Factory that hands out [`FakeEngine`]s running the current [`Script`]
#[derive(Default)]
pub(crate) struct FakeFactory {
    script: Mutex<Script>,
    created: Mutex<Vec<Arc<FakeEngine>>>,
    release: Arc<Notify>,
}

impl FakeFactory {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            ..Default::default()
        })
    }

    /// Affects engines created from now on
    pub fn set_script(&self, script: Script) {
        *self.script.lock() = script;
    }

    pub fn created(&self) -> Vec<Arc<FakeEngine>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<FakeEngine>> {
        self.created.lock().last().cloned()
    }

    /// Let one held `exec` finish
    pub fn release(&self) {
        self.release.notify_one();
    }
}

impl EngineFactory for FakeFactory {
    fn create(&self, variant: CoreVariant, events: EventSink) -> Arc<dyn Engine> {
        let (terminated, _) = watch::channel(false);
        let engine = Arc::new(FakeEngine {
            variant,
            script: self.script.lock().clone(),
            sink: events,
            release: Arc::clone(&self.release),
            terminated,
            files: Mutex::new(HashMap::new()),
            loads: Mutex::new(Vec::new()),
            exec_args: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            last_shared: Mutex::new(None),
        });
        self.created.lock().push(Arc::clone(&engine));
        engine
    }
}

/// Probe answering with fixed metadata, or failing
pub(crate) struct FakeProbe {
    pub result: Option<VideoMetadata>,
}

impl FakeProbe {
    pub fn returning(duration_secs: f64, width: u32, height: u32) -> Self {
        Self {
            result: Some(VideoMetadata {
                duration_secs,
                width,
                height,
            }),
        }
    }

    pub fn failing() -> Self {
        Self { result: None }
    }
}

#[async_trait]
impl MetadataProbe for FakeProbe {
    async fn probe(&self, _path: &Path) -> Result<VideoMetadata, ProbeError> {
        self.result
            .ok_or(ProbeError::TimedOut(Duration::from_secs(10)))
    }
}

/// Poll `check` until it holds or a second passes
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
