//! Engine lifecycle management
//!
//! Owns at most one engine instance and moves it through
//! `Idle -> Loading -> Ready`, or `Loading -> Error`. `Error` stays put until
//! an explicit reload.

use super::capabilities::{Capability, CapabilityProbe};
use super::{CoreSource, CoreVariant, Engine, EngineEvent, EngineFactory, EventSink};
use crate::config::{EngineConfig, MissingCapabilitiesPolicy};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Lifecycle state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Loading,
    Ready,
    Error,
}

fn join_capabilities(missing: &[Capability]) -> String {
    missing
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Why the engine could not be made ready
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    /// The host lacks what the multi-threaded core needs and policy says fail
    #[error("Missing host capabilities: {}", join_capabilities(.0))]
    MissingCapabilities(Vec<Capability>),

    /// Both core sources failed; both causes are kept
    #[error("Engine failed to load (primary: {primary}; fallback: {fallback})")]
    AllSourcesFailed { primary: String, fallback: String },

    /// `terminate` was called while the load was in flight
    #[error("Engine load was cancelled by terminate")]
    Superseded,
}

impl LoadError {
    /// Text meant for the user, with what to do next
    pub fn user_message(&self) -> String {
        match self {
            LoadError::MissingCapabilities(missing) => {
                let fixes = missing
                    .iter()
                    .map(|c| format!("- {}: {}", c, c.remediation()))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!(
                    "The compression engine needs {} which this host does not provide.\n{}",
                    join_capabilities(missing),
                    fixes
                )
            }
            LoadError::AllSourcesFailed { .. } => {
                "The compression engine could not be loaded. Check that ffmpeg is installed \
                 (engine.primary_core / engine.fallback_core) and press r to retry."
                    .to_string()
            }
            LoadError::Superseded => "Engine loading was cancelled.".to_string(),
        }
    }
}

/// Engine settings resolved from configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub primary: CoreSource,
    pub fallback: CoreSource,
    pub load_timeout: Duration,
    pub missing_capabilities: MissingCapabilitiesPolicy,
    /// Thread hint passed to jobs; 0 means derive from the core variant
    pub threads: u32,
}

impl EngineSettings {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            primary: CoreSource::new("primary", &cfg.primary_core),
            fallback: CoreSource::new("fallback", &cfg.fallback_core),
            load_timeout: Duration::from_secs(cfg.load_timeout_secs),
            missing_capabilities: cfg.missing_capabilities,
            threads: cfg.threads,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

struct Inner {
    state: EngineState,
    engine: Option<Arc<dyn Engine>>,
    variant: Option<CoreVariant>,
    error: Option<LoadError>,
    /// Bumped by every terminate; a load that started in an older epoch is stale
    epoch: u64,
}

/// Owns the engine instance and its lifecycle
pub struct EngineManager {
    factory: Arc<dyn EngineFactory>,
    host: Arc<dyn CapabilityProbe>,
    settings: EngineSettings,
    inner: Mutex<Inner>,
    events: broadcast::Sender<EngineEvent>,
    generation: Arc<AtomicU64>,
}

impl EngineManager {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        host: Arc<dyn CapabilityProbe>,
        settings: EngineSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            factory,
            host,
            settings,
            inner: Mutex::new(Inner {
                state: EngineState::Idle,
                engine: None,
                variant: None,
                error: None,
                epoch: 0,
            }),
            events,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> EngineState {
        self.inner.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == EngineState::Ready
    }

    /// Core variant of the loaded instance
    pub fn variant(&self) -> Option<CoreVariant> {
        self.inner.lock().variant
    }

    /// The failure that put the manager in `Error`
    pub fn error(&self) -> Option<LoadError> {
        self.inner.lock().error.clone()
    }

    pub fn error_message(&self) -> Option<String> {
        self.error().map(|e| e.user_message())
    }

    /// The loaded instance, only while `Ready`
    pub fn engine(&self) -> Option<Arc<dyn Engine>> {
        let inner = self.inner.lock();
        match inner.state {
            EngineState::Ready => inner.engine.clone(),
            _ => None,
        }
    }

    /// Events from the current instance; older instances never reach this
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Thread hint for jobs on the loaded core
    ///
    /// The single-threaded core always gets 1. Otherwise the configured value,
    /// falling back to the number of CPUs.
    pub fn thread_hint(&self) -> usize {
        match self.variant() {
            Some(CoreVariant::SingleThread) => 1,
            _ if self.settings.threads > 0 => self.settings.threads as usize,
            _ => num_cpus::get(),
        }
    }

    /// Make the engine ready
    ///
    /// Returns immediately when already `Ready` or while another load is in
    /// flight. In `Error` the stored failure is returned without retrying;
    /// only [`EngineManager::reload`] leaves that state. Tries the primary
    /// source, then the fallback, each bounded by the load timeout.
    pub async fn load(&self) -> Result<(), LoadError> {
        let epoch = {
            let mut inner = self.inner.lock();
            match (inner.state, inner.error.clone()) {
                (EngineState::Ready | EngineState::Loading, _) => return Ok(()),
                (EngineState::Error, Some(e)) => return Err(e),
                _ => {
                    inner.state = EngineState::Loading;
                    inner.error = None;
                    inner.epoch
                }
            }
        };

        let variant = match self.select_variant() {
            Ok(variant) => variant,
            Err(e) => return self.finish(epoch, Err(e)),
        };
        info!(variant = variant.as_str(), "loading engine");

        let primary_cause = match self.try_source(variant, &self.settings.primary).await {
            Ok(engine) => return self.finish(epoch, Ok((engine, variant))),
            Err(cause) => cause,
        };

        if self.inner.lock().epoch != epoch {
            return Err(LoadError::Superseded);
        }
        warn!(cause = %primary_cause, "primary engine core failed, trying fallback");

        match self.try_source(variant, &self.settings.fallback).await {
            Ok(engine) => self.finish(epoch, Ok((engine, variant))),
            Err(fallback_cause) => self.finish(
                epoch,
                Err(LoadError::AllSourcesFailed {
                    primary: primary_cause,
                    fallback: fallback_cause,
                }),
            ),
        }
    }

    /// Release the instance; idempotent
    ///
    /// Any in-flight job fails, and events from the released instance are
    /// dropped from now on. A later `load` acquires a fresh instance.
    pub fn terminate(&self) {
        let engine = {
            let mut inner = self.inner.lock();
            inner.epoch += 1;
            inner.state = EngineState::Idle;
            inner.variant = None;
            inner.error = None;
            inner.engine.take()
        };
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(engine) = engine {
            info!("terminating engine");
            engine.terminate();
        }
    }

    /// Terminate and load again
    pub async fn reload(&self) -> Result<(), LoadError> {
        self.terminate();
        self.load().await
    }

    fn select_variant(&self) -> Result<CoreVariant, LoadError> {
        let caps = self.host.capabilities();
        let missing = caps.missing();
        if missing.is_empty() {
            return Ok(CoreVariant::MultiThread);
        }

        match self.settings.missing_capabilities {
            MissingCapabilitiesPolicy::Fail => {
                warn!(missing = %join_capabilities(&missing), "host lacks engine capabilities");
                Err(LoadError::MissingCapabilities(missing))
            }
            MissingCapabilitiesPolicy::Degrade => {
                warn!(
                    missing = %join_capabilities(&missing),
                    "host lacks engine capabilities, using the single-threaded core"
                );
                Ok(CoreVariant::SingleThread)
            }
        }
    }

    async fn try_source(
        &self,
        variant: CoreVariant,
        source: &CoreSource,
    ) -> Result<Arc<dyn Engine>, String> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let sink = EventSink::new(self.events.clone(), generation, Arc::clone(&self.generation));
        let engine = self.factory.create(variant, sink);

        debug!(source = %source.label, location = %source.location, "loading engine core");
        match tokio::time::timeout(self.settings.load_timeout, engine.load(source)).await {
            Ok(Ok(())) => Ok(engine),
            Ok(Err(e)) => {
                engine.terminate();
                Err(format!("{}: {}", source.label, e))
            }
            Err(_) => {
                engine.terminate();
                Err(format!(
                    "{}: timed out after {}s",
                    source.label,
                    self.settings.load_timeout.as_secs_f64()
                ))
            }
        }
    }

    fn finish(
        &self,
        epoch: u64,
        result: Result<(Arc<dyn Engine>, CoreVariant), LoadError>,
    ) -> Result<(), LoadError> {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            drop(inner);
            if let Ok((engine, _)) = result {
                engine.terminate();
            }
            return Err(LoadError::Superseded);
        }

        match result {
            Ok((engine, variant)) => {
                inner.state = EngineState::Ready;
                inner.engine = Some(engine);
                inner.variant = Some(variant);
                info!(variant = variant.as_str(), "engine ready");
                Ok(())
            }
            Err(e) => {
                inner.state = EngineState::Error;
                inner.error = Some(e.clone());
                warn!(error = %e, "engine failed to load");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HostCapabilities;
    use crate::testing::{FakeFactory, LoadBehavior, Script};

    fn settings(policy: MissingCapabilitiesPolicy) -> EngineSettings {
        EngineSettings {
            primary: CoreSource::new("primary", "core-a"),
            fallback: CoreSource::new("fallback", "core-b"),
            load_timeout: Duration::from_millis(50),
            missing_capabilities: policy,
            threads: 0,
        }
    }

    fn manager_with(
        script: Script,
        caps: HostCapabilities,
        policy: MissingCapabilitiesPolicy,
    ) -> (EngineManager, Arc<FakeFactory>) {
        let factory = FakeFactory::new(script);
        let manager = EngineManager::new(factory.clone(), Arc::new(caps), settings(policy));
        (manager, factory)
    }

    fn manager(script: Script) -> (EngineManager, Arc<FakeFactory>) {
        manager_with(
            script,
            HostCapabilities::all(),
            MissingCapabilitiesPolicy::Fail,
        )
    }

    #[tokio::test]
    async fn test_load_from_primary() {
        let (manager, factory) = manager(Script::default());
        assert_eq!(manager.state(), EngineState::Idle);
        assert!(manager.engine().is_none());

        manager.load().await.unwrap();

        assert_eq!(manager.state(), EngineState::Ready);
        assert_eq!(manager.variant(), Some(CoreVariant::MultiThread));
        assert!(manager.engine().is_some());
        let created = factory.created();
        assert_eq!(created.len(), 1);
        assert_eq!(*created[0].loads.lock(), vec!["primary".to_string()]);
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let (manager, factory) = manager(Script::default());
        manager.load().await.unwrap();
        manager.load().await.unwrap();
        assert_eq!(factory.created().len(), 1);
    }

    #[tokio::test]
    async fn test_primary_failure_falls_back() {
        let (manager, factory) = manager(Script {
            primary: LoadBehavior::Fail("network down"),
            ..Script::default()
        });

        manager.load().await.unwrap();

        assert!(manager.is_ready());
        let created = factory.created();
        assert_eq!(created.len(), 2);
        // the failed instance is released, the fallback one is kept
        assert!(created[0].is_terminated());
        assert!(!created[1].is_terminated());
        assert_eq!(*created[1].loads.lock(), vec!["fallback".to_string()]);
    }

    #[tokio::test]
    async fn test_primary_timeout_falls_back() {
        let (manager, _factory) = manager(Script {
            primary: LoadBehavior::Hang,
            ..Script::default()
        });
        manager.load().await.unwrap();
        assert!(manager.is_ready());
    }

    #[tokio::test]
    async fn test_both_sources_failing_aggregates_causes() {
        let (manager, factory) = manager(Script {
            primary: LoadBehavior::Fail("cdn unreachable"),
            fallback: LoadBehavior::Hang,
            ..Script::default()
        });

        let err = manager.load().await.unwrap_err();
        match &err {
            LoadError::AllSourcesFailed { primary, fallback } => {
                assert!(primary.contains("cdn unreachable"));
                assert!(fallback.contains("timed out"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(manager.state(), EngineState::Error);
        assert_eq!(manager.error(), Some(err.clone()));
        assert!(manager.engine().is_none());

        // Error is sticky until an explicit reload
        factory.set_script(Script::default());
        assert_eq!(manager.load().await, Err(err.clone()));
        assert_eq!(manager.state(), EngineState::Error);
        manager.reload().await.unwrap();
        assert!(manager.is_ready());
    }

    #[tokio::test]
    async fn test_load_in_error_state_does_not_retry() {
        let (manager, factory) = manager(Script {
            primary: LoadBehavior::Fail("bad core"),
            fallback: LoadBehavior::Fail("bad core"),
            ..Script::default()
        });
        let err = manager.load().await.unwrap_err();
        let created = factory.created().len();

        factory.set_script(Script::default());
        assert_eq!(manager.load().await, Err(err));
        assert_eq!(manager.state(), EngineState::Error);
        assert!(manager.engine().is_none());
        assert_eq!(factory.created().len(), created);
    }

    #[tokio::test]
    async fn test_missing_capabilities_fail_policy() {
        let caps = HostCapabilities {
            shared_memory: false,
            cross_origin_isolated: true,
        };
        let (manager, factory) =
            manager_with(Script::default(), caps, MissingCapabilitiesPolicy::Fail);

        let err = manager.load().await.unwrap_err();
        assert_eq!(
            err,
            LoadError::MissingCapabilities(vec![Capability::SharedMemory])
        );
        assert!(err.user_message().contains("degrade"));
        assert_eq!(manager.state(), EngineState::Error);
        assert!(factory.created().is_empty());
    }

    #[tokio::test]
    async fn test_missing_capabilities_degrade_policy() {
        let caps = HostCapabilities {
            shared_memory: true,
            cross_origin_isolated: false,
        };
        let (manager, factory) =
            manager_with(Script::default(), caps, MissingCapabilitiesPolicy::Degrade);

        manager.load().await.unwrap();
        assert_eq!(manager.variant(), Some(CoreVariant::SingleThread));
        assert_eq!(manager.thread_hint(), 1);
        assert_eq!(
            factory.last().map(|e| e.variant),
            Some(CoreVariant::SingleThread)
        );
    }

    #[tokio::test]
    async fn test_thread_hint_prefers_configured_value() {
        let factory = FakeFactory::new(Script::default());
        let mut s = settings(MissingCapabilitiesPolicy::Fail);
        s.threads = 3;
        let manager = EngineManager::new(factory, Arc::new(HostCapabilities::all()), s);
        manager.load().await.unwrap();
        assert_eq!(manager.thread_hint(), 3);
    }

    #[tokio::test]
    async fn test_terminate_releases_and_drops_stale_events() {
        let (manager, factory) = manager(Script::default());
        manager.load().await.unwrap();
        let mut events = manager.subscribe();

        let first = factory.last().unwrap();
        first.emit_progress(0.25, 1.0);
        assert!(matches!(
            events.recv().await,
            Ok(EngineEvent::Progress { .. })
        ));

        manager.terminate();
        manager.terminate();
        assert_eq!(manager.state(), EngineState::Idle);
        assert!(first.is_terminated());

        first.emit_progress(0.5, 2.0);
        assert!(events.try_recv().is_err());

        manager.load().await.unwrap();
        let second = factory.last().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        second.emit_progress(0.75, 3.0);
        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::Progress {
                fraction: 0.75,
                processed_secs: 3.0
            }
        );
    }

    #[tokio::test]
    async fn test_terminate_during_load_supersedes_it() {
        let factory = FakeFactory::new(Script {
            primary: LoadBehavior::Hang,
            ..Script::default()
        });
        let mut s = settings(MissingCapabilitiesPolicy::Fail);
        s.load_timeout = Duration::from_millis(200);
        let manager = Arc::new(EngineManager::new(
            factory.clone(),
            Arc::new(HostCapabilities::all()),
            s,
        ));

        let loading = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.load().await })
        };
        assert!(crate::testing::eventually(|| !factory.created().is_empty()).await);
        assert_eq!(manager.state(), EngineState::Loading);

        // a second load while one is in flight returns at once
        manager.load().await.unwrap();

        manager.terminate();
        assert_eq!(loading.await.unwrap(), Err(LoadError::Superseded));
        assert_eq!(manager.state(), EngineState::Idle);
        // the fallback is never tried once superseded
        assert_eq!(factory.created().len(), 1);
    }
}
