// CheckService - the single entry point for async and blocking checks

use crate::bridge::SyncBridge;
use crate::checker::{AnalysisResult, CheckOptions, Checker, CheckerModule, CHECK_TASK};
use crate::config::{BackendKind, Config, Platform, Setting, SyncMode};
use crate::error::{Error, Result};
use crate::runtime::{Executor, PayloadRef, PoolStats, WorkerScript};
use crate::selector::Selector;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Runs a [`Checker`] off the calling thread
///
/// Platform and backend are resolved once, in [`CheckService::new`]; invalid
/// settings fail there. The executor is created on first use and reused for
/// the lifetime of the service.
///
/// ```no_run
/// # use offcheck::{AnalysisResult, CheckOptions, CheckService, Checker, CheckerError, Config};
/// # use std::sync::Arc;
/// struct Accept;
///
/// impl Checker for Accept {
///     fn check(&self, _: &str, _: &str, _: &CheckOptions) -> Result<AnalysisResult, CheckerError> {
///         Ok(AnalysisResult(serde_json::json!({ "status": "safe" })))
///     }
/// }
///
/// let service = CheckService::new(Config::default(), Arc::new(Accept))?;
/// let result = service.check_sync("^(a|b)*$", &CheckOptions::default())?;
/// # Ok::<(), offcheck::Error>(())
/// ```
pub struct CheckService {
    config: Config,
    platform: Platform,
    backend: BackendKind,
    checker: Arc<dyn Checker>,
    executor: Mutex<Option<Arc<Executor>>>,
    bridge: Mutex<Option<Arc<SyncBridge>>>,
    // The bridge accepts one call at a time; blocking callers queue here
    sync_calls: Mutex<()>,
    terminated: AtomicBool,
}

impl CheckService {
    /// Create a service using the process-wide [`Selector`]
    pub fn new(config: Config, checker: Arc<dyn Checker>) -> Result<Self> {
        Self::with_selector(config, checker, Selector::global())
    }

    pub fn with_selector(
        config: Config,
        checker: Arc<dyn Checker>,
        selector: &Selector,
    ) -> Result<Self> {
        config.pool.validate()?;
        let platform = selector.resolve_platform(config.platform)?;
        let backend = selector.resolve_backend(config.backend, platform)?;
        if let Some(payload) = &config.payload {
            payload.check_loadable(backend)?;
        }

        tracing::info!(?platform, ?backend, sync = %config.sync_backend, "check service configured");
        Ok(Self {
            config,
            platform,
            backend,
            checker,
            executor: Mutex::new(None),
            bridge: Mutex::new(None),
            sync_calls: Mutex::new(()),
            terminated: AtomicBool::new(false),
        })
    }

    /// Check a pattern without blocking the calling task
    pub async fn check(&self, pattern: &str, options: &CheckOptions) -> Result<AnalysisResult> {
        options.validate()?;
        let args = options.task_args(pattern)?;
        let value = self.executor()?.submit(CHECK_TASK, args).await?;
        Ok(AnalysisResult(value))
    }

    /// Check a pattern, blocking the calling thread until the result exists
    pub fn check_sync(&self, pattern: &str, options: &CheckOptions) -> Result<AnalysisResult> {
        options.validate()?;
        let args = options.task_args(pattern)?;
        let value = match self.sync_mode() {
            SyncMode::Direct => self.executor()?.submit(CHECK_TASK, args).wait()?,
            SyncMode::Bridge => self.call_bridge(args)?,
        };
        Ok(AnalysisResult(value))
    }

    /// Route the blocking surface takes
    ///
    /// On `auto`, a server uses the bridge only when a bridge timeout is
    /// configured; the bridge is the one route that can give up on a call.
    pub fn sync_mode(&self) -> SyncMode {
        match self.config.sync_backend {
            Setting::Explicit(mode) => mode,
            Setting::Auto => match self.platform {
                // A sandboxed main thread cannot park on a shared flag
                Platform::Browser => SyncMode::Direct,
                Platform::Server if self.config.bridge.timeout.is_some() => SyncMode::Bridge,
                Platform::Server => SyncMode::Direct,
            },
        }
    }

    /// Stop the executor and the bridge helper; idempotent
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(bridge) = self.bridge.lock().take() {
            bridge.shutdown();
        }
        if let Some(executor) = self.executor.lock().take() {
            executor.terminate();
        }
        tracing::info!("check service terminated");
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Pool bookkeeping once a pool-backed executor exists
    pub fn stats(&self) -> Option<PoolStats> {
        self.executor.lock().as_ref().and_then(|e| e.stats())
    }

    fn call_bridge(&self, args: Vec<Value>) -> Result<Value> {
        let bridge = self.bridge()?;
        let _serial = self.sync_calls.lock();
        bridge.call_sync(CHECK_TASK, args)
    }

    fn executor(&self) -> Result<Arc<Executor>> {
        let mut slot = self.executor.lock();
        if self.terminated.load(Ordering::Acquire) {
            return Err(Error::Terminated);
        }
        if let Some(executor) = slot.as_ref() {
            return Ok(executor.clone());
        }

        let executor = Arc::new(Executor::build(self.backend, &self.config.pool, self.script())?);
        *slot = Some(executor.clone());
        Ok(executor)
    }

    fn bridge(&self) -> Result<Arc<SyncBridge>> {
        let executor = self.executor()?;
        let mut slot = self.bridge.lock();
        if let Some(bridge) = slot.as_ref() {
            return Ok(bridge.clone());
        }

        let bridge = Arc::new(SyncBridge::new(executor, self.config.bridge.clone()));
        *slot = Some(bridge.clone());
        Ok(bridge)
    }

    fn script(&self) -> WorkerScript {
        let inline = CheckerModule::script(self.checker.clone());
        match &self.config.payload {
            Some(reference) if *reference != PayloadRef::Inline => {
                WorkerScript::new(reference.clone(), inline.factory)
            }
            _ => inline,
        }
    }
}

impl Drop for CheckService {
    fn drop(&mut self) {
        self.terminate();
    }
}
