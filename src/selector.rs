// Backend selector - resolves platform and backend once per process

use crate::config::{BackendKind, Platform, Setting, SettingValue};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::{LazyLock, OnceLock};
use std::thread;

/// What the host runtime offers for running code off the calling thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeProbe {
    /// OS threads can be spawned
    pub os_threads: bool,

    /// A sandboxed worker global is present
    pub worker_global: bool,
}

impl RuntimeProbe {
    /// Probe the current runtime
    pub fn detect() -> Self {
        let worker_global = cfg!(all(target_arch = "wasm32", target_os = "unknown"));
        let os_threads = !worker_global
            && thread::Builder::new()
                .name("offcheck-probe".to_string())
                .spawn(|| ())
                .map(|handle| handle.join().is_ok())
                .unwrap_or(false);

        let probe = Self {
            os_threads,
            worker_global,
        };
        tracing::debug!(?probe, "runtime probed");
        probe
    }

    /// The single platform this probe points at
    pub fn platform(&self) -> Result<Platform> {
        match (self.os_threads, self.worker_global) {
            (true, false) => Ok(Platform::Server),
            (false, true) => Ok(Platform::Browser),
            (false, false) => Err(Error::PlatformDetection(
                "neither OS threads nor a worker global are available".to_string(),
            )),
            (true, true) => Err(Error::PlatformDetection(
                "both OS threads and a worker global are available; set the platform explicitly"
                    .to_string(),
            )),
        }
    }
}

/// A value resolved at most once; later requests must agree with it
struct Memo<T> {
    cell: OnceLock<T>,
    init: Mutex<()>,
}

impl<T: SettingValue> Memo<T> {
    fn new() -> Self {
        Self {
            cell: OnceLock::new(),
            init: Mutex::new(()),
        }
    }

    fn resolve(&self, requested: Setting<T>, auto: impl FnOnce() -> Result<T>) -> Result<T> {
        if let Some(current) = self.cell.get() {
            return agree(*current, requested);
        }

        // Concurrent first calls race here; exactly one of them initializes
        let _init = self.init.lock();
        if let Some(current) = self.cell.get() {
            return agree(*current, requested);
        }
        let value = match requested {
            Setting::Explicit(value) => value,
            Setting::Auto => auto()?,
        };
        let _ = self.cell.set(value);
        tracing::debug!(setting = T::SETTING, value = value.name(), "setting resolved");
        Ok(value)
    }
}

fn agree<T: SettingValue>(current: T, requested: Setting<T>) -> Result<T> {
    match requested {
        Setting::Explicit(value) if value != current => Err(Error::Incompatible(format!(
            "{} already resolved to '{}', cannot switch to '{}'",
            T::SETTING,
            current.name(),
            value.name()
        ))),
        _ => Ok(current),
    }
}

/// Resolves `auto` settings into concrete values and remembers them
///
/// Use [`Selector::global`] for the process-wide instance. Separate instances
/// exist for tests and for hosts that want to inject a [`RuntimeProbe`].
pub struct Selector {
    probe: OnceLock<RuntimeProbe>,
    platform: Memo<Platform>,
    backend: Memo<BackendKind>,
}

static GLOBAL: LazyLock<Selector> = LazyLock::new(Selector::new);

impl Selector {
    pub fn new() -> Self {
        Self {
            probe: OnceLock::new(),
            platform: Memo::new(),
            backend: Memo::new(),
        }
    }

    /// Selector that uses a fixed probe instead of detecting one
    pub fn with_probe(probe: RuntimeProbe) -> Self {
        let selector = Self::new();
        let _ = selector.probe.set(probe);
        selector
    }

    /// The process-wide selector
    pub fn global() -> &'static Selector {
        &GLOBAL
    }

    pub fn probe(&self) -> RuntimeProbe {
        *self.probe.get_or_init(RuntimeProbe::detect)
    }

    /// Parse a backend setting and resolve it for the auto-detected platform
    pub fn resolve(&self, value: &str) -> Result<BackendKind> {
        let requested: Setting<BackendKind> = value.parse()?;
        let platform = self.resolve_platform(Setting::Auto)?;
        self.resolve_backend(requested, platform)
    }

    pub fn resolve_platform(&self, requested: Setting<Platform>) -> Result<Platform> {
        self.platform.resolve(requested, || self.probe().platform())
    }

    pub fn resolve_backend(
        &self,
        requested: Setting<BackendKind>,
        platform: Platform,
    ) -> Result<BackendKind> {
        if let (Setting::Explicit(BackendKind::ThreadPool), Platform::Browser) =
            (requested, platform)
        {
            return Err(Error::Incompatible(
                "the thread-pool backend needs a server platform".to_string(),
            ));
        }

        self.backend.resolve(requested, || {
            let probe = self.probe();
            match platform {
                Platform::Server if probe.os_threads => Ok(BackendKind::ThreadPool),
                Platform::Browser => Ok(BackendKind::WorkerPool),
                Platform::Server => Err(Error::PlatformDetection(
                    "server platform without OS thread support".to_string(),
                )),
            }
        })
    }

    /// Backend resolved so far, if any
    pub fn resolved_backend(&self) -> Option<BackendKind> {
        self.backend.cell.get().copied()
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}
