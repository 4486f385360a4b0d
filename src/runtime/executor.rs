// Executor - the concrete backend chosen by the selector

use super::{PendingCall, PoolStats, UnitContext, WorkerPool, WorkerScript};
use crate::config::{BackendKind, PoolConfig};
use crate::error::{Error, Result};
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

/// One of the supported backends, behind a single `submit`/`terminate` surface
#[derive(Debug)]
pub enum Executor {
    InProcess(InProcess),
    Pool(WorkerPool),
}

impl Executor {
    /// Build the executor for an already-resolved backend
    pub fn build(backend: BackendKind, config: &PoolConfig, script: WorkerScript) -> Result<Self> {
        match backend {
            BackendKind::InProcess => Ok(Executor::InProcess(InProcess::new(script)?)),
            BackendKind::ThreadPool | BackendKind::WorkerPool => Ok(Executor::Pool(
                WorkerPool::new(backend, config.clone(), script)?,
            )),
        }
    }

    pub fn submit(&self, name: impl Into<String>, args: Vec<Value>) -> PendingCall {
        match self {
            Executor::InProcess(inline) => inline.submit(&name.into(), &args),
            Executor::Pool(pool) => pool.submit(name, args),
        }
    }

    pub fn terminate(&self) {
        match self {
            Executor::InProcess(inline) => inline.terminate(),
            Executor::Pool(pool) => pool.terminate(),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Executor::InProcess(_) => BackendKind::InProcess,
            Executor::Pool(pool) => pool.kind(),
        }
    }

    /// Pool bookkeeping, `None` for the in-process backend
    pub fn stats(&self) -> Option<PoolStats> {
        match self {
            Executor::InProcess(_) => None,
            Executor::Pool(pool) => Some(pool.stats()),
        }
    }
}

/// Runs the module on the calling thread
///
/// A fresh module instance is created for every call, so concurrent callers
/// never share one.
#[derive(Debug)]
pub struct InProcess {
    script: WorkerScript,
    terminated: AtomicBool,
}

impl InProcess {
    pub fn new(script: WorkerScript) -> Result<Self> {
        script.reference.check_loadable(BackendKind::InProcess)?;
        Ok(Self {
            script,
            terminated: AtomicBool::new(false),
        })
    }

    /// Run the task now and hand back an already-settled call
    pub fn submit(&self, name: &str, args: &[Value]) -> PendingCall {
        if self.terminated.load(Ordering::Acquire) {
            return PendingCall::settled(Err(Error::Terminated));
        }

        let ctx = UnitContext {
            unit: 0,
            backend: BackendKind::InProcess,
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.script.instantiate(ctx).call(name, args)
        }))
        .unwrap_or_else(|payload| {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "module panicked".to_string());
            tracing::warn!(reason = %reason, "in-process module panicked");
            Err(Error::WorkerCrash { unit: 0, reason })
        });

        PendingCall::settled(outcome)
    }

    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
    }
}
