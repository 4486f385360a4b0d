// Execution unit thread - owns one module instance and runs one task at a time

use super::{Task, UnitContext, WorkerModule, WorkerScript};
use crate::config::BackendKind;
use crate::error::{Error, Result};
use crate::wire::Envelope;
use serde_json::Value;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Weak;
use std::thread;
use tokio::sync::mpsc;

/// Command sent from the pool to a unit thread
#[derive(Debug)]
pub enum WorkerCommand {
    /// Run a task with values passed directly (thread backend)
    Call { id: u64, task: Task },

    /// Serialized [`Envelope::Call`] for task `id` (worker backend)
    Post { id: u64, message: String },

    /// Finish the current task, then exit
    Shutdown,
}

/// Where a unit thread went down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CrashSite {
    /// Building the module panicked, no task had started
    Startup,
    /// A task panicked
    Task,
}

/// Callbacks a unit thread uses to report back to its pool
pub(crate) trait UnitEvents: Send + Sync + 'static {
    fn completed(&self, unit: usize, id: u64, outcome: Result<Value>);

    fn crashed(&self, unit: usize, site: CrashSite, reason: String);
}

pub(crate) struct UnitSpec<'a> {
    pub unit: usize,
    pub backend: BackendKind,
    pub script: &'a WorkerScript,
    pub thread_name: &'a str,
    pub stack_size: Option<usize>,
}

/// Spawn a unit thread and return the sending half of its inbox
pub(crate) fn spawn_unit(
    spec: UnitSpec<'_>,
    events: Weak<dyn UnitEvents>,
) -> Result<mpsc::UnboundedSender<WorkerCommand>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let unit = spec.unit;
    let ctx = UnitContext {
        unit,
        backend: spec.backend,
    };
    let script = spec.script.clone();

    let mut builder = thread::Builder::new().name(format!("{}-{}", spec.thread_name, unit));
    if let Some(size) = spec.stack_size {
        builder = builder.stack_size(size);
    }

    builder
        .spawn(move || {
            let report = |site: CrashSite, payload: Box<dyn Any + Send>| {
                let reason = panic_message(payload.as_ref());
                if let Some(events) = events.upgrade() {
                    events.crashed(unit, site, reason);
                }
            };

            let module = match panic::catch_unwind(AssertUnwindSafe(|| script.instantiate(ctx))) {
                Ok(module) => module,
                Err(payload) => return report(CrashSite::Startup, payload),
            };
            let run = panic::catch_unwind(AssertUnwindSafe(|| run_unit(ctx, module, rx, &events)));
            if let Err(payload) = run {
                report(CrashSite::Task, payload);
            }
        })
        .map_err(|e| Error::Platform(format!("failed to spawn worker {unit}: {e}")))?;

    tracing::debug!(unit, backend = ?spec.backend, "execution unit started");
    Ok(tx)
}

fn run_unit(
    ctx: UnitContext,
    mut module: Box<dyn WorkerModule>,
    mut rx: mpsc::UnboundedReceiver<WorkerCommand>,
    events: &Weak<dyn UnitEvents>,
) {
    while let Some(command) = rx.blocking_recv() {
        let (id, outcome) = match command {
            WorkerCommand::Call { id, task } => (id, module.call(&task.name, &task.args)),
            WorkerCommand::Post { id, message } => {
                // Worker side: decode, run, encode. Host side: decode the reply.
                let reply = handle_message(module.as_mut(), &message);
                (id, Envelope::decode(&reply).and_then(Envelope::into_outcome))
            }
            WorkerCommand::Shutdown => break,
        };

        match events.upgrade() {
            Some(events) => events.completed(ctx.unit, id, outcome),
            None => break,
        }
    }

    tracing::debug!(unit = ctx.unit, "execution unit stopped");
}

/// Worker-side message handler, the equivalent of a sandboxed worker's `onmessage`
fn handle_message(module: &mut dyn WorkerModule, message: &str) -> String {
    let reply = match Envelope::decode(message) {
        Ok(Envelope::Call { id, name, args }) => Envelope::reply(id, module.call(&name, &args)),
        Ok(other) => Envelope::reply(
            other.id(),
            Err(Error::Validation("worker received a reply envelope".to_string())),
        ),
        Err(e) => Envelope::reply(0, Err(e)),
    };

    reply.encode().unwrap_or_else(|e| {
        // Fall back to an error envelope the host can always decode
        let fallback = Envelope::reply(reply.id(), Err(e));
        serde_json::to_string(&fallback).unwrap_or_default()
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
