// Worker pool - FIFO dispatch of tasks onto a fixed set of execution units

use super::pending::{PendingCall, Reply};
use super::worker::{spawn_unit, CrashSite, UnitEvents, UnitSpec, WorkerCommand};
use super::{Task, WorkerScript};
use crate::config::{BackendKind, PoolConfig};
use crate::error::{Error, Result};
use crate::wire::Envelope;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Consecutive startup crashes after which a unit is retired instead of respawned
const MAX_STARTUP_FAILURES: u32 = 3;

/// Snapshot of a pool's bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Units that can still receive work
    pub units: usize,
    pub idle: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub crashed: u64,
}

/// Pool of execution units sharing one FIFO queue
///
/// Each unit runs at most one task at a time. Tasks are handed to idle units
/// in submission order; completion order across units is not defined.
///
/// Two transports are available: [`BackendKind::ThreadPool`] passes values to
/// OS threads directly, [`BackendKind::WorkerPool`] only exchanges serialized
/// [`Envelope`] messages with its units, as sandboxed workers do.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

struct Shared {
    backend: BackendKind,
    script: WorkerScript,
    config: PoolConfig,
    state: Mutex<PoolState>,
    this: Weak<Shared>,
}

#[derive(Default)]
struct PoolState {
    units: Vec<Unit>,
    idle: VecDeque<usize>,
    queue: VecDeque<Queued>,
    next_id: u64,
    terminated: bool,
    completed: u64,
    crashed: u64,
}

struct Unit {
    /// `None` once the unit is retired
    port: Option<mpsc::UnboundedSender<WorkerCommand>>,
    in_flight: Option<InFlight>,
    /// Startup crashes since the unit last completed a task
    startup_failures: u32,
}

struct InFlight {
    id: u64,
    reply: Reply,
}

struct Queued {
    id: u64,
    task: Task,
    reply: Reply,
}

impl WorkerPool {
    /// Create a pool and spawn all of its units
    pub fn new(backend: BackendKind, config: PoolConfig, script: WorkerScript) -> Result<Self> {
        if backend == BackendKind::InProcess {
            return Err(Error::Incompatible(
                "the in-process backend has no worker pool".to_string(),
            ));
        }
        config.validate()?;
        script.reference.check_loadable(backend)?;

        let shared = Arc::new_cyclic(|this| Shared {
            backend,
            script,
            config,
            state: Mutex::new(PoolState::default()),
            this: this.clone(),
        });

        {
            let mut state = shared.state.lock();
            for unit in 0..shared.config.max_workers {
                match shared.spawn(unit) {
                    Ok(port) => {
                        state.units.push(Unit {
                            port: Some(port),
                            in_flight: None,
                            startup_failures: 0,
                        });
                        state.idle.push_back(unit);
                    }
                    Err(e) => {
                        drop(state);
                        shared.terminate();
                        return Err(e);
                    }
                }
            }
        }

        tracing::info!(
            backend = ?backend,
            workers = shared.config.max_workers,
            payload = %shared.script.reference,
            "worker pool started"
        );
        Ok(Self { shared })
    }

    /// Pool of OS worker threads
    pub fn threads(config: PoolConfig, script: WorkerScript) -> Result<Self> {
        Self::new(BackendKind::ThreadPool, config, script)
    }

    /// Pool of message-passing workers
    pub fn workers(config: PoolConfig, script: WorkerScript) -> Result<Self> {
        Self::new(BackendKind::WorkerPool, config, script)
    }

    /// Queue a task; never blocks on the task itself
    pub fn submit(&self, name: impl Into<String>, args: Vec<Value>) -> PendingCall {
        let (reply, call) = PendingCall::channel();
        let task = Task::new(name, args);
        let mut state = self.shared.state.lock();

        if state.terminated {
            let _ = reply.send(Err(Error::Terminated));
            return call;
        }
        if state.live_units() == 0 {
            let _ = reply.send(Err(no_live_units()));
            return call;
        }

        let id = state.next_id;
        state.next_id += 1;
        tracing::trace!(task = id, name = %task.name, "task queued");
        state.queue.push_back(Queued { id, task, reply });
        self.shared.pump(&mut state);
        call
    }

    /// Stop all units and reject every unsettled call; idempotent
    pub fn terminate(&self) {
        self.shared.terminate();
    }

    pub fn kind(&self) -> BackendKind {
        self.shared.backend
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.state.lock().terminated
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            units: state.live_units(),
            idle: state.idle.len(),
            queued: state.queue.len(),
            in_flight: state.units.iter().filter(|u| u.in_flight.is_some()).count(),
            completed: state.completed,
            crashed: state.crashed,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.terminate();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("backend", &self.shared.backend)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PoolState {
    fn live_units(&self) -> usize {
        self.units.iter().filter(|u| u.port.is_some()).count()
    }
}

impl Shared {
    fn spawn(&self, unit: usize) -> Result<mpsc::UnboundedSender<WorkerCommand>> {
        let events: Weak<dyn UnitEvents> = self.this.clone();
        spawn_unit(
            UnitSpec {
                unit,
                backend: self.backend,
                script: &self.script,
                thread_name: &self.config.thread_name,
                stack_size: self.config.stack_size,
            },
            events,
        )
    }

    /// Hand queued tasks to idle units, oldest first
    fn pump(&self, state: &mut PoolState) {
        while !state.queue.is_empty() {
            let Some(unit) = state.idle.pop_front() else {
                break;
            };
            let Some(queued) = state.queue.pop_front() else {
                state.idle.push_front(unit);
                break;
            };
            self.dispatch(state, unit, queued);
        }
    }

    fn dispatch(&self, state: &mut PoolState, unit: usize, queued: Queued) {
        let Queued { id, task, reply } = queued;

        let command = match self.backend {
            BackendKind::WorkerPool => {
                let call = Envelope::Call {
                    id,
                    name: task.name,
                    args: task.args,
                };
                match call.encode() {
                    Ok(message) => WorkerCommand::Post { id, message },
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        state.idle.push_front(unit);
                        return;
                    }
                }
            }
            _ => WorkerCommand::Call { id, task },
        };

        let slot = &mut state.units[unit];
        let sent = slot
            .port
            .as_ref()
            .map(|port| port.send(command).is_ok())
            .unwrap_or(false);

        if sent {
            tracing::trace!(task = id, unit, "task dispatched");
            slot.in_flight = Some(InFlight { id, reply });
        } else {
            // The unit's thread is gone without reporting; retire it
            tracing::error!(unit, "execution unit unreachable, retiring it");
            slot.port = None;
            state.crashed += 1;
            let _ = reply.send(Err(Error::WorkerCrash {
                unit,
                reason: "unit is unreachable".to_string(),
            }));
            if state.live_units() == 0 {
                reject_all(state, no_live_units);
            }
        }
    }

    fn terminate(&self) {
        let mut state = self.state.lock();
        if state.terminated {
            return;
        }
        state.terminated = true;

        reject_all(&mut state, || Error::Terminated);
        for unit in state.units.iter_mut() {
            if let Some(in_flight) = unit.in_flight.take() {
                let _ = in_flight.reply.send(Err(Error::Terminated));
            }
            if let Some(port) = unit.port.take() {
                let _ = port.send(WorkerCommand::Shutdown);
            }
        }
        state.idle.clear();

        tracing::info!(backend = ?self.backend, "worker pool terminated");
    }
}

impl UnitEvents for Shared {
    fn completed(&self, unit: usize, id: u64, outcome: Result<Value>) {
        let mut state = self.state.lock();
        let Some(slot) = state.units.get_mut(unit) else {
            return;
        };
        let Some(in_flight) = slot.in_flight.take() else {
            // Already settled by terminate()
            return;
        };
        if in_flight.id != id {
            tracing::error!(
                unit,
                expected = in_flight.id,
                got = id,
                "dropping reply for a task the unit does not hold"
            );
            slot.in_flight = Some(in_flight);
            return;
        }
        slot.startup_failures = 0;
        let _ = in_flight.reply.send(outcome);
        state.completed += 1;

        if !state.terminated {
            state.idle.push_back(unit);
            self.pump(&mut state);
        }
    }

    fn crashed(&self, unit: usize, site: CrashSite, reason: String) {
        let mut state = self.state.lock();
        state.crashed += 1;
        tracing::warn!(unit, ?site, reason = %reason, "execution unit crashed");

        // A unit that dies before its module exists is still queued as idle
        state.idle.retain(|&idle| idle != unit);

        let Some(slot) = state.units.get_mut(unit) else {
            return;
        };
        if let Some(in_flight) = slot.in_flight.take() {
            let _ = in_flight.reply.send(Err(Error::WorkerCrash {
                unit,
                reason: reason.clone(),
            }));
        }
        slot.port = None;
        slot.startup_failures = match site {
            CrashSite::Startup => slot.startup_failures + 1,
            CrashSite::Task => 0,
        };
        let failures = slot.startup_failures;

        if state.terminated {
            return;
        }
        if failures >= MAX_STARTUP_FAILURES {
            tracing::error!(unit, failures, "execution unit keeps failing to start, retiring it");
            if state.live_units() == 0 {
                reject_all(&mut state, no_live_units);
            }
            return;
        }

        match self.spawn(unit) {
            Ok(port) => {
                tracing::debug!(unit, "execution unit respawned");
                state.units[unit].port = Some(port);
                state.idle.push_back(unit);
                self.pump(&mut state);
            }
            Err(e) => {
                tracing::error!(unit, error = %e, "could not respawn execution unit");
                if state.live_units() == 0 {
                    reject_all(&mut state, no_live_units);
                }
            }
        }
    }
}

fn reject_all(state: &mut PoolState, error: impl Fn() -> Error) {
    for queued in state.queue.drain(..) {
        let _ = queued.reply.send(Err(error()));
    }
}

fn no_live_units() -> Error {
    Error::Platform("no live execution units".to_string())
}
