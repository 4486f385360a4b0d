//! Run a CPU-bound checker off the calling thread.
//!
//! offcheck hands each call to an execution unit from a worker pool: OS
//! threads on a server runtime, message-passing workers in a sandboxed one.
//! Callers that cannot await go through a synchronous bridge that parks the
//! thread until the helper replies.
//!
//! The pieces, from the bottom up:
//!
//! - [`runtime::WorkerPool`]: FIFO dispatch onto units, one task per unit,
//!   crash recovery and idempotent termination.
//! - [`Selector`]: resolves `auto` platform and backend settings once.
//! - [`SyncBridge`]: blocking calls with an optional timeout.
//! - [`CheckService`]: the facade that ties them to a [`Checker`].

pub mod bridge;
pub mod checker;
pub mod config;
pub mod error;
pub mod runtime;
pub mod selector;
pub mod service;
pub mod wire;

pub use bridge::SyncBridge;
pub use checker::{AnalysisResult, CheckOptions, Checker, CheckerModule, CHECK_TASK};
pub use config::{BackendKind, BridgeConfig, Config, Platform, PoolConfig, Setting, SyncMode};
pub use error::{CheckerError, Error, ErrorKind, Result};
pub use runtime::{
    Executor, PayloadRef, PendingCall, PoolStats, Task, UnitContext, WorkerModule, WorkerPool,
    WorkerScript,
};
pub use selector::{RuntimeProbe, Selector};
pub use service::CheckService;
