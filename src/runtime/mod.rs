// Runtime module - execution units, worker pool and executor

pub mod executor;
pub mod pending;
pub mod pool;
pub mod worker;

// Re-export commonly used types
pub use executor::Executor;
pub use pending::PendingCall;
pub use pool::{PoolStats, WorkerPool};
pub use worker::WorkerCommand;

use crate::config::BackendKind;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// One unit of work: a call name plus its ordered arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub args: Vec<Value>,
}

impl Task {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// What a module learns about the unit it was created for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitContext {
    pub unit: usize,
    pub backend: BackendKind,
}

/// Code loaded into an execution unit
///
/// Each unit owns its own module instance, created on the unit's thread, so
/// implementations need not be `Send`.
pub trait WorkerModule {
    fn call(&mut self, name: &str, args: &[Value]) -> Result<Value>;
}

/// Produces one [`WorkerModule`] per execution unit
pub type ModuleFactory = Arc<dyn Fn(UnitContext) -> Box<dyn WorkerModule> + Send + Sync>;

/// Reference to the loadable code an execution unit runs
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadRef {
    /// Module file on disk, for server-side workers
    Path(PathBuf),
    /// Script or blob URL, for sandboxed workers
    Url(String),
    /// Module linked into the current binary
    Inline,
}

impl PayloadRef {
    /// Check that this reference can be loaded by the given backend
    pub fn check_loadable(&self, backend: BackendKind) -> Result<()> {
        match (self, backend) {
            (PayloadRef::Inline, _) => Ok(()),
            (PayloadRef::Path(path), BackendKind::ThreadPool | BackendKind::InProcess) => {
                if path.is_file() {
                    Ok(())
                } else {
                    Err(Error::configuration("payload", &path.display().to_string()))
                }
            }
            (PayloadRef::Url(url), BackendKind::WorkerPool) => {
                const SCHEMES: [&str; 4] = ["http://", "https://", "blob:", "data:"];
                if SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
                    Ok(())
                } else {
                    Err(Error::configuration("payload", url))
                }
            }
            (PayloadRef::Path(path), BackendKind::WorkerPool) => Err(Error::Incompatible(format!(
                "worker-pool units have no filesystem access, cannot load '{}'",
                path.display()
            ))),
            (PayloadRef::Url(url), _) => Err(Error::Incompatible(format!(
                "script reference '{url}' requires the worker-pool backend"
            ))),
        }
    }
}

impl fmt::Display for PayloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadRef::Path(path) => write!(f, "{}", path.display()),
            PayloadRef::Url(url) => f.write_str(url),
            PayloadRef::Inline => f.write_str("<inline>"),
        }
    }
}

/// A payload reference together with the factory that instantiates it
#[derive(Clone)]
pub struct WorkerScript {
    pub reference: PayloadRef,
    pub factory: ModuleFactory,
}

impl WorkerScript {
    pub fn new(reference: PayloadRef, factory: ModuleFactory) -> Self {
        Self { reference, factory }
    }

    /// Inline script built from a closure
    pub fn inline<F, M>(factory: F) -> Self
    where
        F: Fn(UnitContext) -> M + Send + Sync + 'static,
        M: WorkerModule + 'static,
    {
        Self {
            reference: PayloadRef::Inline,
            factory: Arc::new(move |ctx| Box::new(factory(ctx)) as Box<dyn WorkerModule>),
        }
    }

    pub(crate) fn instantiate(&self, ctx: UnitContext) -> Box<dyn WorkerModule> {
        (self.factory)(ctx)
    }
}

impl fmt::Debug for WorkerScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerScript")
            .field("reference", &self.reference)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct Echo;

    impl WorkerModule for Echo {
        fn call(&mut self, _name: &str, args: &[Value]) -> Result<Value> {
            Ok(Value::Array(args.to_vec()))
        }
    }

    #[test]
    fn inline_script_instantiates_modules() {
        let script = WorkerScript::inline(|_| Echo);
        let mut module = script.instantiate(UnitContext {
            unit: 0,
            backend: BackendKind::ThreadPool,
        });
        let out = module.call("echo", &[Value::from(1)]).unwrap();
        assert_eq!(out, serde_json::json!([1]));
        assert_eq!(script.reference, PayloadRef::Inline);
    }

    #[test]
    fn path_payload_must_exist_for_threads() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "// worker entry").unwrap();

        let existing = PayloadRef::Path(file.path().to_path_buf());
        assert!(existing.check_loadable(BackendKind::ThreadPool).is_ok());

        let missing = PayloadRef::Path(PathBuf::from("/definitely/not/here/worker.js"));
        let err = missing.check_loadable(BackendKind::ThreadPool).unwrap_err();
        assert!(err.to_string().contains("worker.js"));
    }

    #[test]
    fn sandboxed_workers_reject_paths() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = PayloadRef::Path(file.path().to_path_buf());
        assert!(matches!(
            path.check_loadable(BackendKind::WorkerPool),
            Err(Error::Incompatible(_))
        ));
    }

    #[test]
    fn url_payloads_need_a_known_scheme() {
        let blob = PayloadRef::Url("blob:https://example.com/5f1c".to_string());
        assert!(blob.check_loadable(BackendKind::WorkerPool).is_ok());

        let relative = PayloadRef::Url("./worker.js".to_string());
        assert!(matches!(
            relative.check_loadable(BackendKind::WorkerPool),
            Err(Error::Configuration { .. })
        ));

        assert!(matches!(
            blob.check_loadable(BackendKind::ThreadPool),
            Err(Error::Incompatible(_))
        ));
    }

    #[test]
    fn task_serializes_name_and_args() {
        let task = Task::new("check", vec![Value::from("a+"), Value::from("")]);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["name"], "check");
        assert_eq!(json["args"][0], "a+");
    }
}
