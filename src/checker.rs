// Checker capability and the worker module that exposes it

use crate::error::{CheckerError, Error, Result};
use crate::runtime::{WorkerModule, WorkerScript};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Task name under which the checker is reachable inside an execution unit
pub const CHECK_TASK: &str = "check";

/// Flags a pattern may carry
const KNOWN_FLAGS: &str = "dgimsuyv";

/// The analysis performed inside an execution unit
///
/// offcheck treats it as a black box: the same call is made whether it runs
/// in-process, on a worker thread or behind the message transport.
pub trait Checker: Send + Sync + 'static {
    fn check(
        &self,
        pattern: &str,
        flags: &str,
        options: &CheckOptions,
    ) -> std::result::Result<AnalysisResult, CheckerError>;
}

/// Opaque checker output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalysisResult(pub Value);

impl AnalysisResult {
    pub fn into_inner(self) -> Value {
        self.0
    }
}

/// Per-call options forwarded to the checker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckOptions {
    /// Pattern flags, e.g. `"gi"`
    pub flags: String,

    /// Time budget handed to the checker itself
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Option<Duration>,

    /// Checker-specific parameters, passed through untouched
    pub params: Map<String, Value>,
}

impl CheckOptions {
    pub fn with_flags(mut self, flags: impl Into<String>) -> Self {
        self.flags = flags.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Reject arguments the checker should never see
    pub fn validate(&self) -> Result<()> {
        let mut seen = String::new();
        for flag in self.flags.chars() {
            if !KNOWN_FLAGS.contains(flag) {
                return Err(Error::Validation(format!("unknown flag '{flag}'")));
            }
            if seen.contains(flag) {
                return Err(Error::Validation(format!("duplicate flag '{flag}'")));
            }
            seen.push(flag);
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(Error::Validation("timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// Arguments of the `check` task for this call
    pub(crate) fn task_args(&self, pattern: &str) -> Result<Vec<Value>> {
        let options = serde_json::to_value(self)
            .map_err(|e| Error::Validation(format!("options are not serializable: {e}")))?;
        Ok(vec![
            Value::from(pattern),
            Value::from(self.flags.as_str()),
            options,
        ])
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Worker module exposing a [`Checker`] as the `check` task
pub struct CheckerModule {
    checker: Arc<dyn Checker>,
}

impl CheckerModule {
    pub fn new(checker: Arc<dyn Checker>) -> Self {
        Self { checker }
    }

    /// Inline worker script whose units each wrap the same checker
    pub fn script(checker: Arc<dyn Checker>) -> WorkerScript {
        WorkerScript::inline(move |_| CheckerModule::new(checker.clone()))
    }
}

impl WorkerModule for CheckerModule {
    fn call(&mut self, name: &str, args: &[Value]) -> Result<Value> {
        if name != CHECK_TASK {
            return Err(Error::Validation(format!("unknown task '{name}'")));
        }

        let [pattern, flags, options] = args else {
            return Err(Error::Validation(format!(
                "'{CHECK_TASK}' takes 3 arguments, got {}",
                args.len()
            )));
        };
        let pattern = pattern
            .as_str()
            .ok_or_else(|| Error::Validation("pattern must be a string".to_string()))?;
        let flags = flags
            .as_str()
            .ok_or_else(|| Error::Validation("flags must be a string".to_string()))?;
        let options: CheckOptions = serde_json::from_value(options.clone())
            .map_err(|e| Error::Validation(format!("invalid options: {e}")))?;

        let result = self.checker.check(pattern, flags, &options)?;
        Ok(result.into_inner())
    }
}
