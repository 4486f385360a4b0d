// Error types for the worker pool, selector, bridge and facade

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Unified error type for every offcheck operation
///
/// The enum is serializable so that an error raised inside an execution unit
/// (or inside the bridge helper) reaches the caller with the same variant and
/// message it had where it was produced.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum Error {
    #[error("Invalid value '{value}' for setting '{setting}'")]
    Configuration { setting: String, value: String },

    #[error("Incompatible configuration: {0}")]
    Incompatible(String),

    #[error("Platform detection failed: {0}")]
    PlatformDetection(String),

    #[error("Worker {unit} crashed: {reason}")]
    WorkerCrash { unit: usize, reason: String },

    #[error("Timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Worker pool terminated")]
    Terminated,

    #[error(transparent)]
    Checker(#[from] CheckerError),

    #[error("Invalid arguments: {0}")]
    Validation(String),

    #[error("Bridge failure: {0}")]
    Bridge(String),

    #[error("Platform error: {0}")]
    Platform(String),
}

/// Coarse classification of [`Error`] as seen by facade callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Validation,
    Timeout,
    Backend,
    Checker,
}

impl Error {
    pub(crate) fn configuration(setting: &str, value: &str) -> Self {
        Self::Configuration {
            setting: setting.to_string(),
            value: value.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration { .. } | Error::Incompatible(_) | Error::PlatformDetection(_) => {
                ErrorKind::Configuration
            }
            Error::Validation(_) => ErrorKind::Validation,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Checker(_) => ErrorKind::Checker,
            Error::WorkerCrash { .. }
            | Error::Terminated
            | Error::Bridge(_)
            | Error::Platform(_) => ErrorKind::Backend,
        }
    }
}

/// Domain error raised by a [`crate::Checker`]
///
/// offcheck never interprets it; callers receive exactly what the checker
/// produced.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct CheckerError {
    pub kind: String,
    pub message: String,
}

impl CheckerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        assert_eq!(
            Error::configuration("backend", "bogus-backend").to_string(),
            "Invalid value 'bogus-backend' for setting 'backend'"
        );

        assert_eq!(
            Error::Timeout(Duration::from_millis(50)).to_string(),
            "Timed out after 50ms"
        );

        assert_eq!(
            Error::WorkerCrash {
                unit: 3,
                reason: "boom".to_string()
            }
            .to_string(),
            "Worker 3 crashed: boom"
        );

        assert_eq!(
            Error::from(CheckerError::new("SyntaxError", "unterminated group")).to_string(),
            "SyntaxError: unterminated group"
        );
    }

    #[test]
    fn kinds_are_classified() {
        assert_eq!(
            Error::configuration("platform", "x").kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            Error::PlatformDetection("none".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(Error::Terminated.kind(), ErrorKind::Backend);
        assert_eq!(Error::Bridge("gone".into()).kind(), ErrorKind::Backend);
        assert_eq!(
            Error::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(Error::Validation("x".into()).kind(), ErrorKind::Validation);
    }

    #[test]
    fn errors_survive_serialization() {
        let original = Error::Checker(CheckerError::new("RangeError", "too deep"));
        let json = serde_json::to_string(&original).unwrap();
        let restored: Error = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, original);

        let json = serde_json::to_value(Error::Timeout(Duration::from_millis(5))).unwrap();
        assert_eq!(json["kind"], "timeout");
    }
}
