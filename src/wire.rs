// Serialized messages exchanged with message-passing workers and the bridge helper

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message posted across a serialization boundary
///
/// Worker-pool units and the bridge helper only ever see these as JSON text,
/// the way a sandboxed worker only sees cloned messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    Call {
        id: u64,
        name: String,
        args: Vec<Value>,
    },
    Result {
        id: u64,
        value: Value,
    },
    Error {
        id: u64,
        error: Error,
    },
}

impl Envelope {
    pub fn id(&self) -> u64 {
        match self {
            Envelope::Call { id, .. } | Envelope::Result { id, .. } | Envelope::Error { id, .. } => {
                *id
            }
        }
    }

    /// Reply envelope for a finished call
    pub fn reply(id: u64, outcome: Result<Value>) -> Self {
        match outcome {
            Ok(value) => Envelope::Result { id, value },
            Err(error) => Envelope::Error { id, error },
        }
    }

    /// Turn a reply envelope back into the call's outcome
    pub fn into_outcome(self) -> Result<Value> {
        match self {
            Envelope::Result { value, .. } => Ok(value),
            Envelope::Error { error, .. } => Err(error),
            Envelope::Call { name, .. } => Err(Error::Bridge(format!(
                "expected a reply, received call '{name}'"
            ))),
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Bridge(format!("encode failed: {e}")))
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Bridge(format!("decode failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CheckerError;

    #[test]
    fn call_envelope_is_tagged() {
        let call = Envelope::Call {
            id: 7,
            name: "check".to_string(),
            args: vec![Value::from("^(a+)+$")],
        };
        let json: Value = serde_json::from_str(&call.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "call");
        assert_eq!(json["id"], 7);
        assert_eq!(json["args"][0], "^(a+)+$");
    }

    #[test]
    fn error_reply_keeps_kind_and_message() {
        let reply = Envelope::reply(
            3,
            Err(Error::Checker(CheckerError::new("SyntaxError", "bad escape"))),
        );
        let decoded = Envelope::decode(&reply.encode().unwrap()).unwrap();
        assert_eq!(decoded.id(), 3);
        assert_eq!(
            decoded.into_outcome().unwrap_err(),
            Error::Checker(CheckerError::new("SyntaxError", "bad escape"))
        );
    }

    #[test]
    fn garbage_is_a_bridge_error() {
        assert!(matches!(
            Envelope::decode("{not json"),
            Err(Error::Bridge(_))
        ));
    }

    #[test]
    fn call_is_not_an_outcome() {
        let call = Envelope::Call {
            id: 1,
            name: "check".to_string(),
            args: vec![],
        };
        assert!(matches!(call.into_outcome(), Err(Error::Bridge(_))));
    }
}
