use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

use super::{EventMessage, Greeting};

/// Outbound command envelope: `{"execute": "...", "arguments": {...}}`.
///
/// `arguments` is omitted from the wire when `None`. Replies are paired with
/// commands by ordering, so no `id` is sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command name.
    pub execute: String,

    /// Command arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl Command {
    /// A command without arguments.
    #[must_use]
    pub fn new(execute: impl Into<String>) -> Self {
        Self {
            execute: execute.into(),
            arguments: None,
        }
    }

    /// A command with the given serializable arguments.
    pub fn with_arguments<A: Serialize>(execute: impl Into<String>, args: &A) -> Result<Self> {
        Ok(Self {
            execute: execute.into(),
            arguments: Some(serde_json::to_value(args)?),
        })
    }
}

/// The `error` object of a failed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpError {
    /// Error class, e.g. `GenericError`.
    #[serde(default)]
    pub class: String,
    /// Human readable description.
    pub desc: String,
}

/// A decoded top-level object, sorted by its discriminant key.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// `{"QMP": ...}`
    Greeting(Greeting),
    /// `{"return": ...}`
    Reply(Value),
    /// `{"error": {"class": ..., "desc": ...}}`
    ErrorReply(QmpError),
    /// `{"event": ..., "data": ..., "timestamp": ...}`
    Event(EventMessage),
}

impl IncomingMessage {
    /// Whether `object` would classify as a reply to a command.
    #[must_use]
    pub fn is_reply(object: &Map<String, Value>) -> bool {
        !object.contains_key("QMP")
            && !object.contains_key("event")
            && (object.contains_key("error") || object.contains_key("return"))
    }

    /// Classify a framed object by its discriminant key.
    pub fn classify(mut object: Map<String, Value>) -> Result<Self> {
        if object.contains_key("QMP") {
            let greeting = serde_json::from_value(Value::Object(object))
                .map_err(|e| Error::protocol(format!("invalid greeting: {e}")))?;
            return Ok(Self::Greeting(greeting));
        }

        if object.contains_key("event") {
            let event = serde_json::from_value(Value::Object(object))
                .map_err(|e| Error::protocol(format!("invalid event: {e}")))?;
            return Ok(Self::Event(event));
        }

        if let Some(err) = object.remove("error") {
            let err = serde_json::from_value(err)
                .map_err(|e| Error::protocol(format!("invalid error reply: {e}")))?;
            return Ok(Self::ErrorReply(err));
        }

        if let Some(value) = object.remove("return") {
            return Ok(Self::Reply(value));
        }

        let keys: Vec<&str> = object.keys().map(String::as_str).collect();
        Err(Error::protocol(format!(
            "message without a known discriminant (keys: {keys:?})"
        )))
    }
}
