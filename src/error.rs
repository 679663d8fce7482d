//! Error model for the `qmp_manager` crate.

use std::time::Duration;

use thiserror::Error;

/// Convenience result type.
pub type Result<T> = std::result::Result<T, Error>;

/// High-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The byte stream failed or was closed.
    Transport,
    /// JSON encoding/decoding failure.
    Json,
    /// Malformed or unexpected message shape.
    Protocol,
    /// The peer answered a command with an `error` object.
    Remote,
    /// No reply arrived before the call deadline.
    Timeout,
    /// Operation attempted after teardown or before command mode.
    Lifecycle,
}

/// Structured error type.
///
/// Every variant renders to a single human-readable description through
/// [`Error::description`]; no further codes are exposed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Socket / pipe I/O error.
    #[error("I/O error: {source}")]
    Io {
        /// Lower-level error.
        #[from]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {source}")]
    Json {
        /// Lower-level error.
        #[from]
        source: serde_json::Error,
    },

    /// The stream reached end-of-file.
    #[error("QMP connection closed")]
    Disconnected,

    /// The peer sent an unexpected or invalid message.
    #[error("QMP protocol error: {message}")]
    Protocol {
        /// Human readable message.
        message: String,
    },

    /// The peer returned an `error` object for a command.
    #[error("{desc}")]
    Remote {
        /// Command name.
        command: String,
        /// QMP error class.
        class: String,
        /// QMP error description.
        desc: String,
    },

    /// No reply within the call deadline.
    #[error("QMP command timed out after {timeout:?}")]
    Timeout {
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// The manager is torn down or not yet in command mode.
    #[error("{message}")]
    Lifecycle {
        /// Human readable message.
        message: String,
    },
}

impl Error {
    /// Returns a coarse error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } | Self::Disconnected => ErrorKind::Transport,
            Self::Json { .. } => ErrorKind::Json,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Lifecycle { .. } => ErrorKind::Lifecycle,
        }
    }

    /// The human-readable description handed to observers and callers.
    ///
    /// For [`Error::Remote`] this is exactly the peer's `desc` string.
    #[must_use]
    pub fn description(&self) -> String {
        self.to_string()
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn remote(
        command: impl Into<String>,
        class: impl Into<String>,
        desc: impl Into<String>,
    ) -> Self {
        Self::Remote {
            command: command.into(),
            class: class.into(),
            desc: desc.into(),
        }
    }

    pub(crate) fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle {
            message: message.into(),
        }
    }

    /// The error used to abandon calls when the manager is torn down.
    pub(crate) fn destroyed() -> Self {
        Self::lifecycle("QMP manager destroyed")
    }

    /// Create an owned copy for handing the same failure to several waiters.
    ///
    /// `Error` is not `Clone` because the wrapped I/O and JSON errors are not;
    /// those are rebuilt from their kind and message.
    pub(crate) fn clone_for_task(&self) -> Self {
        match self {
            Self::Io { source } => Self::Io {
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            Self::Json { source } => Self::protocol(source.to_string()),
            Self::Disconnected => Self::Disconnected,
            Self::Protocol { message } => Self::protocol(message.clone()),
            Self::Remote {
                command,
                class,
                desc,
            } => Self::remote(command.clone(), class.clone(), desc.clone()),
            Self::Timeout { timeout } => Self::Timeout { timeout: *timeout },
            Self::Lifecycle { message } => Self::lifecycle(message.clone()),
        }
    }
}
