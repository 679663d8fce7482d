//! Wire and domain data types.

mod event;
mod greeting;
mod message;
mod query;

pub use event::{
    BlockErrorAction, BlockImageCorrupted, BlockIoError, Event, EventMessage, EventRecord,
    GuestPanicAction, IoOperation, ShutdownCause, Timestamp, WatchdogAction,
};
pub use greeting::{Greeting, QmpInfo, QmpVersion, QmpVersionNumber};
pub use message::{Command, IncomingMessage, QmpError};
pub use query::{MouseInfo, QueryStatus};

pub(crate) use query::first_with_absolute;

/// Deserialize `value`, reporting the JSON path of the first mismatch.
pub(crate) fn decode_value<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
) -> std::result::Result<T, String> {
    serde_path_to_error::deserialize(value).map_err(|e| e.to_string())
}
