//! `qmp_manager` - a QEMU Machine Protocol session manager.
//!
//! One [`Manager`] drives one monitor connection:
//! - frames the byte stream into JSON objects and writes commands atomically
//! - negotiates `qmp_capabilities` after the greeting
//! - allows exactly one command in flight, paired with the next reply,
//!   with a per-call deadline
//! - decodes a fixed vocabulary of events and hands each to a [`QmpObserver`]
//! - resolves any in-flight command when the stream dies or the manager is
//!   dropped
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use qmp_manager::{Endpoint, Manager, NoopObserver, PowerAction};
//! # async fn demo() -> qmp_manager::Result<()> {
//! let manager = Manager::builder()
//!     .observer(Arc::new(NoopObserver))
//!     .connect_endpoint(&Endpoint::unix("/run/vm/qmp.sock"))
//!     .await?;
//!
//! let status = manager.query_status().await?;
//! println!("running = {}", status.running);
//!
//! manager.power(PowerAction::Stop).await?;
//! let out = manager.save_state("before-upgrade").await?;
//! println!("{out}");
//! # Ok(()) }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod dispatch;
mod gate;
mod manager;

pub mod error;
pub mod framer;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use dispatch::{NoopObserver, QmpObserver};
pub use error::{Error, ErrorKind, Result};
pub use manager::{
    CallOptions, ConnectionState, DEFAULT_COMMAND_TIMEOUT, Manager, ManagerBuilder,
    ManagerOptions, PowerAction,
};
pub use transport::Endpoint;
