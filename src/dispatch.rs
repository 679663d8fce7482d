//! Observer interface and event dispatch.
//!
//! The manager reports lifecycle changes and guest events through a single
//! [`QmpObserver`] injected at construction. Callbacks run on the reader task,
//! in arrival order, so they must return quickly; hand long work off to
//! another task.

use std::{fmt, sync::Arc};

use serde_json::Value;

use crate::types::{
    BlockImageCorrupted, BlockIoError, Event, EventMessage, EventRecord, Greeting,
    GuestPanicAction, ShutdownCause,
};

/// Receiver of manager notifications.
///
/// Every method has an empty default body; implement the ones you need.
#[allow(unused_variables)]
pub trait QmpObserver: Send + Sync {
    /// The greeting arrived; the session is not yet in command mode.
    fn connected(&self, greeting: &Greeting) {}

    /// Capability negotiation succeeded.
    fn command_mode_entered(&self) {}

    /// The stream closed or failed.
    fn disconnected(&self) {}

    /// A failure that is not tied to a caller (bad frame, failed
    /// negotiation, stream error).
    fn error(&self, description: &str) {}

    /// `SHUTDOWN`
    fn shutdown(&self, guest: bool, reason: ShutdownCause) {}

    /// `RESET`
    fn reset(&self, guest: bool, reason: ShutdownCause) {}

    /// `STOP`
    fn stopped(&self) {}

    /// `RESUME`
    fn resumed(&self) {}

    /// `SUSPEND` and `SUSPEND_DISK`
    fn suspended(&self) {}

    /// `WAKEUP`
    fn woken(&self) {}

    /// `GUEST_PANICKED`
    fn panicked(&self, action: GuestPanicAction, info: Option<&Value>) {}

    /// `BLOCK_IMAGE_CORRUPTED`
    fn block_image_corrupted(&self, info: &BlockImageCorrupted) {}

    /// `BLOCK_IO_ERROR`
    fn block_io_error(&self, info: &BlockIoError) {}

    /// Any recognized event without a dedicated callback above.
    fn other_event(&self, event: &Event) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl QmpObserver for NoopObserver {}

/// Routes decoded events to the observer.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    observer: Arc<dyn QmpObserver>,
}

impl Dispatcher {
    pub(crate) fn new(observer: Arc<dyn QmpObserver>) -> Self {
        Self { observer }
    }

    pub(crate) fn observer(&self) -> &dyn QmpObserver {
        self.observer.as_ref()
    }

    /// Decode `msg` and fire exactly one callback for it.
    ///
    /// Unknown events and undecodable payloads are logged and dropped.
    pub(crate) fn dispatch(&self, msg: EventMessage) {
        let name = msg.name.clone();
        let event = match Event::decode(msg) {
            Ok(Some(event)) => event,
            Ok(None) => {
                tracing::debug!(event = %name, "ignoring unrecognized QMP event");
                return;
            }
            Err(e) => {
                tracing::warn!(event = %name, error = %e, "dropping malformed QMP event");
                return;
            }
        };

        tracing::trace!(event = %event.name, timestamp = ?event.timestamp, "dispatching QMP event");

        let observer = self.observer();
        match &event.record {
            EventRecord::Shutdown { guest, reason } => observer.shutdown(*guest, *reason),
            EventRecord::Reset { guest, reason } => observer.reset(*guest, *reason),
            EventRecord::Stop => observer.stopped(),
            EventRecord::Resume => observer.resumed(),
            EventRecord::Suspend | EventRecord::SuspendDisk => observer.suspended(),
            EventRecord::Wakeup => observer.woken(),
            EventRecord::GuestPanicked { action, info } => {
                observer.panicked(*action, info.as_ref());
            }
            EventRecord::BlockImageCorrupted(info) => observer.block_image_corrupted(info),
            EventRecord::BlockIoError(info) => observer.block_io_error(info),
            EventRecord::Powerdown
            | EventRecord::RtcChange { .. }
            | EventRecord::Watchdog { .. }
            | EventRecord::DeviceDeleted { .. } => observer.other_event(&event),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}
