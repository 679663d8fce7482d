//! One-at-a-time RPC over the shared stream.
//!
//! QMP replies carry nothing that ties them to a request unless the client
//! sends an `id`; this crate relies on ordering instead. That is only sound
//! while at most one command is unanswered, so:
//!
//! - a caller must hold the gate's [`Turn`] for the whole
//!   send → reply/timeout exchange;
//! - the single pending-call slot can only be armed by a `Turn` holder;
//! - a call that gives up after its request hit the wire leaves a stale-reply
//!   credit, and the next reply to arrive is dropped instead of being handed
//!   to whoever calls next;
//! - the write itself runs under the call's deadline and gives way to
//!   [`CallGate::close`]. A write cut short may leave half a frame on the wire,
//!   so the gate closes itself with a transport error.

use std::{
    sync::{Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError},
    time::Duration,
};

use serde_json::Value;
use tokio::{
    sync::{Mutex, MutexGuard, oneshot, watch},
    time::Instant,
};

use crate::{
    error::{Error, Result},
    framer::FrameWriter,
    types::{Command, QmpError},
};

/// Exclusive right to have a command in flight.
pub(crate) struct Turn<'a> {
    _guard: MutexGuard<'a, ()>,
}

#[derive(Debug)]
struct PendingCall {
    command: String,
    deadline: Instant,
    tx: oneshot::Sender<Result<Value>>,
}

#[derive(Debug, Default)]
struct Slot {
    pending: Option<PendingCall>,
    stale_replies: usize,
    closed: Option<Error>,
}

/// Serializes commands onto the writer and pairs each with the next reply.
#[derive(Debug)]
pub(crate) struct CallGate {
    writer: FrameWriter,
    turn: Mutex<()>,
    slot: StdMutex<Slot>,
    closing: watch::Sender<bool>,
}

/// Undoes an armed slot if the call leaves without a reply, including when
/// the caller's future is dropped mid-call.
struct Armed<'g> {
    gate: &'g CallGate,
    written: bool,
}

impl Armed<'_> {
    /// Returns `true` if the call was still pending.
    fn abandon(&self) -> bool {
        let mut slot = self.gate.lock_slot();
        if slot.pending.take().is_none() {
            return false;
        }
        if self.written {
            slot.stale_replies += 1;
        }
        true
    }
}

impl Drop for Armed<'_> {
    fn drop(&mut self) {
        self.abandon();
    }
}

impl CallGate {
    pub(crate) fn new(writer: FrameWriter) -> Self {
        Self {
            writer,
            turn: Mutex::new(()),
            slot: StdMutex::new(Slot::default()),
            closing: watch::Sender::new(false),
        }
    }

    /// Send `command` and wait for its reply, at most `timeout`.
    pub(crate) async fn call(&self, command: &Command, timeout: Duration) -> Result<Value> {
        let turn = Turn {
            _guard: self.turn.lock().await,
        };
        let deadline = Instant::now() + timeout;
        let (mut armed, mut rx) = self.arm(&turn, &command.execute, deadline)?;

        tracing::trace!(command = %command.execute, "sending QMP command");
        // Bytes may reach the peer even if this future is dropped mid-write.
        armed.written = true;
        tokio::select! {
            sent = tokio::time::timeout_at(deadline, self.writer.send(command)) => match sent {
                Ok(sent) => sent?,
                Err(_elapsed) => {
                    tracing::warn!(
                        command = %command.execute,
                        ?timeout,
                        "QMP command could not be written before its deadline"
                    );
                    let message =
                        format!("write of '{}' timed out; stream out of sync", command.execute);
                    self.close(Error::Io {
                        source: std::io::Error::new(std::io::ErrorKind::TimedOut, message),
                    });
                    return Err(Error::Timeout { timeout });
                }
            },
            reason = self.closed() => return Err(reason),
        }

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(result) => result.unwrap_or_else(|_closed| Err(Error::Disconnected)),
            Err(_elapsed) => {
                if armed.abandon() {
                    tracing::debug!(
                        command = %command.execute,
                        ?timeout,
                        "QMP command timed out; its reply will be discarded"
                    );
                    return Err(Error::Timeout { timeout });
                }
                // Resolved between the timer firing and taking the slot.
                rx.try_recv()
                    .unwrap_or_else(|_| Err(Error::Timeout { timeout }))
            }
        }
    }

    fn arm(
        &self,
        _turn: &Turn<'_>,
        command: &str,
        deadline: Instant,
    ) -> Result<(Armed<'_>, oneshot::Receiver<Result<Value>>)> {
        let mut slot = self.lock_slot();
        if let Some(reason) = &slot.closed {
            return Err(reason.clone_for_task());
        }

        let (tx, rx) = oneshot::channel();
        slot.pending = Some(PendingCall {
            command: command.to_string(),
            deadline,
            tx,
        });

        Ok((
            Armed {
                gate: self,
                written: false,
            },
            rx,
        ))
    }

    /// Hand a reply read from the stream to the waiting caller.
    pub(crate) fn deliver(&self, reply: std::result::Result<Value, QmpError>) {
        self.settle(|command| reply.map_err(|e| Error::remote(command, e.class, e.desc)));
    }

    /// A reply arrived but could not be decoded. It still answers the
    /// pending call, which fails with a protocol error.
    pub(crate) fn deliver_malformed(&self, err: &Error) {
        self.settle(|command| {
            Err(Error::protocol(format!(
                "malformed reply to '{command}': {}",
                err.description()
            )))
        });
    }

    fn settle(&self, reply: impl FnOnce(String) -> Result<Value>) {
        let mut slot = self.lock_slot();

        if slot.stale_replies > 0 {
            slot.stale_replies -= 1;
            tracing::debug!(
                stale_remaining = slot.stale_replies,
                "discarding reply to an abandoned QMP command"
            );
            return;
        }

        let Some(call) = slot.pending.take() else {
            tracing::warn!("discarding unsolicited QMP reply");
            return;
        };
        drop(slot);

        let remaining = call.deadline.saturating_duration_since(Instant::now());
        let result = reply(call.command.clone());
        tracing::trace!(
            command = %call.command,
            ?remaining,
            ok = result.is_ok(),
            "received QMP reply"
        );
        let _ = call.tx.send(result);
    }

    /// Resolve the pending call with `reason` and refuse all later calls.
    ///
    /// A lifecycle reason (teardown) is sticky: a later stream failure does
    /// not replace it.
    pub(crate) fn close(&self, reason: Error) {
        let mut slot = self.lock_slot();
        let pending = slot.pending.take();
        slot.stale_replies = 0;
        if !matches!(slot.closed, Some(Error::Lifecycle { .. })) {
            slot.closed = Some(reason.clone_for_task());
        }
        drop(slot);
        self.closing.send_replace(true);

        if let Some(call) = pending {
            tracing::debug!(command = %call.command, error = %reason, "failing in-flight QMP command");
            let _ = call.tx.send(Err(reason));
        }
    }

    /// Resolves once the gate is closed, with the reason it was closed.
    pub(crate) async fn closed(&self) -> Error {
        let mut closing = self.closing.subscribe();
        let _ = closing.wait_for(|closed| *closed).await;
        self.lock_slot()
            .closed
            .as_ref()
            .map_or(Error::Disconnected, Error::clone_for_task)
    }

    fn lock_slot(&self) -> StdMutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
