//! The public QMP manager.
//!
//! A [`Manager`] owns one connection. A spawned reader task pumps frames off
//! the stream and routes them: the greeting to the handshake, `return` and
//! `error` objects to the [`CallGate`](crate::gate), events to the observer.
//! Commands run on the caller's task and never on the reader, which must stay
//! free to deliver the reply they wait for.

mod options;
#[cfg(test)]
mod tests;

pub use options::{CallOptions, DEFAULT_COMMAND_TIMEOUT, ManagerBuilder, ManagerOptions};

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio::{
    io::AsyncRead,
    runtime::Handle,
    sync::watch,
    task::AbortHandle,
};

use crate::{
    dispatch::{Dispatcher, QmpObserver},
    error::{Error, Result},
    framer::{FrameReader, FrameWriter, Inbound},
    gate::CallGate,
    transport::AsyncQmpStream,
    types::{
        Command, Greeting, IncomingMessage, MouseInfo, QueryStatus, decode_value,
        first_with_absolute,
    },
};

/// Session state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No greeting yet, or the stream is gone.
    Disconnected,
    /// Greeting received; capabilities not negotiated.
    Connected,
    /// Negotiated; commands may be issued.
    CommandMode,
}

/// VM power actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerAction {
    /// ACPI power button (`system_powerdown`).
    PowerDown,
    /// Hard reset (`system_reset`).
    Reset,
    /// Pause vCPUs (`stop`).
    Stop,
    /// Resume vCPUs (`cont`).
    Resume,
    /// Terminate the emulator (`quit`).
    Quit,
}

impl PowerAction {
    /// QMP command implementing this action.
    #[must_use]
    pub fn command(self) -> &'static str {
        match self {
            Self::PowerDown => "system_powerdown",
            Self::Reset => "system_reset",
            Self::Stop => "stop",
            Self::Resume => "cont",
            Self::Quit => "quit",
        }
    }
}

#[derive(Debug, Clone)]
enum Handshake {
    Pending,
    Received(Greeting),
    Closed,
}

#[derive(Debug)]
struct Shared {
    gate: CallGate,
    dispatcher: Dispatcher,
    state: watch::Sender<ConnectionState>,
    handshake: watch::Sender<Handshake>,
    torn_down: AtomicBool,
    options: ManagerOptions,
}

/// A QMP session over one stream.
///
/// Dropping the manager tears the session down: an in-flight command resolves
/// with a lifecycle error before the stream is released.
#[derive(Debug)]
pub struct Manager {
    shared: Arc<Shared>,
    reader: AbortHandle,
    runtime: Handle,
}

impl Manager {
    /// Create a builder with default options and no observer.
    #[must_use]
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    /// Attach to `stream` with default options.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new<S>(stream: S, observer: Arc<dyn QmpObserver>) -> Self
    where
        S: AsyncQmpStream + 'static,
    {
        Self::builder().observer(observer).attach(stream)
    }

    fn start<S>(stream: S, observer: Arc<dyn QmpObserver>, options: ManagerOptions) -> Self
    where
        S: AsyncQmpStream + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        let reader = FrameReader::new(r, options.max_frame_len);

        let shared = Arc::new(Shared {
            gate: CallGate::new(FrameWriter::new(w)),
            dispatcher: Dispatcher::new(observer),
            state: watch::Sender::new(ConnectionState::Disconnected),
            handshake: watch::Sender::new(Handshake::Pending),
            torn_down: AtomicBool::new(false),
            options,
        });

        let runtime = Handle::current();
        let reader = runtime.spawn(read_loop(shared.clone(), reader)).abort_handle();

        Self {
            shared,
            reader,
            runtime,
        }
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// The greeting, once received.
    #[must_use]
    pub fn greeting(&self) -> Option<Greeting> {
        match &*self.shared.handshake.borrow() {
            Handshake::Received(greeting) => Some(greeting.clone()),
            _ => None,
        }
    }

    /// Wait for the greeting and negotiate capabilities.
    ///
    /// On success the state is [`ConnectionState::CommandMode`] and the
    /// observer's `command_mode_entered` has fired. On failure the state is
    /// [`ConnectionState::Disconnected`] and the error is also reported to the
    /// observer.
    pub async fn connect(&self) -> Result<Greeting> {
        self.shared.ensure_alive()?;
        if self.state() == ConnectionState::CommandMode {
            return Err(Error::lifecycle("QMP session is already in command mode"));
        }

        let result = self.shared.negotiate().await;
        match &result {
            Ok(_) => {
                self.shared.state.send_replace(ConnectionState::CommandMode);
                tracing::debug!("QMP session entered command mode");
                self.shared.dispatcher.observer().command_mode_entered();
            }
            Err(e) => {
                self.shared.state.send_replace(ConnectionState::Disconnected);
                tracing::warn!(error = %e, "QMP capability negotiation failed");
                self.shared.dispatcher.observer().error(&e.description());
            }
        }
        result
    }

    /// Execute a command and decode its `return` value.
    pub async fn execute<A, R>(&self, command: &str, args: Option<A>) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.execute_with_options(command, args, CallOptions::default())
            .await
    }

    /// Execute a command with per-call options.
    pub async fn execute_with_options<A, R>(
        &self,
        command: &str,
        args: Option<A>,
        options: CallOptions,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let command = match args {
            Some(args) => Command::with_arguments(command, &args)?,
            None => Command::new(command),
        };
        self.shared.execute(&command, options.timeout).await
    }

    /// Resume a VM started with `-S`.
    ///
    /// A failure leaves the session out of command mode. The peer has
    /// already negotiated capabilities, so recovering means dropping this
    /// manager and starting a new session.
    pub async fn continue_boot(&self) -> Result<()> {
        let result = self.shared.run(PowerAction::Resume.command()).await;
        if let Err(e) = &result {
            let demoted = self.shared.state.send_if_modified(|state| {
                if *state == ConnectionState::CommandMode {
                    *state = ConnectionState::Connected;
                    true
                } else {
                    false
                }
            });
            if demoted {
                tracing::warn!(error = %e, "continue failed; leaving command mode");
            }
        }
        result
    }

    /// Perform a power action and wait for the peer to acknowledge it.
    pub async fn power(&self, action: PowerAction) -> Result<()> {
        self.shared.run(action.command()).await
    }

    /// Run `action` on a background task and report through `completion`.
    pub fn power_in_background<F>(&self, action: PowerAction, completion: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let shared = self.shared.clone();
        self.runtime.spawn(async move {
            let result = shared.run(action.command()).await;
            if let Err(e) = &result {
                tracing::debug!(?action, error = %e, "background power action failed");
            }
            completion(result);
        });
    }

    /// Press the ACPI power button in the background.
    pub fn power_down(&self, completion: impl FnOnce(Result<()>) + Send + 'static) {
        self.power_in_background(PowerAction::PowerDown, completion);
    }

    /// Reset the VM in the background.
    pub fn reset(&self, completion: impl FnOnce(Result<()>) + Send + 'static) {
        self.power_in_background(PowerAction::Reset, completion);
    }

    /// Pause the VM in the background.
    pub fn stop(&self, completion: impl FnOnce(Result<()>) + Send + 'static) {
        self.power_in_background(PowerAction::Stop, completion);
    }

    /// Resume the VM in the background.
    pub fn resume(&self, completion: impl FnOnce(Result<()>) + Send + 'static) {
        self.power_in_background(PowerAction::Resume, completion);
    }

    /// Terminate the emulator in the background.
    pub fn quit(&self, completion: impl FnOnce(Result<()>) + Send + 'static) {
        self.power_in_background(PowerAction::Quit, completion);
    }

    /// Run a human monitor command line and return its text output.
    pub async fn human_monitor_command(&self, command_line: &str) -> Result<String> {
        let command = Command::with_arguments(
            "human-monitor-command",
            &json!({ "command-line": command_line }),
        )?;
        self.shared.execute(&command, None).await
    }

    /// Save a snapshot (`savevm <name>`).
    pub async fn save_state(&self, name: &str) -> Result<String> {
        self.human_monitor_command(&monitor_line("savevm", &[name]))
            .await
    }

    /// Delete a snapshot (`delvm <name>`).
    pub async fn delete_state(&self, name: &str) -> Result<String> {
        self.human_monitor_command(&monitor_line("delvm", &[name]))
            .await
    }

    /// Route pointer input to mouse `index` (`mouse_set <index>`).
    pub async fn mouse_select(&self, index: i64) -> Result<String> {
        self.human_monitor_command(&monitor_line("mouse_set", &[&index.to_string()]))
            .await
    }

    /// `query-status`
    pub async fn query_status(&self) -> Result<QueryStatus> {
        self.shared.execute(&Command::new("query-status"), None).await
    }

    /// `query-mice`
    pub async fn query_mice(&self) -> Result<Vec<MouseInfo>> {
        self.shared.execute(&Command::new("query-mice"), None).await
    }

    /// Index of the first mouse whose `absolute` flag equals `absolute`.
    ///
    /// `Ok(None)` means the query worked but no device matched.
    pub async fn mouse_index_for_absolute(&self, absolute: bool) -> Result<Option<i64>> {
        let mice = self.query_mice().await?;
        Ok(first_with_absolute(&mice, absolute))
    }

    /// Tear the session down.
    ///
    /// Resolves an in-flight command with a lifecycle error, then stops the
    /// reader. Later calls fail with a lifecycle error. Idempotent; also run
    /// on drop.
    pub fn shutdown(&self) {
        if self.shared.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("tearing down QMP manager");

        self.shared.gate.close(Error::destroyed());
        self.shared.state.send_replace(ConnectionState::Disconnected);
        self.shared.close_handshake();
        self.reader.abort();
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn ensure_alive(&self) -> Result<()> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(Error::destroyed());
        }
        Ok(())
    }

    fn ensure_command_mode(&self) -> Result<()> {
        self.ensure_alive()?;
        if *self.state.borrow() != ConnectionState::CommandMode {
            return Err(Error::lifecycle("QMP session is not in command mode"));
        }
        Ok(())
    }

    fn timeout(&self, over: Option<Duration>) -> Duration {
        over.unwrap_or(self.options.command_timeout)
    }

    async fn execute<R: DeserializeOwned>(
        &self,
        command: &Command,
        timeout: Option<Duration>,
    ) -> Result<R> {
        self.ensure_command_mode()?;
        let value = self.gate.call(command, self.timeout(timeout)).await?;
        decode_value(value).map_err(|e| {
            Error::protocol(format!(
                "failed to decode reply to '{}': {e}",
                command.execute
            ))
        })
    }

    /// Execute a command whose reply carries nothing of interest.
    async fn run(&self, command: &str) -> Result<()> {
        let _: Value = self.execute(&Command::new(command), None).await?;
        Ok(())
    }

    async fn negotiate(&self) -> Result<Greeting> {
        let greeting = self.wait_for_greeting().await?;

        let caps = &self.options.enable_capabilities;
        for cap in caps {
            if !greeting.supports(cap) {
                tracing::warn!(capability = %cap, "peer does not advertise capability");
            }
        }

        let command = if caps.is_empty() {
            Command::new("qmp_capabilities")
        } else {
            Command::with_arguments("qmp_capabilities", &json!({ "enable": caps }))?
        };
        self.gate.call(&command, self.timeout(None)).await?;
        Ok(greeting)
    }

    async fn wait_for_greeting(&self) -> Result<Greeting> {
        let timeout = self.timeout(None);
        let mut rx = self.handshake.subscribe();
        let handshake = match tokio::time::timeout(
            timeout,
            rx.wait_for(|h| !matches!(h, Handshake::Pending)),
        )
        .await
        {
            Ok(Ok(handshake)) => handshake.clone(),
            Ok(Err(_closed)) => Handshake::Closed,
            Err(_elapsed) => return Err(Error::Timeout { timeout }),
        };

        match handshake {
            Handshake::Received(greeting) => Ok(greeting),
            Handshake::Pending | Handshake::Closed => {
                self.ensure_alive()?;
                Err(Error::Disconnected)
            }
        }
    }

    fn close_handshake(&self) {
        self.handshake.send_if_modified(|h| {
            if matches!(h, Handshake::Pending) {
                *h = Handshake::Closed;
                true
            } else {
                false
            }
        });
    }

    fn route(&self, msg: IncomingMessage) {
        match msg {
            IncomingMessage::Greeting(greeting) => self.on_greeting(greeting),
            IncomingMessage::Reply(value) => self.gate.deliver(Ok(value)),
            IncomingMessage::ErrorReply(err) => self.gate.deliver(Err(err)),
            IncomingMessage::Event(event) => self.dispatcher.dispatch(event),
        }
    }

    fn on_greeting(&self, greeting: Greeting) {
        if !matches!(*self.handshake.borrow(), Handshake::Pending) {
            tracing::warn!("ignoring repeated QMP greeting");
            return;
        }

        tracing::debug!(
            version = %greeting.qmp.version.qemu,
            package = %greeting.qmp.version.package,
            caps = ?greeting.qmp.capabilities,
            "received QMP greeting"
        );

        self.handshake
            .send_replace(Handshake::Received(greeting.clone()));
        self.state.send_replace(ConnectionState::Connected);
        self.dispatcher.observer().connected(&greeting);
    }

    fn malformed_reply(&self, err: &Error) {
        tracing::warn!(error = %err, "QMP reply could not be decoded");
        self.gate.deliver_malformed(err);
        self.dispatcher.observer().error(&err.description());
    }

    fn malformed(&self, err: &Error) {
        tracing::warn!(error = %err, "dropping malformed QMP message");
        self.dispatcher.observer().error(&err.description());
    }

    fn lost(&self, reason: Error) {
        if self.torn_down.load(Ordering::SeqCst) {
            return;
        }

        let failure = match &reason {
            Error::Disconnected => {
                tracing::debug!("QMP peer closed the stream");
                None
            }
            other => {
                tracing::warn!(error = %other, "QMP stream failed");
                Some(other.description())
            }
        };

        self.gate.close(reason);
        self.state.send_replace(ConnectionState::Disconnected);
        self.close_handshake();

        let observer = self.dispatcher.observer();
        if let Some(description) = failure {
            observer.error(&description);
        }
        observer.disconnected();
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: FrameReader<R>)
where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        let frame = tokio::select! {
            frame = reader.read_frame() => frame,
            reason = shared.gate.closed() => break reason,
        };

        match frame {
            Ok(Inbound::Frame(object)) => {
                let is_reply = IncomingMessage::is_reply(&object);
                match IncomingMessage::classify(object) {
                    Ok(msg) => shared.route(msg),
                    Err(e) if is_reply => shared.malformed_reply(&e),
                    Err(e) => shared.malformed(&e),
                }
            }
            Ok(Inbound::Malformed(e)) => shared.malformed(&e),
            Err(e) => break e,
        }
    };

    shared.lost(reason);
}

/// `verb arg1 arg2 ...`
fn monitor_line(verb: &str, args: &[&str]) -> String {
    std::iter::once(verb)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}
