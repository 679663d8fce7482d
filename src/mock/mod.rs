//! Scripted QMP peers.
//!
//! - [`MockQemu`]: answers commands from a [`MockScript`] automatically.
//! - [`MockPeer`]: driven step by step from the test, for exact interleavings
//!   (withheld replies, late replies, mid-call disconnects).
//! - [`ReplayServer`]: replays a recorded JSONL [`Transcript`] over TCP.
//!
//! Gated behind `cfg(test)` or the `mock` Cargo feature.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncRead, DuplexStream, ReadHalf},
    net::TcpListener,
    task::JoinHandle,
};

use crate::{
    error::{Error, Result},
    framer::{DEFAULT_MAX_FRAME_LEN, FrameReader, FrameWriter, Inbound},
    transport::{AsyncQmpStream, Endpoint},
    types::{Command, Greeting, QmpInfo, QmpVersion, QmpVersionNumber},
};

const PIPE_CAPACITY: usize = 64 * 1024;

/// How the mock answers a command.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum MockReply {
    /// `{"return": value}`
    Return(Value),

    /// `{"error": {"class": ..., "desc": ...}}`
    Error {
        /// QMP error class.
        class: String,
        /// QMP error description.
        desc: String,
    },

    /// Never answer.
    Silent,
}

impl MockReply {
    fn into_response(self) -> Option<Value> {
        match self {
            MockReply::Return(v) => Some(json!({ "return": v })),
            MockReply::Error { class, desc } => Some(json!({
                "error": { "class": class, "desc": desc }
            })),
            MockReply::Silent => None,
        }
    }
}

/// What a [`MockQemu`] says and how it answers.
#[derive(Debug, Clone)]
pub struct MockScript {
    /// Greeting to send on connect.
    pub greeting: Greeting,

    /// Replies keyed by `execute` name.
    pub replies: HashMap<String, MockReply>,

    /// Replies to `human-monitor-command`, keyed by command line.
    pub monitor: HashMap<String, MockReply>,

    /// Events sent right after capability negotiation.
    pub post_handshake_events: Vec<Value>,

    /// Events sent after the reply to a given command.
    pub events_after: HashMap<String, Vec<Value>>,
}

impl MockScript {
    /// A greeting resembling a recent QEMU.
    #[must_use]
    pub fn default_greeting() -> Greeting {
        Greeting {
            qmp: QmpInfo {
                version: QmpVersion {
                    qemu: QmpVersionNumber {
                        major: 8,
                        minor: 2,
                        micro: 0,
                    },
                    package: "mock".to_string(),
                },
                capabilities: vec!["oob".to_string()],
            },
        }
    }

    /// An empty script with the default greeting.
    #[must_use]
    pub fn new() -> Self {
        Self {
            greeting: Self::default_greeting(),
            replies: HashMap::new(),
            monitor: HashMap::new(),
            post_handshake_events: Vec::new(),
            events_after: HashMap::new(),
        }
    }

    /// Answer `command` with `value`.
    #[must_use]
    pub fn reply_return(mut self, command: impl Into<String>, value: Value) -> Self {
        self.replies.insert(command.into(), MockReply::Return(value));
        self
    }

    /// Answer `command` with an error.
    #[must_use]
    pub fn reply_error(
        mut self,
        command: impl Into<String>,
        class: impl Into<String>,
        desc: impl Into<String>,
    ) -> Self {
        self.replies.insert(
            command.into(),
            MockReply::Error {
                class: class.into(),
                desc: desc.into(),
            },
        );
        self
    }

    /// Never answer `command`.
    #[must_use]
    pub fn reply_silent(mut self, command: impl Into<String>) -> Self {
        self.replies.insert(command.into(), MockReply::Silent);
        self
    }

    /// Answer the monitor command line `line` with `output`.
    #[must_use]
    pub fn reply_monitor(mut self, line: impl Into<String>, output: impl Into<String>) -> Self {
        self.monitor
            .insert(line.into(), MockReply::Return(Value::String(output.into())));
        self
    }

    /// Send `event` right after negotiation.
    #[must_use]
    pub fn post_event(mut self, event: Value) -> Self {
        self.post_handshake_events.push(event);
        self
    }

    /// Send `event` after replying to `command`.
    #[must_use]
    pub fn event_after(mut self, command: impl Into<String>, event: Value) -> Self {
        self.events_after
            .entry(command.into())
            .or_default()
            .push(event);
        self
    }

    fn reply_for(&self, command: &Command) -> MockReply {
        if command.execute == "human-monitor-command" {
            let line = command
                .arguments
                .as_ref()
                .and_then(|a| a.get("command-line"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            if let Some(reply) = self.monitor.get(line) {
                return reply.clone();
            }
        }

        self.replies
            .get(&command.execute)
            .cloned()
            .unwrap_or_else(|| MockReply::Error {
                class: "CommandNotFound".to_string(),
                desc: format!("The command {} has not been found", command.execute),
            })
    }
}

impl Default for MockScript {
    fn default() -> Self {
        Self::new()
    }
}

/// A peer that plays a [`MockScript`] on its own task.
#[derive(Debug)]
pub struct MockQemu {
    log: Arc<Mutex<Vec<Command>>>,
    task: JoinHandle<Result<()>>,
}

impl MockQemu {
    /// Start a mock on an in-memory pipe; returns the client end.
    #[must_use]
    pub fn pair(script: MockScript) -> (DuplexStream, Self) {
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        (client, Self::serve(server, script))
    }

    /// Serve `script` on an already connected stream.
    pub fn serve<S>(stream: S, script: MockScript) -> Self
    where
        S: AsyncQmpStream + 'static,
    {
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(serve_script(stream, script, log.clone()));
        Self { log, task }
    }

    /// Commands received so far, capability negotiation included.
    #[must_use]
    pub fn commands(&self) -> Vec<Command> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until the client hangs up (or `quit` is served).
    pub async fn finish(self) -> Result<()> {
        join(self.task).await
    }
}

async fn serve_script<S>(stream: S, script: MockScript, log: Arc<Mutex<Vec<Command>>>) -> Result<()>
where
    S: AsyncQmpStream + 'static,
{
    let (r, w) = tokio::io::split(stream);
    let mut reader = FrameReader::new(r, DEFAULT_MAX_FRAME_LEN);
    let writer = FrameWriter::new(w);
    let record = |cmd: &Command| {
        log.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(cmd.clone());
    };

    writer.send(&script.greeting).await?;

    let caps = recv_command(&mut reader).await?;
    record(&caps);
    if caps.execute != "qmp_capabilities" {
        let err = MockReply::Error {
            class: "CommandNotFound".to_string(),
            desc: "Expecting capabilities negotiation with 'qmp_capabilities'".to_string(),
        };
        if let Some(resp) = err.into_response() {
            writer.send(&resp).await?;
        }
        return Ok(());
    }
    writer.send(&json!({ "return": {} })).await?;

    for event in &script.post_handshake_events {
        writer.send(event).await?;
    }

    loop {
        let cmd = match recv_command(&mut reader).await {
            Ok(cmd) => cmd,
            Err(Error::Disconnected) => return Ok(()),
            Err(e) => return Err(e),
        };
        record(&cmd);

        if let Some(resp) = script.reply_for(&cmd).into_response() {
            writer.send(&resp).await?;
        }
        if let Some(events) = script.events_after.get(&cmd.execute) {
            for event in events {
                writer.send(event).await?;
            }
        }

        if cmd.execute == "quit" {
            return Ok(());
        }
    }
}

async fn recv_command<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Result<Command> {
    match reader.read_frame().await? {
        Inbound::Frame(object) => {
            serde_json::from_value(Value::Object(object)).map_err(|e| Error::Protocol {
                message: format!("client sent something other than a command: {e}"),
            })
        }
        Inbound::Malformed(e) => Err(e),
    }
}

async fn join(task: JoinHandle<Result<()>>) -> Result<()> {
    task.await
        .unwrap_or_else(|e| Err(Error::protocol(format!("mock peer task failed: {e}"))))
}

/// A peer the test drives by hand.
#[derive(Debug)]
pub struct MockPeer {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: FrameWriter,
}

impl MockPeer {
    /// Create a peer on an in-memory pipe; returns the client end.
    #[must_use]
    pub fn pair() -> (DuplexStream, Self) {
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let (r, w) = tokio::io::split(server);
        (
            client,
            Self {
                reader: FrameReader::new(r, DEFAULT_MAX_FRAME_LEN),
                writer: FrameWriter::new(w),
            },
        )
    }

    /// Send any JSON value as one frame.
    pub async fn send(&self, msg: &Value) -> Result<()> {
        self.writer.send(msg).await
    }

    /// Send raw bytes, e.g. a partial or broken frame.
    pub async fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        self.writer.send_raw(bytes).await
    }

    /// Send the default greeting.
    pub async fn send_greeting(&self) -> Result<()> {
        self.writer.send(&MockScript::default_greeting()).await
    }

    /// Wait for the next command from the client.
    pub async fn recv_command(&mut self) -> Result<Command> {
        recv_command(&mut self.reader).await
    }

    /// Answer with `{"return": value}`.
    pub async fn reply(&self, value: Value) -> Result<()> {
        self.send(&json!({ "return": value })).await
    }

    /// Answer with an error object.
    pub async fn reply_error(&self, class: &str, desc: &str) -> Result<()> {
        self.send(&json!({ "error": { "class": class, "desc": desc } }))
            .await
    }

    /// Greeting, `qmp_capabilities`, empty return.
    pub async fn handshake(&mut self) -> Result<()> {
        self.send_greeting().await?;
        let caps = self.recv_command().await?;
        if caps.execute != "qmp_capabilities" {
            return Err(Error::protocol(format!(
                "expected qmp_capabilities, got {}",
                caps.execute
            )));
        }
        self.reply(json!({})).await
    }
}

/// A transcript step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "dir", rename_all = "lowercase")]
pub enum TranscriptStep {
    /// A message the server sends.
    Server {
        /// Message payload.
        msg: Value,
    },
    /// A message the client must send.
    Client {
        /// Message payload.
        msg: Value,
    },
}

/// An ordered JSONL conversation.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    /// Ordered transcript steps.
    pub steps: Vec<TranscriptStep>,
}

impl Transcript {
    /// Parse JSON Lines content; blank lines are skipped.
    pub fn from_jsonl_str(s: &str) -> Result<Self> {
        let mut steps = Vec::new();
        for (idx, line) in s.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let step = serde_json::from_str(line).map_err(|e| {
                Error::protocol(format!("invalid jsonl at line {}: {e}", idx + 1))
            })?;
            steps.push(step);
        }

        Ok(Self { steps })
    }

    /// Load a transcript from a JSONL file.
    pub fn from_jsonl_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(Error::from)?;
        Self::from_jsonl_str(&data)
    }
}

/// Replays a [`Transcript`] to the first client that connects over TCP.
#[derive(Debug)]
pub struct ReplayServer {
    endpoint: Endpoint,
    task: JoinHandle<Result<()>>,
}

impl ReplayServer {
    /// Listen on an ephemeral loopback port.
    pub async fn start_tcp(transcript: Transcript) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(Error::from)?;
        let addr = listener.local_addr().map_err(Error::from)?;
        let endpoint = Endpoint::tcp(addr.ip().to_string(), addr.port());

        let task = tokio::spawn(async move {
            let (stream, _peer) = listener.accept().await.map_err(Error::from)?;
            replay(stream, transcript).await
        });

        Ok(Self { endpoint, task })
    }

    /// Endpoint clients should connect to.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    /// Wait for the replay to end; a client deviating from the transcript
    /// yields a protocol error.
    pub async fn finish(self) -> Result<()> {
        join(self.task).await
    }
}

async fn replay<S>(stream: S, transcript: Transcript) -> Result<()>
where
    S: AsyncQmpStream + 'static,
{
    let (r, w) = tokio::io::split(stream);
    let mut reader = FrameReader::new(r, DEFAULT_MAX_FRAME_LEN);
    let writer = FrameWriter::new(w);

    for step in transcript.steps {
        match step {
            TranscriptStep::Server { msg } => writer.send(&msg).await?,
            TranscriptStep::Client { msg: expected } => {
                let got = match reader.read_frame().await? {
                    Inbound::Frame(object) => Value::Object(object),
                    Inbound::Malformed(e) => return Err(e),
                };
                if got != expected {
                    return Err(Error::protocol(format!(
                        "transcript mismatch: expected {expected}, got {got}"
                    )));
                }
            }
        }
    }

    Ok(())
}
