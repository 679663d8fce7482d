//! JSON stream framing.
//!
//! QEMU writes one JSON object per message, usually followed by `\r\n`, but
//! nothing guarantees that a read returns whole lines. [`JsonFramer`] buffers
//! arbitrary chunks and yields top-level objects as soon as they are complete.
//! [`FrameWriter`] is the outbound half.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

use crate::error::{Error, Result};

/// Default upper bound for a single buffered frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Incremental decoder from bytes to top-level JSON objects.
#[derive(Debug)]
pub struct JsonFramer {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl Default for JsonFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl JsonFramer {
    /// Create a framer that gives up on frames longer than `max_frame_len`.
    #[must_use]
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len: max_frame_len.max(1),
        }
    }

    /// Append bytes read from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered, not yet framed bytes.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete object.
    ///
    /// `None` means more bytes are needed. An `Err` reports one bad frame; the
    /// framer has already skipped past it and can be polled again.
    pub fn next_frame(&mut self) -> Option<Result<Map<String, Value>>> {
        let start = match self.buf.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(start) => start,
            None => {
                self.buf.clear();
                return None;
            }
        };
        self.buf.drain(..start);

        let (parsed, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
            let parsed = stream.next();
            (parsed, stream.byte_offset())
        };

        match parsed {
            None => None,
            Some(Ok(value)) => {
                self.buf.drain(..consumed);
                match value {
                    Value::Object(object) => Some(Ok(object)),
                    other => Some(Err(Error::protocol(format!(
                        "expected a JSON object at top level, got `{other}`"
                    )))),
                }
            }
            Some(Err(e)) if e.is_eof() => {
                if self.buf.len() > self.max_frame_len {
                    let len = self.buf.len();
                    self.buf.clear();
                    return Some(Err(Error::protocol(format!(
                        "frame exceeds {} bytes (buffered {len})",
                        self.max_frame_len
                    ))));
                }
                None
            }
            Some(Err(e)) => {
                self.resync();
                Some(Err(Error::protocol(format!("malformed JSON frame: {e}"))))
            }
        }
    }

    /// Drop everything up to and including the next newline.
    fn resync(&mut self) {
        match self.buf.iter().position(|&b| b == b'\n') {
            Some(nl) => {
                self.buf.drain(..=nl);
            }
            None => self.buf.clear(),
        }
    }
}

/// One item pulled off the stream by [`FrameReader`].
#[derive(Debug)]
pub enum Inbound {
    /// A complete top-level object.
    Frame(Map<String, Value>),
    /// A frame that could not be decoded; the stream is still usable.
    Malformed(Error),
}

/// Inbound half of the stream: a read half pumped through a [`JsonFramer`].
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    framer: JsonFramer,
    chunk: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a read half.
    pub fn new(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            framer: JsonFramer::new(max_frame_len),
            chunk: vec![0; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Wait for the next frame.
    ///
    /// End-of-stream is [`Error::Disconnected`]; read failures are
    /// [`Error::Io`]. Both are final.
    pub async fn read_frame(&mut self) -> Result<Inbound> {
        loop {
            if let Some(frame) = self.framer.next_frame() {
                return Ok(match frame {
                    Ok(object) => Inbound::Frame(object),
                    Err(e) => Inbound::Malformed(e),
                });
            }

            let n = self.inner.read(&mut self.chunk).await.map_err(Error::from)?;
            if n == 0 {
                return Err(Error::Disconnected);
            }
            self.framer.push(&self.chunk[..n]);
        }
    }
}

/// Serialize `msg` into a single `\r\n` terminated line.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(msg)?;
    line.extend_from_slice(b"\r\n");
    Ok(line)
}

/// Outbound half of the stream.
///
/// Each [`FrameWriter::send`] writes and flushes one whole frame while holding
/// the writer lock, so frames never interleave.
pub struct FrameWriter {
    w: Mutex<Box<dyn AsyncWrite + Unpin + Send>>,
}

impl FrameWriter {
    /// Wrap a write half.
    pub fn new(w: impl AsyncWrite + Unpin + Send + 'static) -> Self {
        Self {
            w: Mutex::new(Box::new(w)),
        }
    }

    /// Write one frame.
    pub async fn send<T: Serialize>(&self, msg: &T) -> Result<()> {
        let line = encode(msg)?;
        self.send_raw(&line).await
    }

    /// Write `bytes` verbatim, as one uninterrupted unit.
    pub async fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut w = self.w.lock().await;
        w.write_all(bytes).await.map_err(Error::from)?;
        w.flush().await.map_err(Error::from)?;
        Ok(())
    }

    /// Shut the write direction down.
    pub async fn close(&self) -> Result<()> {
        let mut w = self.w.lock().await;
        w.shutdown().await.map_err(Error::from)
    }
}

impl fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameWriter").finish_non_exhaustive()
    }
}
