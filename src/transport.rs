//! Byte-stream transport.
//!
//! The manager only needs a duplex byte stream. Sockets opened from an
//! [`Endpoint`] are one source; anything implementing [`AsyncQmpStream`]
//! (for example a `tokio::io::duplex` half or a child's stdio pair joined
//! with `tokio::io::join`) works as well.

use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};

/// An async duplex stream that can carry QMP traffic.
pub trait AsyncQmpStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncQmpStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A connected, type-erased QMP stream.
pub type QmpStream = Box<dyn AsyncQmpStream>;

/// Where a QEMU monitor socket lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A Unix domain socket (`-qmp unix:<path>,server`).
    Unix {
        /// Socket path.
        path: PathBuf,
    },

    /// A TCP socket (`-qmp tcp:<host>:<port>,server`).
    Tcp {
        /// Hostname or IP.
        host: String,
        /// Port.
        port: u16,
    },
}

impl Endpoint {
    /// Create a Unix socket endpoint.
    #[must_use]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Create a TCP endpoint.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }
}

/// Open a socket to `endpoint`.
pub async fn connect(endpoint: &Endpoint) -> Result<QmpStream> {
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix { path } => {
            let s = tokio::net::UnixStream::connect(path)
                .await
                .map_err(Error::from)?;
            tracing::debug!(path = %path.display(), "opened QMP unix socket");
            Ok(Box::new(s))
        }
        #[cfg(not(unix))]
        Endpoint::Unix { .. } => Err(Error::protocol(
            "unix sockets are not supported on this platform",
        )),
        Endpoint::Tcp { host, port } => {
            let s = tokio::net::TcpStream::connect((host.as_str(), *port))
                .await
                .map_err(Error::from)?;
            // Commands are tiny and latency bound.
            let _ = s.set_nodelay(true);
            tracing::debug!(%host, port, "opened QMP tcp socket");
            Ok(Box::new(s))
        }
    }
}
