use std::{fmt, sync::Arc, time::Duration};

use crate::{
    dispatch::{NoopObserver, QmpObserver},
    error::Result,
    framer::DEFAULT_MAX_FRAME_LEN,
    transport::{self, AsyncQmpStream, Endpoint},
};

use super::Manager;

/// Default deadline for a single command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Options controlling a [`Manager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Deadline for each command, including capability negotiation and the
    /// wait for the greeting.
    pub command_timeout: Duration,

    /// Capabilities to enable during `qmp_capabilities`.
    ///
    /// Leaving this empty sends a plain `qmp_capabilities`.
    pub enable_capabilities: Vec<String>,

    /// Largest frame the reader will buffer before discarding it.
    pub max_frame_len: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            enable_capabilities: Vec::new(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Options for a single command call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Override the manager's command timeout.
    pub timeout: Option<Duration>,
}

/// Builder for [`Manager`].
pub struct ManagerBuilder {
    options: ManagerOptions,
    observer: Arc<dyn QmpObserver>,
}

impl ManagerBuilder {
    pub(crate) fn new() -> Self {
        Self {
            options: ManagerOptions::default(),
            observer: Arc::new(NoopObserver),
        }
    }

    /// Replace all options at once.
    #[must_use]
    pub fn options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the observer that receives lifecycle and event callbacks.
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn QmpObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Set the per-command deadline.
    #[must_use]
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.options.command_timeout = timeout;
        self
    }

    /// Set capabilities to enable during negotiation.
    #[must_use]
    pub fn enable_capabilities(mut self, caps: impl Into<Vec<String>>) -> Self {
        self.options.enable_capabilities = caps.into();
        self
    }

    /// Set the largest accepted frame.
    #[must_use]
    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.options.max_frame_len = len;
        self
    }

    /// Take ownership of an established stream and start reading from it.
    ///
    /// The session is not usable for commands until [`Manager::connect`]
    /// succeeds.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn attach<S>(self, stream: S) -> Manager
    where
        S: AsyncQmpStream + 'static,
    {
        Manager::start(stream, self.observer, self.options)
    }

    /// Open `endpoint`, attach to it and negotiate command mode.
    pub async fn connect_endpoint(self, endpoint: &Endpoint) -> Result<Manager> {
        let stream = transport::connect(endpoint).await?;
        let manager = self.attach(stream);
        manager.connect().await?;
        Ok(manager)
    }
}

impl fmt::Debug for ManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerBuilder")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
