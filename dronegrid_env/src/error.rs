//! Error types for the DroneGrid environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Filesystem or pipe I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A registry line or identity could not be parsed
    #[error("Malformed entry: {0}")]
    Malformed(String),

    /// A channel handle passed on the command line is unusable
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// An OS call (kill, fcntl, pipe) failed
    #[error("OS call {call} failed: {source}")]
    OsCall {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl EnvError {
    /// Creates a malformed-entry error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Creates a channel error.
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::ChannelError(msg.into())
    }

    /// Captures `errno` for a failed OS call.
    pub fn last_os_error(call: &'static str) -> Self {
        Self::OsCall {
            call,
            source: std::io::Error::last_os_error(),
        }
    }
}
