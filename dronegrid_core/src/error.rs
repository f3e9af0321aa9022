//! Error types for the DroneGrid core.

use dronegrid_env::EnvError;
use thiserror::Error;

/// Fatal errors on a framed byte stream.
///
/// After one of these the stream position is unknown, so the channel is
/// abandoned rather than resynchronised.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Underlying channel I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A bulk frame announced a count that is not an integer
    #[error("Unreadable bulk count '{0}'")]
    BadCount(String),

    /// A bulk frame announced more records than any peer may send
    #[error("Bulk count {0} exceeds limit")]
    BulkTooLarge(usize),
}

/// Errors that can occur in the DroneGrid core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Framing failure on a channel
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    /// A well-sized frame carried a payload that does not parse for its type
    #[error("Bad {kind} payload: {reason}")]
    Payload { kind: &'static str, reason: String },

    /// Frame type code is not part of the protocol
    #[error("Unknown frame type {0}")]
    UnknownKind(i32),

    /// Terminal or UI failure
    #[error("UI error: {0}")]
    Ui(String),

    /// Environment failure (registry, channels, process control)
    #[error(transparent)]
    Env(#[from] EnvError),
}

impl CoreError {
    /// Creates a payload parse error.
    pub fn payload(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::Payload {
            kind,
            reason: reason.into(),
        }
    }

    /// Creates a UI error.
    pub fn ui(msg: impl Into<String>) -> Self {
        Self::Ui(msg.into())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Frame(FrameError::Io(e))
    }
}
