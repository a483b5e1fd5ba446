//! Error taxonomy for warmsh sessions
//!
//! Every failure that can abort a single connection is a [`SessionError`].
//! The daemon logs these and keeps serving; the client maps them to a
//! non-zero exit status.

use std::io;
use thiserror::Error;

/// Errors raised while establishing or running one session
#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed, truncated, oversized or stalled request payload
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket or descriptor read/write failure
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Fork, pseudo-terminal or pipe allocation failure
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// The shell entry point returned an error or panicked
    #[error("shell failed: {0}")]
    Collaborator(String),

    /// The peer hung up before sending anything, as liveness checks do
    #[error("peer disconnected without a request")]
    Disconnected,
}

impl SessionError {
    pub fn protocol(message: impl Into<String>) -> Self {
        SessionError::Protocol(message.into())
    }

    pub fn spawn(message: impl Into<String>) -> Self {
        SessionError::Spawn(message.into())
    }

    /// Stable error code used in log lines
    pub fn error_code(&self) -> &'static str {
        match self {
            SessionError::Protocol(_) => "PROTOCOL_ERROR",
            SessionError::Io(_) => "IO_ERROR",
            SessionError::Spawn(_) => "SPAWN_ERROR",
            SessionError::Collaborator(_) => "COLLABORATOR_FAILURE",
            SessionError::Disconnected => "DISCONNECTED",
        }
    }

    /// Exit status a client reports for this error
    pub fn exit_code(&self) -> i32 {
        1
    }
}

impl From<nix::Error> for SessionError {
    fn from(err: nix::Error) -> Self {
        SessionError::Io(io::Error::from(err))
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
