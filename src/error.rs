//! Error types for the spalloc client.
//!
//! Every public operation of the protocol client and the job controller
//! returns [`SpallocError`]. Front ends are expected to match on the
//! variants and map them to exit codes.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = SpallocError> = std::result::Result<T, E>;

/// Errors raised by the protocol client and job controller.
#[derive(Debug, Error)]
pub enum SpallocError {
    /// The connection could not be established or was lost.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The connection was torn down while the operation was outstanding.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A call received no response within its timeout.
    #[error("Command '{command}' timed out after {timeout:?}")]
    ProtocolTimeout {
        /// Name of the command that timed out
        command: String,
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// The server replied with something of the wrong shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server reported an exception for a command.
    #[error("Server error: {0}")]
    Server(String),

    /// A single frame could not be parsed.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A job did not reach one of the requested states in time.
    #[error("Job {job_id} did not reach the requested state within {timeout:?}")]
    StateChangeTimeout {
        /// The job being waited on
        job_id: u64,
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// The job has been destroyed.
    #[error("Job {job_id} destroyed{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    JobDestroyed {
        /// The destroyed job
        job_id: u64,
        /// Reason reported by the server or given locally
        reason: Option<String>,
    },

    /// The allocation request was rejected.
    #[error("Allocation rejected: {0}")]
    Allocation(String),

    /// The server runs a protocol version this client cannot talk to.
    #[error("Server version {0} is not compatible with this client")]
    IncompatibleVersion(String),

    /// A configuration file could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SpallocError {
    /// Build a `Connection` error from anything printable.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Build a `Protocol` error from anything printable.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Build a `MalformedMessage` error from anything printable.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage(message.into())
    }

    /// True for errors that mean the connection is unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::ConnectionClosed)
    }

    /// True for transient failures a caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::ConnectionClosed
                | Self::ProtocolTimeout { .. }
                | Self::StateChangeTimeout { .. }
        )
    }
}

impl From<std::io::Error> for SpallocError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => SpallocError::ConnectionClosed,
            _ => SpallocError::Connection(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for SpallocError {
    fn from(err: serde_json::Error) -> Self {
        SpallocError::Protocol(err.to_string())
    }
}
