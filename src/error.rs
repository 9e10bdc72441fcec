//! Error types surfaced to callers of the multiplexer.
//!
//! Every failure a caller can observe on a submitted command is a
//! [`MuxError`]. Errors are `Clone` because a single completion may be
//! delivered to a blocking waiter, an async waiter and any number of
//! continuations at once.

use crate::connection::ConnectionPurpose;
use crate::protocol::{ParseError, ResultShape};
use thiserror::Error;

/// Result type used throughout the crate.
pub type MuxResult<T> = Result<T, MuxError>;

/// Failures a command or connection can run into.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MuxError {
    /// No usable endpoint or connection at submission time.
    #[error("No connection is available to service this operation: {command}; {reason}")]
    ConnectionUnavailable { command: String, reason: String },

    /// The stream was torn down while the command was outstanding.
    #[error("Connection lost to {endpoint}/{purpose}: {reason}")]
    ConnectionLost {
        endpoint: String,
        purpose: ConnectionPurpose,
        reason: String,
    },

    /// The deadline elapsed while the connection was otherwise healthy.
    #[error("Timeout awaiting response (command={command}, endpoint={endpoint}, timeout={timeout_ms}ms)")]
    Timeout {
        command: String,
        endpoint: String,
        timeout_ms: u64,
    },

    /// Malformed reply; always fatal to the stream it arrived on.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Stream creation or handshake failed.
    #[error("Failed to connect to {endpoint}: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    /// The multiplexer was shut down.
    #[error("The multiplexer has been disposed")]
    ConnectionDisposed,

    /// Backpressure: the bridge already holds too many messages.
    #[error("Queue for {endpoint} is full ({limit} messages pending or outstanding)")]
    QueueFull { endpoint: String, limit: usize },

    /// The server answered with an error reply.
    #[error("{0}")]
    Server(String),

    /// The reply did not have the shape the caller asked for.
    #[error("Unexpected reply: expected {expected}, got {actual}")]
    UnexpectedReply {
        expected: ResultShape,
        actual: &'static str,
    },
}

/// Flat classification of [`MuxError`], convenient for matching and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionUnavailable,
    ConnectionLost,
    Timeout,
    Protocol,
    ConnectFailed,
    ConnectionDisposed,
    QueueFull,
    Server,
    UnexpectedReply,
}

impl MuxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MuxError::ConnectionUnavailable { .. } => ErrorKind::ConnectionUnavailable,
            MuxError::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            MuxError::Timeout { .. } => ErrorKind::Timeout,
            MuxError::Protocol(_) => ErrorKind::Protocol,
            MuxError::ConnectFailed { .. } => ErrorKind::ConnectFailed,
            MuxError::ConnectionDisposed => ErrorKind::ConnectionDisposed,
            MuxError::QueueFull { .. } => ErrorKind::QueueFull,
            MuxError::Server(_) => ErrorKind::Server,
            MuxError::UnexpectedReply { .. } => ErrorKind::UnexpectedReply,
        }
    }

    /// True for failures caused by the connection rather than the command.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConnectionUnavailable
                | ErrorKind::ConnectionLost
                | ErrorKind::Protocol
                | ErrorKind::ConnectFailed
                | ErrorKind::ConnectionDisposed
        )
    }
}

impl From<ParseError> for MuxError {
    fn from(e: ParseError) -> Self {
        MuxError::Protocol(e.to_string())
    }
}
