//! Crate-level error types

use std::path::PathBuf;

use thiserror::Error;

use crate::wire::FrameError;

/// Error type for broker operations
#[derive(Debug, Error)]
pub enum Error {
    /// Another broker instance is already listening on the socket path
    #[error("another message broker is already listening on {0}")]
    AlreadyRunning(PathBuf),

    /// Binding the listening socket failed
    #[error("unable to bind {path}: {source}")]
    Bind {
        /// Socket path we tried to bind
        path: PathBuf,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// Malformed or truncated wire frame
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Generic I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The broker answered with something unexpected
    #[error("unexpected reply from the broker: {0}")]
    BadReply(String),
}

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, Error>;
