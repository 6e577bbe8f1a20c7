//! Error types for connection handling.

use std::io;
use thiserror::Error;
use tokio::task::JoinError;

/// Outcome of a failed connection.
///
/// Every variant is local to a single client connection; none of them stop
/// the server.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A backend could not be reached.
    #[error("failed to connect to target {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Read or write failure while relaying bytes.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The shared cancellation token fired before the operation finished.
    #[error("operation cancelled")]
    Cancelled,

    /// A copy task panicked or was aborted.
    #[error("copy task failed: {0}")]
    Task(#[from] JoinError),
}

impl ProxyError {
    /// True when the connection ended because of shutdown rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProxyError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
