//! Connection error types

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Operation attempted on a connection that was already closed
    #[error("Connection closed")]
    Closed,

    /// Error from the underlying transport, passed through unchanged
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Dial to {address} timed out after {timeout:?}")]
    DialTimeout { address: String, timeout: Duration },

    #[error("Dial to {address} cancelled")]
    DialCancelled { address: String },
}

impl ConnectionError {
    /// Whether this error was caused by an expired deadline.
    ///
    /// Only used to pick a log level; timeouts are returned to the caller
    /// like any other transport error.
    pub fn is_timeout(&self) -> bool {
        match self {
            ConnectionError::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            ConnectionError::DialTimeout { .. } => true,
            _ => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionError::Closed)
    }
}

impl From<ConnectionError> for io::Error {
    fn from(err: ConnectionError) -> Self {
        let message = err.to_string();
        match err {
            ConnectionError::Io(e) => e,
            ConnectionError::Closed => io::Error::new(io::ErrorKind::NotConnected, message),
            ConnectionError::DialTimeout { .. } => io::Error::new(io::ErrorKind::TimedOut, message),
            ConnectionError::DialCancelled { .. } => {
                io::Error::new(io::ErrorKind::Interrupted, message)
            }
        }
    }
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;
