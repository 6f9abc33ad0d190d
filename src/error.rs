//! Error taxonomy shared by every layer.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = GensioError> = std::result::Result<T, E>;

/// Errors reported by streams, filters, transports and accepters.
#[derive(Debug, Clone, Error)]
pub enum GensioError {
    /// Connect, bind or name resolution failed.
    #[error("Open failed: {0}")]
    OpenFailure(String),

    /// A handshake or certificate check failed.
    #[error("Communication error on send: {0}")]
    CommError(String),

    #[error("Operation timed out")]
    Timeout,

    /// The addressed layer has no meaning for the operation.
    #[error("Operation not supported")]
    NotSupported,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Remote end closed connection")]
    RemoteClosed,

    #[error("Local end closed connection")]
    LocalClosed,

    /// The stream is not in a state that permits the operation.
    #[error("Not ready")]
    NotReady,

    #[error("Value out of range: {0}")]
    OutOfRange(String),

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

/// The coarse error classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    OpenFailure,
    CommunicationError,
    Timeout,
    NotSupported,
    InvalidConfiguration,
}

impl GensioError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GensioError::OpenFailure(_) => ErrorKind::OpenFailure,
            GensioError::CommError(_)
            | GensioError::RemoteClosed
            | GensioError::LocalClosed
            | GensioError::Io(_) => ErrorKind::CommunicationError,
            GensioError::Timeout => ErrorKind::Timeout,
            GensioError::NotSupported => ErrorKind::NotSupported,
            GensioError::InvalidConfig(_)
            | GensioError::NotReady
            | GensioError::OutOfRange(_) => ErrorKind::InvalidConfiguration,
        }
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, GensioError::NotSupported)
    }

    pub(crate) fn comm(msg: impl Into<String>) -> Self {
        GensioError::CommError(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        GensioError::InvalidConfig(msg.into())
    }

    /// Wraps an I/O failure that happened while establishing a link.
    pub(crate) fn open(context: &str, err: io::Error) -> Self {
        GensioError::OpenFailure(format!("{context}: {err}"))
    }
}

impl From<io::Error> for GensioError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                GensioError::RemoteClosed
            }
            io::ErrorKind::TimedOut => GensioError::Timeout,
            _ => GensioError::Io(Arc::new(err)),
        }
    }
}

impl From<rustls::Error> for GensioError {
    fn from(err: rustls::Error) -> Self {
        GensioError::CommError(err.to_string())
    }
}
