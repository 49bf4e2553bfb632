use thiserror::Error;
use tokio::task::JoinError;

/// Errors surfaced by the filesystem core.
///
/// Translation to errno values happens at the FUSE boundary; nothing in the
/// core depends on libc error codes.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    #[error("object not found: {0}")]
    NotFound(String),

    /// A create or update hit a generation precondition. For writes this
    /// means a third party clobbered the object; staged bytes are preserved.
    #[error("generation precondition failed on {0}")]
    PreconditionFailed(String),

    /// Transient I/O after the bucket adapter exhausted its own retries.
    #[error("I/O error: {0}")]
    Io(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("filesystem is mounted read-only")]
    ReadOnly,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(value.to_string()),
            std::io::ErrorKind::Interrupted => Error::Cancelled,
            std::io::ErrorKind::InvalidInput => Error::InvalidArgument(value.to_string()),
            _ => Error::Io(value.to_string()),
        }
    }
}

impl From<JoinError> for Error {
    fn from(value: JoinError) -> Self {
        Error::Io(value.to_string())
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::NotFound(msg) => Self::new(std::io::ErrorKind::NotFound, msg),
            Error::Cancelled => Self::new(std::io::ErrorKind::Interrupted, "cancelled"),
            Error::InvalidArgument(msg) => Self::new(std::io::ErrorKind::InvalidInput, msg),
            other => Self::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}
