use std::fmt;

/// Result alias used throughout the crate.
pub type CResult<T> = Result<T, Error>;

/// The engine's flat error taxonomy.
///
/// Conflict and graph-reachability errors are recoverable: the caller is
/// expected to `abort()` the transaction and may retry. `Serialization` and
/// `Storage` errors are abort-only; the database itself remains usable after
/// the offending operation is dropped.
#[derive(Debug)]
pub enum Error {
    /// Write to an object whose overlay the calling thread does not own.
    ReadOnly(String),
    /// A concurrent commit overlapped this transaction's write set and no
    /// resolver salvaged it.
    WriteConflict(String),
    /// A concurrent commit invalidated this transaction's read set.
    ReadConflict(String),
    /// A commit touched an object with no OID that is not reachable from
    /// the database root.
    ObjectGraph(String),
    /// The codec refused to serialize an attribute value.
    Serialization(String),
    /// I/O failure, corruption beyond the last-good trailer, or a lock
    /// acquisition failure.
    Storage(String),
    /// Anything else that doesn't fit the taxonomy above.
    Internal(String),
    /// Wrapped `std::io::Error`, for use with `?`.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ReadOnly(msg) => write!(f, "read-only object: {msg}"),
            Error::WriteConflict(msg) => write!(f, "write conflict: {msg}"),
            Error::ReadConflict(msg) => write!(f, "read conflict: {msg}"),
            Error::ObjectGraph(msg) => write!(f, "object graph error: {msg}"),
            Error::Serialization(msg) => write!(f, "serialization error: {msg}"),
            Error::Storage(msg) => write!(f, "storage error: {msg}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
            Error::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Serialization(err.to_string())
    }
}
