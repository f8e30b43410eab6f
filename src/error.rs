use std::fmt::Display;

/// SiltDB errors.
#[derive(Debug)]
pub enum Error {
    /// A storage read/write/sync failure. Fatal to the operation that hit it;
    /// writes leave the memtable unchanged, reads do not corrupt state.
    Io(std::io::Error),
    /// Invalid on-disk data: checksum mismatch, malformed footer, unknown
    /// format version, or a manifest referencing missing files.
    Corruption(String),
    /// A write was attempted on a read-only structure (frozen memtable,
    /// finalized sorted run).
    ReadOnly,
    /// Invalid caller input, typically schema or constraint violations from
    /// the relational layer.
    InvalidInput(String),
    /// The engine reached an internal state it cannot proceed from.
    InvalidState(String),
    /// The engine was halted after repeated background-compaction failures
    /// and refuses further writes until reopened.
    Halted,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Error::Halted => write!(f, "engine halted after repeated compaction failures"),
        }
    }
}

/// A SiltDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::InvalidState(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Corruption(err.to_string())
    }
}
