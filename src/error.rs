use std::fmt::Display;

/// EmberDB errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// A log record at the tail of a file was cut short, typically by a
    /// crash mid-append. `valid` is the length in bytes of the clean prefix
    /// preceding the truncated record.
    Incomplete { valid: u64 },
    /// Invalid data, typically decoding errors, corruption, or unexpected
    /// internal values.
    InvalidData(String),
    /// An IO error.
    Io(String),
    /// A write was attempted on a sealed memtable.
    ReadOnly,
    /// A file creation found its target already on disk. Generations are
    /// never reused, so this indicates a generator bug.
    AlreadyExists(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Incomplete { valid } => {
                write!(f, "incomplete record after {valid} valid bytes")
            }
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::ReadOnly => write!(f, "write attempted on sealed memtable"),
            Error::AlreadyExists(path) => write!(f, "file already exists: {path}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)) };
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
