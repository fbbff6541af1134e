use std::fmt::Display;

/// EmberDB errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// An IO error from any file operation.
    Io(String),
    /// On-disk data could not be decoded: bad SSTable magic, truncated
    /// blocks, undecodable manifests.
    Corruption(String),
    /// A WAL chunk failed checksum validation. Replay terminates at the
    /// offending record.
    InvalidCrc,
    /// A WAL payload exceeded the maximum single-chunk size.
    ChunkTooBig,
    /// An operation was attempted on a closed WAL or segment.
    Closed,
    /// A write was attempted on a segment that is no longer the append
    /// target.
    InactiveSegmentWrite,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::InvalidCrc => write!(f, "invalid crc"),
            Error::ChunkTooBig => write!(f, "chunk is too big"),
            Error::Closed => write!(f, "segment is closed"),
            Error::InactiveSegmentWrite => write!(f, "inactive segment can't write"),
        }
    }
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
