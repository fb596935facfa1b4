use std::io;
use std::result;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[source] Box<io::Error>),
    #[error("Corruption: {0}")]
    Corruption(String),
    #[error("Not supported: {0}")]
    NotSupported(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid filename: {0}")]
    InvalidFile(String),
    #[error("Error decoding record: {0}")]
    VarDecode(&'static str),
    #[error("Error reading table: {0}")]
    TableRead(String),
    #[error("Error reading log: {0}")]
    LogRead(String),
    #[error("Task cancelled: {0}")]
    Cancel(&'static str),
    #[error("Database closed")]
    DbClosed,
    #[error("Compaction error: {0}")]
    CompactionError(String),
    #[error("Other error: {0}")]
    Other(String),
}

impl From<io::Error> for Error {
    #[inline]
    fn from(e: io::Error) -> Error {
        Error::Io(Box::new(e))
    }
}

// The write path hands one status to every member of a commit group, so the
// error must be clonable. IO errors flatten into a message.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Io(e) => Error::Other(format!("IO error: {:?}", e)),
            Error::Corruption(e) => Error::Corruption(e.clone()),
            Error::NotSupported(e) => Error::NotSupported(e.clone()),
            Error::InvalidArgument(e) => Error::InvalidArgument(e.clone()),
            Error::InvalidFile(e) => Error::InvalidFile(e.clone()),
            Error::VarDecode(e) => Error::VarDecode(e),
            Error::TableRead(e) => Error::TableRead(e.clone()),
            Error::LogRead(e) => Error::LogRead(e.clone()),
            Error::Cancel(e) => Error::Cancel(e),
            Error::DbClosed => Error::DbClosed,
            Error::CompactionError(e) => Error::CompactionError(e.clone()),
            Error::Other(e) => Error::Other(e.clone()),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
