use std::io;
use std::result;

use thiserror::Error;

/// Custom result type for lumokv operations
pub type Result<T> = result::Result<T, Error>;

/// lumokv error codes
#[derive(Debug, Error)]
pub enum Error {
    /// Key/data pair already exists
    #[error("Key/data pair already exists")]
    KeyExist,
    /// No matching key/data pair found
    #[error("No matching key/data pair found")]
    NotFound,
    /// Page or structure invariant violated
    #[error("Database file is corrupted")]
    Corrupted,
    /// File is not a lumokv file
    #[error("File is not a valid lumokv file")]
    Invalid,
    /// Database version mismatch
    #[error("Database version mismatch: file has {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    /// Environment mapsize limit reached
    #[error("Environment mapsize limit reached")]
    MapFull,
    /// Another process grew the data file past this environment's map
    #[error("Database contents grew beyond environment mapsize")]
    MapResized,
    /// Environment maxdbs limit reached
    #[error("Environment maxdbs limit reached")]
    DbsFull,
    /// Environment maxreaders limit reached
    #[error("Environment maxreaders limit reached")]
    ReadersFull,
    /// Another writer committed since this transaction began
    #[error("Write transaction conflicts with a concurrent commit")]
    Conflict,
    /// Resource is held elsewhere
    #[error("Resource busy: {0}")]
    Busy(&'static str),
    /// Timed out waiting for the writer lock
    #[error("Timed out waiting for the writer lock")]
    Timeout,
    /// Operation and DB incompatible
    #[error("Operation and DB incompatible")]
    Incompatible,
    /// Unsupported size of key/DB name/data
    #[error("Unsupported size of key/DB name/data")]
    BadValSize,
    /// Database handle is unknown or was dropped
    #[error("The specified DBI is invalid")]
    BadDbi,
    /// Transaction hit an unrecoverable error and must be aborted
    #[error("Transaction must abort, has a child, or is invalid")]
    BadTxn,
    /// Operation not allowed in read-only transaction
    #[error("Operation not allowed in read-only transaction")]
    TxnReadOnly,
    /// Environment is read-only
    #[error("Environment is read-only")]
    EnvReadOnly,
    /// Environment is closed
    #[error("Environment is closed")]
    EnvClosed,
    /// Invalid environment configuration
    #[error("Invalid environment configuration: {0}")]
    EnvInvalidConfig(&'static str),
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the error reports an exhausted configured limit
    /// (map size, database count, or reader slots).
    pub fn is_capacity(&self) -> bool {
        matches!(self, Error::MapFull | Error::DbsFull | Error::ReadersFull)
    }
}
