//! Error types for the Tessera library.
//!
//! All fallible operations return [`Result`], whose error side is the
//! [`TesseraError`] enum. The variants follow the failure taxonomy of the
//! index writer: transient I/O, corruption of persisted files, lock
//! contention, misuse of a closed or misconfigured component, and merges
//! that were cooperatively aborted.
//!
//! # Examples
//!
//! ```
//! use tessera::error::{Result, TesseraError};
//!
//! fn example_operation() -> Result<()> {
//!     Err(TesseraError::illegal_argument("max_buffered_docs must be >= 2"))
//! }
//!
//! assert!(example_operation().is_err());
//! ```

use std::io;

use thiserror::Error;

/// The main error type for Tessera operations.
#[derive(Error, Debug)]
pub enum TesseraError {
    /// I/O errors (file operations, sync, rename).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage-related errors.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Index-related errors.
    #[error("Index error: {0}")]
    Index(String),

    /// A persisted file failed its checksum or was truncated.
    #[error("Corrupt index: {0}")]
    Corrupt(String),

    /// The write lock of an index is held by another writer.
    #[error("Lock obtain failed: {0}")]
    LockObtainFailed(String),

    /// The component was closed, possibly because of a tragic event.
    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    /// The operation is not valid in the component's current state.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// An argument or configuration value is out of range.
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    /// A merge observed its abort flag and stopped.
    #[error("Merge aborted: {0}")]
    MergeAborted(String),

    /// Analysis errors raised by an analyzer.
    #[error("Analysis error: {0}")]
    Analysis(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases.
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error.
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with TesseraError.
pub type Result<T> = std::result::Result<T, TesseraError>;

impl From<bincode::Error> for TesseraError {
    fn from(err: bincode::Error) -> Self {
        TesseraError::Serialization(err.to_string())
    }
}

impl TesseraError {
    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        TesseraError::Storage(msg.into())
    }

    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        TesseraError::Index(msg.into())
    }

    /// Create a new corruption error.
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        TesseraError::Corrupt(msg.into())
    }

    /// Create a new lock-obtain error.
    pub fn lock_obtain_failed<S: Into<String>>(msg: S) -> Self {
        TesseraError::LockObtainFailed(msg.into())
    }

    /// Create a new already-closed error.
    pub fn already_closed<S: Into<String>>(msg: S) -> Self {
        TesseraError::AlreadyClosed(msg.into())
    }

    /// Create a new illegal-state error.
    pub fn illegal_state<S: Into<String>>(msg: S) -> Self {
        TesseraError::IllegalState(msg.into())
    }

    /// Create a new illegal-argument error.
    pub fn illegal_argument<S: Into<String>>(msg: S) -> Self {
        TesseraError::IllegalArgument(msg.into())
    }

    /// Create a new merge-aborted error.
    pub fn merge_aborted<S: Into<String>>(msg: S) -> Self {
        TesseraError::MergeAborted(msg.into())
    }

    /// Create a new analysis error.
    pub fn analysis<S: Into<String>>(msg: S) -> Self {
        TesseraError::Analysis(msg.into())
    }

    /// Create a new serialization error.
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        TesseraError::Serialization(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        TesseraError::Other(msg.into())
    }

    /// Whether this error only reports a cooperative merge abort.
    pub fn is_merge_aborted(&self) -> bool {
        matches!(self, TesseraError::MergeAborted(_))
    }

    /// Whether this error reports a missing file.
    pub fn is_not_found(&self) -> bool {
        match self {
            TesseraError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
