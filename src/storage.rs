//! Storage abstraction layer for Tessera.
//!
//! An index lives in a flat namespace of named files (a "directory"). The
//! writer only ever creates new files, renames a prepared manifest into
//! place, syncs, and deletes files it no longer references; it never edits a
//! file after closing it. Every backend implements [`Storage`].
//!
//! # Storage Types
//!
//! ## FileStorage
//! - Disk-based persistent storage
//! - `write.lock` held through an OS advisory lock
//!
//! ## MemoryStorage
//! - In-memory storage for tests and temporary indexes
//!
//! ## FaultyStorage
//! - Wraps another storage and injects I/O failures, and can simulate a
//!   crash that loses every file written since its last sync

use std::fmt::Debug;
use std::io::{self, Read, Seek, Write};

use crate::error::{Result, TesseraError};

pub mod faulty;
pub mod file;
pub mod memory;
pub mod structured;

pub use faulty::{FaultPoint, FaultyStorage};
pub use file::{FileStorage, FileStorageConfig};
pub use memory::MemoryStorage;

/// A trait for storage backends that hold the files of one index.
pub trait Storage: Send + Sync + Debug {
    /// Open a file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create (or truncate) a file for writing.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files in the storage.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Atomically rename a file, replacing any existing target.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Make the contents of the named files durable.
    fn sync(&self, names: &[String]) -> Result<()>;

    /// Make renames and deletions durable.
    fn sync_meta_data(&self) -> Result<()>;

    /// Obtain the named exclusive lock, failing immediately if it is held.
    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>>;

    /// Close the storage and release resources.
    fn close(&self) -> Result<()>;
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;

    /// Close the input stream.
    fn close(&mut self) -> Result<()>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Send + Debug {
    /// Flush and sync the output to storage.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Number of bytes written so far.
    fn position(&self) -> u64;

    /// Flush and close the output. The file is complete afterwards.
    fn close(&mut self) -> Result<()>;
}

/// A held storage lock. Dropping it releases the lock.
pub trait StorageLock: Send + Debug {
    /// Get the lock name.
    fn name(&self) -> &str;

    /// Release the lock.
    fn release(&mut self) -> Result<()>;

    /// Whether the lock is still held.
    fn is_valid(&self) -> bool;
}

/// Errors specific to storage operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The file does not exist.
    FileNotFound(String),
    /// The lock is held by someone else.
    LockFailed(String),
    /// The storage has been closed.
    StorageClosed,
    /// Other I/O failure.
    IoError(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "File not found: {name}"),
            StorageError::LockFailed(name) => write!(f, "Failed to acquire lock: {name}"),
            StorageError::StorageClosed => write!(f, "Storage is closed"),
            StorageError::IoError(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for TesseraError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::FileNotFound(name) => {
                TesseraError::Io(io::Error::new(io::ErrorKind::NotFound, name))
            }
            StorageError::LockFailed(name) => TesseraError::lock_obtain_failed(name),
            StorageError::StorageClosed => TesseraError::already_closed("storage is closed"),
            StorageError::IoError(msg) => TesseraError::storage(msg),
        }
    }
}

/// Read a whole file into memory.
pub fn read_file(storage: &dyn Storage, name: &str) -> Result<Vec<u8>> {
    let mut input = storage.open_input(name)?;
    let mut bytes = Vec::with_capacity(input.size()? as usize);
    input.read_to_end(&mut bytes)?;
    input.close()?;
    Ok(bytes)
}

/// Write a whole file and close it. The file is not synced.
pub fn write_file(storage: &dyn Storage, name: &str, bytes: &[u8]) -> Result<()> {
    let mut output = storage.create_output(name)?;
    output.write_all(bytes)?;
    output.close()
}
