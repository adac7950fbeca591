//! File-based storage implementation.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashSet;
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::storage::{Storage, StorageError, StorageInput, StorageLock, StorageOutput};

/// Lock files held by this process. OS advisory locks do not reliably
/// exclude a second handle opened by the same process.
static HELD_LOCKS: LazyLock<Mutex<AHashSet<PathBuf>>> =
    LazyLock::new(|| Mutex::new(AHashSet::new()));

/// Configuration for file storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStorageConfig {
    /// Buffer size for reads and writes.
    pub buffer_size: usize,
    /// Flush the buffer after each write call.
    pub sync_writes: bool,
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        FileStorageConfig {
            buffer_size: 64 * 1024,
            sync_writes: false,
        }
    }
}

/// A file-based storage implementation.
#[derive(Debug)]
pub struct FileStorage {
    /// The root directory for storage.
    directory: PathBuf,
    /// Storage configuration.
    config: FileStorageConfig,
    /// Whether the storage is closed.
    closed: AtomicBool,
}

impl FileStorage {
    /// Create a new file storage in the given directory.
    pub fn new<P: AsRef<Path>>(directory: P, config: FileStorageConfig) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();

        if !directory.exists() {
            std::fs::create_dir_all(&directory)
                .map_err(|e| TesseraError::storage(format!("Failed to create directory: {e}")))?;
        }

        if !directory.is_dir() {
            return Err(TesseraError::storage(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        Ok(FileStorage {
            directory,
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Open a storage with the default configuration.
    pub fn open<P: AsRef<Path>>(directory: P) -> Result<Self> {
        Self::new(directory, FileStorageConfig::default())
    }

    /// The root directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::StorageClosed.into())
        } else {
            Ok(())
        }
    }
}

fn map_io_error(name: &str, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::FileNotFound(name.to_string())
    } else {
        StorageError::IoError(format!("{name}: {e}"))
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.check_closed()?;

        let file = File::open(self.file_path(name)).map_err(|e| map_io_error(name, e))?;
        Ok(Box::new(FileInput::new(file, self.config.buffer_size)?))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_closed()?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.file_path(name))
            .map_err(|e| map_io_error(name, e))?;

        Ok(Box::new(FileOutput::new(
            file,
            self.config.buffer_size,
            self.config.sync_writes,
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.file_path(name).exists()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.check_closed()?;

        std::fs::remove_file(self.file_path(name)).map_err(|e| map_io_error(name, e))?;
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.check_closed()?;

        let mut files = Vec::new();
        let entries = std::fs::read_dir(&self.directory)
            .map_err(|e| TesseraError::storage(format!("Failed to read directory: {e}")))?;

        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    files.push(name.to_string());
                }
            }
        }

        files.sort();
        Ok(files)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.check_closed()?;

        let metadata =
            std::fs::metadata(self.file_path(name)).map_err(|e| map_io_error(name, e))?;
        Ok(metadata.len())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.check_closed()?;

        std::fs::rename(self.file_path(old_name), self.file_path(new_name))
            .map_err(|e| map_io_error(old_name, e))?;
        Ok(())
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        self.check_closed()?;

        for name in names {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(self.file_path(name))
                .map_err(|e| map_io_error(name, e))?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn sync_meta_data(&self) -> Result<()> {
        self.check_closed()?;

        #[cfg(unix)]
        {
            let dir = File::open(&self.directory)?;
            dir.sync_all()?;
        }
        Ok(())
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        self.check_closed()?;

        let path = self.file_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| map_io_error(name, e))?;
        let canonical = path.canonicalize()?;

        if !HELD_LOCKS.lock().insert(canonical.clone()) {
            return Err(StorageError::LockFailed(format!(
                "{} is held by this process",
                path.display()
            ))
            .into());
        }

        if let Err(e) = file.try_lock_exclusive() {
            HELD_LOCKS.lock().remove(&canonical);
            return Err(StorageError::LockFailed(format!("{}: {e}", path.display())).into());
        }

        Ok(Box::new(FileLock {
            name: name.to_string(),
            canonical,
            file: Some(file),
        }))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// A file input implementation.
#[derive(Debug)]
pub struct FileInput {
    reader: BufReader<File>,
    size: u64,
}

impl FileInput {
    fn new(file: File, buffer_size: usize) -> Result<Self> {
        let size = file
            .metadata()
            .map_err(|e| TesseraError::storage(format!("Failed to get file metadata: {e}")))?
            .len();

        Ok(FileInput {
            reader: BufReader::with_capacity(buffer_size, file),
            size,
        })
    }
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A file output implementation.
#[derive(Debug)]
pub struct FileOutput {
    writer: BufWriter<File>,
    sync_writes: bool,
    position: u64,
}

impl FileOutput {
    fn new(file: File, buffer_size: usize, sync_writes: bool) -> Self {
        FileOutput {
            writer: BufWriter::with_capacity(buffer_size, file),
            sync_writes,
            position: 0,
        }
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes_written = self.writer.write(buf)?;
        self.position += bytes_written as u64;

        if self.sync_writes {
            self.writer.flush()?;
        }

        Ok(bytes_written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| TesseraError::storage(format!("Failed to flush: {e}")))?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| TesseraError::storage(format!("Failed to sync: {e}")))?;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn close(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| TesseraError::storage(format!("Failed to flush: {e}")))?;
        Ok(())
    }
}

/// An exclusive OS-level lock on a file in the storage directory.
#[derive(Debug)]
struct FileLock {
    name: String,
    canonical: PathBuf,
    file: Option<File>,
}

impl StorageLock for FileLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            let unlocked = FileExt::unlock(&file);
            HELD_LOCKS.lock().remove(&self.canonical);
            unlocked.map_err(|e| TesseraError::storage(format!("Failed to release lock: {e}")))?;
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (TempDir, FileStorage) {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::open(temp_dir.path()).unwrap();
        (temp_dir, storage)
    }

    #[test]
    fn test_create_and_read_file() {
        let (_dir, storage) = create_test_storage();

        let mut output = storage.create_output("_0.seg").unwrap();
        output.write_all(b"Hello, World!").unwrap();
        assert_eq!(output.position(), 13);
        output.close().unwrap();

        let mut input = storage.open_input("_0.seg").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();
        assert_eq!(buffer, b"Hello, World!");
        assert_eq!(input.size().unwrap(), 13);
    }

    #[test]
    fn test_rename_sync_and_delete() {
        let (_dir, storage) = create_test_storage();

        crate::storage::write_file(&storage, "pending_segments_1", b"manifest").unwrap();
        storage.sync(&["pending_segments_1".to_string()]).unwrap();
        storage.rename_file("pending_segments_1", "segments_1").unwrap();
        storage.sync_meta_data().unwrap();

        assert!(!storage.file_exists("pending_segments_1"));
        assert!(storage.file_exists("segments_1"));
        assert_eq!(storage.file_size("segments_1").unwrap(), 8);
        assert_eq!(storage.list_files().unwrap(), vec!["segments_1".to_string()]);

        storage.delete_file("segments_1").unwrap();
        assert!(!storage.file_exists("segments_1"));
    }

    #[test]
    fn test_file_not_found() {
        let (_dir, storage) = create_test_storage();

        let err = storage.open_input("missing").unwrap_err();
        assert!(err.is_not_found());
        assert!(storage.delete_file("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_write_lock_is_exclusive() {
        let (dir, storage) = create_test_storage();
        let other = FileStorage::open(dir.path()).unwrap();

        let mut lock = storage.obtain_lock("write.lock").unwrap();
        assert!(lock.is_valid());
        assert_eq!(lock.name(), "write.lock");

        let err = other.obtain_lock("write.lock").unwrap_err();
        assert!(matches!(err, TesseraError::LockObtainFailed(_)));

        lock.release().unwrap();
        assert!(!lock.is_valid());
        let relocked = other.obtain_lock("write.lock").unwrap();
        drop(relocked);
        storage.obtain_lock("write.lock").unwrap();
    }

    #[test]
    fn test_storage_close() {
        let (_dir, storage) = create_test_storage();
        storage.close().unwrap();
        assert!(storage.create_output("x").is_err());
        assert!(!storage.file_exists("x"));
    }
}
