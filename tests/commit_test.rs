//! Integration tests for commits, rollback and crash safety.

use std::sync::Arc;

use tempfile::TempDir;
use tessera::document::{Document, Field, Term};
use tessera::error::{Result, TesseraError};
use tessera::index::{CompositeReader, DirectoryReader, IndexWriter, IndexWriterConfig, OpenMode};
use tessera::merge::{NoMergePolicy, SerialMergeScheduler};
use tessera::search::{IndexSearcher, TermQuery};
use tessera::storage::{FaultPoint, FaultyStorage, FileStorage, MemoryStorage, Storage};

fn config() -> IndexWriterConfig {
    IndexWriterConfig::default()
        .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()))
        .with_merge_policy(Arc::new(NoMergePolicy::new()))
}

fn doc(id: usize, body: &str) -> Document {
    Document::new()
        .with(Field::string("id", id.to_string(), true))
        .with(Field::text("body", body, true))
}

#[test]
fn test_commit_on_file_storage() -> Result<()> {
    let dir = TempDir::new()?;
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(dir.path())?);
    let writer = IndexWriter::new(Arc::clone(&storage), config())?;
    for i in 0..20 {
        writer.add_document(&doc(i, "persisted on disk"))?;
    }
    writer.commit()?;
    writer.close()?;

    // A fresh storage over the same directory sees the commit.
    let reopened: Arc<dyn Storage> = Arc::new(FileStorage::open(dir.path())?);
    let reader = DirectoryReader::open(Arc::clone(&reopened))?;
    assert_eq!(reader.num_docs(), 20);
    let hits = IndexSearcher::new(&reader).count(&TermQuery::new(Term::new("body", "disk")))?;
    assert_eq!(hits, 20);

    let writer = IndexWriter::new(reopened, config().with_open_mode(OpenMode::Append))?;
    assert_eq!(writer.max_doc(), 20);
    writer.rollback()?;
    Ok(())
}

#[test]
fn test_second_writer_gets_lock_error() -> Result<()> {
    let dir = TempDir::new()?;
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(dir.path())?);
    let writer = IndexWriter::new(Arc::clone(&storage), config())?;

    let err = IndexWriter::new(Arc::clone(&storage), config()).unwrap_err();
    assert!(matches!(err, TesseraError::LockObtainFailed(_)));

    writer.close()?;
    let again = IndexWriter::new(storage, config())?;
    again.close()?;
    Ok(())
}

#[test]
fn test_config_reuse_is_rejected() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let config = config();
    let writer = IndexWriter::new(Arc::clone(&storage), config.clone())?;
    writer.close()?;

    let err = IndexWriter::new(storage, config).unwrap_err();
    assert!(matches!(err, TesseraError::IllegalState(_)));
    Ok(())
}

#[test]
fn test_two_phase_commit() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let writer = IndexWriter::new(Arc::clone(&storage), config())?;
    writer.add_document(&doc(1, "first"))?;
    writer.commit()?;

    writer.add_document(&doc(2, "second"))?;
    writer.prepare_commit()?;
    assert!(matches!(
        writer.prepare_commit().unwrap_err(),
        TesseraError::IllegalState(_)
    ));
    // Prepared but not committed: readers still see the old commit.
    assert_eq!(DirectoryReader::open(Arc::clone(&storage))?.num_docs(), 1);
    assert!(
        storage
            .list_files()?
            .iter()
            .any(|f| f.starts_with("pending_segments"))
    );

    writer.commit()?;
    assert_eq!(DirectoryReader::open(Arc::clone(&storage))?.num_docs(), 2);
    assert!(
        !storage
            .list_files()?
            .iter()
            .any(|f| f.starts_with("pending_segments"))
    );
    writer.close()?;
    Ok(())
}

#[test]
fn test_rollback_after_prepare_discards_pending_manifest() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let writer = IndexWriter::new(Arc::clone(&storage), config())?;
    writer.add_document(&doc(1, "kept"))?;
    writer.commit()?;
    writer.add_document(&doc(2, "dropped"))?;
    writer.prepare_commit()?;
    writer.rollback()?;

    let files = storage.list_files()?;
    assert!(!files.iter().any(|f| f.starts_with("pending_segments")));
    let reader = DirectoryReader::open(storage)?;
    assert_eq!(reader.num_docs(), 1);
    Ok(())
}

#[test]
fn test_crash_loses_only_uncommitted_documents() -> Result<()> {
    let memory: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let faulty = Arc::new(FaultyStorage::new(Arc::clone(&memory), 1));
    let storage: Arc<dyn Storage> = faulty.clone();

    let writer = IndexWriter::new(Arc::clone(&storage), config())?;
    for i in 0..10 {
        writer.add_document(&doc(i, "committed"))?;
    }
    writer.commit()?;
    assert!(faulty.unsynced_files().is_empty());

    for i in 10..20 {
        writer.add_document(&doc(i, "flushed but never committed"))?;
    }
    writer.flush()?;
    assert!(!faulty.unsynced_files().is_empty());

    faulty.crash()?;
    let reader = DirectoryReader::open(Arc::clone(&memory))?;
    assert_eq!(reader.num_docs(), 10);
    for d in 0..reader.max_doc() {
        let stored = reader.document(d)?;
        assert!(stored.get_text("id").is_some());
    }
    writer.rollback()?;
    Ok(())
}

#[test]
fn test_commits_are_atomic_under_random_failures() -> Result<()> {
    const BATCH: usize = 10;
    let memory: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let faulty = Arc::new(FaultyStorage::new(Arc::clone(&memory), 42));
    let storage: Arc<dyn Storage> = faulty.clone();

    let mut committed = 0;
    let mut next_id = 0;
    for round in 0..30 {
        faulty.set_random_failure_rate(
            0.05,
            &[
                FaultPoint::CreateOutput,
                FaultPoint::Write,
                FaultPoint::Sync,
                FaultPoint::Rename,
            ],
        );
        let mut config = config();
        config.commit_on_close = false;
        if let Ok(writer) = IndexWriter::new(Arc::clone(&storage), config) {
            let mut ok = true;
            for _ in 0..BATCH {
                ok &= writer.add_document(&doc(next_id, "batch")).is_ok();
                next_id += 1;
            }
            if ok && writer.commit().is_ok() {
                committed += BATCH;
            }
            let _ = writer.rollback();
        }
        faulty.clear_faults();

        if committed > 0 {
            let reader = DirectoryReader::open(Arc::clone(&storage))?;
            let visible = reader.num_docs() as usize;
            assert_eq!(visible % BATCH, 0, "partial commit visible in round {round}");
            assert!(visible >= committed);
        }
    }
    assert!(faulty.injected_failures() > 0);
    Ok(())
}

#[test]
fn test_tragic_failure_closes_writer() -> Result<()> {
    let memory: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let faulty = Arc::new(FaultyStorage::new(Arc::clone(&memory), 3));
    let storage: Arc<dyn Storage> = faulty.clone();
    let writer = IndexWriter::new(Arc::clone(&storage), config())?;
    writer.add_document(&doc(1, "durable"))?;
    writer.commit()?;

    writer.add_document(&doc(2, "lost"))?;
    faulty.fail_after(FaultPoint::Rename, 1);
    assert!(writer.commit().is_err());
    assert!(writer.is_closed());
    assert!(writer.tragic_exception().is_some());
    assert!(matches!(
        writer.commit().unwrap_err(),
        TesseraError::AlreadyClosed(_)
    ));

    let reader = DirectoryReader::open(Arc::clone(&storage))?;
    assert_eq!(reader.num_docs(), 1);
    // The lock was released by the rollback.
    let writer = IndexWriter::new(storage, config())?;
    assert_eq!(writer.max_doc(), 1);
    writer.close()?;
    Ok(())
}
