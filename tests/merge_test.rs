//! Integration tests for merge policies and schedulers driven by the writer.

use std::sync::Arc;
use std::thread;

use tessera::document::{Document, Field, Term};
use tessera::error::Result;
use tessera::index::{CompositeReader, DirectoryReader, IndexWriter, IndexWriterConfig};
use tessera::merge::{
    ConcurrentMergeScheduler, LogMergePolicy, LogMergePolicyConfig, NoMergePolicy,
    NoMergeScheduler, SerialMergeScheduler, TieredMergePolicy,
};
use tessera::search::{IndexSearcher, MatchAllDocsQuery, TermQuery};
use tessera::storage::{MemoryStorage, Storage};

fn doc(id: usize) -> Document {
    Document::new()
        .with(Field::string("id", id.to_string(), true))
        .with(Field::text("body", format!("shared token{id}"), true).with_term_vectors(true, true))
}

fn live_ids(reader: &DirectoryReader) -> Result<Vec<usize>> {
    let mut ids = Vec::new();
    for d in 0..reader.max_doc() {
        if reader.is_live(d) {
            let stored = reader.document(d)?;
            if let Some(id) = stored.get_text("id") {
                ids.push(id.parse().unwrap());
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

#[test]
fn test_force_merge_preserves_stored_fields_and_vectors() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let config = IndexWriterConfig::default()
        .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()))
        .with_merge_policy(Arc::new(LogMergePolicy::default()))
        .with_max_buffered_docs(Some(7));
    let writer = IndexWriter::new(Arc::clone(&storage), config)?;
    for i in 0..40 {
        writer.add_document(&doc(i))?;
    }
    writer.flush()?;
    assert!(writer.segment_count() > 1);

    writer.force_merge(1)?;
    writer.commit()?;
    assert_eq!(writer.segment_count(), 1);

    let reader = DirectoryReader::open(Arc::clone(&storage))?;
    assert_eq!(reader.leaves().len(), 1);
    assert_eq!(live_ids(&reader)?, (0..40).collect::<Vec<_>>());
    for d in 0..reader.max_doc() {
        let stored = reader.document(d)?;
        let id = stored.get_text("id").unwrap().to_string();
        let vectors = reader.term_vectors(d)?.unwrap();
        let body = &vectors["body"];
        assert!(body.iter().any(|e| e.term == format!("token{id}").into_bytes()));
        assert!(body.iter().all(|e| !e.positions.is_empty()));
    }
    let hits = IndexSearcher::new(&reader).count(&TermQuery::new(Term::new("body", "shared")))?;
    assert_eq!(hits, 40);
    writer.close()?;
    Ok(())
}

#[test]
fn test_force_merge_deletes_reclaims_deleted_documents() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let config = IndexWriterConfig::default()
        .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()))
        .with_merge_policy(Arc::new(TieredMergePolicy::default()))
        .with_max_buffered_docs(Some(10));
    let writer = IndexWriter::new(Arc::clone(&storage), config)?;
    for i in 0..100 {
        writer.add_document(&doc(i))?;
    }
    writer.commit()?;
    let even: Vec<Term> = (0..100)
        .step_by(2)
        .map(|i| Term::new("id", &i.to_string()))
        .collect();
    writer.delete_documents(even)?;
    writer.commit()?;
    assert_eq!(writer.num_docs(), 50);

    writer.force_merge_deletes()?;
    writer.commit()?;
    assert_eq!(writer.max_doc(), 50);
    assert_eq!(writer.num_docs(), 50);

    let reader = DirectoryReader::open(storage)?;
    assert!(!reader.has_deletions());
    assert_eq!(live_ids(&reader)?, (1..100).step_by(2).collect::<Vec<_>>());
    writer.close()?;
    Ok(())
}

#[test]
fn test_concurrent_scheduler_merges_in_background() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let config = IndexWriterConfig::default()
        .with_merge_scheduler(Arc::new(ConcurrentMergeScheduler::with_limits(4, 2)?))
        .with_merge_policy(Arc::new(LogMergePolicy::default()))
        .with_max_buffered_docs(Some(5));
    let writer = IndexWriter::new(Arc::clone(&storage), config)?;
    for i in 0..300 {
        writer.add_document(&doc(i))?;
    }
    writer.commit()?;
    writer.wait_for_merges()?;
    assert!(!writer.has_pending_merges());
    // 60 flushed segments collapse under the default merge factor.
    assert!(writer.segment_count() < 60);
    writer.commit()?;

    let reader = DirectoryReader::open(storage)?;
    assert_eq!(reader.num_docs(), 300);
    assert_eq!(live_ids(&reader)?, (0..300).collect::<Vec<_>>());
    writer.close()?;
    Ok(())
}

#[test]
fn test_deletes_during_force_merge_are_kept() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let config = IndexWriterConfig::default()
        .with_merge_scheduler(Arc::new(ConcurrentMergeScheduler::with_limits(2, 1)?))
        .with_merge_policy(Arc::new(LogMergePolicy::default()))
        .with_max_buffered_docs(Some(20));
    let writer = IndexWriter::new(Arc::clone(&storage), config)?;
    for i in 0..400 {
        writer.add_document(&doc(i))?;
    }
    writer.flush()?;

    thread::scope(|scope| {
        let merger = scope.spawn(|| writer.force_merge(1));
        for i in (0..400).filter(|i| i % 4 == 0) {
            writer
                .delete_documents(vec![Term::new("id", &i.to_string())])
                .unwrap();
        }
        merger.join().unwrap()
    })?;
    writer.commit()?;
    assert_eq!(writer.num_docs(), 300);

    let reader = DirectoryReader::open(storage)?;
    assert_eq!(reader.num_docs(), 300);
    assert_eq!(IndexSearcher::new(&reader).count(&MatchAllDocsQuery::new())?, 300);
    assert_eq!(
        live_ids(&reader)?,
        (0..400).filter(|i| i % 4 != 0).collect::<Vec<_>>()
    );
    writer.close()?;
    Ok(())
}

#[test]
fn test_no_merge_policy_keeps_every_segment() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let config = IndexWriterConfig::default()
        .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()))
        .with_merge_policy(Arc::new(NoMergePolicy::new()))
        .with_max_buffered_docs(Some(5));
    let writer = IndexWriter::new(storage, config)?;
    for i in 0..50 {
        writer.add_document(&doc(i))?;
    }
    writer.commit()?;
    writer.maybe_merge()?;
    assert_eq!(writer.segment_count(), 10);
    writer.close()?;
    Ok(())
}

#[test]
fn test_stalled_indexing_threads_resume_after_merges() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let policy = LogMergePolicy::new(LogMergePolicyConfig {
        merge_factor: 2,
        ..LogMergePolicyConfig::default()
    });
    // One merge thread and one allowed merge: every flush that finds a
    // backlog stalls its caller until that merge finishes.
    let config = IndexWriterConfig::default()
        .with_merge_scheduler(Arc::new(ConcurrentMergeScheduler::with_limits(1, 1)?))
        .with_merge_policy(Arc::new(policy))
        .with_max_buffered_docs(Some(2));
    let writer = IndexWriter::new(Arc::clone(&storage), config)?;

    thread::scope(|scope| {
        let workers: Vec<_> = (0..4)
            .map(|t| {
                let writer = &writer;
                scope.spawn(move || -> Result<()> {
                    for i in (t * 50)..(t * 50 + 50) {
                        writer.add_document(&doc(i))?;
                    }
                    Ok(())
                })
            })
            .collect();
        workers
            .into_iter()
            .try_for_each(|worker| worker.join().unwrap())
    })?;
    writer.commit()?;
    writer.wait_for_merges()?;
    assert!(!writer.has_pending_merges());
    writer.commit()?;

    let reader = DirectoryReader::open(storage)?;
    assert_eq!(live_ids(&reader)?, (0..200).collect::<Vec<_>>());
    writer.close()?;
    Ok(())
}

#[test]
fn test_no_merge_scheduler_never_runs_merges() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let config = IndexWriterConfig::default()
        .with_merge_scheduler(Arc::new(NoMergeScheduler::new()))
        .with_merge_policy(Arc::new(LogMergePolicy::default()))
        .with_max_buffered_docs(Some(5));
    let writer = IndexWriter::new(Arc::clone(&storage), config)?;
    for i in 0..60 {
        writer.add_document(&doc(i))?;
    }
    writer.commit()?;
    writer.maybe_merge()?;
    writer.wait_for_merges()?;
    // The policy found a merge of ten segments but nothing ran it.
    assert!(writer.has_pending_merges());
    assert_eq!(writer.segment_count(), 12);

    let reader = DirectoryReader::open(storage)?;
    assert_eq!(reader.leaves().len(), 12);
    assert_eq!(live_ids(&reader)?, (0..60).collect::<Vec<_>>());
    writer.close()?;
    Ok(())
}
