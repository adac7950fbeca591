//! Integration tests for point-in-time, near-real-time and parallel readers.

use std::sync::Arc;

use tessera::document::{Document, Field, Term};
use tessera::error::Result;
use tessera::index::{
    CompositeReader, DirectoryReader, IndexWriter, IndexWriterConfig, ParallelCompositeReader,
};
use tessera::merge::{NoMergePolicy, SerialMergeScheduler};
use tessera::search::{BooleanQuery, IndexSearcher, Occur, Query, TermQuery};
use tessera::storage::{MemoryStorage, Storage};

const WORDS: [&str; 5] = ["red", "green", "blue", "black", "white"];

fn config() -> IndexWriterConfig {
    IndexWriterConfig::default()
        .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()))
        .with_merge_policy(Arc::new(NoMergePolicy::new()))
}

fn doc(id: usize) -> Document {
    Document::new().with(Field::string("id", id.to_string(), true))
}

fn field_value(field: usize, i: usize) -> String {
    format!("{} {}", WORDS[(i + field) % WORDS.len()], WORDS[(i * field) % WORDS.len()])
}

/// Index `count` documents holding `fields`, flushing every `flush_every`.
fn build(fields: &[usize], count: usize, flush_every: usize) -> Result<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let writer = IndexWriter::new(Arc::clone(&storage), config())?;
    for i in 0..count {
        let mut document = Document::new();
        for &f in fields {
            document.add(Field::text(format!("f{f}"), field_value(f, i), true));
        }
        writer.add_document(&document)?;
        if (i + 1) % flush_every == 0 {
            writer.flush()?;
        }
    }
    writer.close()?;
    Ok(storage)
}

#[test]
fn test_parallel_reader_matches_single_index() -> Result<()> {
    const DOCS: usize = 23;
    let single = DirectoryReader::open(build(&[1, 2, 3, 4], DOCS, 5)?)?;
    let left = DirectoryReader::open(build(&[1, 2], DOCS, 5)?)?;
    let right = DirectoryReader::open(build(&[3, 4], DOCS, 5)?)?;
    let parallel = ParallelCompositeReader::new(&[&left, &right])?;

    assert_eq!(parallel.max_doc(), single.max_doc());
    assert_eq!(parallel.num_docs(), single.num_docs());
    assert_eq!(parallel.leaves().len(), single.leaves().len());

    let expected = IndexSearcher::new(&single);
    let actual = IndexSearcher::new(&parallel);
    for f in 1..=4 {
        for word in WORDS {
            let query = TermQuery::new(Term::new(format!("f{f}"), word));
            assert_eq!(actual.search(&query)?, expected.search(&query)?, "f{f}:{word}");
        }
    }
    let cross = BooleanQuery::new()
        .add(TermQuery::new(Term::new("f1", "red")), Occur::Must)
        .add(TermQuery::new(Term::new("f4", "blue")), Occur::Must);
    assert_eq!(actual.search(&cross)?, expected.search(&cross)?);

    for d in 0..single.max_doc() {
        let expected = single.document(d)?;
        let actual = parallel.document(d)?;
        for f in 1..=4 {
            let name = format!("f{f}");
            assert_eq!(actual.get_text(&name), expected.get_text(&name), "doc {d} {name}");
        }
    }
    Ok(())
}

#[test]
fn test_point_in_time_reader_ignores_later_commits() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let writer = IndexWriter::new(Arc::clone(&storage), config())?;
    for i in 0..5 {
        writer.add_document(&doc(i))?;
    }
    writer.commit()?;
    let reader = DirectoryReader::open(Arc::clone(&storage))?;
    assert!(reader.is_current()?);
    assert!(DirectoryReader::open_if_changed(&reader)?.is_none());

    writer.delete_documents(vec![Term::new("id", "0")])?;
    writer.add_document(&doc(5))?;
    writer.commit()?;
    assert!(!reader.is_current()?);
    assert_eq!(reader.num_docs(), 5);
    assert!(reader.is_live(0));

    let newer = DirectoryReader::open_if_changed(&reader)?.unwrap();
    assert_eq!(newer.num_docs(), 5);
    assert_eq!(newer.max_doc(), 6);
    assert!(!newer.is_live(0));
    assert!(newer.version() > reader.version());
    writer.close()?;
    Ok(())
}

#[test]
fn test_near_real_time_reopen_shares_segments() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let writer = IndexWriter::new(Arc::clone(&storage), config())?;
    for i in 0..10 {
        writer.add_document(&doc(i))?;
    }
    let first = DirectoryReader::open_from_writer(&writer, true)?;
    assert_eq!(first.num_docs(), 10);
    // Nothing was committed.
    assert!(DirectoryReader::open(Arc::clone(&storage)).is_err());

    for i in 10..20 {
        writer.add_document(&doc(i))?;
    }
    let second = DirectoryReader::open_if_changed(&first)?.unwrap();
    assert_eq!(second.num_docs(), 20);
    assert_eq!(second.leaves().len(), 2);
    assert!(Arc::ptr_eq(&first.cores()[0], &second.cores()[0]));

    writer.delete_documents(vec![Term::new("id", "3")])?;
    let third = DirectoryReader::open_if_changed(&second)?.unwrap();
    assert_eq!(third.num_docs(), 19);
    assert_eq!(second.num_docs(), 20);
    assert!(Arc::ptr_eq(&second.cores()[0], &third.cores()[0]));
    assert!(Arc::ptr_eq(&second.cores()[1], &third.cores()[1]));
    assert!(DirectoryReader::open_if_changed(&third)?.is_none());

    let hits = IndexSearcher::new(&third).count(&TermQuery::new(Term::new("id", "3")))?;
    assert_eq!(hits, 0);
    let query: &dyn Query = &TermQuery::new(Term::new("id", "13"));
    assert_eq!(IndexSearcher::new(&third).search(query)?, vec![13]);
    writer.close()?;
    Ok(())
}
