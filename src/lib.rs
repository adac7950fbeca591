//! # Tessera
//!
//! A segment-based inverted index engine.
//!
//! ## Features
//!
//! - Concurrent indexing into per-thread arenas with RAM and document-count
//!   flush triggers and stalling under memory pressure
//! - Totally ordered deletes and doc-values updates, applied consistently
//!   across concurrently flushing segments
//! - Tiered and log-structured merge policies with serial or concurrent
//!   merge scheduling
//! - Two-phase commits of generation-numbered manifests, rollback, and
//!   snapshot-aware deletion policies
//! - Point-in-time and near-real-time readers with shared sub-readers
//!
//! ```
//! use std::sync::Arc;
//!
//! use tessera::document::{Document, Field, Term};
//! use tessera::index::{DirectoryReader, IndexWriter, IndexWriterConfig};
//! use tessera::search::{IndexSearcher, TermQuery};
//! use tessera::storage::{MemoryStorage, Storage};
//!
//! let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
//! let writer = IndexWriter::new(Arc::clone(&storage), IndexWriterConfig::default()).unwrap();
//! writer
//!     .add_document(&Document::new().with(Field::text("body", "hello segments", true)))
//!     .unwrap();
//! writer.commit().unwrap();
//!
//! let reader = DirectoryReader::open(storage).unwrap();
//! let hits = IndexSearcher::new(&reader)
//!     .search(&TermQuery::new(Term::new("body", "segments")))
//!     .unwrap();
//! assert_eq!(hits, vec![0]);
//! ```

pub mod analysis;
pub mod codec;
pub mod document;
pub mod error;
pub mod index;
pub mod merge;
pub mod search;
pub mod storage;
pub mod util;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
