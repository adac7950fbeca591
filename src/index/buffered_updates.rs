//! Buffered deletes and doc-values updates.
//!
//! [`BufferedUpdates`] collects deletes and updates for one arena (with a
//! `doc_id_upto` limit per entry) or for the global buffer of the delete
//! queue (limit [`MAX_DOC_UPTO`]). On flush the global buffer is frozen into
//! an immutable [`FrozenBufferedUpdates`] packet that the writer applies to
//! every published segment.

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;

use crate::document::{DocId, Term};
use crate::index::doc_values::DocValuesUpdate;
use crate::search::Query;

/// Limit that covers every document.
pub const MAX_DOC_UPTO: DocId = DocId::MAX;

/// A deleted term: map entry plus two heap vectors.
pub const BYTES_PER_DEL_TERM: usize = 6 * mem::size_of::<usize>();

/// A deleted document id.
pub const BYTES_PER_DEL_DOCID: usize = 2 * mem::size_of::<DocId>();

/// A deleted query; the query itself is undercounted.
pub const BYTES_PER_DEL_QUERY: usize = 4 * mem::size_of::<usize>() + 28;

/// Deletes and updates buffered for one arena or for the global buffer.
#[derive(Debug, Default)]
pub struct BufferedUpdates {
    /// Deleted terms with the exclusive doc limit they apply below.
    pub delete_terms: AHashMap<Term, DocId>,
    /// Deleted queries with their doc limits, in arrival order.
    pub delete_queries: Vec<(Arc<dyn Query>, DocId)>,
    /// Arena-local documents to delete (failed documents).
    pub delete_doc_ids: Vec<DocId>,
    /// Doc-values updates with their doc limits, in arrival order.
    pub doc_values_updates: Vec<(DocValuesUpdate, DocId)>,
    num_term_deletes: usize,
    bytes_used: usize,
}

impl BufferedUpdates {
    /// Empty updates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete documents with `term` whose id is below `doc_id_upto`. A
    /// smaller limit never replaces a larger one: two threads replacing the
    /// same document must not both survive.
    pub fn add_term(&mut self, term: Term, doc_id_upto: DocId) {
        if let Some(current) = self.delete_terms.get(&term) {
            if doc_id_upto < *current {
                return;
            }
        }
        let cost = BYTES_PER_DEL_TERM + term.ram_bytes();
        // Repeated terms are counted again so the delete-term flush
        // trigger sees every operation.
        self.num_term_deletes += 1;
        if self.delete_terms.insert(term, doc_id_upto).is_none() {
            self.bytes_used += cost;
        }
    }

    /// Delete documents matching `query` below `doc_id_upto`.
    pub fn add_query(&mut self, query: Arc<dyn Query>, doc_id_upto: DocId) {
        self.bytes_used += BYTES_PER_DEL_QUERY;
        self.delete_queries.push((query, doc_id_upto));
    }

    /// Delete an arena-local document.
    pub fn add_doc_id(&mut self, doc: DocId) {
        self.delete_doc_ids.push(doc);
        self.bytes_used += BYTES_PER_DEL_DOCID;
    }

    /// Update doc values of documents below `doc_id_upto`.
    pub fn add_doc_values_update(&mut self, update: DocValuesUpdate, doc_id_upto: DocId) {
        self.bytes_used += update.ram_bytes();
        self.doc_values_updates.push((update, doc_id_upto));
    }

    /// Number of term deletes, repeats included.
    pub fn num_term_deletes(&self) -> usize {
        self.num_term_deletes
    }

    /// Approximate heap usage.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Whether anything is buffered.
    pub fn any(&self) -> bool {
        !self.delete_terms.is_empty()
            || !self.delete_queries.is_empty()
            || !self.delete_doc_ids.is_empty()
            || !self.doc_values_updates.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.delete_terms.clear();
        self.delete_queries.clear();
        self.delete_doc_ids.clear();
        self.doc_values_updates.clear();
        self.num_term_deletes = 0;
        self.bytes_used = 0;
    }
}

/// An immutable packet of global deletes and updates.
#[derive(Debug, Clone)]
pub struct FrozenBufferedUpdates {
    /// Deleted terms, sorted.
    pub terms: Vec<Term>,
    /// Deleted queries.
    pub queries: Vec<Arc<dyn Query>>,
    /// Doc-values updates in arrival order.
    pub doc_values_updates: Vec<DocValuesUpdate>,
    /// Number of term deletes the packet absorbed.
    pub num_term_deletes: usize,
    /// Approximate heap usage.
    pub bytes_used: usize,
    del_gen: Option<u64>,
}

impl FrozenBufferedUpdates {
    /// Freeze a global buffer.
    pub fn new(updates: &BufferedUpdates) -> Self {
        let mut terms: Vec<Term> = updates.delete_terms.keys().cloned().collect();
        terms.sort();
        FrozenBufferedUpdates {
            terms,
            queries: updates
                .delete_queries
                .iter()
                .map(|(q, _)| Arc::clone(q))
                .collect(),
            doc_values_updates: updates
                .doc_values_updates
                .iter()
                .map(|(u, _)| u.clone())
                .collect(),
            num_term_deletes: updates.num_term_deletes,
            bytes_used: updates.bytes_used,
            del_gen: None,
        }
    }

    /// Generation assigned when the packet was pushed.
    pub fn del_gen(&self) -> Option<u64> {
        self.del_gen
    }

    /// Whether the packet holds anything.
    pub fn any(&self) -> bool {
        !self.terms.is_empty() || !self.queries.is_empty() || !self.doc_values_updates.is_empty()
    }
}

impl fmt::Display for FrozenBufferedUpdates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gen={:?} {} deleted terms (unique={}) {} deleted queries {} doc values updates bytes={}",
            self.del_gen,
            self.num_term_deletes,
            self.terms.len(),
            self.queries.len(),
            self.doc_values_updates.len(),
            self.bytes_used
        )
    }
}

/// Assigns increasing generations to published packets and segments.
/// Generations start at 1 so that a segment that never saw a packet (gen
/// 0) precedes all of them.
#[derive(Debug)]
pub struct BufferedUpdatesStream {
    next_gen: AtomicU64,
}

impl Default for BufferedUpdatesStream {
    fn default() -> Self {
        BufferedUpdatesStream {
            next_gen: AtomicU64::new(1),
        }
    }
}

impl BufferedUpdatesStream {
    /// A new stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next generation.
    pub fn next_gen(&self) -> u64 {
        self.next_gen.fetch_add(1, Ordering::AcqRel)
    }

    /// Assign the packet its generation.
    pub fn push(&self, mut packet: FrozenBufferedUpdates) -> FrozenBufferedUpdates {
        packet.del_gen = Some(self.next_gen());
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::doc_values::DocValuesValue;
    use crate::search::TermQuery;

    #[test]
    fn test_term_limit_only_grows() {
        let mut updates = BufferedUpdates::new();
        let term = Term::new("id", "1");
        updates.add_term(term.clone(), 5);
        updates.add_term(term.clone(), 3);
        assert_eq!(updates.delete_terms[&term], 5);
        updates.add_term(term.clone(), 9);
        assert_eq!(updates.delete_terms[&term], 9);
        assert_eq!(updates.num_term_deletes(), 2);
        assert_eq!(updates.delete_terms.len(), 1);
    }

    #[test]
    fn test_freeze_sorts_terms_and_clear() {
        let mut updates = BufferedUpdates::new();
        updates.add_term(Term::new("id", "b"), MAX_DOC_UPTO);
        updates.add_term(Term::new("id", "a"), MAX_DOC_UPTO);
        updates.add_query(Arc::new(TermQuery::new(Term::new("f", "x"))), MAX_DOC_UPTO);
        updates.add_doc_values_update(
            DocValuesUpdate {
                term: Term::new("id", "a"),
                field: "price".into(),
                value: DocValuesValue::Numeric(Some(1)),
            },
            MAX_DOC_UPTO,
        );
        assert!(updates.bytes_used() > 0);

        let frozen = FrozenBufferedUpdates::new(&updates);
        assert_eq!(frozen.terms[0], Term::new("id", "a"));
        assert_eq!(frozen.queries.len(), 1);
        assert!(frozen.any());
        assert!(frozen.del_gen().is_none());

        updates.clear();
        assert!(!updates.any());
        assert_eq!(updates.bytes_used(), 0);
    }

    #[test]
    fn test_stream_generations_increase() {
        let stream = BufferedUpdatesStream::new();
        let packet = FrozenBufferedUpdates::new(&BufferedUpdates::new());
        let first = stream.push(packet.clone());
        let second = stream.push(packet);
        assert_eq!(first.del_gen(), Some(1));
        assert_eq!(second.del_gen(), Some(2));
        assert_eq!(stream.next_gen(), 3);
    }
}
