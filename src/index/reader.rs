//! Reader abstractions.
//!
//! A [`LeafReader`] exposes one atomic unit of documents (a segment, or a
//! field-wise combination of segments). A [`CompositeReader`] is an ordered
//! list of leaves; its document ids are the leaf ids shifted by the
//! preceding leaves' `max_doc`.

use std::fmt::Debug;
use std::sync::Arc;

use crate::codec::{Posting, TermVectors};
use crate::document::{DocId, StoredDocument, Term};
use crate::error::{Result, TesseraError};
use crate::index::field_infos::FieldInfos;

/// Read access to one atomic set of documents.
pub trait LeafReader: Send + Sync + Debug {
    /// Number of documents, deleted ones included.
    fn max_doc(&self) -> u32;

    /// Number of live documents.
    fn num_docs(&self) -> u32;

    /// Whether `doc` is live.
    fn is_live(&self, doc: DocId) -> bool;

    /// Field metadata.
    fn field_infos(&self) -> &FieldInfos;

    /// Stored fields of `doc`.
    fn document(&self, doc: DocId) -> Result<StoredDocument>;

    /// Term vectors of `doc`, if any field stored them.
    fn term_vectors(&self, doc: DocId) -> Result<Option<TermVectors>>;

    /// Postings of `term`, deleted documents included.
    fn postings(&self, term: &Term) -> Option<&[Posting]>;

    /// Terms of a field in order.
    fn terms(&self, field: &str) -> Vec<Vec<u8>>;

    /// Norm of `field` for `doc`.
    fn norm(&self, field: &str, doc: DocId) -> Option<i64>;

    /// Numeric doc value of `doc`, updates applied.
    fn numeric_doc_value(&self, field: &str, doc: DocId) -> Option<i64>;

    /// Binary (or sorted) doc value of `doc`, updates applied.
    fn binary_doc_value(&self, field: &str, doc: DocId) -> Option<Vec<u8>>;

    /// Number of documents containing `term`, deleted ones included.
    fn doc_freq(&self, term: &Term) -> u32 {
        self.postings(term).map_or(0, |p| p.len() as u32)
    }

    /// Whether any document was deleted.
    fn has_deletions(&self) -> bool {
        self.num_docs() < self.max_doc()
    }
}

/// A leaf positioned inside a composite reader.
#[derive(Debug, Clone)]
pub struct LeafReaderContext {
    /// Position among the leaves.
    pub ord: usize,
    /// Composite id of the leaf's first document.
    pub doc_base: u32,
    /// The leaf.
    pub reader: Arc<dyn LeafReader>,
}

/// An ordered list of leaves with composite document ids.
pub trait CompositeReader: Send + Sync + Debug {
    /// The leaves in order.
    fn leaves(&self) -> Vec<LeafReaderContext>;

    /// Total `max_doc`.
    fn max_doc(&self) -> u32 {
        self.leaves().iter().map(|l| l.reader.max_doc()).sum()
    }

    /// Total live documents.
    fn num_docs(&self) -> u32 {
        self.leaves().iter().map(|l| l.reader.num_docs()).sum()
    }

    /// Whether any leaf has deletions.
    fn has_deletions(&self) -> bool {
        self.leaves().iter().any(|l| l.reader.has_deletions())
    }

    /// Stored fields of a composite document.
    fn document(&self, doc: DocId) -> Result<StoredDocument> {
        let (leaf, local) = locate(&self.leaves(), doc)?;
        leaf.reader.document(local)
    }

    /// Term vectors of a composite document.
    fn term_vectors(&self, doc: DocId) -> Result<Option<TermVectors>> {
        let (leaf, local) = locate(&self.leaves(), doc)?;
        leaf.reader.term_vectors(local)
    }

    /// Whether a composite document is live.
    fn is_live(&self, doc: DocId) -> bool {
        locate(&self.leaves(), doc)
            .map(|(leaf, local)| leaf.reader.is_live(local))
            .unwrap_or(false)
    }

    /// Document frequency of `term` over all leaves.
    fn doc_freq(&self, term: &Term) -> u32 {
        self.leaves().iter().map(|l| l.reader.doc_freq(term)).sum()
    }

    /// Postings of `term` with composite doc ids, deleted documents
    /// included.
    fn postings(&self, term: &Term) -> Vec<Posting> {
        let mut out = Vec::new();
        for leaf in self.leaves() {
            if let Some(postings) = leaf.reader.postings(term) {
                out.extend(postings.iter().map(|p| Posting {
                    doc: p.doc + leaf.doc_base,
                    freq: p.freq,
                    positions: p.positions.clone(),
                }));
            }
        }
        out
    }

    /// Numeric doc value of a composite document.
    fn numeric_doc_value(&self, field: &str, doc: DocId) -> Option<i64> {
        let (leaf, local) = locate(&self.leaves(), doc).ok()?;
        leaf.reader.numeric_doc_value(field, local)
    }

    /// Binary doc value of a composite document.
    fn binary_doc_value(&self, field: &str, doc: DocId) -> Option<Vec<u8>> {
        let (leaf, local) = locate(&self.leaves(), doc).ok()?;
        leaf.reader.binary_doc_value(field, local)
    }
}

/// Find the leaf holding composite `doc`; returns it with the local id.
pub fn locate(leaves: &[LeafReaderContext], doc: DocId) -> Result<(LeafReaderContext, DocId)> {
    let idx = leaves.partition_point(|l| l.doc_base <= doc);
    if idx > 0 {
        let leaf = &leaves[idx - 1];
        let local = doc - leaf.doc_base;
        if local < leaf.reader.max_doc() {
            return Ok((leaf.clone(), local));
        }
    }
    Err(TesseraError::illegal_argument(format!(
        "doc {doc} is out of bounds"
    )))
}

/// Build leaf contexts with running doc bases.
pub fn build_leaves<I>(readers: I) -> Vec<LeafReaderContext>
where
    I: IntoIterator<Item = Arc<dyn LeafReader>>,
{
    let mut doc_base = 0;
    readers
        .into_iter()
        .enumerate()
        .map(|(ord, reader)| {
            let ctx = LeafReaderContext {
                ord,
                doc_base,
                reader,
            };
            doc_base += ctx.reader.max_doc();
            ctx
        })
        .collect()
}
