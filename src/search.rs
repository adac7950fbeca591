//! Matching documents.
//!
//! Queries here select documents without scoring them. They drive
//! delete-by-query inside the writer and let tests and applications
//! inspect what an index holds through an [`IndexSearcher`].

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

use crate::document::{DocId, Term};
use crate::error::Result;
use crate::index::reader::{CompositeReader, LeafReader};

/// Selects documents of a leaf.
pub trait Query: Send + Sync + Debug {
    /// Matching documents in increasing order, deleted ones included.
    fn doc_ids(&self, reader: &dyn LeafReader) -> Result<Vec<DocId>>;

    /// A human-readable description.
    fn description(&self) -> String;
}

/// Matches documents containing a term.
#[derive(Debug, Clone)]
pub struct TermQuery {
    term: Term,
}

impl TermQuery {
    /// Create a term query.
    pub fn new(term: Term) -> Self {
        TermQuery { term }
    }

    /// The term.
    pub fn term(&self) -> &Term {
        &self.term
    }
}

impl Query for TermQuery {
    fn doc_ids(&self, reader: &dyn LeafReader) -> Result<Vec<DocId>> {
        Ok(reader
            .postings(&self.term)
            .map(|postings| postings.iter().map(|p| p.doc).collect())
            .unwrap_or_default())
    }

    fn description(&self) -> String {
        self.term.to_string()
    }
}

/// Matches every document.
#[derive(Debug, Clone, Default)]
pub struct MatchAllDocsQuery;

impl MatchAllDocsQuery {
    /// Create the query.
    pub fn new() -> Self {
        MatchAllDocsQuery
    }
}

impl Query for MatchAllDocsQuery {
    fn doc_ids(&self, reader: &dyn LeafReader) -> Result<Vec<DocId>> {
        Ok((0..reader.max_doc()).collect())
    }

    fn description(&self) -> String {
        "*:*".to_string()
    }
}

/// Occurrence requirements for boolean clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occur {
    /// The clause must match.
    Must,
    /// The clause should match.
    Should,
    /// The clause must not match.
    MustNot,
}

/// A clause in a boolean query.
#[derive(Debug, Clone)]
pub struct BooleanClause {
    /// The query for this clause.
    pub query: Arc<dyn Query>,
    /// The occurrence requirement.
    pub occur: Occur,
}

/// Combines queries with boolean logic. A query with only `MustNot`
/// clauses matches nothing.
#[derive(Debug, Clone, Default)]
pub struct BooleanQuery {
    clauses: Vec<BooleanClause>,
    minimum_should_match: usize,
}

impl BooleanQuery {
    /// An empty boolean query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a clause.
    pub fn add<Q: Query + 'static>(mut self, query: Q, occur: Occur) -> Self {
        self.clauses.push(BooleanClause {
            query: Arc::new(query),
            occur,
        });
        self
    }

    /// Require at least `n` `Should` clauses to match.
    pub fn with_minimum_should_match(mut self, n: usize) -> Self {
        self.minimum_should_match = n;
        self
    }

    /// The clauses.
    pub fn clauses(&self) -> &[BooleanClause] {
        &self.clauses
    }
}

impl Query for BooleanQuery {
    fn doc_ids(&self, reader: &dyn LeafReader) -> Result<Vec<DocId>> {
        let mut must: Option<BTreeSet<DocId>> = None;
        let mut should_counts: std::collections::BTreeMap<DocId, usize> = Default::default();
        let mut must_not = BTreeSet::new();
        let mut num_should = 0;

        for clause in &self.clauses {
            let docs = clause.query.doc_ids(reader)?;
            match clause.occur {
                Occur::Must => {
                    let docs: BTreeSet<DocId> = docs.into_iter().collect();
                    must = Some(match must {
                        None => docs,
                        Some(acc) => acc.intersection(&docs).copied().collect(),
                    });
                }
                Occur::Should => {
                    num_should += 1;
                    for doc in docs {
                        *should_counts.entry(doc).or_default() += 1;
                    }
                }
                Occur::MustNot => must_not.extend(docs),
            }
        }

        let min_should = if must.is_none() && num_should > 0 {
            self.minimum_should_match.max(1)
        } else {
            self.minimum_should_match
        };
        let candidates: BTreeSet<DocId> = match must {
            Some(docs) => docs,
            None => should_counts.keys().copied().collect(),
        };
        Ok(candidates
            .into_iter()
            .filter(|doc| {
                min_should == 0 || should_counts.get(doc).copied().unwrap_or(0) >= min_should
            })
            .filter(|doc| !must_not.contains(doc))
            .collect())
    }

    fn description(&self) -> String {
        let parts: Vec<String> = self
            .clauses
            .iter()
            .map(|c| match c.occur {
                Occur::Must => format!("+{}", c.query.description()),
                Occur::Should => c.query.description(),
                Occur::MustNot => format!("-{}", c.query.description()),
            })
            .collect();
        format!("({})", parts.join(" "))
    }
}

/// Runs queries over a composite reader and returns live composite ids.
#[derive(Debug)]
pub struct IndexSearcher<'a> {
    reader: &'a dyn CompositeReader,
}

impl<'a> IndexSearcher<'a> {
    /// Search `reader`.
    pub fn new(reader: &'a dyn CompositeReader) -> Self {
        IndexSearcher { reader }
    }

    /// Live documents matching `query`, in composite id order.
    pub fn search(&self, query: &dyn Query) -> Result<Vec<DocId>> {
        let mut hits = Vec::new();
        for leaf in self.reader.leaves() {
            for doc in query.doc_ids(leaf.reader.as_ref())? {
                if leaf.reader.is_live(doc) {
                    hits.push(leaf.doc_base + doc);
                }
            }
        }
        Ok(hits)
    }

    /// Number of live documents matching `query`.
    pub fn count(&self, query: &dyn Query) -> Result<usize> {
        Ok(self.search(query)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FieldPostings, Posting, SegmentData};
    use crate::document::StoredDocument;
    use crate::index::segment_reader::SegmentReader;

    fn reader() -> SegmentReader {
        let mut postings = FieldPostings::default();
        let posting = |doc| Posting {
            doc,
            freq: 1,
            positions: Vec::new(),
        };
        postings
            .terms
            .insert(b"a".to_vec(), vec![posting(0), posting(1), posting(2)]);
        postings.terms.insert(b"b".to_vec(), vec![posting(1), posting(3)]);
        let mut data = SegmentData {
            max_doc: 4,
            stored: vec![StoredDocument::new(); 4],
            term_vectors: vec![None; 4],
            ..Default::default()
        };
        data.postings.insert("f".into(), postings);
        SegmentReader::from_data("_0", data)
    }

    fn term(text: &str) -> TermQuery {
        TermQuery::new(Term::new("f", text))
    }

    #[test]
    fn test_boolean_logic() {
        let reader = reader();
        let and = BooleanQuery::new()
            .add(term("a"), Occur::Must)
            .add(term("b"), Occur::Must);
        assert_eq!(and.doc_ids(&reader).unwrap(), vec![1]);

        let or = BooleanQuery::new()
            .add(term("a"), Occur::Should)
            .add(term("b"), Occur::Should);
        assert_eq!(or.doc_ids(&reader).unwrap(), vec![0, 1, 2, 3]);

        let not = BooleanQuery::new()
            .add(MatchAllDocsQuery, Occur::Must)
            .add(term("a"), Occur::MustNot);
        assert_eq!(not.doc_ids(&reader).unwrap(), vec![3]);

        let only_not = BooleanQuery::new().add(term("a"), Occur::MustNot);
        assert!(only_not.doc_ids(&reader).unwrap().is_empty());
    }

    #[test]
    fn test_minimum_should_match() {
        let reader = reader();
        let query = BooleanQuery::new()
            .add(term("a"), Occur::Should)
            .add(term("b"), Occur::Should)
            .with_minimum_should_match(2);
        assert_eq!(query.doc_ids(&reader).unwrap(), vec![1]);
        assert_eq!(query.description(), "(f:a f:b)");
    }
}
