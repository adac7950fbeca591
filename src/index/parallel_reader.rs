//! Field-wise combination of readers with identical document numbering.
//!
//! Two indexes built with the same documents in the same order, each
//! holding a different set of fields, read as one index through a
//! [`ParallelCompositeReader`]. A field present in several inputs is served
//! by the first input that has it. Liveness comes from the first input.

use std::sync::Arc;

use ahash::AHashMap;

use crate::codec::{Posting, TermVectors};
use crate::document::{DocId, StoredDocument, Term};
use crate::error::{Result, TesseraError};
use crate::index::field_infos::FieldInfos;
use crate::index::reader::{CompositeReader, LeafReader, LeafReaderContext, build_leaves};

/// Several leaves over the same documents, read as one.
#[derive(Debug)]
pub struct ParallelLeafReader {
    readers: Vec<Arc<dyn LeafReader>>,
    field_infos: FieldInfos,
    /// Index into `readers` of the input serving each field.
    owners: AHashMap<String, usize>,
}

impl ParallelLeafReader {
    /// Combine `readers`. They must agree on `max_doc` and `num_docs`.
    pub fn new(readers: Vec<Arc<dyn LeafReader>>) -> Result<Self> {
        let Some(first) = readers.first() else {
            return Err(TesseraError::illegal_argument(
                "a parallel reader needs at least one input",
            ));
        };
        let (max_doc, num_docs) = (first.max_doc(), first.num_docs());
        if let Some(other) = readers
            .iter()
            .find(|r| r.max_doc() != max_doc || r.num_docs() != num_docs)
        {
            return Err(TesseraError::illegal_argument(format!(
                "all readers must have the same max_doc and num_docs: {max_doc}/{num_docs} != {}/{}",
                other.max_doc(),
                other.num_docs()
            )));
        }

        let mut field_infos = FieldInfos::new();
        let mut owners = AHashMap::new();
        for (idx, reader) in readers.iter().enumerate() {
            for info in reader.field_infos().iter() {
                if field_infos.insert_if_absent(info) {
                    owners.insert(info.name.clone(), idx);
                }
            }
        }
        Ok(ParallelLeafReader {
            readers,
            field_infos,
            owners,
        })
    }

    fn owner(&self, field: &str) -> Option<&Arc<dyn LeafReader>> {
        self.owners.get(field).map(|&idx| &self.readers[idx])
    }

    fn owns(&self, idx: usize, field: &str) -> bool {
        // Stored-only fields unknown to any field infos stay with their input.
        self.owners.get(field).is_none_or(|&owner| owner == idx)
    }

    /// The combined inputs.
    pub fn readers(&self) -> &[Arc<dyn LeafReader>] {
        &self.readers
    }
}

impl LeafReader for ParallelLeafReader {
    fn max_doc(&self) -> u32 {
        self.readers[0].max_doc()
    }

    fn num_docs(&self) -> u32 {
        self.readers[0].num_docs()
    }

    fn is_live(&self, doc: DocId) -> bool {
        self.readers[0].is_live(doc)
    }

    fn field_infos(&self) -> &FieldInfos {
        &self.field_infos
    }

    fn document(&self, doc: DocId) -> Result<StoredDocument> {
        let mut merged = StoredDocument::new();
        for (idx, reader) in self.readers.iter().enumerate() {
            for (name, value) in reader.document(doc)?.fields() {
                if self.owns(idx, name) {
                    merged.push(name.as_str(), value.clone());
                }
            }
        }
        Ok(merged)
    }

    fn term_vectors(&self, doc: DocId) -> Result<Option<TermVectors>> {
        let mut merged = TermVectors::new();
        for (idx, reader) in self.readers.iter().enumerate() {
            let Some(vectors) = reader.term_vectors(doc)? else {
                continue;
            };
            for (field, entries) in vectors {
                if self.owns(idx, &field) {
                    merged.insert(field, entries);
                }
            }
        }
        Ok((!merged.is_empty()).then_some(merged))
    }

    fn postings(&self, term: &Term) -> Option<&[Posting]> {
        self.owner(&term.field)?.postings(term)
    }

    fn terms(&self, field: &str) -> Vec<Vec<u8>> {
        self.owner(field).map(|r| r.terms(field)).unwrap_or_default()
    }

    fn norm(&self, field: &str, doc: DocId) -> Option<i64> {
        self.owner(field)?.norm(field, doc)
    }

    fn numeric_doc_value(&self, field: &str, doc: DocId) -> Option<i64> {
        self.owner(field)?.numeric_doc_value(field, doc)
    }

    fn binary_doc_value(&self, field: &str, doc: DocId) -> Option<Vec<u8>> {
        self.owner(field)?.binary_doc_value(field, doc)
    }
}

/// Several composite readers with the same leaf structure, read as one.
#[derive(Debug)]
pub struct ParallelCompositeReader {
    leaves: Vec<LeafReaderContext>,
}

impl ParallelCompositeReader {
    /// Combine `readers` leaf by leaf. They must have the same number of
    /// leaves and matching `max_doc` per leaf.
    pub fn new(readers: &[&dyn CompositeReader]) -> Result<Self> {
        let Some(first) = readers.first() else {
            return Err(TesseraError::illegal_argument(
                "a parallel reader needs at least one input",
            ));
        };
        let per_reader: Vec<Vec<LeafReaderContext>> = readers.iter().map(|r| r.leaves()).collect();
        let shape: Vec<u32> = first.leaves().iter().map(|l| l.reader.max_doc()).collect();
        for leaves in &per_reader {
            let other: Vec<u32> = leaves.iter().map(|l| l.reader.max_doc()).collect();
            if other != shape {
                return Err(TesseraError::illegal_argument(format!(
                    "readers have different leaf structure: {shape:?} != {other:?}"
                )));
            }
        }

        let mut parallel = Vec::with_capacity(shape.len());
        for ord in 0..shape.len() {
            let inputs = per_reader
                .iter()
                .map(|leaves| Arc::clone(&leaves[ord].reader))
                .collect();
            parallel.push(Arc::new(ParallelLeafReader::new(inputs)?) as Arc<dyn LeafReader>);
        }
        Ok(ParallelCompositeReader {
            leaves: build_leaves(parallel),
        })
    }
}

impl CompositeReader for ParallelCompositeReader {
    fn leaves(&self) -> Vec<LeafReaderContext> {
        self.leaves.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, Field, FieldValue};
    use crate::index::segment_reader::SegmentReader;
    use crate::index::{DirectoryReader, IndexWriter, IndexWriterConfig};
    use crate::merge::{NoMergePolicy, SerialMergeScheduler};
    use crate::storage::{MemoryStorage, Storage};

    fn build(docs: &[Document], flush_every: usize) -> Arc<dyn Storage> {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let config = IndexWriterConfig::default()
            .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()))
            .with_merge_policy(Arc::new(NoMergePolicy::new()));
        let writer = IndexWriter::new(Arc::clone(&storage), config).unwrap();
        for (i, doc) in docs.iter().enumerate() {
            writer.add_document(doc).unwrap();
            if (i + 1) % flush_every == 0 {
                writer.flush().unwrap();
            }
        }
        writer.close().unwrap();
        storage
    }

    #[test]
    fn test_fields_come_from_owner() {
        let left = build(
            &[Document::new()
                .with(Field::text("f1", "alpha", true))
                .with(Field::string("shared", "left", true))],
            1,
        );
        let right = build(
            &[Document::new()
                .with(Field::text("f2", "beta", true))
                .with(Field::string("shared", "right", true))],
            1,
        );
        let left = DirectoryReader::open(left).unwrap();
        let right = DirectoryReader::open(right).unwrap();
        let parallel = ParallelCompositeReader::new(&[&left, &right]).unwrap();

        let doc = parallel.document(0).unwrap();
        assert_eq!(doc.get_text("f1"), Some("alpha"));
        assert_eq!(doc.get_text("f2"), Some("beta"));
        assert_eq!(doc.get_all("shared"), vec![&FieldValue::Text("left".to_string())]);
        assert_eq!(parallel.doc_freq(&Term::new("f2", "beta")), 1);
        assert_eq!(parallel.doc_freq(&Term::new("shared", "right")), 0);
    }

    #[test]
    fn test_mismatched_inputs_are_rejected() {
        let one = SegmentReader::from_data("_a", crate::codec::SegmentData {
            max_doc: 1,
            ..Default::default()
        });
        let two = SegmentReader::from_data("_b", crate::codec::SegmentData {
            max_doc: 2,
            ..Default::default()
        });
        let err = ParallelLeafReader::new(vec![Arc::new(one) as Arc<dyn LeafReader>, Arc::new(two)]).unwrap_err();
        assert!(matches!(err, TesseraError::IllegalArgument(_)));

        let docs: Vec<Document> = (0..4)
            .map(|i| Document::new().with(Field::string("id", i.to_string(), true)))
            .collect();
        let a = DirectoryReader::open(build(&docs, 2)).unwrap();
        let b = DirectoryReader::open(build(&docs, 4)).unwrap();
        assert!(ParallelCompositeReader::new(&[&a, &b]).is_err());
    }
}
