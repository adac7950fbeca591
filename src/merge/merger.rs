//! Combining segments into one.
//!
//! The merged segment holds the live documents of the inputs in input
//! order; deleted documents are dropped and the rest renumbered
//! contiguously. Doc-values updates layered on the inputs are folded into
//! the merged columns.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use rayon::prelude::*;

use crate::codec::{FieldPostings, Posting, SegmentData, TermVectors};
use crate::document::{DocId, StoredDocument};
use crate::error::{Result, TesseraError};
use crate::index::doc_values::DocValuesColumn;
use crate::index::field_infos::FieldInfos;
use crate::index::reader::LeafReader;
use crate::index::segment_reader::SegmentReader;

type MergedDocuments = (Vec<StoredDocument>, Vec<Option<TermVectors>>);

/// How input documents map onto the merged segment.
#[derive(Debug, Clone, Default)]
pub struct MergeState {
    /// Per input, the new id of every document, `None` for deleted ones.
    pub doc_maps: Vec<Vec<Option<DocId>>>,
    /// Documents in the merged segment.
    pub max_doc: u32,
}

impl MergeState {
    fn build(readers: &[SegmentReader]) -> Self {
        let mut next = 0;
        let doc_maps = readers
            .iter()
            .map(|reader| {
                (0..reader.max_doc())
                    .map(|doc| {
                        reader.is_live(doc).then(|| {
                            next += 1;
                            next - 1
                        })
                    })
                    .collect()
            })
            .collect();
        MergeState {
            doc_maps,
            max_doc: next,
        }
    }

    /// New id of `doc` of input `reader`.
    pub fn map(&self, reader: usize, doc: DocId) -> Option<DocId> {
        self.doc_maps
            .get(reader)
            .and_then(|m| m.get(doc as usize))
            .copied()
            .flatten()
    }
}

/// Merges the data of several segment readers.
#[derive(Debug)]
pub struct SegmentMerger {
    readers: Vec<SegmentReader>,
    abort: Arc<AtomicBool>,
}

impl SegmentMerger {
    /// A merger over `readers`, stopping early once `abort` is set.
    pub fn new(readers: Vec<SegmentReader>, abort: Arc<AtomicBool>) -> Self {
        SegmentMerger { readers, abort }
    }

    fn check_abort(&self) -> Result<()> {
        if self.abort.load(Ordering::Acquire) {
            let names: Vec<_> = self.readers.iter().map(SegmentReader::name).collect();
            return Err(TesseraError::merge_aborted(names.join(" ")));
        }
        Ok(())
    }

    /// Produce the merged segment and the doc maps used.
    pub fn merge(&self) -> Result<(SegmentData, MergeState)> {
        let state = MergeState::build(&self.readers);
        let mut field_infos = FieldInfos::new();
        for reader in &self.readers {
            field_infos.merge(reader.field_infos())?;
        }
        debug!(
            target: "tessera::ms",
            "merging {} segments into {} docs, {} fields",
            self.readers.len(),
            state.max_doc,
            field_infos.len()
        );

        let postings = self.merge_postings(&state)?;
        self.check_abort()?;
        let (stored, term_vectors) = self.merge_documents(&state)?;
        let norms = self.merge_norms(&field_infos, &state)?;
        let doc_values = self.merge_doc_values(&field_infos, &state)?;

        let data = SegmentData {
            max_doc: state.max_doc,
            field_infos,
            postings,
            stored,
            term_vectors,
            doc_values,
            norms,
        };
        Ok((data, state))
    }

    fn merge_postings(&self, state: &MergeState) -> Result<BTreeMap<String, FieldPostings>> {
        let fields: BTreeSet<&String> = self
            .readers
            .iter()
            .flat_map(|r| r.core().data().postings.keys())
            .collect();

        let merged: Vec<(String, FieldPostings)> = fields
            .into_par_iter()
            .map(|field| -> Result<(String, FieldPostings)> {
                self.check_abort()?;
                Ok((field.clone(), self.merge_field_postings(field, state)))
            })
            .collect::<Result<_>>()?;
        Ok(merged
            .into_iter()
            .filter(|(_, p)| !p.terms.is_empty())
            .collect())
    }

    fn merge_field_postings(&self, field: &str, state: &MergeState) -> FieldPostings {
        let mut out = FieldPostings::default();
        let mut seen = vec![false; state.max_doc as usize];
        for (idx, reader) in self.readers.iter().enumerate() {
            let Some(postings) = reader.core().data().postings.get(field) else {
                continue;
            };
            for (term, list) in &postings.terms {
                let remapped = list.iter().filter_map(|p| {
                    state.map(idx, p.doc).map(|doc| Posting {
                        doc,
                        freq: p.freq,
                        positions: p.positions.clone(),
                    })
                });
                let mut remapped = remapped.peekable();
                if remapped.peek().is_none() {
                    continue;
                }
                // Inputs come in order and doc ids grow with them, so
                // appending keeps every list sorted.
                let target = out.terms.entry(term.clone()).or_default();
                for posting in remapped {
                    out.sum_total_term_freq += posting.freq as u64;
                    out.sum_doc_freq += 1;
                    if let Some(slot) = seen.get_mut(posting.doc as usize) {
                        if !*slot {
                            *slot = true;
                            out.doc_count += 1;
                        }
                    }
                    target.push(posting);
                }
            }
        }
        out
    }

    fn merge_documents(&self, state: &MergeState) -> Result<MergedDocuments> {
        let mut stored = Vec::with_capacity(state.max_doc as usize);
        let mut vectors = Vec::with_capacity(state.max_doc as usize);
        for (idx, reader) in self.readers.iter().enumerate() {
            self.check_abort()?;
            for doc in 0..reader.max_doc() {
                if state.map(idx, doc).is_none() {
                    continue;
                }
                stored.push(reader.document(doc)?);
                vectors.push(reader.term_vectors(doc)?);
            }
        }
        Ok((stored, vectors))
    }

    fn merge_norms(
        &self,
        field_infos: &FieldInfos,
        state: &MergeState,
    ) -> Result<BTreeMap<String, Vec<i64>>> {
        let mut norms = BTreeMap::new();
        for info in field_infos.iter().filter(|i| i.has_norms()) {
            self.check_abort()?;
            let mut column = vec![0; state.max_doc as usize];
            for (idx, reader) in self.readers.iter().enumerate() {
                for doc in 0..reader.max_doc() {
                    if let Some(new_doc) = state.map(idx, doc) {
                        column[new_doc as usize] = reader.norm(&info.name, doc).unwrap_or(0);
                    }
                }
            }
            norms.insert(info.name.clone(), column);
        }
        Ok(norms)
    }

    fn merge_doc_values(
        &self,
        field_infos: &FieldInfos,
        state: &MergeState,
    ) -> Result<BTreeMap<String, DocValuesColumn>> {
        let mut columns = BTreeMap::new();
        for info in field_infos.iter() {
            let Some(kind) = info.doc_values else {
                continue;
            };
            self.check_abort()?;
            let mut column = DocValuesColumn::new(kind, state.max_doc as usize);
            for (idx, reader) in self.readers.iter().enumerate() {
                let source = reader.core().data().doc_values.get(&info.name);
                for doc in 0..reader.max_doc() {
                    let Some(new_doc) = state.map(idx, doc) else {
                        continue;
                    };
                    let slot = new_doc as usize;
                    match &mut column {
                        DocValuesColumn::Numeric(values) => {
                            values[slot] = reader.numeric_doc_value(&info.name, doc);
                        }
                        DocValuesColumn::Binary(values) | DocValuesColumn::Sorted(values) => {
                            values[slot] = reader.binary_doc_value(&info.name, doc);
                        }
                        DocValuesColumn::SortedSet(values) => {
                            if let Some(source) = source {
                                values[slot] = source.set(doc).to_vec();
                            }
                        }
                    }
                }
            }
            columns.insert(info.name.clone(), column);
        }
        Ok(columns)
    }
}
