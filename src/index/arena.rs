//! Per-thread in-memory segments.
//!
//! An [`Arena`] buffers the documents of one indexing thread at a time:
//! inverted postings, stored fields, term vectors, doc values and norms.
//! Deletes reach it through its slice of the shared [`DeleteQueue`]. When
//! flushed, the buffered deletes are resolved against the arena's own
//! documents and the result is written as a new segment.
//!
//! A document is first analyzed into an [`InvertedDoc`] without touching
//! the buffers. Only a document that analyzed cleanly is committed, so a
//! failing analyzer never leaves a half-indexed document behind.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::analysis::Analyzer;
use crate::codec::{
    self, Codec, FieldPostings, Position, Posting, SegmentData, TermVectorEntry, TermVectors,
};
use crate::document::{DocId, DocValuesType, Document, Field, FieldType, StoredDocument};
use crate::error::{Result, TesseraError};
use crate::index::buffered_updates::{BufferedUpdates, FrozenBufferedUpdates};
use crate::index::delete_queue::{DeleteOp, DeleteQueue, DeleteSlice};
use crate::index::doc_values::DocValuesColumn;
use crate::index::field_infos::FieldInfos;
use crate::index::live_docs::LiveDocs;
use crate::index::segment::{SegmentCommitInfo, SegmentInfo};
use crate::index::segment_reader::SegmentReader;
use crate::index::similarity::{FieldInvertState, Similarity};
use crate::storage::Storage;
use crate::util::to_radix36;

/// Everything arenas of one writer share.
#[derive(Debug)]
pub struct ArenaContext {
    /// Where segments are written.
    pub storage: Arc<dyn Storage>,
    /// How segments are written.
    pub codec: Arc<dyn Codec>,
    /// Analyzer for tokenized fields.
    pub analyzer: Arc<dyn Analyzer>,
    /// Computes norms.
    pub similarity: Arc<dyn Similarity>,
    /// Pack flushed segments into compound files.
    pub use_compound_file: bool,
    /// Segment name counter, shared with the manifest.
    pub name_counter: Arc<AtomicU64>,
    /// Doc-values type of every field seen by this writer.
    pub doc_values_types: Arc<Mutex<AHashMap<String, DocValuesType>>>,
}

impl ArenaContext {
    /// Take the next segment name.
    pub fn new_segment_name(&self) -> String {
        format!("_{}", to_radix36(self.name_counter.fetch_add(1, Ordering::AcqRel)))
    }
}

/// A segment flushed from an arena.
#[derive(Debug)]
pub struct FlushedSegment {
    /// The written segment, live docs included.
    pub sci: SegmentCommitInfo,
    /// Documents deleted while the segment was in memory.
    pub del_count: u32,
}

#[derive(Debug, Default)]
struct TermOccurrences {
    freq: u32,
    positions: Vec<Position>,
}

#[derive(Debug)]
struct InvertedField {
    name: String,
    field_type: FieldType,
    terms: BTreeMap<Vec<u8>, TermOccurrences>,
    state: FieldInvertState,
    has_payloads: bool,
    instances: u32,
    position: i64,
}

#[derive(Debug)]
enum PendingDocValue {
    Numeric(i64),
    Bytes(Vec<u8>),
    Set(Vec<Vec<u8>>),
}

/// A document analyzed but not yet added to the buffers.
#[derive(Debug, Default)]
struct InvertedDoc {
    field_types: Vec<(String, FieldType)>,
    fields: Vec<InvertedField>,
    stored: StoredDocument,
    doc_values: Vec<(String, DocValuesType, PendingDocValue)>,
    ram_bytes: usize,
}

/// The in-memory segment of one indexing thread.
#[derive(Debug)]
pub struct Arena {
    id: usize,
    ctx: Arc<ArenaContext>,
    delete_queue: Arc<DeleteQueue>,
    delete_slice: DeleteSlice,
    pending_updates: BufferedUpdates,
    segment_name: Option<String>,
    num_docs: u32,
    field_infos: FieldInfos,
    postings: BTreeMap<String, AHashMap<Vec<u8>, Vec<Posting>>>,
    stored: Vec<StoredDocument>,
    term_vectors: Vec<Option<TermVectors>>,
    doc_values: BTreeMap<String, DocValuesColumn>,
    norms: BTreeMap<String, Vec<i64>>,
    bytes_used: usize,
}

impl Arena {
    /// An empty arena reading deletes from `delete_queue`.
    pub fn new(id: usize, ctx: Arc<ArenaContext>, delete_queue: Arc<DeleteQueue>) -> Self {
        let delete_slice = delete_queue.new_slice();
        Arena {
            id,
            ctx,
            delete_queue,
            delete_slice,
            pending_updates: BufferedUpdates::new(),
            segment_name: None,
            num_docs: 0,
            field_infos: FieldInfos::new(),
            postings: BTreeMap::new(),
            stored: Vec::new(),
            term_vectors: Vec::new(),
            doc_values: BTreeMap::new(),
            norms: BTreeMap::new(),
            bytes_used: 0,
        }
    }

    /// Arena id, stable for the life of the writer.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Documents buffered, failed ones included.
    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    /// Heap used by buffered documents and arena-private deletes.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used + self.pending_updates.bytes_used()
    }

    /// Name of the segment being built, if any document arrived.
    pub fn segment_name(&self) -> Option<&str> {
        self.segment_name.as_deref()
    }

    /// Add a block of documents atomically, optionally replacing the
    /// documents matched by `delete`. Returns the sequence number.
    ///
    /// If any document fails analysis no document of the block becomes
    /// visible and the delete is not applied; the doc ids the block
    /// consumed are marked deleted.
    pub fn update_documents(&mut self, docs: &[Document], delete: Option<DeleteOp>) -> Result<u64> {
        if self.segment_name.is_none() {
            self.segment_name = Some(self.ctx.new_segment_name());
        }
        let mut inverted = Vec::with_capacity(docs.len());
        for (i, doc) in docs.iter().enumerate() {
            match self.invert(doc) {
                Ok(inv) => inverted.push(inv),
                Err(e) => {
                    for _ in 0..=i {
                        self.add_deleted_placeholder();
                    }
                    return Err(e);
                }
            }
        }
        if let Err(e) = self.register_doc_values_types(&inverted) {
            for _ in 0..docs.len() {
                self.add_deleted_placeholder();
            }
            return Err(e);
        }

        let start = self.num_docs;
        for inv in inverted {
            self.commit(inv);
        }
        Ok(self.finish_documents(start, delete))
    }

    fn finish_documents(&mut self, start: DocId, delete: Option<DeleteOp>) -> u64 {
        match delete {
            Some(op) => {
                let seq_no = self.delete_queue.add_to_slice(op, &mut self.delete_slice);
                debug_assert!(self.delete_slice.is_tail_seq_no(seq_no));
                // The replacing documents themselves must survive.
                self.delete_slice.apply(&mut self.pending_updates, start);
                seq_no
            }
            None => {
                let (seq_no, changed) = self.delete_queue.update_slice(&mut self.delete_slice);
                if changed {
                    self.delete_slice.apply(&mut self.pending_updates, start);
                } else {
                    self.delete_slice.reset();
                }
                seq_no
            }
        }
    }

    fn add_deleted_placeholder(&mut self) {
        let doc = self.num_docs;
        self.stored.push(StoredDocument::new());
        self.term_vectors.push(None);
        self.num_docs += 1;
        self.pending_updates.add_doc_id(doc);
    }

    fn doc_values_type_conflict(
        name: &str,
        existing: DocValuesType,
        kind: DocValuesType,
    ) -> TesseraError {
        TesseraError::illegal_argument(format!(
            "cannot change doc values type from {existing:?} to {kind:?} for field \"{name}\""
        ))
    }

    fn check_doc_values_type(&self, name: &str, kind: DocValuesType) -> Result<()> {
        match self.ctx.doc_values_types.lock().get(name) {
            Some(existing) if *existing != kind => {
                Err(Self::doc_values_type_conflict(name, *existing, kind))
            }
            _ => Ok(()),
        }
    }

    /// Record the doc-values types of a fully inverted block. Nothing is
    /// recorded if any field conflicts.
    fn register_doc_values_types(&self, inverted: &[InvertedDoc]) -> Result<()> {
        let mut types = self.ctx.doc_values_types.lock();
        let mut added: AHashMap<&str, DocValuesType> = AHashMap::new();
        for (name, kind, _) in inverted.iter().flat_map(|inv| &inv.doc_values) {
            let existing = types.get(name.as_str()).or_else(|| added.get(name.as_str()));
            match existing {
                Some(existing) if existing != kind => {
                    return Err(Self::doc_values_type_conflict(name, *existing, *kind));
                }
                Some(_) => {}
                None => {
                    added.insert(name.as_str(), *kind);
                }
            }
        }
        for (name, kind) in added {
            types.insert(name.to_string(), kind);
        }
        Ok(())
    }

    fn invert(&self, doc: &Document) -> Result<InvertedDoc> {
        let mut inv = InvertedDoc::default();
        let mut by_name: AHashMap<&str, usize> = AHashMap::new();

        for field in doc.fields() {
            let ft = field.field_type;
            inv.field_types.push((field.name.clone(), ft));
            if ft.stored {
                inv.ram_bytes += field.name.len() + 32;
                inv.stored.push(field.name.clone(), field.value.clone());
            }
            if let Some(kind) = ft.doc_values {
                self.check_doc_values_type(&field.name, kind)?;
                Self::add_doc_value(&mut inv, field, kind)?;
            }
            if ft.indexed {
                let idx = *by_name.entry(field.name.as_str()).or_insert_with(|| {
                    inv.fields.push(InvertedField {
                        name: field.name.clone(),
                        field_type: ft,
                        terms: BTreeMap::new(),
                        state: FieldInvertState {
                            name: field.name.clone(),
                            ..Default::default()
                        },
                        has_payloads: false,
                        instances: 0,
                        position: -1,
                    });
                    inv.fields.len() - 1
                });
                let bytes = self.invert_field(&mut inv.fields[idx], field)?;
                inv.ram_bytes += bytes;
            }
        }
        inv.ram_bytes += inv.stored.ram_bytes();
        Ok(inv)
    }

    fn add_doc_value(inv: &mut InvertedDoc, field: &Field, kind: DocValuesType) -> Result<()> {
        let existing = inv.doc_values.iter_mut().find(|(name, _, _)| *name == field.name);
        let value = match kind {
            DocValuesType::Numeric => PendingDocValue::Numeric(field.value.as_long().ok_or_else(
                || {
                    TesseraError::illegal_argument(format!(
                        "numeric doc values field \"{}\" needs an integer value",
                        field.name
                    ))
                },
            )?),
            DocValuesType::Binary | DocValuesType::Sorted | DocValuesType::SortedSet => {
                let bytes = field.value.as_bytes().ok_or_else(|| {
                    TesseraError::illegal_argument(format!(
                        "doc values field \"{}\" needs a byte or text value",
                        field.name
                    ))
                })?;
                if kind == DocValuesType::SortedSet {
                    PendingDocValue::Set(vec![bytes.to_vec()])
                } else {
                    PendingDocValue::Bytes(bytes.to_vec())
                }
            }
        };
        inv.ram_bytes += match &value {
            PendingDocValue::Numeric(_) => 8,
            PendingDocValue::Bytes(b) => b.len() + 24,
            PendingDocValue::Set(s) => s.iter().map(|b| b.len() + 24).sum(),
        };
        match (existing, value) {
            (None, value) => {
                inv.doc_values.push((field.name.clone(), kind, value));
                Ok(())
            }
            (Some((_, _, PendingDocValue::Set(values))), PendingDocValue::Set(more)) => {
                values.extend(more);
                Ok(())
            }
            (Some(_), _) => Err(TesseraError::illegal_argument(format!(
                "doc values field \"{}\" appears more than once in this document",
                field.name
            ))),
        }
    }

    /// Analyze one field instance into `target`. Returns the heap cost.
    fn invert_field(&self, target: &mut InvertedField, field: &Field) -> Result<usize> {
        let analyzer = &self.ctx.analyzer;
        if target.instances > 0 {
            target.position += analyzer.position_increment_gap(&field.name) as i64;
            target.state.offset += analyzer.offset_gap(&field.name);
        }
        target.instances += 1;
        target.field_type.store_term_vectors |= field.field_type.store_term_vectors;
        target.field_type.store_term_vector_positions |= field.field_type.store_term_vector_positions;
        target.field_type.store_term_vector_offsets |= field.field_type.store_term_vector_offsets;

        let tokens: Vec<(Vec<u8>, u32, u32, u32, Option<Vec<u8>>)> = if field.field_type.tokenized {
            let text = field.value.as_text().ok_or_else(|| {
                TesseraError::illegal_argument(format!(
                    "tokenized field \"{}\" needs a text value",
                    field.name
                ))
            })?;
            analyzer
                .token_stream(&field.name, text)?
                .map(|t| {
                    (
                        t.text.into_bytes(),
                        t.position_increment,
                        t.start_offset,
                        t.end_offset,
                        t.payload,
                    )
                })
                .collect()
        } else {
            let bytes = field.value.as_bytes().ok_or_else(|| {
                TesseraError::illegal_argument(format!(
                    "indexed field \"{}\" needs a byte or text value",
                    field.name
                ))
            })?;
            vec![(bytes.to_vec(), 1, 0, bytes.len() as u32, None)]
        };

        let base_offset = target.state.offset;
        let mut last_end = 0;
        let mut cost = 0;
        for (bytes, increment, start, end, payload) in tokens {
            if end < start {
                return Err(TesseraError::analysis(format!(
                    "field \"{}\": end offset {end} before start offset {start}",
                    field.name
                )));
            }
            if increment == 0 {
                target.state.num_overlap += 1;
            }
            target.position += increment as i64;
            if target.position < 0 {
                return Err(TesseraError::analysis(format!(
                    "field \"{}\": first position increment must be > 0",
                    field.name
                )));
            }
            target.state.length += 1;
            last_end = last_end.max(end);

            if payload.is_some() {
                target.has_payloads = true;
            }
            cost += bytes.len() + 48;
            let entry = target.terms.entry(bytes).or_default();
            entry.freq += 1;
            entry.positions.push(Position {
                position: target.position as u32,
                start_offset: base_offset + start,
                end_offset: base_offset + end,
                payload,
            });
        }
        target.state.position = target.position.max(0) as u32;
        target.state.offset = base_offset + last_end;
        Ok(cost)
    }

    fn commit(&mut self, inv: InvertedDoc) {
        let doc = self.num_docs;
        for (name, ft) in &inv.field_types {
            // Doc-values conflicts were rejected during analysis.
            if let Err(e) = self.field_infos.add_or_update(name, ft) {
                warn!(target: "tessera::dw", "field infos rejected {name}: {e}");
            }
        }

        let mut vectors = TermVectors::new();
        for field in inv.fields {
            if field.has_payloads {
                self.field_infos.set_has_payloads(&field.name);
            }
            let ft = field.field_type;
            let keep_positions = ft.index_positions || ft.tokenized;
            let postings = self.postings.entry(field.name.clone()).or_default();
            let mut max_freq = 0;
            for (term, occ) in &field.terms {
                max_freq = max_freq.max(occ.freq);
                let positions = if keep_positions {
                    occ.positions
                        .iter()
                        .map(|p| strip_offsets(p, ft.index_offsets))
                        .collect()
                } else {
                    Vec::new()
                };
                postings.entry(term.clone()).or_default().push(Posting {
                    doc,
                    freq: occ.freq,
                    positions,
                });
            }

            if !ft.omit_norms {
                let mut state = field.state.clone();
                state.max_term_frequency = max_freq;
                state.unique_term_count = field.terms.len() as u32;
                let norms = self.norms.entry(field.name.clone()).or_default();
                norms.resize(doc as usize + 1, 0);
                norms[doc as usize] = self.ctx.similarity.compute_norm(&state);
            }

            if ft.store_term_vectors {
                let entries = field
                    .terms
                    .into_iter()
                    .map(|(term, occ)| TermVectorEntry {
                        term,
                        freq: occ.freq,
                        positions: if ft.store_term_vector_positions || ft.store_term_vector_offsets {
                            occ.positions
                                .iter()
                                .map(|p| {
                                    let mut p = strip_offsets(p, ft.store_term_vector_offsets);
                                    if !ft.store_term_vector_positions {
                                        p.position = 0;
                                    }
                                    p
                                })
                                .collect()
                        } else {
                            Vec::new()
                        },
                    })
                    .collect();
                vectors.insert(field.name, entries);
            }
        }

        for (name, kind, value) in inv.doc_values {
            let column = self
                .doc_values
                .entry(name)
                .or_insert_with(|| DocValuesColumn::new(kind, 0));
            column.resize(doc as usize + 1);
            match (column, value) {
                (DocValuesColumn::Numeric(values), PendingDocValue::Numeric(v)) => {
                    values[doc as usize] = Some(v)
                }
                (DocValuesColumn::Binary(values), PendingDocValue::Bytes(v))
                | (DocValuesColumn::Sorted(values), PendingDocValue::Bytes(v)) => {
                    values[doc as usize] = Some(v)
                }
                (DocValuesColumn::SortedSet(values), PendingDocValue::Set(mut v)) => {
                    v.sort();
                    v.dedup();
                    values[doc as usize] = v;
                }
                _ => {}
            }
        }

        self.stored.push(inv.stored);
        self.term_vectors
            .push(if vectors.is_empty() { None } else { Some(vectors) });
        self.num_docs += 1;
        self.bytes_used += inv.ram_bytes;
    }

    /// Freeze the global update buffer and catch this arena up with every
    /// queued operation. Must run while the arena is checked out for flush
    /// and in ticket order.
    pub fn prepare_flush(&mut self) -> Option<FrozenBufferedUpdates> {
        let global = self.delete_queue.freeze_global_buffer(Some(&mut self.delete_slice));
        self.delete_slice.apply(&mut self.pending_updates, self.num_docs);
        global
    }

    /// Write the buffered documents as a segment and reset the arena.
    /// Returns `None` when every document ended up deleted.
    pub fn flush(&mut self) -> Result<Option<FlushedSegment>> {
        let name = match self.segment_name.take() {
            Some(name) => name,
            None => {
                self.reset();
                return Ok(None);
            }
        };
        let result = self.flush_segment(&name);
        if result.is_err() {
            codec::delete_segment_files(self.ctx.storage.as_ref(), &name);
        }
        self.reset();
        result
    }

    fn flush_segment(&mut self, name: &str) -> Result<Option<FlushedSegment>> {
        let max_doc = self.num_docs;
        let mut data = self.take_segment_data();
        let updates = std::mem::take(&mut self.pending_updates);

        let mut live = LiveDocs::new(max_doc);
        for doc in &updates.delete_doc_ids {
            live.delete(*doc);
        }
        for (term, upto) in &updates.delete_terms {
            if let Some(postings) = data.postings(&term.field, &term.bytes) {
                for posting in postings.iter().take_while(|p| p.doc < *upto) {
                    live.delete(posting.doc);
                }
            }
        }
        for (update, upto) in &updates.doc_values_updates {
            let docs: Vec<DocId> = data
                .postings(&update.term.field, &update.term.bytes)
                .map(|ps| ps.iter().map(|p| p.doc).take_while(|d| d < upto).collect())
                .unwrap_or_default();
            if docs.is_empty() {
                continue;
            }
            let kind = update.value.doc_values_type();
            data.field_infos
                .add_or_update(&update.field, &FieldType::doc_values(kind))?;
            let column = data
                .doc_values
                .entry(update.field.clone())
                .or_insert_with(|| DocValuesColumn::new(kind, max_doc as usize));
            for doc in docs {
                column.apply(doc, &update.value);
            }
        }

        let data = if updates.delete_queries.is_empty() {
            data
        } else {
            let reader = SegmentReader::from_data(name, data);
            for (query, upto) in &updates.delete_queries {
                for doc in query.doc_ids(&reader)? {
                    if doc < *upto {
                        live.delete(doc);
                    }
                }
            }
            reader.into_data()
        };

        if live.num_live() == 0 {
            debug!(
                target: "tessera::dw",
                "flush of {name}: all {max_doc} docs deleted, dropping segment"
            );
            return Ok(None);
        }

        let storage = self.ctx.storage.as_ref();
        let codec = self.ctx.codec.as_ref();
        let mut info = SegmentInfo::new(name, max_doc, codec.name(), "flush");
        codec::write_new_segment(storage, codec, &mut info, &data, self.ctx.use_compound_file)?;
        let mut sci = SegmentCommitInfo::new(info, 0, -1, -1);
        let del_count = live.num_deleted();
        if del_count > 0 {
            codec.write_live_docs(storage, &sci, &live, sci.next_write_del_gen())?;
            sci.advance_del_gen();
            sci.del_count = del_count;
        }
        debug!(
            target: "tessera::dw",
            "flushed {name}: {max_doc} docs, {del_count} deleted, {} bytes",
            sci.size_in_bytes()
        );
        Ok(Some(FlushedSegment { sci, del_count }))
    }

    fn take_segment_data(&mut self) -> SegmentData {
        let max_doc = self.num_docs as usize;
        let mut postings = BTreeMap::new();
        for (field, terms) in std::mem::take(&mut self.postings) {
            let mut fp = FieldPostings::default();
            let mut seen = vec![false; max_doc];
            for (term, list) in terms {
                fp.sum_doc_freq += list.len() as u64;
                for posting in &list {
                    fp.sum_total_term_freq += posting.freq as u64;
                    seen[posting.doc as usize] = true;
                }
                fp.terms.insert(term, list);
            }
            fp.doc_count = seen.iter().filter(|s| **s).count() as u32;
            postings.insert(field, fp);
        }
        let mut doc_values = std::mem::take(&mut self.doc_values);
        for column in doc_values.values_mut() {
            column.resize(max_doc);
        }
        let mut norms = std::mem::take(&mut self.norms);
        for values in norms.values_mut() {
            values.resize(max_doc, 0);
        }
        SegmentData {
            max_doc: self.num_docs,
            field_infos: std::mem::take(&mut self.field_infos),
            postings,
            stored: std::mem::take(&mut self.stored),
            term_vectors: std::mem::take(&mut self.term_vectors),
            doc_values,
            norms,
        }
    }

    fn reset(&mut self) {
        self.segment_name = None;
        self.num_docs = 0;
        self.field_infos = FieldInfos::new();
        self.postings.clear();
        self.stored.clear();
        self.term_vectors.clear();
        self.doc_values.clear();
        self.norms.clear();
        self.pending_updates.clear();
        self.bytes_used = 0;
    }

    /// Discard every buffered document and update.
    pub fn abort(&mut self) {
        if let Some(name) = self.segment_name.take() {
            debug!(target: "tessera::dw", "abort arena {} segment {name}", self.id);
            codec::delete_segment_files(self.ctx.storage.as_ref(), &name);
        }
        self.reset();
        self.delete_slice = self.delete_queue.new_slice();
    }
}

fn strip_offsets(position: &Position, keep: bool) -> Position {
    let mut p = position.clone();
    if !keep {
        p.start_offset = 0;
        p.end_offset = 0;
    }
    p
}
