//! Per-segment pending deletes and doc-values updates.
//!
//! The writer keeps one [`ReadersAndUpdates`] per published segment it
//! touched. Deletes and updates are first applied in memory, copy-on-write,
//! so readers already handed out keep their snapshot; they are written as
//! new generation files on commit or when a reader is opened from the
//! writer.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, warn};

use crate::codec::Codec;
use crate::document::DocId;
use crate::error::Result;
use crate::index::buffered_updates::FrozenBufferedUpdates;
use crate::index::doc_values::{DocValuesOverlay, DocValuesValue};
use crate::index::live_docs::LiveDocs;
use crate::index::reader::LeafReader;
use crate::index::segment::SegmentCommitInfo;
use crate::index::segment_reader::{SegmentCore, SegmentReader};
use crate::index::{DV_UPDATES_EXTENSION, LIVE_DOCS_EXTENSION, file_name_from_generation};
use crate::merge::MergeState;
use crate::storage::Storage;

/// Changes applied to a segment while it was being merged.
#[derive(Debug, Default, Clone)]
pub struct MergeLog {
    /// Newly deleted documents.
    pub deletes: Vec<DocId>,
    /// Doc-values updates in arrival order.
    pub dv_updates: Vec<(String, DocId, DocValuesValue)>,
}

/// Pending state of one segment.
#[derive(Debug)]
pub struct ReadersAndUpdates {
    core: Option<Arc<SegmentCore>>,
    live_docs: Option<Arc<LiveDocs>>,
    overlay: Arc<DocValuesOverlay>,
    loaded: bool,
    pending_delete_count: u32,
    pending_dv_updates: usize,
    merge_log: Option<MergeLog>,
}

impl Default for ReadersAndUpdates {
    fn default() -> Self {
        ReadersAndUpdates {
            core: None,
            live_docs: None,
            overlay: Arc::new(DocValuesOverlay::new()),
            loaded: false,
            pending_delete_count: 0,
            pending_dv_updates: 0,
            merge_log: None,
        }
    }
}

impl ReadersAndUpdates {
    fn load(
        &mut self,
        storage: &dyn Storage,
        codec: &dyn Codec,
        sci: &SegmentCommitInfo,
    ) -> Result<()> {
        if !self.loaded {
            self.live_docs = codec.read_live_docs(storage, sci)?.map(Arc::new);
            self.overlay = Arc::new(codec.read_doc_values_updates(storage, sci)?);
            self.loaded = true;
        }
        Ok(())
    }

    fn core(
        &mut self,
        storage: &dyn Storage,
        codec: &dyn Codec,
        sci: &SegmentCommitInfo,
    ) -> Result<Arc<SegmentCore>> {
        if let Some(core) = &self.core {
            return Ok(Arc::clone(core));
        }
        let core = SegmentCore::open(storage, codec, &sci.info)?;
        self.core = Some(Arc::clone(&core));
        Ok(core)
    }

    /// A reader over the segment including every pending change.
    pub fn reader(
        &mut self,
        storage: &dyn Storage,
        codec: &dyn Codec,
        sci: &SegmentCommitInfo,
    ) -> Result<SegmentReader> {
        self.load(storage, codec, sci)?;
        let core = self.core(storage, codec, sci)?;
        let mut snapshot = sci.clone();
        snapshot.del_count += self.pending_delete_count;
        Ok(SegmentReader::with_state(
            core,
            snapshot,
            self.live_docs.clone(),
            Arc::clone(&self.overlay),
        ))
    }

    /// Delete `doc`. Returns false if it was already deleted.
    pub fn delete(
        &mut self,
        storage: &dyn Storage,
        codec: &dyn Codec,
        sci: &SegmentCommitInfo,
        doc: DocId,
    ) -> Result<bool> {
        self.load(storage, codec, sci)?;
        let live = self
            .live_docs
            .get_or_insert_with(|| Arc::new(LiveDocs::new(sci.info.max_doc)));
        if !live.is_live(doc) {
            return Ok(false);
        }
        Arc::make_mut(live).delete(doc);
        self.pending_delete_count += 1;
        if let Some(log) = &mut self.merge_log {
            log.deletes.push(doc);
        }
        Ok(true)
    }

    /// Set a doc value of `doc`.
    pub fn update_doc_value(
        &mut self,
        storage: &dyn Storage,
        codec: &dyn Codec,
        sci: &SegmentCommitInfo,
        field: &str,
        doc: DocId,
        value: DocValuesValue,
    ) -> Result<()> {
        self.load(storage, codec, sci)?;
        if let Some(log) = &mut self.merge_log {
            log.dv_updates.push((field.to_string(), doc, value.clone()));
        }
        Arc::make_mut(&mut self.overlay).set(field, doc, value);
        self.pending_dv_updates += 1;
        Ok(())
    }

    /// Apply a frozen packet. Returns the number of newly deleted docs.
    pub fn apply_packet(
        &mut self,
        storage: &dyn Storage,
        codec: &dyn Codec,
        sci: &SegmentCommitInfo,
        packet: &FrozenBufferedUpdates,
    ) -> Result<u32> {
        let reader = self.reader(storage, codec, sci)?;
        let mut to_delete = Vec::new();
        for term in &packet.terms {
            if let Some(postings) = reader.postings(term) {
                to_delete.extend(postings.iter().map(|p| p.doc));
            }
        }
        for query in &packet.queries {
            to_delete.extend(query.doc_ids(&reader)?);
        }
        let mut updates = Vec::new();
        for update in &packet.doc_values_updates {
            if let Some(postings) = reader.postings(&update.term) {
                for posting in postings {
                    updates.push((update.field.as_str(), posting.doc, update.value.clone()));
                }
            }
        }
        drop(reader);

        let mut deleted = 0;
        for doc in to_delete {
            if self.delete(storage, codec, sci, doc)? {
                deleted += 1;
            }
        }
        for (field, doc, value) in updates {
            self.update_doc_value(storage, codec, sci, field, doc, value)?;
        }
        Ok(deleted)
    }

    /// Deletes not yet written to a live-docs file.
    pub fn pending_delete_count(&self) -> u32 {
        self.pending_delete_count
    }

    /// Whether anything waits to be written.
    pub fn has_pending_changes(&self) -> bool {
        self.pending_delete_count > 0 || self.pending_dv_updates > 0
    }

    /// Whether every document is deleted, pending deletes included.
    pub fn is_fully_deleted(&self, sci: &SegmentCommitInfo) -> bool {
        sci.del_count + self.pending_delete_count >= sci.info.max_doc
    }

    /// Write pending deletes as the next live-docs generation.
    pub fn write_live_docs(
        &mut self,
        storage: &dyn Storage,
        codec: &dyn Codec,
        sci: &mut SegmentCommitInfo,
    ) -> Result<bool> {
        if self.pending_delete_count == 0 {
            return Ok(false);
        }
        let Some(live) = self.live_docs.clone() else {
            return Ok(false);
        };
        let generation = sci.next_write_del_gen();
        match codec.write_live_docs(storage, sci, &live, generation) {
            Ok(file) => {
                sci.advance_del_gen();
                sci.del_count += self.pending_delete_count;
                self.pending_delete_count = 0;
                debug!(target: "tessera::bd", "wrote {file}: {} deleted", sci.del_count);
                Ok(true)
            }
            Err(e) => {
                sci.advance_next_write_del_gen();
                if let Some(name) =
                    file_name_from_generation(sci.name(), LIVE_DOCS_EXTENSION, generation)
                {
                    let _ = storage.delete_file(&name);
                }
                Err(e)
            }
        }
    }

    /// Write pending doc-values updates as the next generation.
    pub fn write_dv_updates(
        &mut self,
        storage: &dyn Storage,
        codec: &dyn Codec,
        sci: &mut SegmentCommitInfo,
    ) -> Result<bool> {
        if self.pending_dv_updates == 0 {
            return Ok(false);
        }
        let generation = sci.next_write_dv_gen();
        match codec.write_doc_values_updates(storage, sci, &self.overlay, generation) {
            Ok(_) => {
                sci.advance_dv_gen();
                self.pending_dv_updates = 0;
                Ok(true)
            }
            Err(e) => {
                sci.advance_next_write_dv_gen();
                if let Some(name) =
                    file_name_from_generation(sci.name(), DV_UPDATES_EXTENSION, generation)
                {
                    let _ = storage.delete_file(&name);
                }
                Err(e)
            }
        }
    }

    /// Start logging changes for a merge and return the merge input.
    pub fn reader_for_merge(
        &mut self,
        storage: &dyn Storage,
        codec: &dyn Codec,
        sci: &SegmentCommitInfo,
    ) -> Result<SegmentReader> {
        let reader = self.reader(storage, codec, sci)?;
        self.merge_log = Some(MergeLog::default());
        Ok(reader)
    }

    /// Stop logging and return what changed since the merge started.
    pub fn finish_merge(&mut self) -> MergeLog {
        self.merge_log.take().unwrap_or_default()
    }

    /// Whether the segment is an input of a running merge.
    pub fn is_merging(&self) -> bool {
        self.merge_log.is_some()
    }
}

/// Pending state of every touched segment, keyed by segment name.
#[derive(Debug, Default)]
pub struct ReaderPool {
    entries: BTreeMap<String, ReadersAndUpdates>,
}

impl ReaderPool {
    /// An empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry of `name`, created on first use.
    pub fn get(&mut self, name: &str) -> &mut ReadersAndUpdates {
        self.entries.entry(name.to_string()).or_default()
    }

    /// The entry of `name` if one exists.
    pub fn peek(&self, name: &str) -> Option<&ReadersAndUpdates> {
        self.entries.get(name)
    }

    /// Forget a segment.
    pub fn drop_entry(&mut self, name: &str) {
        self.entries.remove(name);
    }

    /// Replay the merge logs of a merge's inputs onto the merged segment
    /// `sci`, returning how many deletes were carried. On error the merged
    /// segment's entry is dropped.
    pub fn carry_over(
        &mut self,
        storage: &dyn Storage,
        codec: &dyn Codec,
        sci: &SegmentCommitInfo,
        logs: Vec<MergeLog>,
        merge_state: &MergeState,
    ) -> Result<usize> {
        let entry = self.get(sci.name());
        let result = Self::replay(entry, storage, codec, sci, logs, merge_state);
        if result.is_err() {
            self.drop_entry(sci.name());
        }
        result
    }

    fn replay(
        entry: &mut ReadersAndUpdates,
        storage: &dyn Storage,
        codec: &dyn Codec,
        sci: &SegmentCommitInfo,
        logs: Vec<MergeLog>,
        merge_state: &MergeState,
    ) -> Result<usize> {
        let mut carried = 0;
        for (input, log) in logs.into_iter().enumerate() {
            for doc in log.deletes {
                let Some(new_doc) = merge_state.map(input, doc) else {
                    continue;
                };
                if entry.delete(storage, codec, sci, new_doc)? {
                    carried += 1;
                }
            }
            for (field, doc, value) in log.dv_updates {
                if let Some(new_doc) = merge_state.map(input, doc) {
                    entry.update_doc_value(storage, codec, sci, &field, new_doc, value)?;
                }
            }
        }
        Ok(carried)
    }

    /// Forget everything; pending changes are lost.
    pub fn drop_all(&mut self) {
        let pending = self
            .entries
            .values()
            .filter(|e| e.has_pending_changes())
            .count();
        if pending > 0 {
            warn!(target: "tessera::iw", "dropping {pending} segments with unwritten changes");
        }
        self.entries.clear();
    }

    /// Keep only entries of `live` segments that are merging or carry
    /// pending changes.
    pub fn release_unused<'a, I>(&mut self, live: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let live: std::collections::BTreeSet<&str> = live.into_iter().collect();
        self.entries.retain(|name, entry| {
            live.contains(name.as_str())
                && (entry.is_merging() || entry.has_pending_changes() || entry.core.is_some())
        });
    }

    /// Whether any segment has unwritten changes.
    pub fn any_pending_changes(&self) -> bool {
        self.entries.values().any(ReadersAndUpdates::has_pending_changes)
    }

    /// Names of segments with unwritten changes.
    pub fn dirty_segments(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.has_pending_changes())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DefaultCodec, FieldPostings, Posting, SegmentData, write_new_segment};
    use crate::document::{StoredDocument, Term};
    use crate::index::buffered_updates::BufferedUpdates;
    use crate::index::segment::SegmentInfo;
    use crate::storage::MemoryStorage;

    fn segment(storage: &dyn Storage, codec: &dyn Codec) -> SegmentCommitInfo {
        let mut postings = FieldPostings::default();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            postings.terms.insert(
                id.as_bytes().to_vec(),
                vec![Posting {
                    doc: i as DocId,
                    freq: 1,
                    positions: Vec::new(),
                }],
            );
        }
        let mut data = SegmentData {
            max_doc: 3,
            stored: vec![StoredDocument::new(); 3],
            term_vectors: vec![None; 3],
            ..Default::default()
        };
        data.postings.insert("id".into(), postings);
        let mut info = SegmentInfo::new("_0", 3, codec.name(), "flush");
        write_new_segment(storage, codec, &mut info, &data, false).unwrap();
        SegmentCommitInfo::new(info, 0, -1, -1)
    }

    #[test]
    fn test_deletes_are_copy_on_write() {
        let storage = MemoryStorage::new();
        let codec = DefaultCodec::new();
        let mut sci = segment(&storage, &codec);
        let mut pool = ReaderPool::new();

        let entry = pool.get("_0");
        let before = entry.reader(&storage, &codec, &sci).unwrap();
        assert!(entry.delete(&storage, &codec, &sci, 1).unwrap());
        assert!(!entry.delete(&storage, &codec, &sci, 1).unwrap());
        assert!(before.is_live(1));
        let after = entry.reader(&storage, &codec, &sci).unwrap();
        assert!(!after.is_live(1));
        assert_eq!(after.segment_info().del_count, 1);

        assert!(entry.write_live_docs(&storage, &codec, &mut sci).unwrap());
        assert_eq!(sci.del_count, 1);
        assert_eq!(sci.del_gen, 1);
        assert!(!pool.any_pending_changes());
        let reopened = SegmentReader::open(&storage, &codec, &sci).unwrap();
        assert_eq!(reopened.num_docs(), 2);
    }

    #[test]
    fn test_apply_packet_and_merge_log() {
        let storage = MemoryStorage::new();
        let codec = DefaultCodec::new();
        let mut sci = segment(&storage, &codec);
        let mut pool = ReaderPool::new();
        let entry = pool.get("_0");
        entry.reader_for_merge(&storage, &codec, &sci).unwrap();

        let mut updates = BufferedUpdates::new();
        updates.add_term(Term::new("id", "a"), u32::MAX);
        updates.add_term(Term::new("id", "zzz"), u32::MAX);
        updates.add_doc_values_update(
            crate::index::doc_values::DocValuesUpdate {
                term: Term::new("id", "c"),
                field: "rank".into(),
                value: DocValuesValue::Numeric(Some(7)),
            },
            u32::MAX,
        );
        let packet = FrozenBufferedUpdates::new(&updates);
        assert_eq!(entry.apply_packet(&storage, &codec, &sci, &packet).unwrap(), 1);

        let log = entry.finish_merge();
        assert_eq!(log.deletes, vec![0]);
        assert_eq!(log.dv_updates.len(), 1);

        assert!(entry.write_dv_updates(&storage, &codec, &mut sci).unwrap());
        let reader = SegmentReader::open(&storage, &codec, &sci).unwrap();
        assert_eq!(reader.numeric_doc_value("rank", 2), Some(7));
    }

    #[test]
    fn test_failed_carry_over_drops_merged_entry() {
        let storage = MemoryStorage::new();
        let codec = DefaultCodec::new();
        let mut sci = segment(&storage, &codec);
        // Points at a live-docs file that was never written.
        sci.del_gen = 1;
        let logs = vec![MergeLog {
            deletes: vec![0],
            dv_updates: Vec::new(),
        }];
        let merge_state = MergeState {
            doc_maps: vec![vec![Some(0), Some(1), Some(2)]],
            max_doc: 3,
        };
        let mut pool = ReaderPool::new();
        assert!(pool.carry_over(&storage, &codec, &sci, logs.clone(), &merge_state).is_err());
        assert!(pool.peek("_0").is_none());

        sci.del_gen = -1;
        assert_eq!(pool.carry_over(&storage, &codec, &sci, logs, &merge_state).unwrap(), 1);
        assert!(pool.any_pending_changes());
    }
}
