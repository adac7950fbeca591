//! Reading one segment.
//!
//! The immutable contents of a segment are loaded once into a
//! [`SegmentCore`] and shared by every [`SegmentReader`] over that segment.
//! A reader adds the per-commit state: live docs and doc-values updates.
//! Reopening a reader after new deletions creates a new `SegmentReader`
//! sharing the old core, so only the liveness mask is reloaded.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::codec::{Codec, Posting, SegmentData, TermVectors};
use crate::document::{DocId, StoredDocument, Term};
use crate::error::{Result, TesseraError};
use crate::index::doc_values::{DocValuesOverlay, DocValuesValue};
use crate::index::field_infos::FieldInfos;
use crate::index::live_docs::LiveDocs;
use crate::index::reader::LeafReader;
use crate::index::segment::{SegmentCommitInfo, SegmentInfo};
use crate::storage::Storage;

/// Immutable contents of a segment, shared across readers.
#[derive(Debug)]
pub struct SegmentCore {
    name: String,
    data: SegmentData,
}

impl SegmentCore {
    /// Load the data of a segment.
    pub fn open(storage: &dyn Storage, codec: &dyn Codec, info: &SegmentInfo) -> Result<Arc<Self>> {
        let data = codec.read_segment(storage, info)?;
        Ok(Arc::new(SegmentCore {
            name: info.name.clone(),
            data,
        }))
    }

    /// Wrap data already in memory.
    pub fn from_data<S: Into<String>>(name: S, data: SegmentData) -> Arc<Self> {
        Arc::new(SegmentCore {
            name: name.into(),
            data,
        })
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The segment contents.
    pub fn data(&self) -> &SegmentData {
        &self.data
    }
}

/// A reference-counted reader over one segment at one commit point.
#[derive(Debug)]
pub struct SegmentReader {
    sci: SegmentCommitInfo,
    core: Arc<SegmentCore>,
    live_docs: Option<Arc<LiveDocs>>,
    num_docs: u32,
    overlay: Arc<DocValuesOverlay>,
    ref_count: AtomicUsize,
}

impl SegmentReader {
    /// Open a segment as described by `sci`.
    pub fn open(storage: &dyn Storage, codec: &dyn Codec, sci: &SegmentCommitInfo) -> Result<Self> {
        let core = SegmentCore::open(storage, codec, &sci.info)?;
        let live_docs = codec.read_live_docs(storage, sci)?.map(Arc::new);
        let overlay = Arc::new(codec.read_doc_values_updates(storage, sci)?);
        Ok(Self::with_state(core, sci.clone(), live_docs, overlay))
    }

    /// A reader over an already loaded core.
    pub fn with_state(
        core: Arc<SegmentCore>,
        sci: SegmentCommitInfo,
        live_docs: Option<Arc<LiveDocs>>,
        overlay: Arc<DocValuesOverlay>,
    ) -> Self {
        let max_doc = core.data.max_doc;
        let num_docs = live_docs.as_ref().map_or(max_doc, |l| l.num_live());
        SegmentReader {
            sci,
            core,
            live_docs,
            num_docs,
            overlay,
            ref_count: AtomicUsize::new(1),
        }
    }

    /// A reader over in-memory data that was never written.
    pub fn from_data(name: &str, data: SegmentData) -> Self {
        let info = SegmentInfo::new(name, data.max_doc, "", "flush");
        let sci = SegmentCommitInfo::new(info, 0, -1, -1);
        Self::with_state(
            SegmentCore::from_data(name, data),
            sci,
            None,
            Arc::new(DocValuesOverlay::new()),
        )
    }

    /// Take the segment data back, copying it if the core is shared.
    pub fn into_data(self) -> SegmentData {
        match Arc::try_unwrap(self.core) {
            Ok(core) => core.data,
            Err(core) => core.data.clone(),
        }
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// The commit state this reader was opened with.
    pub fn segment_info(&self) -> &SegmentCommitInfo {
        &self.sci
    }

    /// The shared core.
    pub fn core(&self) -> &Arc<SegmentCore> {
        &self.core
    }

    /// Live docs, `None` when nothing is deleted.
    pub fn live_docs(&self) -> Option<&Arc<LiveDocs>> {
        self.live_docs.as_ref()
    }

    /// Doc-values updates.
    pub fn overlay(&self) -> &Arc<DocValuesOverlay> {
        &self.overlay
    }

    /// Current reference count.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Number of readers sharing this reader's core.
    pub fn core_ref_count(&self) -> usize {
        Arc::strong_count(&self.core)
    }

    /// Take a reference. Fails once the reader was closed.
    pub fn inc_ref(&self) -> Result<()> {
        if self.try_inc_ref() {
            Ok(())
        } else {
            Err(TesseraError::already_closed(format!(
                "segment reader {} is closed",
                self.name()
            )))
        }
    }

    /// Take a reference unless the reader was closed.
    pub fn try_inc_ref(&self) -> bool {
        let mut count = self.ref_count.load(Ordering::Acquire);
        while count > 0 {
            match self.ref_count.compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => count = actual,
            }
        }
        false
    }

    /// Release a reference. Returns true when this was the last one.
    pub fn dec_ref(&self) -> Result<bool> {
        let mut count = self.ref_count.load(Ordering::Acquire);
        loop {
            if count == 0 {
                return Err(TesseraError::already_closed(format!(
                    "segment reader {} is closed",
                    self.name()
                )));
            }
            match self.ref_count.compare_exchange_weak(
                count,
                count - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(count == 1),
                Err(actual) => count = actual,
            }
        }
    }

    fn check_doc(&self, doc: DocId) -> Result<()> {
        if doc >= self.core.data.max_doc {
            return Err(TesseraError::illegal_argument(format!(
                "doc {doc} out of bounds for segment {} with {} docs",
                self.name(),
                self.core.data.max_doc
            )));
        }
        Ok(())
    }
}

impl LeafReader for SegmentReader {
    fn max_doc(&self) -> u32 {
        self.core.data.max_doc
    }

    fn num_docs(&self) -> u32 {
        self.num_docs
    }

    fn is_live(&self, doc: DocId) -> bool {
        match &self.live_docs {
            Some(live) => live.is_live(doc),
            None => doc < self.core.data.max_doc,
        }
    }

    fn field_infos(&self) -> &FieldInfos {
        &self.core.data.field_infos
    }

    fn document(&self, doc: DocId) -> Result<StoredDocument> {
        self.check_doc(doc)?;
        Ok(self
            .core
            .data
            .stored
            .get(doc as usize)
            .cloned()
            .unwrap_or_default())
    }

    fn term_vectors(&self, doc: DocId) -> Result<Option<TermVectors>> {
        self.check_doc(doc)?;
        Ok(self.core.data.term_vectors.get(doc as usize).cloned().flatten())
    }

    fn postings(&self, term: &Term) -> Option<&[Posting]> {
        self.core.data.postings(&term.field, &term.bytes)
    }

    fn terms(&self, field: &str) -> Vec<Vec<u8>> {
        self.core
            .data
            .postings
            .get(field)
            .map(|p| p.terms.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn norm(&self, field: &str, doc: DocId) -> Option<i64> {
        self.core
            .data
            .norms
            .get(field)
            .and_then(|n| n.get(doc as usize))
            .copied()
    }

    fn numeric_doc_value(&self, field: &str, doc: DocId) -> Option<i64> {
        match self.overlay.get(field, doc) {
            Some(DocValuesValue::Numeric(value)) => *value,
            _ => self
                .core
                .data
                .doc_values
                .get(field)
                .and_then(|c| c.numeric(doc)),
        }
    }

    fn binary_doc_value(&self, field: &str, doc: DocId) -> Option<Vec<u8>> {
        match self.overlay.get(field, doc) {
            Some(DocValuesValue::Binary(value)) => value.clone(),
            _ => self
                .core
                .data
                .doc_values
                .get(field)
                .and_then(|c| c.bytes(doc))
                .map(<[u8]>::to_vec),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocValuesType;
    use crate::index::doc_values::DocValuesColumn;

    fn data() -> SegmentData {
        let mut data = SegmentData {
            max_doc: 3,
            stored: vec![StoredDocument::new(); 3],
            term_vectors: vec![None; 3],
            ..Default::default()
        };
        let mut column = DocValuesColumn::new(DocValuesType::Numeric, 3);
        column.apply(0, &DocValuesValue::Numeric(Some(10)));
        data.doc_values.insert("price".into(), column);
        data
    }

    #[test]
    fn test_overlay_shadows_column() {
        let reader = SegmentReader::from_data("_0", data());
        assert_eq!(reader.numeric_doc_value("price", 0), Some(10));

        let mut overlay = DocValuesOverlay::new();
        overlay.set("price", 0, DocValuesValue::Numeric(Some(20)));
        let updated = SegmentReader::with_state(
            Arc::clone(reader.core()),
            reader.segment_info().clone(),
            None,
            Arc::new(overlay),
        );
        assert_eq!(updated.numeric_doc_value("price", 0), Some(20));
        assert_eq!(reader.core_ref_count(), 2);
    }

    #[test]
    fn test_live_docs_and_ref_counting() {
        let mut live = LiveDocs::new(3);
        live.delete(2);
        let base = SegmentReader::from_data("_1", data());
        let reader = SegmentReader::with_state(
            Arc::clone(base.core()),
            base.segment_info().clone(),
            Some(Arc::new(live)),
            Arc::new(DocValuesOverlay::new()),
        );
        assert_eq!(reader.num_docs(), 2);
        assert!(!reader.is_live(2));
        assert!(reader.document(5).is_err());

        reader.inc_ref().unwrap();
        assert!(!reader.dec_ref().unwrap());
        assert!(reader.dec_ref().unwrap());
        assert!(reader.inc_ref().is_err());
        assert!(reader.dec_ref().is_err());
    }
}
