//! Segment encoding.
//!
//! A [`Codec`] turns the in-memory contents of a segment ([`SegmentData`])
//! into files and back, and owns the encoding of the per-generation files
//! (live docs, doc-values updates) and of the manifest. The engine never
//! looks at bytes itself.

pub mod compound;
pub mod default;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::document::{DocId, StoredDocument};
use crate::error::{Result, TesseraError};
use crate::index::doc_values::{DocValuesColumn, DocValuesOverlay};
use crate::index::field_infos::FieldInfos;
use crate::index::live_docs::LiveDocs;
use crate::index::segment::{SegmentCommitInfo, SegmentInfo};
use crate::index::segment_infos::SegmentInfos;
use crate::storage::Storage;

pub use default::DefaultCodec;

/// One occurrence of a term in a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Token position.
    pub position: u32,
    /// Start character offset.
    pub start_offset: u32,
    /// End character offset.
    pub end_offset: u32,
    /// Optional payload.
    pub payload: Option<Vec<u8>>,
}

/// The occurrences of a term in one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    /// Document id.
    pub doc: DocId,
    /// Term frequency.
    pub freq: u32,
    /// Positions, empty when the field does not index them.
    pub positions: Vec<Position>,
}

/// Inverted index of one field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPostings {
    /// Postings per term, in term order. Postings are in doc order.
    pub terms: BTreeMap<Vec<u8>, Vec<Posting>>,
    /// Sum of all term frequencies.
    pub sum_total_term_freq: u64,
    /// Sum of all document frequencies.
    pub sum_doc_freq: u64,
    /// Number of documents with at least one term.
    pub doc_count: u32,
}

/// A term of a document's term vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermVectorEntry {
    /// Term bytes.
    pub term: Vec<u8>,
    /// Frequency in the document.
    pub freq: u32,
    /// Positions and offsets, when recorded.
    pub positions: Vec<Position>,
}

/// Term vectors of one document, per field.
pub type TermVectors = BTreeMap<String, Vec<TermVectorEntry>>;

/// Everything a segment holds, in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentData {
    /// Number of documents.
    pub max_doc: u32,
    /// Field metadata.
    pub field_infos: FieldInfos,
    /// Postings per field.
    pub postings: BTreeMap<String, FieldPostings>,
    /// Stored fields per document.
    pub stored: Vec<StoredDocument>,
    /// Term vectors per document.
    pub term_vectors: Vec<Option<TermVectors>>,
    /// Doc-values columns per field.
    pub doc_values: BTreeMap<String, DocValuesColumn>,
    /// Norms per field, one value per document (0 when absent).
    pub norms: BTreeMap<String, Vec<i64>>,
}

impl SegmentData {
    /// Postings of a term.
    pub fn postings(&self, field: &str, term: &[u8]) -> Option<&[Posting]> {
        self.postings
            .get(field)
            .and_then(|p| p.terms.get(term))
            .map(Vec::as_slice)
    }
}

/// Encodes segments, generation files and manifests.
pub trait Codec: Send + Sync + Debug {
    /// Codec name recorded in every segment it writes.
    fn name(&self) -> &str;

    /// Write the data files of a segment. Returns the file names.
    fn write_segment(
        &self,
        storage: &dyn Storage,
        info: &SegmentInfo,
        data: &SegmentData,
    ) -> Result<BTreeSet<String>>;

    /// Read the data of a segment, from its compound file if it has one.
    fn read_segment(&self, storage: &dyn Storage, info: &SegmentInfo) -> Result<SegmentData>;

    /// Write the segment description (`.si`). Returns the file name.
    fn write_segment_info(&self, storage: &dyn Storage, info: &SegmentInfo) -> Result<String>;

    /// Read a segment description.
    fn read_segment_info(&self, storage: &dyn Storage, segment: &str) -> Result<SegmentInfo>;

    /// Pack `files` into the compound file of the segment. The caller
    /// deletes the originals. Returns the compound file name.
    fn write_compound_file(
        &self,
        storage: &dyn Storage,
        info: &SegmentInfo,
        files: &BTreeSet<String>,
    ) -> Result<String>;

    /// Files a segment consists of, generation files excluded.
    fn segment_files(&self, info: &SegmentInfo) -> BTreeSet<String>;

    /// Write live docs as generation `generation`. Returns the file name.
    fn write_live_docs(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        live_docs: &LiveDocs,
        generation: i64,
    ) -> Result<String>;

    /// Read the current live docs of a segment, `None` without deletions.
    fn read_live_docs(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
    ) -> Result<Option<LiveDocs>>;

    /// Write doc-values updates as generation `generation`.
    fn write_doc_values_updates(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        overlay: &DocValuesOverlay,
        generation: i64,
    ) -> Result<String>;

    /// Read the current doc-values updates of a segment.
    fn read_doc_values_updates(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
    ) -> Result<DocValuesOverlay>;

    /// Write a manifest to `file_name`. The file is not synced.
    fn write_segment_infos(
        &self,
        storage: &dyn Storage,
        infos: &SegmentInfos,
        file_name: &str,
    ) -> Result<()>;

    /// Read the manifest stored in `file_name`.
    fn read_segment_infos(&self, storage: &dyn Storage, file_name: &str) -> Result<SegmentInfos>;
}

/// Look up a codec by the name recorded in a segment.
pub fn for_name(name: &str) -> Result<Arc<dyn Codec>> {
    match name {
        default::CODEC_NAME => Ok(Arc::new(DefaultCodec::new())),
        other => Err(TesseraError::index(format!("unknown codec \"{other}\""))),
    }
}

/// Write a new segment: data files, optionally packed into a compound
/// file, then the segment description. Fills in `info.files` and
/// `info.size_in_bytes`. On failure every file of the segment is removed.
pub fn write_new_segment(
    storage: &dyn Storage,
    codec: &dyn Codec,
    info: &mut SegmentInfo,
    data: &SegmentData,
    use_compound_file: bool,
) -> Result<()> {
    let result = (|| -> Result<()> {
        let mut files = codec.write_segment(storage, info, data)?;
        if use_compound_file {
            let cfs = codec.write_compound_file(storage, info, &files)?;
            for file in &files {
                storage.delete_file(file)?;
            }
            files = BTreeSet::from([cfs]);
            info.use_compound_file = true;
        }
        let mut size = 0;
        for file in &files {
            size += storage.file_size(file)?;
        }
        files.insert(crate::index::segment_file_name(
            &info.name,
            crate::index::SEGMENT_INFO_EXTENSION,
        ));
        info.files = files;
        info.size_in_bytes = size;
        codec.write_segment_info(storage, info)?;
        Ok(())
    })();
    if result.is_err() {
        delete_segment_files(storage, &info.name);
    }
    result
}

/// Best-effort removal of every file belonging to `segment`.
pub fn delete_segment_files(storage: &dyn Storage, segment: &str) {
    let prefix_dot = format!("{segment}.");
    let prefix_gen = format!("{segment}_");
    if let Ok(files) = storage.list_files() {
        for file in files {
            if file.starts_with(&prefix_dot) || file.starts_with(&prefix_gen) {
                let _ = storage.delete_file(&file);
            }
        }
    }
}
