//! Segment metadata.
//!
//! [`SegmentInfo`] describes the immutable part of a segment: its name,
//! random id, document count and file set. [`SegmentCommitInfo`] adds the
//! mutable per-commit state (deletion count and the generations of the
//! live-docs and doc-values update files). Both are plain values; the
//! writer's manifest and every commit or reader hold their own copy.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::index::{file_name_from_generation, LIVE_DOCS_EXTENSION, DV_UPDATES_EXTENSION};

/// Diagnostics key naming how the segment was produced.
pub const SOURCE_DIAGNOSTIC: &str = "source";

/// Immutable description of one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Segment name, `_` followed by a base-36 counter.
    pub name: String,
    /// Random unique id.
    pub id: String,
    /// Number of documents, deleted ones included.
    pub max_doc: u32,
    /// Name of the codec that wrote the segment.
    pub codec: String,
    /// Whether the segment data is packed in a compound file.
    pub use_compound_file: bool,
    /// Files that make up the segment, generation files excluded.
    pub files: BTreeSet<String>,
    /// Free-form metadata (source, timestamp, merge inputs).
    pub diagnostics: BTreeMap<String, String>,
    /// Total bytes of `files`.
    pub size_in_bytes: u64,
}

impl SegmentInfo {
    /// Describe a new segment. Files and size are filled in once written.
    pub fn new<S: Into<String>>(name: S, max_doc: u32, codec: &str, source: &str) -> Self {
        let mut diagnostics = BTreeMap::new();
        diagnostics.insert(SOURCE_DIAGNOSTIC.to_string(), source.to_string());
        diagnostics.insert(
            "timestamp".to_string(),
            chrono::Utc::now().to_rfc3339(),
        );
        SegmentInfo {
            name: name.into(),
            id: uuid::Uuid::new_v4().simple().to_string(),
            max_doc,
            codec: codec.to_string(),
            use_compound_file: false,
            files: BTreeSet::new(),
            diagnostics,
            size_in_bytes: 0,
        }
    }

    /// How the segment was produced (`flush` or `merge`).
    pub fn source(&self) -> Option<&str> {
        self.diagnostics.get(SOURCE_DIAGNOSTIC).map(String::as_str)
    }
}

fn first_gen() -> i64 {
    1
}

/// A segment as referenced by one manifest generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentCommitInfo {
    /// The immutable segment description.
    pub info: Arc<SegmentInfo>,
    /// Number of deleted documents as of `del_gen`.
    pub del_count: u32,
    /// Generation of the live-docs file, -1 if none.
    pub del_gen: i64,
    /// Generation of the doc-values update file, -1 if none.
    pub dv_gen: i64,
    #[serde(skip, default = "first_gen")]
    next_write_del_gen: i64,
    #[serde(skip, default = "first_gen")]
    next_write_dv_gen: i64,
    /// Generation of the deletes packet this segment was published with;
    /// packets with a smaller generation never apply to it.
    #[serde(skip)]
    pub buffered_deletes_gen: u64,
}

impl SegmentCommitInfo {
    /// Wrap a segment with the given deletion state.
    pub fn new(info: SegmentInfo, del_count: u32, del_gen: i64, dv_gen: i64) -> Self {
        let mut sci = SegmentCommitInfo {
            info: Arc::new(info),
            del_count,
            del_gen,
            dv_gen,
            next_write_del_gen: 1,
            next_write_dv_gen: 1,
            buffered_deletes_gen: 0,
        };
        sci.reset_write_gens();
        sci
    }

    /// Recompute the next write generations after loading from a manifest.
    pub fn reset_write_gens(&mut self) {
        self.next_write_del_gen = if self.del_gen == -1 { 1 } else { self.del_gen + 1 };
        self.next_write_dv_gen = if self.dv_gen == -1 { 1 } else { self.dv_gen + 1 };
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Live documents as of this commit.
    pub fn num_docs(&self) -> u32 {
        self.info.max_doc - self.del_count
    }

    /// Whether a live-docs file exists.
    pub fn has_deletions(&self) -> bool {
        self.del_gen != -1
    }

    /// Whether a doc-values update file exists.
    pub fn has_field_updates(&self) -> bool {
        self.dv_gen != -1
    }

    /// Generation the next live-docs file is written with.
    pub fn next_write_del_gen(&self) -> i64 {
        self.next_write_del_gen
    }

    /// Generation the next doc-values update file is written with.
    pub fn next_write_dv_gen(&self) -> i64 {
        self.next_write_dv_gen
    }

    /// A live-docs file of the next generation was written successfully.
    pub fn advance_del_gen(&mut self) {
        self.del_gen = self.next_write_del_gen;
        self.next_write_del_gen = self.del_gen + 1;
    }

    /// Writing the next live-docs generation failed; never reuse its name.
    pub fn advance_next_write_del_gen(&mut self) {
        self.next_write_del_gen += 1;
    }

    /// A doc-values update file of the next generation was written.
    pub fn advance_dv_gen(&mut self) {
        self.dv_gen = self.next_write_dv_gen;
        self.next_write_dv_gen = self.dv_gen + 1;
    }

    /// Writing the next doc-values generation failed.
    pub fn advance_next_write_dv_gen(&mut self) {
        self.next_write_dv_gen += 1;
    }

    /// Name of the current live-docs file.
    pub fn live_docs_file_name(&self) -> Option<String> {
        file_name_from_generation(&self.info.name, LIVE_DOCS_EXTENSION, self.del_gen)
    }

    /// Name of the current doc-values update file.
    pub fn dv_updates_file_name(&self) -> Option<String> {
        file_name_from_generation(&self.info.name, DV_UPDATES_EXTENSION, self.dv_gen)
    }

    /// Every file referenced by this commit of the segment.
    pub fn files(&self) -> BTreeSet<String> {
        let mut files = self.info.files.clone();
        files.extend(self.live_docs_file_name());
        files.extend(self.dv_updates_file_name());
        files
    }

    /// Segment bytes, generation files excluded.
    pub fn size_in_bytes(&self) -> u64 {
        self.info.size_in_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str) -> SegmentInfo {
        let mut info = SegmentInfo::new(name, 10, "default", "flush");
        info.files.insert(format!("{name}.seg"));
        info.files.insert(format!("{name}.si"));
        info
    }

    #[test]
    fn test_generation_files() {
        let mut sci = SegmentCommitInfo::new(info("_3"), 0, -1, -1);
        assert_eq!(sci.files().len(), 2);
        assert_eq!(sci.next_write_del_gen(), 1);

        sci.advance_del_gen();
        sci.advance_del_gen();
        assert_eq!(sci.live_docs_file_name().as_deref(), Some("_3_2.liv"));

        sci.advance_next_write_dv_gen();
        sci.advance_dv_gen();
        assert_eq!(sci.dv_updates_file_name().as_deref(), Some("_3_2.dvu"));
        assert!(sci.files().contains("_3_2.liv"));
        assert_eq!(sci.files().len(), 4);
    }

    #[test]
    fn test_write_gens_after_load() {
        let sci = SegmentCommitInfo::new(info("_a"), 4, 5, -1);
        let json = serde_json::to_string(&sci).unwrap();
        let mut loaded: SegmentCommitInfo = serde_json::from_str(&json).unwrap();
        loaded.reset_write_gens();
        assert_eq!(loaded.next_write_del_gen(), 6);
        assert_eq!(loaded.next_write_dv_gen(), 1);
        assert_eq!(loaded.num_docs(), 6);
        assert_eq!(loaded.info.source(), Some("flush"));
    }
}
