//! The segment-based index: writer, readers and everything in between.
//!
//! Documents added through an [`IndexWriter`] are buffered in per-thread
//! arenas, flushed into immutable segments, merged in the background and
//! made durable by writing a generation-numbered manifest (`segments_N`).
//! A [`DirectoryReader`] opens a point-in-time view of either a commit or
//! the writer's current state.
//!
//! # File names
//!
//! Every file of an index is named after a segment or a manifest:
//!
//! * `_3.seg`, `_3.si`, `_3.cfs`: data, description and compound file of
//!   segment `_3`.
//! * `_3_2.liv`, `_3_1.dvu`: live-docs and doc-values update generations.
//! * `segments_5`, `pending_segments_6`: committed and prepared manifests.
//! * `snapshots_2`: persisted snapshot pins.
//! * `write.lock`: held by the single open writer.

pub mod arena;
pub mod buffered_updates;
pub mod commit;
pub mod config;
pub mod delete_queue;
pub mod deleter;
pub mod deletion_policy;
pub mod directory_reader;
pub mod doc_values;
pub mod documents_writer;
pub mod field_infos;
pub mod flush_control;
pub mod flush_policy;
pub mod flush_ticket;
pub mod live_docs;
pub mod parallel_reader;
pub mod reader;
pub mod reader_pool;
pub mod segment;
pub mod segment_infos;
pub mod segment_reader;
pub mod similarity;
pub mod writer;

pub use commit::IndexCommit;
pub use config::{IndexWriterConfig, OpenMode};
pub use deletion_policy::{
    IndexDeletionPolicy, KeepOnlyLastCommitDeletionPolicy, NoDeletionPolicy,
    PersistentSnapshotDeletionPolicy, SnapshotDeletionPolicy,
};
pub use directory_reader::DirectoryReader;
pub use parallel_reader::{ParallelCompositeReader, ParallelLeafReader};
pub use reader::{CompositeReader, LeafReader, LeafReaderContext};
pub use segment::{SegmentCommitInfo, SegmentInfo};
pub use segment_infos::SegmentInfos;
pub use segment_reader::SegmentReader;
pub use similarity::{DefaultSimilarity, FieldInvertState, Similarity};
pub use writer::IndexWriter;

use crate::util::{from_radix36, to_radix36};

/// Prefix of committed manifests.
pub const SEGMENTS: &str = "segments";

/// Prefix of prepared, not yet committed manifests.
pub const PENDING_SEGMENTS: &str = "pending_segments";

/// Name of the writer lock file.
pub const WRITE_LOCK_NAME: &str = "write.lock";

/// Prefix of persisted snapshot files.
pub const SNAPSHOTS_PREFIX: &str = "snapshots";

/// Segment data (postings, stored fields, vectors, doc values, norms).
pub const SEGMENT_DATA_EXTENSION: &str = ".seg";

/// Segment description.
pub const SEGMENT_INFO_EXTENSION: &str = ".si";

/// Compound file packing the segment data.
pub const COMPOUND_FILE_EXTENSION: &str = ".cfs";

/// Live-docs generation file.
pub const LIVE_DOCS_EXTENSION: &str = ".liv";

/// Doc-values update generation file.
pub const DV_UPDATES_EXTENSION: &str = ".dvu";

/// Name of a generation file: `None` for generation -1, `base + ext` for
/// generation 0, otherwise `base_<gen in base 36>ext`.
pub fn file_name_from_generation(base: &str, ext: &str, generation: i64) -> Option<String> {
    match generation {
        -1 => None,
        0 => Some(format!("{base}{ext}")),
        g if g > 0 => Some(format!("{base}_{}{ext}", to_radix36(g as u64))),
        _ => None,
    }
}

/// `{segment}{ext}`.
pub fn segment_file_name(segment: &str, ext: &str) -> String {
    format!("{segment}{ext}")
}

/// Name of the committed manifest of `generation`.
pub fn segments_file_name(generation: i64) -> Option<String> {
    file_name_from_generation(SEGMENTS, "", generation)
}

/// Name of the prepared manifest of `generation`.
pub fn pending_segments_file_name(generation: i64) -> Option<String> {
    file_name_from_generation(PENDING_SEGMENTS, "", generation)
}

/// Generation of a `segments_N` or `pending_segments_N` file.
pub fn generation_from_segments_file_name(file_name: &str) -> Option<i64> {
    let rest = file_name
        .strip_prefix(PENDING_SEGMENTS)
        .or_else(|| file_name.strip_prefix(SEGMENTS))?;
    match rest {
        "" => Some(0),
        _ => rest
            .strip_prefix('_')
            .and_then(from_radix36)
            .map(|g| g as i64),
    }
}

/// Whether `file_name` is a committed manifest.
pub fn is_segments_file(file_name: &str) -> bool {
    file_name.starts_with(SEGMENTS) && generation_from_segments_file_name(file_name).is_some()
}

/// Segment name of a per-segment file: `_3_2.liv` and `_3.seg` both give
/// `_3`.
pub fn parse_segment_name(file_name: &str) -> &str {
    let end = file_name[1.min(file_name.len())..]
        .find(['.', '_'])
        .map(|i| i + 1)
        .unwrap_or(file_name.len());
    &file_name[..end]
}

/// Whether the writer owns `file_name`: segment files, manifests and
/// pending manifests. Snapshot files and the write lock are not included.
pub fn is_index_file(file_name: &str) -> bool {
    file_name.starts_with('_')
        || file_name.starts_with(&format!("{SEGMENTS}_"))
        || file_name.starts_with(PENDING_SEGMENTS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_from_generation() {
        assert_eq!(file_name_from_generation("_3", ".liv", -1), None);
        assert_eq!(
            file_name_from_generation("_3", ".liv", 0).as_deref(),
            Some("_3.liv")
        );
        assert_eq!(
            file_name_from_generation("_3", ".liv", 37).as_deref(),
            Some("_3_11.liv")
        );
        assert_eq!(segments_file_name(36).as_deref(), Some("segments_10"));
        assert_eq!(
            pending_segments_file_name(2).as_deref(),
            Some("pending_segments_2")
        );
    }

    #[test]
    fn test_segments_generation_parsing() {
        assert_eq!(generation_from_segments_file_name("segments_a"), Some(10));
        assert_eq!(
            generation_from_segments_file_name("pending_segments_2"),
            Some(2)
        );
        assert_eq!(generation_from_segments_file_name("_0.seg"), None);
        assert!(is_segments_file("segments_3"));
        assert!(!is_segments_file("pending_segments_3"));
        assert!(!is_segments_file("segments_x!"));
    }

    #[test]
    fn test_parse_segment_name() {
        assert_eq!(parse_segment_name("_3.seg"), "_3");
        assert_eq!(parse_segment_name("_3_2.liv"), "_3");
        assert_eq!(parse_segment_name("_ab.cfs"), "_ab");
    }

    #[test]
    fn test_is_index_file() {
        assert!(is_index_file("_0.si"));
        assert!(is_index_file("segments_1"));
        assert!(is_index_file("pending_segments_1"));
        assert!(!is_index_file("write.lock"));
        assert!(!is_index_file("snapshots_0"));
    }
}
