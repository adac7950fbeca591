//! The manifest: which segments make up an index.
//!
//! [`SegmentInfos`] is a plain value. The writer mutates its own copy and
//! clones it for every commit and every near-real-time reader, so a
//! published manifest never changes. A commit is two-phased: the manifest is
//! first written and synced as `pending_segments_N`, then renamed to
//! `segments_N`. Readers only ever look at `segments_N`, so a crash at any
//! point leaves the previous commit readable.

use std::collections::{BTreeMap, BTreeSet};
use std::io;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::error::{Result, TesseraError};
use crate::index::segment::SegmentCommitInfo;
use crate::index::{
    generation_from_segments_file_name, is_segments_file, pending_segments_file_name,
    segments_file_name,
};
use crate::storage::Storage;

const READ_RETRIES: usize = 3;

fn no_generation() -> i64 {
    -1
}

/// An ordered list of segments plus commit metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentInfos {
    /// Incremented on every change of the manifest.
    pub version: u64,
    /// Segment name counter.
    pub counter: u64,
    #[serde(skip, default = "no_generation")]
    generation: i64,
    #[serde(skip, default = "no_generation")]
    last_generation: i64,
    #[serde(skip)]
    pending_commit: bool,
    /// Opaque user data stored with the commit.
    pub user_data: BTreeMap<String, String>,
    segments: Vec<SegmentCommitInfo>,
}

impl Default for SegmentInfos {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentInfos {
    /// An empty manifest that has never been committed.
    pub fn new() -> Self {
        SegmentInfos {
            version: 0,
            counter: 0,
            generation: -1,
            last_generation: -1,
            pending_commit: false,
            user_data: BTreeMap::new(),
            segments: Vec::new(),
        }
    }

    /// Read the manifest stored in `file_name`.
    pub fn read_commit(storage: &dyn Storage, codec: &dyn Codec, file_name: &str) -> Result<Self> {
        let generation = generation_from_segments_file_name(file_name).ok_or_else(|| {
            TesseraError::illegal_argument(format!("\"{file_name}\" is not a segments file"))
        })?;
        let mut infos = codec.read_segment_infos(storage, file_name)?;
        infos.generation = generation;
        infos.last_generation = generation;
        for sci in &mut infos.segments {
            sci.reset_write_gens();
        }
        Ok(infos)
    }

    /// Read the newest readable commit. A newer manifest that cannot be read
    /// (a concurrent writer may be deleting it) falls back to older ones.
    pub fn read_latest(storage: &dyn Storage, codec: &dyn Codec) -> Result<Self> {
        let mut last_error = None;
        for attempt in 0..READ_RETRIES {
            let mut generations = commit_generations(&storage.list_files()?);
            if generations.is_empty() {
                return Err(TesseraError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    "no segments file found",
                )));
            }
            generations.sort_unstable_by(|a, b| b.cmp(a));
            for generation in generations {
                let Some(file_name) = segments_file_name(generation) else {
                    continue;
                };
                match Self::read_commit(storage, codec, &file_name) {
                    Ok(infos) => return Ok(infos),
                    Err(e) => {
                        warn!(target: "tessera::iw", "attempt {attempt}: cannot read {file_name}: {e}");
                        last_error = Some(e);
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| TesseraError::index("no readable segments file")))
    }

    /// Highest committed generation among `files`, -1 if none.
    pub fn last_commit_generation(files: &[String]) -> i64 {
        commit_generations(files).into_iter().max().unwrap_or(-1)
    }

    /// Name of the newest committed manifest among `files`.
    pub fn last_commit_segments_file_name(files: &[String]) -> Option<String> {
        segments_file_name(Self::last_commit_generation(files))
    }

    /// Generation of the last write (committed or prepared).
    pub fn generation(&self) -> i64 {
        self.generation
    }

    /// Generation of the last successful commit.
    pub fn last_generation(&self) -> i64 {
        self.last_generation
    }

    /// Manifest file of the last successful commit.
    pub fn segments_file_name(&self) -> Option<String> {
        segments_file_name(self.last_generation)
    }

    /// Take over generations from another copy of the manifest.
    pub fn update_generation(&mut self, other: &SegmentInfos) {
        self.generation = other.generation;
        self.last_generation = other.last_generation;
    }

    /// Continue after `other`: generation, version and name counter.
    pub fn update_generation_version_and_counter(&mut self, other: &SegmentInfos) {
        self.update_generation(other);
        self.version = self.version.max(other.version);
        self.counter = self.counter.max(other.counter);
    }

    /// Record a change.
    pub fn changed(&mut self) {
        self.version += 1;
    }

    /// Replace the user data.
    pub fn set_user_data(&mut self, user_data: BTreeMap<String, String>, increment_version: bool) {
        self.user_data = user_data;
        if increment_version {
            self.changed();
        }
    }

    /// Write and sync `pending_segments_N` for the next generation.
    pub fn prepare_commit(&mut self, storage: &dyn Storage, codec: &dyn Codec) -> Result<()> {
        if self.pending_commit {
            return Err(TesseraError::illegal_state("prepare_commit was already called"));
        }
        let next = if self.generation == -1 {
            1
        } else {
            self.generation + 1
        };
        let pending = pending_segments_file_name(next)
            .ok_or_else(|| TesseraError::illegal_state("invalid manifest generation"))?;
        self.generation = next;

        let result = codec
            .write_segment_infos(storage, self, &pending)
            .and_then(|_| storage.sync(std::slice::from_ref(&pending)));
        if let Err(e) = result {
            if let Err(delete_err) = storage.delete_file(&pending) {
                debug!(target: "tessera::iw", "cannot delete {pending}: {delete_err}");
            }
            return Err(e);
        }
        self.pending_commit = true;
        Ok(())
    }

    /// Publish the prepared manifest by renaming it to `segments_N`.
    /// Returns the committed file name.
    pub fn finish_commit(&mut self, storage: &dyn Storage) -> Result<String> {
        if !self.pending_commit {
            return Err(TesseraError::illegal_state("prepare_commit was not called"));
        }
        let (Some(pending), Some(dest)) = (
            pending_segments_file_name(self.generation),
            segments_file_name(self.generation),
        ) else {
            return Err(TesseraError::illegal_state("invalid manifest generation"));
        };
        self.pending_commit = false;

        let result = storage
            .rename_file(&pending, &dest)
            .and_then(|_| storage.sync_meta_data());
        if let Err(e) = result {
            for name in [&pending, &dest] {
                if storage.file_exists(name) {
                    let _ = storage.delete_file(name);
                }
            }
            return Err(e);
        }
        self.last_generation = self.generation;
        Ok(dest)
    }

    /// Discard a prepared manifest.
    pub fn rollback_commit(&mut self, storage: &dyn Storage) {
        if !self.pending_commit {
            return;
        }
        self.pending_commit = false;
        if let Some(pending) = pending_segments_file_name(self.generation) {
            if let Err(e) = storage.delete_file(&pending) {
                debug!(target: "tessera::iw", "cannot delete {pending} on rollback: {e}");
            }
        }
    }

    /// Whether a prepared manifest is waiting for `finish_commit`.
    pub fn has_pending_commit(&self) -> bool {
        self.pending_commit
    }

    /// Every file referenced by this manifest.
    pub fn files(&self, include_segments_file: bool) -> BTreeSet<String> {
        let mut files = BTreeSet::new();
        if include_segments_file {
            files.extend(self.segments_file_name());
        }
        for sci in &self.segments {
            files.extend(sci.files());
        }
        files
    }

    /// Segments in order.
    pub fn segments(&self) -> &[SegmentCommitInfo] {
        &self.segments
    }

    /// Iterate segments in order.
    pub fn iter(&self) -> std::slice::Iter<'_, SegmentCommitInfo> {
        self.segments.iter()
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the manifest has no segment.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Append a segment.
    pub fn add(&mut self, sci: SegmentCommitInfo) {
        self.segments.push(sci);
    }

    /// Remove a segment by name.
    pub fn remove(&mut self, name: &str) -> Option<SegmentCommitInfo> {
        let idx = self.index_of(name)?;
        Some(self.segments.remove(idx))
    }

    /// Drop every segment.
    pub fn clear(&mut self) {
        self.segments.clear();
    }

    /// Replace the segment list.
    pub fn replace(&mut self, segments: Vec<SegmentCommitInfo>) {
        self.segments = segments;
    }

    /// Look up a segment by name.
    pub fn find(&self, name: &str) -> Option<&SegmentCommitInfo> {
        self.segments.iter().find(|s| s.name() == name)
    }

    /// Look up a segment by name for update.
    pub fn find_mut(&mut self, name: &str) -> Option<&mut SegmentCommitInfo> {
        self.segments.iter_mut().find(|s| s.name() == name)
    }

    /// Position of a segment.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.segments.iter().position(|s| s.name() == name)
    }

    /// Sum of `max_doc` over all segments.
    pub fn total_max_doc(&self) -> u64 {
        self.segments.iter().map(|s| s.info.max_doc as u64).sum()
    }

    /// Replace the inputs of a merge by its output. The output takes the
    /// place of the first input; with `merged == None` the inputs are just
    /// dropped (the merged segment was fully deleted).
    pub fn apply_merge_changes(
        &mut self,
        inputs: &BTreeSet<String>,
        merged: Option<SegmentCommitInfo>,
    ) {
        let mut merged = merged;
        let mut result = Vec::with_capacity(self.segments.len());
        for sci in self.segments.drain(..) {
            if inputs.contains(sci.name()) {
                if let Some(out) = merged.take() {
                    result.push(out);
                }
            } else {
                result.push(sci);
            }
        }
        if let Some(out) = merged {
            // None of the inputs was still present.
            result.insert(0, out);
        }
        self.segments = result;
    }
}

fn commit_generations(files: &[String]) -> Vec<i64> {
    files
        .iter()
        .filter(|f| is_segments_file(f))
        .filter_map(|f| generation_from_segments_file_name(f))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DefaultCodec;
    use crate::index::segment::SegmentInfo;
    use crate::storage::{MemoryStorage, write_file};

    fn sci(name: &str) -> SegmentCommitInfo {
        let mut info = SegmentInfo::new(name, 4, "default", "flush");
        info.files.insert(format!("{name}.seg"));
        SegmentCommitInfo::new(info, 0, -1, -1)
    }

    fn commit(infos: &mut SegmentInfos, storage: &MemoryStorage) -> String {
        infos.prepare_commit(storage, &DefaultCodec::new()).unwrap();
        infos.finish_commit(storage).unwrap()
    }

    #[test]
    fn test_two_phase_commit() {
        let storage = MemoryStorage::new();
        let mut infos = SegmentInfos::new();
        infos.add(sci("_0"));
        infos.user_data.insert("k".into(), "v".into());

        infos.prepare_commit(&storage, &DefaultCodec::new()).unwrap();
        assert!(storage.file_exists("pending_segments_1"));
        assert!(SegmentInfos::read_latest(&storage, &DefaultCodec::new()).is_err());

        assert_eq!(infos.finish_commit(&storage).unwrap(), "segments_1");
        assert!(!storage.file_exists("pending_segments_1"));

        let read = SegmentInfos::read_latest(&storage, &DefaultCodec::new()).unwrap();
        assert_eq!(read.generation(), 1);
        assert_eq!(read.len(), 1);
        assert_eq!(read.user_data.get("k").map(String::as_str), Some("v"));
        assert!(read.files(true).contains("segments_1"));
    }

    #[test]
    fn test_rollback_commit_removes_pending() {
        let storage = MemoryStorage::new();
        let mut infos = SegmentInfos::new();
        infos.prepare_commit(&storage, &DefaultCodec::new()).unwrap();
        infos.rollback_commit(&storage);
        assert!(storage.list_files().unwrap().is_empty());
        assert!(infos.finish_commit(&storage).is_err());
    }

    #[test]
    fn test_read_latest_falls_back_on_corrupt_commit() {
        let storage = MemoryStorage::new();
        let mut infos = SegmentInfos::new();
        infos.add(sci("_0"));
        commit(&mut infos, &storage);
        infos.add(sci("_1"));
        commit(&mut infos, &storage);

        write_file(&storage, "segments_2", b"garbage").unwrap();
        let read = SegmentInfos::read_latest(&storage, &DefaultCodec::new()).unwrap();
        assert_eq!(read.generation(), 1);
        assert_eq!(read.len(), 1);
    }

    #[test]
    fn test_missing_index_is_not_found() {
        let storage = MemoryStorage::new();
        let err = SegmentInfos::read_latest(&storage, &DefaultCodec::new()).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(SegmentInfos::last_commit_generation(&[]), -1);
    }

    #[test]
    fn test_apply_merge_changes() {
        let mut infos = SegmentInfos::new();
        for name in ["_0", "_1", "_2", "_3"] {
            infos.add(sci(name));
        }
        let inputs = BTreeSet::from(["_1".to_string(), "_3".to_string()]);
        infos.apply_merge_changes(&inputs, Some(sci("_4")));
        let names: Vec<_> = infos.iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["_0", "_4", "_2"]);

        let inputs = BTreeSet::from(["_0".to_string()]);
        infos.apply_merge_changes(&inputs, None);
        assert_eq!(infos.len(), 2);
        assert!(infos.find("_0").is_none());
    }
}
