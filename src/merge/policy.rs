//! The merge policy contract.
//!
//! A policy is consulted whenever the manifest changes. It never runs a
//! merge itself: it returns a [`MergeSpecification`] of [`OneMerge`]s that
//! the writer registers and hands to the merge scheduler.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, TesseraError};
use crate::index::segment::SegmentCommitInfo;
use crate::index::segment_infos::SegmentInfos;

/// Default share of the index size below which merged segments are
/// packed into a compound file.
pub const DEFAULT_NO_CFS_RATIO: f64 = 0.1;

/// What caused the policy to be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeTrigger {
    /// An arena was flushed.
    SegmentFlush,
    /// A full flush (commit or near-real-time reader).
    FullFlush,
    /// The application asked for merges.
    Explicit,
    /// A merge finished.
    MergeFinished,
    /// The writer is closing.
    Closing,
    /// A commit.
    Commit,
}

impl fmt::Display for MergeTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeTrigger::SegmentFlush => "segment_flush",
            MergeTrigger::FullFlush => "full_flush",
            MergeTrigger::Explicit => "explicit",
            MergeTrigger::MergeFinished => "merge_finished",
            MergeTrigger::Closing => "closing",
            MergeTrigger::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// A single merge: the segments it consumes plus its abort flag.
#[derive(Debug)]
pub struct OneMerge {
    /// Input segments in manifest order.
    pub segments: Vec<SegmentCommitInfo>,
    /// Target segment count of the forced merge this belongs to.
    pub max_num_segments: Option<usize>,
    /// Sum of `max_doc` over the inputs.
    pub total_max_doc: u64,
    pub(crate) id: u64,
    aborted: Arc<AtomicBool>,
}

impl OneMerge {
    /// A merge of `segments`.
    pub fn new(segments: Vec<SegmentCommitInfo>) -> Self {
        let total_max_doc = segments.iter().map(|s| s.info.max_doc as u64).sum();
        OneMerge {
            segments,
            max_num_segments: None,
            total_max_doc,
            id: 0,
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Id assigned on registration with the writer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Names of the input segments.
    pub fn segment_names(&self) -> BTreeSet<String> {
        self.segments.iter().map(|s| s.name().to_string()).collect()
    }

    /// Total bytes of the inputs.
    pub fn total_bytes_size(&self) -> u64 {
        self.segments.iter().map(SegmentCommitInfo::size_in_bytes).sum()
    }

    /// Ask the merge to stop at its next check.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    /// Whether the merge was asked to stop.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// The flag merge workers poll.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.aborted)
    }

    /// Fail with `MergeAborted` once aborted.
    pub fn check_aborted(&self) -> Result<()> {
        if self.is_aborted() {
            return Err(TesseraError::merge_aborted(self.seg_string()));
        }
        Ok(())
    }

    /// `_0(12) _1(3)`: names with live doc counts.
    pub fn seg_string(&self) -> String {
        self.segments
            .iter()
            .map(|s| format!("{}({})", s.name(), s.num_docs()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The merges a policy proposes.
#[derive(Debug, Default)]
pub struct MergeSpecification {
    /// Proposed merges, run in any order and concurrently.
    pub merges: Vec<OneMerge>,
}

impl MergeSpecification {
    /// An empty specification.
    pub fn new() -> Self {
        Self::default()
    }

    /// Propose a merge.
    pub fn add(&mut self, merge: OneMerge) {
        self.merges.push(merge);
    }

    /// Whether nothing was proposed.
    pub fn is_empty(&self) -> bool {
        self.merges.is_empty()
    }

    /// Number of proposed merges.
    pub fn len(&self) -> usize {
        self.merges.len()
    }

    /// `None` for an empty specification.
    pub fn non_empty(self) -> Option<Self> {
        if self.is_empty() { None } else { Some(self) }
    }
}

/// What a policy may ask the writer while deciding.
pub trait MergeContext {
    /// Deleted docs a merge of `info` would reclaim, unwritten deletes
    /// included.
    fn num_deletes_to_merge(&self, info: &SegmentCommitInfo) -> u32;

    /// Segments registered with a running or pending merge.
    fn merging_segments(&self) -> &BTreeSet<String>;
}

/// Chooses merges.
pub trait MergePolicy: Debug + Send + Sync {
    /// Natural merges after a manifest change.
    fn find_merges(
        &self,
        trigger: MergeTrigger,
        infos: &SegmentInfos,
        ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification>;

    /// Merges bringing the index down to at most `max_segment_count`
    /// segments. `segments_to_merge` maps every segment taking part in the
    /// forced merge to whether it existed when the forced merge started.
    fn find_forced_merges(
        &self,
        infos: &SegmentInfos,
        max_segment_count: usize,
        segments_to_merge: &BTreeMap<String, bool>,
        ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification>;

    /// Merges reclaiming deleted documents.
    fn find_forced_deletes_merges(
        &self,
        infos: &SegmentInfos,
        ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification>;

    /// Whether a merged segment should be packed into a compound file.
    fn use_compound_file(
        &self,
        infos: &SegmentInfos,
        merged: &SegmentCommitInfo,
        ctx: &dyn MergeContext,
    ) -> bool;
}

/// Helpers shared by the policies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergePolicyBase {
    /// Merged segments larger than this share of the index are written
    /// without a compound file.
    pub no_cfs_ratio: f64,
    /// Merged segments above this size never use a compound file.
    pub max_cfs_segment_size: u64,
}

impl Default for MergePolicyBase {
    fn default() -> Self {
        MergePolicyBase {
            no_cfs_ratio: DEFAULT_NO_CFS_RATIO,
            max_cfs_segment_size: u64::MAX,
        }
    }
}

impl MergePolicyBase {
    /// Helpers with the given no-CFS ratio.
    pub fn new(no_cfs_ratio: f64) -> Self {
        MergePolicyBase {
            no_cfs_ratio,
            ..Default::default()
        }
    }

    /// Byte size of `info` scaled down by its deleted share.
    pub fn size(&self, info: &SegmentCommitInfo, ctx: &dyn MergeContext) -> u64 {
        let bytes = info.size_in_bytes();
        let max_doc = info.info.max_doc;
        if max_doc == 0 {
            return bytes;
        }
        let del_count = ctx.num_deletes_to_merge(info).min(max_doc);
        let del_ratio = del_count as f64 / max_doc as f64;
        (bytes as f64 * (1.0 - del_ratio)) as u64
    }

    /// Whether `info` has nothing a merge would clean up.
    pub fn is_merged(&self, info: &SegmentCommitInfo, ctx: &dyn MergeContext) -> bool {
        ctx.num_deletes_to_merge(info) == 0 && !info.has_field_updates()
    }

    /// Compound-file decision by size relative to the whole index.
    pub fn use_compound_file(
        &self,
        infos: &SegmentInfos,
        merged: &SegmentCommitInfo,
        ctx: &dyn MergeContext,
    ) -> bool {
        if self.no_cfs_ratio <= 0.0 {
            return false;
        }
        let merged_size = self.size(merged, ctx);
        if merged_size > self.max_cfs_segment_size {
            return false;
        }
        if self.no_cfs_ratio >= 1.0 {
            return true;
        }
        let total: u64 = infos.iter().map(|info| self.size(info, ctx)).sum();
        merged_size as f64 <= self.no_cfs_ratio * total as f64
    }
}

/// Never merges.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMergePolicy;

impl NoMergePolicy {
    /// Create the policy.
    pub fn new() -> Self {
        Self
    }
}

impl MergePolicy for NoMergePolicy {
    fn find_merges(
        &self,
        _trigger: MergeTrigger,
        _infos: &SegmentInfos,
        _ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification> {
        None
    }

    fn find_forced_merges(
        &self,
        _infos: &SegmentInfos,
        _max_segment_count: usize,
        _segments_to_merge: &BTreeMap<String, bool>,
        _ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification> {
        None
    }

    fn find_forced_deletes_merges(
        &self,
        _infos: &SegmentInfos,
        _ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification> {
        None
    }

    fn use_compound_file(
        &self,
        _infos: &SegmentInfos,
        merged: &SegmentCommitInfo,
        _ctx: &dyn MergeContext,
    ) -> bool {
        merged.info.use_compound_file
    }
}
