//! Log-scale merging.
//!
//! Segments are grouped into levels by the logarithm (base `merge_factor`)
//! of their size; whenever a level holds `merge_factor` adjacent segments
//! they are merged into one segment of the next level. Size is either the
//! document count ([`LogSizeMeasure::Docs`]) or the byte size
//! ([`LogSizeMeasure::Bytes`]).

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::index::segment::SegmentCommitInfo;
use crate::index::segment_infos::SegmentInfos;
use crate::merge::policy::{
    DEFAULT_NO_CFS_RATIO, MergeContext, MergePolicy, MergePolicyBase, MergeSpecification,
    MergeTrigger, OneMerge,
};

/// Segments within this span of the largest segment's level are on the
/// same level.
pub const LEVEL_LOG_SPAN: f64 = 0.75;

/// How segment size is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSizeMeasure {
    /// Number of documents.
    Docs,
    /// Bytes on disk.
    Bytes,
}

/// Tunables of [`LogMergePolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogMergePolicyConfig {
    /// Size measure.
    pub measure: LogSizeMeasure,
    /// Segments per level before they are merged.
    pub merge_factor: usize,
    /// Sizes below this are all on the lowest level.
    pub min_merge_size: u64,
    /// Segments at or above this size are left alone by natural merges.
    pub max_merge_size: u64,
    /// Segments above this size are left alone by forced merges.
    pub max_merge_size_for_forced_merge: u64,
    /// Segments with this many documents are left alone by natural merges.
    pub max_merge_docs: u32,
    /// Subtract deleted documents when measuring size.
    pub calibrate_size_by_deletes: bool,
    /// See [`MergePolicyBase::no_cfs_ratio`].
    pub no_cfs_ratio: f64,
}

impl Default for LogMergePolicyConfig {
    fn default() -> Self {
        Self::docs()
    }
}

impl LogMergePolicyConfig {
    /// Defaults for measuring by document count.
    pub fn docs() -> Self {
        LogMergePolicyConfig {
            measure: LogSizeMeasure::Docs,
            merge_factor: 10,
            min_merge_size: 1000,
            max_merge_size: u64::MAX,
            max_merge_size_for_forced_merge: u64::MAX,
            max_merge_docs: u32::MAX,
            calibrate_size_by_deletes: true,
            no_cfs_ratio: DEFAULT_NO_CFS_RATIO,
        }
    }

    /// Defaults for measuring by bytes.
    pub fn bytes() -> Self {
        LogMergePolicyConfig {
            measure: LogSizeMeasure::Bytes,
            min_merge_size: (1.6 * 1024.0 * 1024.0) as u64,
            max_merge_size: 2048 * 1024 * 1024,
            ..Self::docs()
        }
    }
}

/// Merges segments of roughly equal size in groups of `merge_factor`.
#[derive(Debug, Clone)]
pub struct LogMergePolicy {
    config: LogMergePolicyConfig,
    base: MergePolicyBase,
}

impl Default for LogMergePolicy {
    fn default() -> Self {
        Self::new(LogMergePolicyConfig::default())
    }
}

impl LogMergePolicy {
    /// A policy with the given tunables.
    pub fn new(config: LogMergePolicyConfig) -> Self {
        let base = MergePolicyBase::new(config.no_cfs_ratio);
        LogMergePolicy { config, base }
    }

    /// Measures by document count.
    pub fn doc_policy() -> Self {
        Self::new(LogMergePolicyConfig::docs())
    }

    /// Measures by bytes.
    pub fn byte_size_policy() -> Self {
        Self::new(LogMergePolicyConfig::bytes())
    }

    /// The tunables.
    pub fn config(&self) -> &LogMergePolicyConfig {
        &self.config
    }

    fn size(&self, info: &SegmentCommitInfo, ctx: &dyn MergeContext) -> u64 {
        match self.config.measure {
            LogSizeMeasure::Docs => self.size_docs(info, ctx),
            LogSizeMeasure::Bytes => {
                if self.config.calibrate_size_by_deletes {
                    self.base.size(info, ctx)
                } else {
                    info.size_in_bytes()
                }
            }
        }
    }

    fn size_docs(&self, info: &SegmentCommitInfo, ctx: &dyn MergeContext) -> u64 {
        let max_doc = info.info.max_doc as u64;
        if self.config.calibrate_size_by_deletes {
            max_doc - (ctx.num_deletes_to_merge(info) as u64).min(max_doc)
        } else {
            max_doc
        }
    }

    fn is_merged(&self, info: &SegmentCommitInfo, ctx: &dyn MergeContext) -> bool {
        self.base.is_merged(info, ctx)
    }

    fn merge_of(segments: &[&SegmentCommitInfo]) -> OneMerge {
        OneMerge::new(segments.iter().map(|s| (*s).clone()).collect())
    }

    fn forced_merges_max_num_segments(
        &self,
        segments: &[&SegmentCommitInfo],
        max_num_segments: usize,
        mut last: usize,
        ctx: &dyn MergeContext,
    ) -> MergeSpecification {
        let merge_factor = self.config.merge_factor;
        let mut spec = MergeSpecification::new();

        // Full merges first, so they can run concurrently.
        while last + 1 >= max_num_segments + merge_factor {
            spec.add(Self::merge_of(&segments[last - merge_factor..last]));
            last -= merge_factor;
        }

        if spec.is_empty() {
            if max_num_segments == 1 {
                if last > 1 || !self.is_merged(segments[0], ctx) {
                    spec.add(Self::merge_of(&segments[..last]));
                }
            } else if last > max_num_segments {
                // A partial merge of adjacent segments; pick the window
                // whose size best matches its left neighbour.
                let final_merge_size = last - max_num_segments + 1;
                let mut best_start = 0;
                let mut best_size = 0;
                for i in 0..=(last - final_merge_size) {
                    let sum: u64 = segments[i..i + final_merge_size]
                        .iter()
                        .map(|s| self.size(s, ctx))
                        .sum();
                    if i == 0
                        || (sum < 2 * self.size(segments[i - 1], ctx) && sum < best_size)
                    {
                        best_start = i;
                        best_size = sum;
                    }
                }
                spec.add(Self::merge_of(
                    &segments[best_start..best_start + final_merge_size],
                ));
            }
        }
        spec
    }

    fn forced_merges_size_limit(
        &self,
        segments: &[&SegmentCommitInfo],
        last: usize,
        ctx: &dyn MergeContext,
    ) -> MergeSpecification {
        let mut spec = MergeSpecification::new();
        let limit = self.config.max_merge_size_for_forced_merge;
        let mut end = last;
        for start in (0..last).rev() {
            let info = segments[start];
            let too_large = self.size(info, ctx) > limit
                || self.size_docs(info, ctx) > self.config.max_merge_docs as u64;
            if too_large {
                // Skip it; merge what lies after it unless that is a single
                // segment with nothing to reclaim.
                let right = end - start - 1;
                if right > 1 || (right == 1 && !self.is_merged(segments[start + 1], ctx)) {
                    spec.add(Self::merge_of(&segments[start + 1..end]));
                }
                end = start;
            } else if end - start == self.config.merge_factor {
                spec.add(Self::merge_of(&segments[start..end]));
                end = start;
            }
        }
        if end > 0 && (end > 1 || !self.is_merged(segments[0], ctx)) {
            spec.add(Self::merge_of(&segments[..end]));
        }
        spec
    }
}

impl MergePolicy for LogMergePolicy {
    fn find_merges(
        &self,
        trigger: MergeTrigger,
        infos: &SegmentInfos,
        ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification> {
        let segments: Vec<&SegmentCommitInfo> = infos.iter().collect();
        let num_segments = segments.len();
        let merge_factor = self.config.merge_factor.max(2);
        let norm = (merge_factor as f64).ln();
        let merging = ctx.merging_segments();

        let levels: Vec<f64> = segments
            .iter()
            .map(|s| (self.size(s, ctx).max(1) as f64).ln() / norm)
            .collect();
        let level_floor = if self.config.min_merge_size == 0 {
            0.0
        } else {
            (self.config.min_merge_size as f64).ln() / norm
        };

        let mut spec = MergeSpecification::new();
        let mut start = 0;
        while start < num_segments {
            let max_level = levels[start..]
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max);

            let level_bottom = if max_level <= level_floor {
                // Every remaining segment is on the lowest level.
                -1.0
            } else {
                let bottom = max_level - LEVEL_LOG_SPAN;
                if bottom < level_floor && max_level >= level_floor {
                    level_floor
                } else {
                    bottom
                }
            };

            let mut upto = num_segments - 1;
            while upto >= start {
                if levels[upto] >= level_bottom {
                    break;
                }
                if upto == 0 {
                    break;
                }
                upto -= 1;
            }
            debug!(
                target: "tessera::mp",
                "level {level_bottom:.3} to {max_level:.3}: {} segments",
                upto + 1 - start
            );

            let mut window_start = start;
            let mut end = start + merge_factor;
            while end <= upto + 1 {
                let window = &segments[window_start..end];
                let any_merging = window.iter().any(|s| merging.contains(s.name()));
                let any_too_large = window.iter().any(|s| {
                    self.size(s, ctx) >= self.config.max_merge_size
                        || self.size_docs(s, ctx) >= self.config.max_merge_docs as u64
                });
                if !any_merging && !any_too_large {
                    debug!(
                        target: "tessera::mp",
                        "{trigger}: add merge of segments {window_start} to {}",
                        end - 1
                    );
                    spec.add(Self::merge_of(window));
                }
                window_start = end;
                end = window_start + merge_factor;
            }
            start = upto + 1;
        }
        spec.non_empty()
    }

    fn find_forced_merges(
        &self,
        infos: &SegmentInfos,
        max_segment_count: usize,
        segments_to_merge: &BTreeMap<String, bool>,
        ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification> {
        let max_segment_count = max_segment_count.max(1);
        let merging = ctx.merging_segments();
        let segments: Vec<&SegmentCommitInfo> = infos
            .iter()
            .filter(|s| !merging.contains(s.name()))
            .collect();

        let considered = segments
            .iter()
            .filter(|s| segments_to_merge.contains_key(s.name()))
            .count();
        let already_merged = considered <= max_segment_count
            && (considered != 1
                || segments
                    .iter()
                    .filter(|s| segments_to_merge.contains_key(s.name()))
                    .all(|s| self.is_merged(s, ctx)));
        if already_merged {
            debug!(target: "tessera::mp", "already merged to {max_segment_count} segments");
            return None;
        }

        // Only segments up to the last one taking part are considered.
        let last = segments
            .iter()
            .rposition(|s| segments_to_merge.contains_key(s.name()))
            .map(|i| i + 1)?;

        if max_segment_count == 1 && last == 1 && self.is_merged(segments[0], ctx) {
            return None;
        }

        let any_too_large = segments[..last].iter().any(|s| {
            self.size(s, ctx) > self.config.max_merge_size_for_forced_merge
                || self.size_docs(s, ctx) > self.config.max_merge_docs as u64
        });
        let spec = if any_too_large {
            self.forced_merges_size_limit(&segments, last, ctx)
        } else {
            self.forced_merges_max_num_segments(&segments, max_segment_count, last, ctx)
        };
        spec.non_empty()
    }

    fn find_forced_deletes_merges(
        &self,
        infos: &SegmentInfos,
        ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification> {
        let segments: Vec<&SegmentCommitInfo> = infos.iter().collect();
        let merging = ctx.merging_segments();
        let merge_factor = self.config.merge_factor.max(2);
        let mut spec = MergeSpecification::new();
        let mut first_with_deletions: Option<usize> = None;

        for (i, info) in segments.iter().enumerate() {
            let has_deletes =
                ctx.num_deletes_to_merge(info) > 0 && !merging.contains(info.name());
            match (has_deletes, first_with_deletions) {
                (true, None) => first_with_deletions = Some(i),
                (true, Some(first)) if i - first == merge_factor => {
                    spec.add(Self::merge_of(&segments[first..i]));
                    first_with_deletions = Some(i);
                }
                (false, Some(first)) => {
                    spec.add(Self::merge_of(&segments[first..i]));
                    first_with_deletions = None;
                }
                _ => {}
            }
        }
        if let Some(first) = first_with_deletions {
            spec.add(Self::merge_of(&segments[first..]));
        }
        spec.non_empty()
    }

    fn use_compound_file(
        &self,
        infos: &SegmentInfos,
        merged: &SegmentCommitInfo,
        ctx: &dyn MergeContext,
    ) -> bool {
        self.base.use_compound_file(infos, merged, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::policy::tests::{TestContext, segment};

    fn infos(sizes: &[u32]) -> SegmentInfos {
        let mut infos = SegmentInfos::new();
        for (i, docs) in sizes.iter().enumerate() {
            infos.add(segment(&format!("_{i}"), *docs, *docs as u64 * 100));
        }
        infos
    }

    fn policy(merge_factor: usize) -> LogMergePolicy {
        LogMergePolicy::new(LogMergePolicyConfig {
            merge_factor,
            min_merge_size: 10,
            ..LogMergePolicyConfig::docs()
        })
    }

    fn names(merge: &OneMerge) -> Vec<String> {
        merge.segments.iter().map(|s| s.name().to_string()).collect()
    }

    #[test]
    fn test_merges_full_level() {
        let infos = infos(&[5, 5, 5, 5]);
        let ctx = TestContext::default();
        let spec = policy(3)
            .find_merges(MergeTrigger::SegmentFlush, &infos, &ctx)
            .unwrap();
        assert_eq!(spec.len(), 1);
        assert_eq!(names(&spec.merges[0]), vec!["_0", "_1", "_2"]);

        assert!(policy(10)
            .find_merges(MergeTrigger::SegmentFlush, &infos, &ctx)
            .is_none());
    }

    #[test]
    fn test_large_segment_not_merged_with_small_ones() {
        let infos = infos(&[10000, 5, 5]);
        let ctx = TestContext::default();
        assert!(policy(3)
            .find_merges(MergeTrigger::SegmentFlush, &infos, &ctx)
            .is_none());

        let infos = self::infos(&[10000, 5, 5, 5]);
        let spec = policy(3)
            .find_merges(MergeTrigger::SegmentFlush, &infos, &ctx)
            .unwrap();
        assert_eq!(names(&spec.merges[0]), vec!["_1", "_2", "_3"]);
    }

    #[test]
    fn test_skips_merging_segments() {
        let infos = infos(&[5, 5, 5]);
        let mut ctx = TestContext::default();
        ctx.merging.insert("_1".into());
        assert!(policy(3)
            .find_merges(MergeTrigger::SegmentFlush, &infos, &ctx)
            .is_none());
    }

    #[test]
    fn test_max_merge_docs_excludes_segment() {
        let infos = infos(&[5, 5, 5]);
        let ctx = TestContext::default();
        let policy = LogMergePolicy::new(LogMergePolicyConfig {
            merge_factor: 3,
            max_merge_docs: 5,
            ..LogMergePolicyConfig::docs()
        });
        assert!(policy
            .find_merges(MergeTrigger::SegmentFlush, &infos, &ctx)
            .is_none());
    }

    #[test]
    fn test_forced_merge_to_one() {
        let infos = infos(&[50, 20, 5, 5]);
        let ctx = TestContext::default();
        let all: BTreeMap<String, bool> = infos.iter().map(|s| (s.name().to_string(), true)).collect();
        let spec = policy(10).find_forced_merges(&infos, 1, &all, &ctx).unwrap();
        assert_eq!(spec.len(), 1);
        assert_eq!(spec.merges[0].segments.len(), 4);

        let single = self::infos(&[50]);
        let all: BTreeMap<String, bool> = single.iter().map(|s| (s.name().to_string(), true)).collect();
        assert!(policy(10).find_forced_merges(&single, 1, &all, &ctx).is_none());
    }

    #[test]
    fn test_forced_merge_full_windows_first() {
        let infos = infos(&[5; 7]);
        let ctx = TestContext::default();
        let all: BTreeMap<String, bool> = infos.iter().map(|s| (s.name().to_string(), true)).collect();
        let spec = policy(3).find_forced_merges(&infos, 1, &all, &ctx).unwrap();
        assert_eq!(spec.len(), 2);
        assert_eq!(names(&spec.merges[0]), vec!["_4", "_5", "_6"]);
        assert_eq!(names(&spec.merges[1]), vec!["_1", "_2", "_3"]);
    }

    #[test]
    fn test_forced_merge_partial_window() {
        let infos = infos(&[5; 4]);
        let ctx = TestContext::default();
        let all: BTreeMap<String, bool> = infos.iter().map(|s| (s.name().to_string(), true)).collect();
        let spec = policy(10).find_forced_merges(&infos, 2, &all, &ctx).unwrap();
        assert_eq!(spec.len(), 1);
        assert_eq!(spec.merges[0].segments.len(), 3);
        assert!(policy(10).find_forced_merges(&infos, 4, &all, &ctx).is_none());
    }

    #[test]
    fn test_forced_deletes_merges_groups_adjacent() {
        let infos = infos(&[5, 5, 5, 5]);
        let mut ctx = TestContext::default();
        ctx.deletes.insert("_0".into(), 1);
        ctx.deletes.insert("_1".into(), 2);
        ctx.deletes.insert("_3".into(), 1);
        let spec = policy(10).find_forced_deletes_merges(&infos, &ctx).unwrap();
        assert_eq!(spec.len(), 2);
        assert_eq!(names(&spec.merges[0]), vec!["_0", "_1"]);
        assert_eq!(names(&spec.merges[1]), vec!["_3"]);
    }

    #[test]
    fn test_config_from_json() {
        let config: LogMergePolicyConfig =
            serde_json::from_str(r#"{"measure":"bytes","merge_factor":4}"#).unwrap();
        assert_eq!(config.measure, LogSizeMeasure::Bytes);
        assert_eq!(config.merge_factor, 4);
        assert_eq!(config.min_merge_size, 1000);
    }
}
