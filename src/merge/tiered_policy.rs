//! Tiered merging.
//!
//! Computes how many segments the index may have given its size (a budget
//! of `segments_per_tier` segments per tier, each tier `max_merge_at_once`
//! times larger than the one below) and, while the index is over budget,
//! picks the cheapest merge among windows of similarly sized segments.
//! Merges are scored by skew (how unbalanced the inputs are), total size and
//! the share of deletes they reclaim; lower is better. Segments need not be
//! adjacent.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::index::segment::SegmentCommitInfo;
use crate::index::segment_infos::SegmentInfos;
use crate::merge::policy::{
    DEFAULT_NO_CFS_RATIO, MergeContext, MergePolicy, MergePolicyBase, MergeSpecification,
    MergeTrigger, OneMerge,
};

const MB: f64 = 1024.0 * 1024.0;

/// Tunables of [`TieredMergePolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieredMergePolicyConfig {
    /// Most segments merged at once by natural merges.
    pub max_merge_at_once: usize,
    /// Most segments merged at once by forced merges.
    pub max_merge_at_once_explicit: usize,
    /// Upper bound of a merged segment's size.
    pub max_merged_segment_mb: f64,
    /// Smaller segments are treated as this size.
    pub floor_segment_mb: f64,
    /// Segments allowed per tier.
    pub segments_per_tier: f64,
    /// Segments with a smaller share of deletes are left alone by
    /// `force_merge_deletes`.
    pub force_merge_deletes_pct_allowed: f64,
    /// How strongly reclaiming deletes is favoured.
    pub reclaim_deletes_weight: f64,
    /// See [`MergePolicyBase::no_cfs_ratio`].
    pub no_cfs_ratio: f64,
}

impl Default for TieredMergePolicyConfig {
    fn default() -> Self {
        TieredMergePolicyConfig {
            max_merge_at_once: 10,
            max_merge_at_once_explicit: 30,
            max_merged_segment_mb: 5.0 * 1024.0,
            floor_segment_mb: 2.0,
            segments_per_tier: 10.0,
            force_merge_deletes_pct_allowed: 10.0,
            reclaim_deletes_weight: 2.0,
            no_cfs_ratio: DEFAULT_NO_CFS_RATIO,
        }
    }
}

/// Merges segments of similar size, budgeting segments per tier.
#[derive(Debug, Clone)]
pub struct TieredMergePolicy {
    config: TieredMergePolicyConfig,
    base: MergePolicyBase,
    max_merged_segment_bytes: u64,
    floor_segment_bytes: u64,
}

impl Default for TieredMergePolicy {
    fn default() -> Self {
        Self::new(TieredMergePolicyConfig::default())
    }
}

impl TieredMergePolicy {
    /// A policy with the given tunables.
    pub fn new(config: TieredMergePolicyConfig) -> Self {
        TieredMergePolicy {
            base: MergePolicyBase::new(config.no_cfs_ratio),
            max_merged_segment_bytes: (config.max_merged_segment_mb * MB) as u64,
            floor_segment_bytes: (config.floor_segment_mb * MB) as u64,
            config,
        }
    }

    /// The tunables.
    pub fn config(&self) -> &TieredMergePolicyConfig {
        &self.config
    }

    fn size(&self, info: &SegmentCommitInfo, ctx: &dyn MergeContext) -> u64 {
        self.base.size(info, ctx)
    }

    fn floor_size(&self, bytes: u64) -> u64 {
        bytes.max(self.floor_segment_bytes)
    }

    /// Segments sorted by decreasing size.
    fn sorted_by_size<'a>(
        &self,
        segments: impl Iterator<Item = &'a SegmentCommitInfo>,
        ctx: &dyn MergeContext,
    ) -> Vec<(&'a SegmentCommitInfo, u64)> {
        let mut sorted: Vec<_> = segments.map(|s| (s, self.size(s, ctx))).collect();
        sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.name().cmp(b.0.name())));
        sorted
    }

    fn score(&self, candidate: &[(&SegmentCommitInfo, u64)], hit_too_large: bool) -> f64 {
        let before: u64 = candidate.iter().map(|(s, _)| s.size_in_bytes()).sum();
        let after: u64 = candidate.iter().map(|(_, size)| *size).sum();
        let after_floored: u64 = candidate.iter().map(|(_, size)| self.floor_size(*size)).sum();

        // Merging a few large segments with small ones is cheap when the
        // result would be too large anyway.
        let skew = if hit_too_large {
            1.0 / self.config.max_merge_at_once as f64
        } else {
            self.floor_size(candidate[0].1) as f64 / after_floored.max(1) as f64
        };

        let mut score = skew * (after.max(1) as f64).powf(0.05);
        let non_del_ratio = if before == 0 {
            1.0
        } else {
            after as f64 / before as f64
        };
        score *= non_del_ratio.powf(self.config.reclaim_deletes_weight);
        score
    }

    fn allowed_segment_count(&self, total_bytes: u64, min_segment_bytes: u64) -> usize {
        let per_tier = self.config.segments_per_tier;
        let mut level_size = self.floor_size(min_segment_bytes) as f64;
        let mut bytes_left = total_bytes as f64;
        let mut allowed = 0.0;
        loop {
            let count = bytes_left / level_size;
            if count < per_tier {
                allowed += count.ceil();
                break;
            }
            allowed += per_tier;
            bytes_left -= per_tier * level_size;
            level_size *= self.config.max_merge_at_once as f64;
        }
        allowed as usize
    }
}

impl MergePolicy for TieredMergePolicy {
    fn find_merges(
        &self,
        trigger: MergeTrigger,
        infos: &SegmentInfos,
        ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification> {
        if infos.is_empty() {
            return None;
        }
        let merging = ctx.merging_segments();
        let sorted = self.sorted_by_size(infos.iter(), ctx);

        // Segments already near the maximum size do not count against the
        // budget.
        let too_big_count = sorted
            .iter()
            .take_while(|(_, size)| *size >= self.max_merged_segment_bytes / 2)
            .count();
        let total_bytes: u64 = sorted[too_big_count..].iter().map(|(_, size)| *size).sum();
        let min_segment_bytes = sorted.last().map_or(0, |(_, size)| *size);
        let allowed = self.allowed_segment_count(total_bytes, min_segment_bytes);

        let max_merge_at_once = self.config.max_merge_at_once.max(2);
        let mut to_be_merged: BTreeSet<&str> = BTreeSet::new();
        let mut spec = MergeSpecification::new();
        loop {
            let mut merging_bytes = 0;
            let mut eligible = Vec::new();
            for (info, size) in &sorted[too_big_count..] {
                if merging.contains(info.name()) {
                    merging_bytes += size;
                } else if !to_be_merged.contains(info.name()) {
                    eligible.push((*info, *size));
                }
            }
            let max_merge_is_running = merging_bytes >= self.max_merged_segment_bytes;

            if eligible.len() <= allowed || eligible.len() < max_merge_at_once {
                return spec.non_empty();
            }

            let mut best: Option<(Vec<(&SegmentCommitInfo, u64)>, f64)> = None;
            for start in 0..=(eligible.len() - max_merge_at_once) {
                let mut candidate = Vec::new();
                let mut merged_bytes = 0;
                let mut hit_too_large = false;
                for (info, size) in &eligible[start..] {
                    if candidate.len() >= max_merge_at_once {
                        break;
                    }
                    if merged_bytes + size > self.max_merged_segment_bytes {
                        hit_too_large = true;
                        continue;
                    }
                    candidate.push((*info, *size));
                    merged_bytes += size;
                }
                if candidate.is_empty() || (hit_too_large && max_merge_is_running) {
                    continue;
                }
                let score = self.score(&candidate, hit_too_large);
                let better = best
                    .as_ref()
                    .is_none_or(|(_, best_score)| score.partial_cmp(best_score) == Some(Ordering::Less));
                if better {
                    best = Some((candidate, score));
                }
            }

            let Some((candidate, score)) = best else {
                return spec.non_empty();
            };
            debug!(
                target: "tessera::mp",
                "{trigger}: add merge of {} segments, score {score:.3}",
                candidate.len()
            );
            to_be_merged.extend(candidate.iter().map(|(s, _)| s.name()));
            spec.add(OneMerge::new(candidate.into_iter().map(|(s, _)| s.clone()).collect()));
        }
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
        let mut force_merge_running = false;
        let mut segment_is_original = false;
        let mut eligible = Vec::new();
        for info in infos.iter() {
            if let Some(original) = segments_to_merge.get(info.name()) {
                segment_is_original |= *original;
                if merging.contains(info.name()) {
                    force_merge_running = true;
                } else {
                    eligible.push(info);
                }
            }
        }
        if eligible.is_empty() {
            return None;
        }
        if (max_segment_count > 1 && eligible.len() <= max_segment_count)
            || (max_segment_count == 1
                && eligible.len() == 1
                && (!segment_is_original || self.base.is_merged(eligible[0], ctx)))
        {
            debug!(target: "tessera::mp", "already merged to {max_segment_count} segments");
            return None;
        }

        let eligible = self.sorted_by_size(eligible.into_iter(), ctx);
        let explicit = self.config.max_merge_at_once_explicit.max(2);
        let mut spec = MergeSpecification::new();
        let mut end = eligible.len();

        // Full merges first, largest segments last.
        while end + 1 >= explicit + max_segment_count {
            spec.add(OneMerge::new(
                eligible[end - explicit..end].iter().map(|(s, _)| (*s).clone()).collect(),
            ));
            end -= explicit;
        }
        if spec.is_empty() && !force_merge_running {
            let num_to_merge = end + 1 - max_segment_count;
            spec.add(OneMerge::new(
                eligible[end - num_to_merge..end]
                    .iter()
                    .map(|(s, _)| (*s).clone())
                    .collect(),
            ));
        }
        spec.non_empty()
    }

    fn find_forced_deletes_merges(
        &self,
        infos: &SegmentInfos,
        ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification> {
        let merging = ctx.merging_segments();
        let eligible = infos.iter().filter(|info| {
            let max_doc = info.info.max_doc;
            let pct = if max_doc == 0 {
                0.0
            } else {
                100.0 * ctx.num_deletes_to_merge(info) as f64 / max_doc as f64
            };
            pct > self.config.force_merge_deletes_pct_allowed && !merging.contains(info.name())
        });
        let eligible = self.sorted_by_size(eligible, ctx);
        let explicit = self.config.max_merge_at_once_explicit.max(1);
        let mut spec = MergeSpecification::new();
        for chunk in eligible.chunks(explicit) {
            spec.add(OneMerge::new(chunk.iter().map(|(s, _)| (*s).clone()).collect()));
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

    const KB: u64 = 1024;

    fn policy() -> TieredMergePolicy {
        TieredMergePolicy::new(TieredMergePolicyConfig {
            max_merge_at_once: 2,
            max_merge_at_once_explicit: 3,
            segments_per_tier: 2.0,
            floor_segment_mb: 0.001,
            ..Default::default()
        })
    }

    fn infos(sizes_kb: &[u64]) -> SegmentInfos {
        let mut infos = SegmentInfos::new();
        for (i, kb) in sizes_kb.iter().enumerate() {
            infos.add(segment(&format!("_{i}"), 100, kb * KB));
        }
        infos
    }

    fn all(infos: &SegmentInfos) -> BTreeMap<String, bool> {
        infos.iter().map(|s| (s.name().to_string(), true)).collect()
    }

    #[test]
    fn test_under_budget_no_merge() {
        let ctx = TestContext::default();
        assert!(policy()
            .find_merges(MergeTrigger::SegmentFlush, &infos(&[100, 1]), &ctx)
            .is_none());
    }

    #[test]
    fn test_merges_small_segments_first() {
        let ctx = TestContext::default();
        let mut sizes = vec![1000];
        sizes.extend([10; 20]);
        let infos = infos(&sizes);
        let spec = policy()
            .find_merges(MergeTrigger::SegmentFlush, &infos, &ctx)
            .unwrap();
        assert!(!spec.is_empty());
        let mut seen = BTreeSet::new();
        for merge in &spec.merges {
            assert_eq!(merge.segments.len(), 2);
            for s in &merge.segments {
                assert_ne!(s.name(), "_0");
                assert!(seen.insert(s.name().to_string()));
            }
        }
    }

    #[test]
    fn test_never_proposes_merging_segments() {
        let mut ctx = TestContext::default();
        ctx.merging.insert("_1".into());
        ctx.merging.insert("_2".into());
        let infos = infos(&[10, 10, 10, 10, 10, 10]);
        if let Some(spec) = policy().find_merges(MergeTrigger::SegmentFlush, &infos, &ctx) {
            for merge in &spec.merges {
                assert!(merge.segments.iter().all(|s| !ctx.merging.contains(s.name())));
            }
        }
    }

    #[test]
    fn test_forced_merge_to_one() {
        let ctx = TestContext::default();
        let infos = infos(&[10, 20, 30, 40, 50]);
        let spec = policy().find_forced_merges(&infos, 1, &all(&infos), &ctx).unwrap();
        // One full merge of three, the rest follows once it finished.
        assert_eq!(spec.len(), 1);
        assert_eq!(spec.merges[0].segments.len(), 3);

        let two = self::infos(&[10, 20]);
        let spec = policy().find_forced_merges(&two, 1, &all(&two), &ctx).unwrap();
        assert_eq!(spec.merges[0].segments.len(), 2);
        assert!(policy().find_forced_merges(&two, 2, &all(&two), &ctx).is_none());
    }

    #[test]
    fn test_forced_merge_single_segment_with_deletes() {
        let mut ctx = TestContext::default();
        let one = infos(&[10]);
        assert!(policy().find_forced_merges(&one, 1, &all(&one), &ctx).is_none());
        ctx.deletes.insert("_0".into(), 50);
        let spec = policy().find_forced_merges(&one, 1, &all(&one), &ctx).unwrap();
        assert_eq!(spec.merges[0].segments.len(), 1);
    }

    #[test]
    fn test_forced_deletes_merges_by_pct() {
        let mut ctx = TestContext::default();
        let infos = infos(&[10, 10, 10]);
        ctx.deletes.insert("_0".into(), 5);
        ctx.deletes.insert("_1".into(), 50);
        ctx.deletes.insert("_2".into(), 20);
        let spec = policy().find_forced_deletes_merges(&infos, &ctx).unwrap();
        assert_eq!(spec.len(), 1);
        let names = spec.merges[0].segment_names();
        assert!(names.contains("_1") && names.contains("_2") && !names.contains("_0"));
    }

    #[test]
    fn test_score_prefers_reclaiming_deletes() {
        let policy = policy();
        let a = segment("_a", 100, 100 * KB);
        let b = segment("_b", 100, 100 * KB);
        let clean = policy.score(&[(&a, 100 * KB), (&b, 100 * KB)], false);
        let deleted = policy.score(&[(&a, 50 * KB), (&b, 50 * KB)], false);
        assert!(deleted < clean);
    }
}
