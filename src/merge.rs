//! Segment merging.
//!
//! A [`MergePolicy`] looks at the manifest and proposes merges, a
//! [`MergeScheduler`] decides on which thread they run and the
//! [`SegmentMerger`] produces the merged segment. The writer glues them
//! together as the [`MergeSource`] the scheduler pulls merges from.

pub mod log_policy;
pub mod merger;
pub mod policy;
pub mod scheduler;
pub mod tiered_policy;

pub use log_policy::{LogMergePolicy, LogMergePolicyConfig, LogSizeMeasure};
pub use merger::{MergeState, SegmentMerger};
pub use policy::{
    MergeContext, MergePolicy, MergePolicyBase, MergeSpecification, MergeTrigger, NoMergePolicy,
    OneMerge,
};
pub use scheduler::{
    ConcurrentMergeScheduler, MergeScheduler, MergeSource, NoMergeScheduler, SerialMergeScheduler,
};
pub use tiered_policy::{TieredMergePolicy, TieredMergePolicyConfig};
