//! Index writer configuration.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::analysis::{Analyzer, StandardAnalyzer};
use crate::codec::{Codec, DefaultCodec};
use crate::error::{Result, TesseraError};
use crate::index::commit::IndexCommit;
use crate::index::deletion_policy::{IndexDeletionPolicy, KeepOnlyLastCommitDeletionPolicy};
use crate::index::similarity::{DefaultSimilarity, Similarity};
use crate::merge::{ConcurrentMergeScheduler, MergePolicy, MergeScheduler, TieredMergePolicy};

/// Default RAM buffer in megabytes.
pub const DEFAULT_RAM_BUFFER_SIZE_MB: f64 = 16.0;

/// Default per-arena hard limit in megabytes.
pub const DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB: usize = 1945;

/// Default ratio of the RAM buffer at which indexing threads stall.
pub const DEFAULT_STALL_RAM_MULTIPLIER: f64 = 2.0;

/// How a writer treats an existing index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Start an empty index, replacing any existing one on first commit.
    Create,
    /// Open an existing index; fail if there is none.
    Append,
    /// Open the existing index or create one.
    #[default]
    CreateOrAppend,
}

/// Settings of an [`IndexWriter`](crate::index::IndexWriter).
///
/// A config backs at most one writer; clones share that claim. Build a new
/// config for every writer.
#[derive(Clone)]
pub struct IndexWriterConfig {
    /// How an existing index is treated.
    pub open_mode: OpenMode,
    /// Flush once buffered documents and deletes use this much RAM.
    pub ram_buffer_size_mb: Option<f64>,
    /// Flush an arena once it holds this many documents.
    pub max_buffered_docs: Option<usize>,
    /// Apply buffered deletes once this many delete terms are queued.
    pub max_buffered_delete_terms: Option<usize>,
    /// An arena above this size is flushed regardless of the policy.
    pub ram_per_thread_hard_limit_mb: usize,
    /// Indexing stalls once flushing and active bytes exceed this multiple
    /// of the RAM buffer.
    pub stall_ram_multiplier: f64,
    /// Pack newly flushed segments into compound files.
    pub use_compound_file: bool,
    /// Commit on [`IndexWriter::close`](crate::index::IndexWriter::close);
    /// otherwise close rolls back.
    pub commit_on_close: bool,
    /// Indexing threads help flushing pending arenas on every update.
    pub check_pending_flush_on_update: bool,
    /// Analyzer for tokenized fields.
    pub analyzer: Arc<dyn Analyzer>,
    /// Codec new segments are written with.
    pub codec: Arc<dyn Codec>,
    /// Computes norms.
    pub similarity: Arc<dyn Similarity>,
    /// Chooses merges.
    pub merge_policy: Arc<dyn MergePolicy>,
    /// Runs merges.
    pub merge_scheduler: Arc<dyn MergeScheduler>,
    /// Decides which commits are kept.
    pub deletion_policy: Arc<dyn IndexDeletionPolicy>,
    /// Open the writer on this commit instead of the newest one.
    pub index_commit: Option<IndexCommit>,
    in_use: Arc<AtomicBool>,
}

impl Default for IndexWriterConfig {
    fn default() -> Self {
        IndexWriterConfig {
            open_mode: OpenMode::default(),
            ram_buffer_size_mb: Some(DEFAULT_RAM_BUFFER_SIZE_MB),
            max_buffered_docs: None,
            max_buffered_delete_terms: None,
            ram_per_thread_hard_limit_mb: DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB,
            stall_ram_multiplier: DEFAULT_STALL_RAM_MULTIPLIER,
            use_compound_file: true,
            commit_on_close: true,
            check_pending_flush_on_update: true,
            analyzer: Arc::new(StandardAnalyzer::new()),
            codec: Arc::new(DefaultCodec::new()),
            similarity: Arc::new(DefaultSimilarity::default()),
            merge_policy: Arc::new(TieredMergePolicy::default()),
            merge_scheduler: Arc::new(ConcurrentMergeScheduler::default()),
            deletion_policy: Arc::new(KeepOnlyLastCommitDeletionPolicy::new()),
            index_commit: None,
            in_use: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl fmt::Debug for IndexWriterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexWriterConfig")
            .field("open_mode", &self.open_mode)
            .field("ram_buffer_size_mb", &self.ram_buffer_size_mb)
            .field("max_buffered_docs", &self.max_buffered_docs)
            .field("max_buffered_delete_terms", &self.max_buffered_delete_terms)
            .field(
                "ram_per_thread_hard_limit_mb",
                &self.ram_per_thread_hard_limit_mb,
            )
            .field("stall_ram_multiplier", &self.stall_ram_multiplier)
            .field("use_compound_file", &self.use_compound_file)
            .field("commit_on_close", &self.commit_on_close)
            .field("analyzer", &self.analyzer.name())
            .field("codec", &self.codec.name())
            .field("merge_policy", &self.merge_policy)
            .field("deletion_policy", &self.deletion_policy)
            .field("index_commit", &self.index_commit)
            .finish()
    }
}

impl IndexWriterConfig {
    /// The default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the open mode.
    pub fn with_open_mode(mut self, open_mode: OpenMode) -> Self {
        self.open_mode = open_mode;
        self
    }

    /// Set the RAM trigger, `None` to disable it.
    pub fn with_ram_buffer_size_mb(mut self, mb: Option<f64>) -> Self {
        self.ram_buffer_size_mb = mb;
        self
    }

    /// Set the document count trigger, `None` to disable it.
    pub fn with_max_buffered_docs(mut self, docs: Option<usize>) -> Self {
        self.max_buffered_docs = docs;
        self
    }

    /// Set the merge policy.
    pub fn with_merge_policy(mut self, policy: Arc<dyn MergePolicy>) -> Self {
        self.merge_policy = policy;
        self
    }

    /// Set the merge scheduler.
    pub fn with_merge_scheduler(mut self, scheduler: Arc<dyn MergeScheduler>) -> Self {
        self.merge_scheduler = scheduler;
        self
    }

    /// Set the deletion policy.
    pub fn with_deletion_policy(mut self, policy: Arc<dyn IndexDeletionPolicy>) -> Self {
        self.deletion_policy = policy;
        self
    }

    /// Set the analyzer.
    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Check the settings for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.ram_buffer_size_mb.is_none() && self.max_buffered_docs.is_none() {
            return Err(TesseraError::illegal_argument(
                "at least one of ram_buffer_size_mb and max_buffered_docs must be enabled",
            ));
        }
        if let Some(mb) = self.ram_buffer_size_mb.filter(|mb| mb.is_nan() || *mb <= 0.0) {
            return Err(TesseraError::illegal_argument(format!(
                "ram_buffer_size_mb must be positive, got {mb}"
            )));
        }
        if let Some(docs) = self.max_buffered_docs.filter(|docs| *docs < 2) {
            return Err(TesseraError::illegal_argument(format!(
                "max_buffered_docs must be at least 2, got {docs}"
            )));
        }
        if self.max_buffered_delete_terms == Some(0) {
            return Err(TesseraError::illegal_argument(
                "max_buffered_delete_terms must be at least 1",
            ));
        }
        if self.ram_per_thread_hard_limit_mb == 0 || self.ram_per_thread_hard_limit_mb >= 2048 {
            return Err(TesseraError::illegal_argument(format!(
                "ram_per_thread_hard_limit_mb must be in 1..2048, got {}",
                self.ram_per_thread_hard_limit_mb
            )));
        }
        if self.stall_ram_multiplier.is_nan() || self.stall_ram_multiplier < 1.0 {
            return Err(TesseraError::illegal_argument(format!(
                "stall_ram_multiplier must be at least 1.0, got {}",
                self.stall_ram_multiplier
            )));
        }
        Ok(())
    }

    /// RAM buffer in bytes.
    pub(crate) fn ram_buffer_bytes(&self) -> Option<usize> {
        self.ram_buffer_size_mb
            .map(|mb| (mb * 1024.0 * 1024.0) as usize)
    }

    /// Per-arena hard limit in bytes.
    pub(crate) fn hard_limit_bytes(&self) -> usize {
        self.ram_per_thread_hard_limit_mb * 1024 * 1024
    }

    /// Stall ceiling in bytes; no stalling without a RAM trigger.
    pub(crate) fn stall_limit_bytes(&self) -> Option<usize> {
        self.ram_buffer_bytes()
            .map(|bytes| (bytes as f64 * self.stall_ram_multiplier) as usize)
    }

    /// Claim the config for a writer.
    pub(crate) fn acquire(&self) -> Result<()> {
        if self.in_use.swap(true, Ordering::AcqRel) {
            return Err(TesseraError::illegal_state(
                "this config is already used by an index writer; create a new config",
            ));
        }
        Ok(())
    }

    /// Give up a claim taken by a writer that failed to open.
    pub(crate) fn release(&self) {
        self.in_use.store(false, Ordering::Release);
    }
}
