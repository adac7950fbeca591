//! Commit points.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;

use crate::codec::Codec;
use crate::error::{Result, TesseraError};
use crate::index::is_segments_file;
use crate::index::segment_infos::SegmentInfos;
use crate::storage::Storage;

struct CommitInner {
    segments_file_name: String,
    generation: i64,
    files: BTreeSet<String>,
    user_data: BTreeMap<String, String>,
    segment_count: usize,
    storage: Arc<dyn Storage>,
    deleted: AtomicBool,
}

/// A committed manifest and the files it references.
///
/// Deletion policies receive the commits of an index oldest first and call
/// [`IndexCommit::delete`] on those that may go; the files are removed once
/// no other commit or open reader needs them.
#[derive(Clone)]
pub struct IndexCommit {
    inner: Arc<CommitInner>,
}

impl fmt::Debug for IndexCommit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexCommit")
            .field("segments_file_name", &self.inner.segments_file_name)
            .field("segment_count", &self.inner.segment_count)
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

impl PartialEq for IndexCommit {
    fn eq(&self, other: &Self) -> bool {
        self.inner.generation == other.inner.generation
            && Arc::ptr_eq(&self.inner.storage, &other.inner.storage)
    }
}

impl IndexCommit {
    /// The commit point of a committed manifest.
    pub(crate) fn from_infos(infos: &SegmentInfos, storage: Arc<dyn Storage>) -> Result<Self> {
        let segments_file_name = infos
            .segments_file_name()
            .ok_or_else(|| TesseraError::illegal_state("manifest was never committed"))?;
        Ok(IndexCommit {
            inner: Arc::new(CommitInner {
                segments_file_name,
                generation: infos.last_generation(),
                files: infos.files(true),
                user_data: infos.user_data.clone(),
                segment_count: infos.len(),
                storage,
                deleted: AtomicBool::new(false),
            }),
        })
    }

    /// Every readable commit of the index in `storage`, oldest first.
    pub fn list(storage: Arc<dyn Storage>, codec: &dyn Codec) -> Result<Vec<IndexCommit>> {
        let mut commits = Vec::new();
        for file in storage.list_files()? {
            if !is_segments_file(&file) {
                continue;
            }
            match SegmentInfos::read_commit(storage.as_ref(), codec, &file) {
                Ok(infos) => commits.push(Self::from_infos(&infos, Arc::clone(&storage))?),
                Err(e) => warn!(target: "tessera::ifd", "skip unreadable commit {file}: {e}"),
            }
        }
        commits.sort_by_key(IndexCommit::generation);
        Ok(commits)
    }

    /// The manifest file, `segments_N`.
    pub fn segments_file_name(&self) -> &str {
        &self.inner.segments_file_name
    }

    /// The manifest generation.
    pub fn generation(&self) -> i64 {
        self.inner.generation
    }

    /// Every file the commit references, its manifest included.
    pub fn file_names(&self) -> &BTreeSet<String> {
        &self.inner.files
    }

    /// User data stored with the commit.
    pub fn user_data(&self) -> &BTreeMap<String, String> {
        &self.inner.user_data
    }

    /// Number of segments in the commit.
    pub fn segment_count(&self) -> usize {
        self.inner.segment_count
    }

    /// Where the commit lives.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    /// Mark the commit for deletion.
    pub fn delete(&self) {
        self.inner.deleted.store(true, Ordering::Release);
    }

    /// Whether the commit was marked for deletion.
    pub fn is_deleted(&self) -> bool {
        self.inner.deleted.load(Ordering::Acquire)
    }

    /// A copy with its own deletion mark.
    pub(crate) fn shadow(&self) -> IndexCommit {
        IndexCommit {
            inner: Arc::new(CommitInner {
                segments_file_name: self.inner.segments_file_name.clone(),
                generation: self.inner.generation,
                files: self.inner.files.clone(),
                user_data: self.inner.user_data.clone(),
                segment_count: self.inner.segment_count,
                storage: Arc::clone(&self.inner.storage),
                deleted: AtomicBool::new(false),
            }),
        }
    }
}
