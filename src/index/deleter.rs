//! Reference counting of index files.
//!
//! Every file of the index is referenced by the commits the deletion policy
//! retains, by the writer's current manifest and by near-real-time readers
//! that pinned their manifest. A file is deleted the moment its count drops
//! to zero. Deletions that fail (a reader on some platforms may hold the
//! file open) are retried on later checkpoints.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::codec::Codec;
use crate::error::Result;
use crate::index::commit::IndexCommit;
use crate::index::deletion_policy::IndexDeletionPolicy;
use crate::index::segment_infos::SegmentInfos;
use crate::index::{is_index_file, is_segments_file};
use crate::storage::Storage;

/// Tracks which files are still needed and deletes the rest.
#[derive(Debug)]
pub struct IndexFileDeleter {
    storage: Arc<dyn Storage>,
    policy: Arc<dyn IndexDeletionPolicy>,
    ref_counts: BTreeMap<String, usize>,
    /// Retained commits, oldest first.
    commits: Vec<IndexCommit>,
    /// Files of the last non-commit checkpoint.
    last_files: BTreeSet<String>,
    pending_deletes: BTreeSet<String>,
}

impl IndexFileDeleter {
    /// Scan the storage, let the policy pick the commits to keep and remove
    /// every index file that neither a retained commit nor `current`
    /// references.
    pub fn new(
        storage: Arc<dyn Storage>,
        codec: &dyn Codec,
        policy: Arc<dyn IndexDeletionPolicy>,
        current: &SegmentInfos,
    ) -> Result<Self> {
        let mut deleter = IndexFileDeleter {
            storage,
            policy,
            ref_counts: BTreeMap::new(),
            commits: Vec::new(),
            last_files: BTreeSet::new(),
            pending_deletes: BTreeSet::new(),
        };

        let files = deleter.storage.list_files()?;
        for file in files.iter().filter(|f| is_index_file(f)) {
            deleter.ref_counts.entry(file.clone()).or_insert(0);
            if !is_segments_file(file) {
                continue;
            }
            match SegmentInfos::read_commit(deleter.storage.as_ref(), codec, file) {
                Ok(infos) => {
                    let commit = IndexCommit::from_infos(&infos, Arc::clone(&deleter.storage))?;
                    deleter.inc_ref(commit.file_names());
                    deleter.commits.push(commit);
                }
                Err(e) => {
                    warn!(target: "tessera::ifd", "init: cannot read {file}, treating it as unreferenced: {e}");
                }
            }
        }
        deleter.commits.sort_by_key(IndexCommit::generation);

        // Crash leftovers: half-written segments and pending manifests.
        let unreferenced: Vec<String> = deleter
            .ref_counts
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(file, _)| file.clone())
            .collect();
        for file in unreferenced {
            debug!(target: "tessera::ifd", "init: removing unreferenced file {file}");
            deleter.ref_counts.remove(&file);
            deleter.delete_file(&file);
        }

        deleter.policy.on_init(&deleter.commits)?;
        deleter.checkpoint(current, false)?;
        deleter.delete_commits();
        Ok(deleter)
    }

    /// Record a new state of the manifest. For a commit, the policy decides
    /// which commits to keep; otherwise the previous non-commit state is
    /// released.
    pub fn checkpoint(&mut self, infos: &SegmentInfos, is_commit: bool) -> Result<()> {
        self.retry_pending_deletes();
        let files = infos.files(is_commit);
        self.inc_ref(&files);
        if is_commit {
            self.commits
                .push(IndexCommit::from_infos(infos, Arc::clone(&self.storage))?);
            self.policy.on_commit(&self.commits)?;
            self.delete_commits();
        } else {
            let old = std::mem::replace(&mut self.last_files, files);
            self.dec_ref(&old);
        }
        Ok(())
    }

    /// Ask the policy again, for instance after a snapshot was released.
    pub fn revisit_policy(&mut self) -> Result<()> {
        self.retry_pending_deletes();
        if !self.commits.is_empty() {
            self.policy.on_commit(&self.commits)?;
            self.delete_commits();
        }
        Ok(())
    }

    fn delete_commits(&mut self) {
        let (deleted, kept): (Vec<_>, Vec<_>) =
            self.commits.drain(..).partition(IndexCommit::is_deleted);
        self.commits = kept;
        for commit in deleted {
            debug!(target: "tessera::ifd", "delete commit {}", commit.segments_file_name());
            self.dec_ref(commit.file_names());
        }
    }

    /// Take a reference on each of `files`.
    pub fn inc_ref<'a, I>(&mut self, files: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for file in files {
            *self.ref_counts.entry(file.clone()).or_insert(0) += 1;
        }
    }

    /// Release a reference on each of `files`, deleting those no longer
    /// referenced.
    pub fn dec_ref<'a, I>(&mut self, files: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for file in files {
            let Some(count) = self.ref_counts.get_mut(file) else {
                warn!(target: "tessera::ifd", "dec_ref of untracked file {file}");
                continue;
            };
            *count -= 1;
            if *count == 0 {
                self.ref_counts.remove(file);
                self.delete_file(file);
            }
        }
    }

    /// Remove every index file nothing references. Only safe while no flush
    /// or merge is writing new files.
    pub fn refresh(&mut self) -> Result<()> {
        self.retry_pending_deletes();
        for file in self.storage.list_files()? {
            if is_index_file(&file) && !self.ref_counts.contains_key(&file) {
                debug!(target: "tessera::ifd", "refresh: removing unreferenced file {file}");
                self.delete_file(&file);
            }
        }
        Ok(())
    }

    /// Current reference count of `file`.
    pub fn ref_count(&self, file: &str) -> usize {
        self.ref_counts.get(file).copied().unwrap_or(0)
    }

    /// Retained commits, oldest first.
    pub fn commits(&self) -> &[IndexCommit] {
        &self.commits
    }

    /// Files whose deletion failed and will be retried.
    pub fn pending_deletes(&self) -> &BTreeSet<String> {
        &self.pending_deletes
    }

    fn delete_file(&mut self, file: &str) {
        trace!(target: "tessera::ifd", "delete {file}");
        match self.storage.delete_file(file) {
            Ok(()) => {
                self.pending_deletes.remove(file);
            }
            Err(e) if e.is_not_found() => {
                self.pending_deletes.remove(file);
            }
            Err(e) => {
                warn!(target: "tessera::ifd", "cannot delete {file}, will retry: {e}");
                self.pending_deletes.insert(file.to_string());
            }
        }
    }

    fn retry_pending_deletes(&mut self) {
        let pending: Vec<String> = self.pending_deletes.iter().cloned().collect();
        for file in pending {
            if self.ref_counts.contains_key(&file) {
                // Referenced again since the failed attempt.
                self.pending_deletes.remove(&file);
            } else {
                self.delete_file(&file);
            }
        }
    }
}
