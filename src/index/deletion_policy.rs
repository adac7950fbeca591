//! Which commits to keep.
//!
//! The file deleter hands every commit of the index to an
//! [`IndexDeletionPolicy`] when the writer opens and after every commit.
//! Commits the policy marks with [`IndexCommit::delete`] are removed along
//! with the files only they reference.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{Result, TesseraError};
use crate::index::SNAPSHOTS_PREFIX;
use crate::index::commit::IndexCommit;
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter, read_checked};

/// Decides which commits to delete.
pub trait IndexDeletionPolicy: Debug + Send + Sync {
    /// Called once when a writer opens, with the existing commits oldest
    /// first.
    fn on_init(&self, commits: &[IndexCommit]) -> Result<()>;

    /// Called after each commit, with every retained commit oldest first.
    fn on_commit(&self, commits: &[IndexCommit]) -> Result<()>;
}

/// Keeps only the newest commit.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepOnlyLastCommitDeletionPolicy;

impl KeepOnlyLastCommitDeletionPolicy {
    /// Create the policy.
    pub fn new() -> Self {
        Self
    }
}

impl IndexDeletionPolicy for KeepOnlyLastCommitDeletionPolicy {
    fn on_init(&self, commits: &[IndexCommit]) -> Result<()> {
        self.on_commit(commits)
    }

    fn on_commit(&self, commits: &[IndexCommit]) -> Result<()> {
        if let Some((_, older)) = commits.split_last() {
            for commit in older {
                commit.delete();
            }
        }
        Ok(())
    }
}

/// Keeps every commit.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDeletionPolicy;

impl NoDeletionPolicy {
    /// Create the policy.
    pub fn new() -> Self {
        Self
    }
}

impl IndexDeletionPolicy for NoDeletionPolicy {
    fn on_init(&self, _commits: &[IndexCommit]) -> Result<()> {
        Ok(())
    }

    fn on_commit(&self, _commits: &[IndexCommit]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SnapshotState {
    /// Pin count per commit generation.
    ref_counts: BTreeMap<i64, usize>,
    /// Pinned commits by generation, once seen.
    commits: BTreeMap<i64, IndexCommit>,
    last_commit: Option<IndexCommit>,
}

/// Wraps another policy and keeps snapshotted commits alive.
///
/// [`snapshot`](Self::snapshot) pins the newest commit: its files survive
/// any number of later commits until the snapshot is
/// [`release`](Self::release)d. The primary policy sees every commit and
/// its decisions apply to the unpinned ones.
#[derive(Debug)]
pub struct SnapshotDeletionPolicy {
    primary: Arc<dyn IndexDeletionPolicy>,
    state: Mutex<SnapshotState>,
}

impl SnapshotDeletionPolicy {
    /// Wrap `primary`.
    pub fn new(primary: Arc<dyn IndexDeletionPolicy>) -> Self {
        SnapshotDeletionPolicy {
            primary,
            state: Mutex::new(SnapshotState::default()),
        }
    }

    fn with_ref_counts(primary: Arc<dyn IndexDeletionPolicy>, ref_counts: BTreeMap<i64, usize>) -> Self {
        SnapshotDeletionPolicy {
            primary,
            state: Mutex::new(SnapshotState {
                ref_counts,
                ..Default::default()
            }),
        }
    }

    fn on_commits(&self, commits: &[IndexCommit], init: bool) -> Result<()> {
        let shadows: Vec<_> = commits.iter().map(IndexCommit::shadow).collect();
        if init {
            self.primary.on_init(&shadows)?;
        } else {
            self.primary.on_commit(&shadows)?;
        }
        let mut state = self.state.lock();
        for (commit, shadow) in commits.iter().zip(&shadows) {
            if state.ref_counts.contains_key(&commit.generation()) {
                state.commits.insert(commit.generation(), commit.clone());
            } else if shadow.is_deleted() {
                commit.delete();
            }
        }
        state.last_commit = commits.last().cloned();
        Ok(())
    }

    /// Pin the newest commit and return it.
    pub fn snapshot(&self) -> Result<IndexCommit> {
        let mut state = self.state.lock();
        let commit = state
            .last_commit
            .clone()
            .ok_or_else(|| TesseraError::illegal_state("no index commit to snapshot"))?;
        *state.ref_counts.entry(commit.generation()).or_insert(0) += 1;
        state.commits.insert(commit.generation(), commit.clone());
        debug!(target: "tessera::ifd", "snapshot {}", commit.segments_file_name());
        Ok(commit)
    }

    /// Unpin a snapshot. Its files are removed on the next commit or
    /// [`delete_unused_files`](crate::index::IndexWriter::delete_unused_files)
    /// unless another snapshot or the primary policy keeps them.
    pub fn release(&self, commit: &IndexCommit) -> Result<()> {
        self.release_generation(commit.generation())
    }

    fn release_generation(&self, generation: i64) -> Result<()> {
        let mut state = self.state.lock();
        let count = state.ref_counts.get_mut(&generation).ok_or_else(|| {
            TesseraError::illegal_argument(format!("commit generation {generation} is not snapshotted"))
        })?;
        *count -= 1;
        if *count == 0 {
            state.ref_counts.remove(&generation);
            state.commits.remove(&generation);
        }
        Ok(())
    }

    fn pin_generation(&self, commit: &IndexCommit) {
        let mut state = self.state.lock();
        *state.ref_counts.entry(commit.generation()).or_insert(0) += 1;
        state.commits.insert(commit.generation(), commit.clone());
    }

    /// Every pinned commit, oldest first.
    pub fn snapshots(&self) -> Vec<IndexCommit> {
        self.state.lock().commits.values().cloned().collect()
    }

    /// Total number of pins over all commits.
    pub fn snapshot_count(&self) -> usize {
        self.state.lock().ref_counts.values().sum()
    }

    /// The pinned commit of `generation`.
    pub fn index_commit(&self, generation: i64) -> Option<IndexCommit> {
        self.state.lock().commits.get(&generation).cloned()
    }

    fn ref_counts(&self) -> BTreeMap<i64, usize> {
        self.state.lock().ref_counts.clone()
    }
}

impl IndexDeletionPolicy for SnapshotDeletionPolicy {
    fn on_init(&self, commits: &[IndexCommit]) -> Result<()> {
        self.on_commits(commits, true)
    }

    fn on_commit(&self, commits: &[IndexCommit]) -> Result<()> {
        self.on_commits(commits, false)
    }
}

const SNAPSHOTS_MAGIC: u32 = 0x534E_4150;
const SNAPSHOTS_VERSION: u32 = 1;

fn snapshots_generation(file: &str) -> Option<u64> {
    file.strip_prefix(SNAPSHOTS_PREFIX)?
        .strip_prefix('_')?
        .parse()
        .ok()
}

/// A [`SnapshotDeletionPolicy`] whose pins survive restarts.
///
/// Pin counts are written to `snapshots_N` on every snapshot and release.
/// The new generation is written and synced before the previous one is
/// deleted, so a crash always leaves one complete file behind.
#[derive(Debug)]
pub struct PersistentSnapshotDeletionPolicy {
    inner: SnapshotDeletionPolicy,
    storage: Arc<dyn Storage>,
    /// Generation of the next file and the name of the last one written.
    persisted: Mutex<(u64, Option<String>)>,
}

impl PersistentSnapshotDeletionPolicy {
    /// Wrap `primary`, loading pins from the newest readable snapshots file
    /// in `storage`. A missing file means no pins; if files exist but none
    /// can be read, opening fails.
    pub fn new(primary: Arc<dyn IndexDeletionPolicy>, storage: Arc<dyn Storage>) -> Result<Self> {
        let mut generations: Vec<(u64, String)> = storage
            .list_files()?
            .into_iter()
            .filter_map(|f| snapshots_generation(&f).map(|g| (g, f)))
            .collect();
        generations.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        let mut loaded = None;
        let mut last_error = None;
        for (generation, file) in &generations {
            match Self::load(storage.as_ref(), file) {
                Ok(ref_counts) => {
                    loaded = Some((*generation, file.clone(), ref_counts));
                    break;
                }
                Err(e) => {
                    warn!(target: "tessera::ifd", "cannot read {file}: {e}");
                    last_error = Some(e);
                }
            }
        }

        let next_generation = generations.first().map_or(0, |(g, _)| g + 1);
        let (ref_counts, current) = match loaded {
            Some((generation, file, ref_counts)) => {
                debug!(
                    target: "tessera::ifd",
                    "loaded {} snapshots from {file} (generation {generation})",
                    ref_counts.len()
                );
                (ref_counts, Some(file))
            }
            None => match last_error {
                Some(e) => return Err(e),
                None => (BTreeMap::new(), None),
            },
        };

        // Only the file just loaded is still needed.
        for (_, file) in &generations {
            if Some(file) != current.as_ref() {
                if let Err(e) = storage.delete_file(file) {
                    debug!(target: "tessera::ifd", "cannot delete stale {file}: {e}");
                }
            }
        }

        Ok(PersistentSnapshotDeletionPolicy {
            inner: SnapshotDeletionPolicy::with_ref_counts(primary, ref_counts),
            storage,
            persisted: Mutex::new((next_generation, current)),
        })
    }

    fn load(storage: &dyn Storage, file: &str) -> Result<BTreeMap<i64, usize>> {
        let body = read_checked(storage, file)?;
        let mut reader = StructReader::from_slice(&body, file);
        reader.read_header(SNAPSHOTS_MAGIC, SNAPSHOTS_VERSION, SNAPSHOTS_VERSION)?;
        let count = reader.read_varint()?;
        let mut ref_counts = BTreeMap::new();
        for _ in 0..count {
            let generation = reader.read_i64()?;
            let pins = reader.read_varint()? as usize;
            ref_counts.insert(generation, pins);
        }
        Ok(ref_counts)
    }

    fn persist(&self) -> Result<()> {
        let mut persisted = self.persisted.lock();
        let (generation, previous) = &mut *persisted;
        let file = format!("{SNAPSHOTS_PREFIX}_{generation}");
        let ref_counts = self.inner.ref_counts();

        let written = (|| -> Result<()> {
            let mut writer = StructWriter::create(self.storage.as_ref(), &file)?;
            writer.write_header(SNAPSHOTS_MAGIC, SNAPSHOTS_VERSION)?;
            writer.write_varint(ref_counts.len() as u64)?;
            for (generation, pins) in &ref_counts {
                writer.write_i64(*generation)?;
                writer.write_varint(*pins as u64)?;
            }
            writer.close()?;
            self.storage.sync(std::slice::from_ref(&file))
        })();
        if let Err(e) = written {
            let _ = self.storage.delete_file(&file);
            return Err(e);
        }

        *generation += 1;
        if let Some(old) = previous.replace(file) {
            if let Err(e) = self.storage.delete_file(&old) {
                warn!(target: "tessera::ifd", "cannot delete {old}: {e}");
            }
        }
        Ok(())
    }

    /// Pin the newest commit and persist the pins. Nothing is pinned if
    /// persisting fails.
    pub fn snapshot(&self) -> Result<IndexCommit> {
        let commit = self.inner.snapshot()?;
        if let Err(e) = self.persist() {
            self.inner.release(&commit)?;
            return Err(e);
        }
        Ok(commit)
    }

    /// Unpin a snapshot and persist the pins. The pin stays if persisting
    /// fails.
    pub fn release(&self, commit: &IndexCommit) -> Result<()> {
        self.inner.release(commit)?;
        if let Err(e) = self.persist() {
            self.inner.pin_generation(commit);
            return Err(e);
        }
        Ok(())
    }

    /// Unpin the snapshot of `generation`.
    pub fn release_generation(&self, generation: i64) -> Result<()> {
        match self.inner.index_commit(generation) {
            Some(commit) => self.release(&commit),
            None => {
                self.inner.release_generation(generation)?;
                if let Err(e) = self.persist() {
                    let mut state = self.inner.state.lock();
                    *state.ref_counts.entry(generation).or_insert(0) += 1;
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Every pinned commit, oldest first.
    pub fn snapshots(&self) -> Vec<IndexCommit> {
        self.inner.snapshots()
    }

    /// Total number of pins.
    pub fn snapshot_count(&self) -> usize {
        self.inner.snapshot_count()
    }

    /// The pinned commit of `generation`.
    pub fn index_commit(&self, generation: i64) -> Option<IndexCommit> {
        self.inner.index_commit(generation)
    }

    /// Generation of the last snapshots file written or loaded, if any.
    pub fn last_saved_generation(&self) -> Option<u64> {
        self.persisted
            .lock()
            .1
            .as_deref()
            .and_then(snapshots_generation)
    }
}

impl IndexDeletionPolicy for PersistentSnapshotDeletionPolicy {
    fn on_init(&self, commits: &[IndexCommit]) -> Result<()> {
        self.inner.on_init(commits)
    }

    fn on_commit(&self, commits: &[IndexCommit]) -> Result<()> {
        self.inner.on_commit(commits)
    }
}
