//! Point-in-time composite readers over a whole index.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, trace, warn};

use crate::codec::{Codec, DefaultCodec};
use crate::error::{Result, TesseraError};
use crate::index::commit::IndexCommit;
use crate::index::reader::{CompositeReader, LeafReader, LeafReaderContext, build_leaves};
use crate::index::segment::SegmentCommitInfo;
use crate::index::segment_infos::SegmentInfos;
use crate::index::segment_reader::{SegmentCore, SegmentReader};
use crate::index::writer::{IndexWriter, WriterInner};
use crate::storage::Storage;

/// Attempts to open the newest commit while commits are being deleted
/// underneath.
const OPEN_ATTEMPTS: usize = 3;

/// Link of a near-real-time reader to the writer it came from.
struct WriterLink {
    writer: Weak<WriterInner>,
    /// Files pinned in the writer's deleter until the reader is released.
    files: BTreeSet<String>,
    apply_all_deletes: bool,
}

/// A read-only view of one manifest: either a commit or the current state
/// of a writer.
///
/// Sub-readers are reference counted. A reopened reader takes a reference
/// on every sub-reader it shares with its predecessor before it is
/// returned, and releasing a reader releases each of its sub-readers.
pub struct DirectoryReader {
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
    infos: SegmentInfos,
    readers: Vec<Arc<SegmentReader>>,
    leaves: Vec<LeafReaderContext>,
    writer: Option<WriterLink>,
    ref_count: AtomicUsize,
    closed: AtomicBool,
    released: AtomicBool,
}

impl fmt::Debug for DirectoryReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let segments: Vec<&str> = self.readers.iter().map(|r| r.name()).collect();
        f.debug_struct("DirectoryReader")
            .field("generation", &self.infos.last_generation())
            .field("version", &self.infos.version)
            .field("segments", &segments)
            .field("nrt", &self.writer.is_some())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

impl DirectoryReader {
    /// Open the newest commit in `storage`.
    pub fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        Self::open_with_codec(storage, Arc::new(DefaultCodec::new()))
    }

    /// Open the newest commit, decoding with `codec`.
    ///
    /// A commit may be deleted by a writer between listing and loading its
    /// segments; opening is retried on the then newest commit.
    pub fn open_with_codec(storage: Arc<dyn Storage>, codec: Arc<dyn Codec>) -> Result<Self> {
        let mut attempt = 1;
        loop {
            let opened = SegmentInfos::read_latest(storage.as_ref(), codec.as_ref())
                .and_then(|infos| Self::from_infos(&storage, &codec, infos, &[]));
            match opened {
                Err(e) if e.is_not_found() && attempt < OPEN_ATTEMPTS => {
                    debug!(target: "tessera::reader", "open attempt {attempt} failed: {e}");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Open a specific commit.
    pub fn open_commit(commit: &IndexCommit) -> Result<Self> {
        let storage = Arc::clone(commit.storage());
        let codec: Arc<dyn Codec> = Arc::new(DefaultCodec::new());
        let infos =
            SegmentInfos::read_commit(storage.as_ref(), codec.as_ref(), commit.segments_file_name())?;
        Self::from_infos(&storage, &codec, infos, &[])
    }

    /// A near-real-time reader over everything `writer` indexed so far,
    /// committed or not.
    pub fn open_from_writer(writer: &IndexWriter, apply_all_deletes: bool) -> Result<Self> {
        writer.inner().nrt_reader(apply_all_deletes)
    }

    /// A reader over whatever changed since `reader` was opened, or `None`
    /// if it is still current. Unchanged segments are shared with `reader`.
    pub fn open_if_changed(reader: &DirectoryReader) -> Result<Option<Self>> {
        reader.ensure_open()?;
        if let Some(link) = &reader.writer {
            let writer = link.writer.upgrade().ok_or_else(|| {
                TesseraError::already_closed("the writer of this reader was closed")
            })?;
            if writer.nrt_is_current(reader.version()) {
                return Ok(None);
            }
            let fresh = writer.nrt_reader(link.apply_all_deletes)?;
            return Ok(Some(fresh.share_unchanged(reader)));
        }

        let storage = &reader.storage;
        let generation = SegmentInfos::last_commit_generation(&storage.list_files()?);
        if generation == reader.infos.last_generation() {
            return Ok(None);
        }
        let infos = SegmentInfos::read_latest(storage.as_ref(), reader.codec.as_ref())?;
        debug!(
            target: "tessera::reader",
            "reopen generation {} -> {}",
            reader.infos.last_generation(),
            infos.last_generation()
        );
        Self::from_infos(storage, &reader.codec, infos, &reader.readers).map(Some)
    }

    /// A near-real-time reader of `writer` sharing unchanged segments with
    /// `reader`, or `None` if `reader` already sees all of the writer's
    /// changes.
    pub fn open_if_changed_with_writer(
        reader: &DirectoryReader,
        writer: &IndexWriter,
        apply_all_deletes: bool,
    ) -> Result<Option<Self>> {
        reader.ensure_open()?;
        let inner = writer.inner();
        let same_writer = reader
            .writer
            .as_ref()
            .is_some_and(|link| std::ptr::eq(link.writer.as_ptr(), Arc::as_ptr(inner)));
        if same_writer && inner.nrt_is_current(reader.version()) {
            return Ok(None);
        }
        let fresh = inner.nrt_reader(apply_all_deletes)?;
        Ok(Some(fresh.share_unchanged(reader)))
    }

    pub(crate) fn from_writer(
        storage: Arc<dyn Storage>,
        codec: Arc<dyn Codec>,
        infos: SegmentInfos,
        readers: Vec<SegmentReader>,
        writer: Weak<WriterInner>,
        files: BTreeSet<String>,
        apply_all_deletes: bool,
    ) -> Self {
        let readers = readers.into_iter().map(Arc::new).collect();
        Self::assemble(
            storage,
            codec,
            infos,
            readers,
            Some(WriterLink {
                writer,
                files,
                apply_all_deletes,
            }),
        )
    }

    fn assemble(
        storage: Arc<dyn Storage>,
        codec: Arc<dyn Codec>,
        infos: SegmentInfos,
        readers: Vec<Arc<SegmentReader>>,
        writer: Option<WriterLink>,
    ) -> Self {
        let leaves = build_leaves(
            readers
                .iter()
                .map(|r| Arc::clone(r) as Arc<dyn LeafReader>),
        );
        DirectoryReader {
            storage,
            codec,
            infos,
            readers,
            leaves,
            writer,
            ref_count: AtomicUsize::new(1),
            closed: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    /// Open the segments of `infos`, sharing what is unchanged in
    /// `previous`.
    fn from_infos(
        storage: &Arc<dyn Storage>,
        codec: &Arc<dyn Codec>,
        infos: SegmentInfos,
        previous: &[Arc<SegmentReader>],
    ) -> Result<Self> {
        let mut readers: Vec<Arc<SegmentReader>> = Vec::with_capacity(infos.len());
        for sci in infos.iter() {
            match Self::open_segment(storage.as_ref(), codec.as_ref(), sci, previous) {
                Ok(reader) => readers.push(reader),
                Err(e) => {
                    for reader in &readers {
                        if let Err(e) = reader.dec_ref() {
                            warn!(target: "tessera::reader", "release after failed open: {e}");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self::assemble(
            Arc::clone(storage),
            Arc::clone(codec),
            infos,
            readers,
            None,
        ))
    }

    fn open_segment(
        storage: &dyn Storage,
        codec: &dyn Codec,
        sci: &SegmentCommitInfo,
        previous: &[Arc<SegmentReader>],
    ) -> Result<Arc<SegmentReader>> {
        let Some(old) = previous.iter().find(|r| r.name() == sci.name()) else {
            return SegmentReader::open(storage, codec, sci).map(Arc::new);
        };
        let old_sci = old.segment_info();
        if old_sci.del_gen == sci.del_gen && old_sci.dv_gen == sci.dv_gen && old.try_inc_ref() {
            trace!(target: "tessera::reader", "share segment reader {}", sci.name());
            return Ok(Arc::clone(old));
        }
        // Same segment, new deletes or updates: only the per-commit state
        // is reloaded.
        let live_docs = codec.read_live_docs(storage, sci)?.map(Arc::new);
        let overlay = Arc::new(codec.read_doc_values_updates(storage, sci)?);
        Ok(Arc::new(SegmentReader::with_state(
            Arc::clone(old.core()),
            sci.clone(),
            live_docs,
            overlay,
        )))
    }

    /// Replace sub-readers of this fresh reader by those of `previous`
    /// that see the same segment state.
    fn share_unchanged(mut self, previous: &DirectoryReader) -> Self {
        let mut shared = 0;
        for slot in &mut self.readers {
            let Some(old) = previous.readers.iter().find(|r| r.name() == slot.name()) else {
                continue;
            };
            if WriterInner::same_segment_state(old, slot) && old.try_inc_ref() {
                *slot = Arc::clone(old);
                shared += 1;
            }
        }
        trace!(
            target: "tessera::reader",
            "nrt reopen shares {shared} of {} segment readers",
            self.readers.len()
        );
        self.leaves = build_leaves(
            self.readers
                .iter()
                .map(|r| Arc::clone(r) as Arc<dyn LeafReader>),
        );
        self
    }

    fn ensure_open(&self) -> Result<()> {
        if self.ref_count() == 0 {
            return Err(TesseraError::already_closed("this reader is closed"));
        }
        Ok(())
    }

    /// Whether the reader still sees the newest state: the newest commit,
    /// or for a near-real-time reader every change of its writer.
    pub fn is_current(&self) -> Result<bool> {
        self.ensure_open()?;
        match &self.writer {
            Some(link) => Ok(link
                .writer
                .upgrade()
                .is_some_and(|writer| writer.nrt_is_current(self.version()))),
            None => {
                let files = self.storage.list_files()?;
                Ok(SegmentInfos::last_commit_generation(&files) == self.infos.last_generation())
            }
        }
    }

    /// Version of the manifest this reader sees.
    pub fn version(&self) -> u64 {
        self.infos.version
    }

    /// The manifest this reader sees.
    pub fn segment_infos(&self) -> &SegmentInfos {
        &self.infos
    }

    /// The commit this reader was opened on; `None` for a near-real-time
    /// reader.
    pub fn index_commit(&self) -> Result<Option<IndexCommit>> {
        if self.writer.is_some() {
            return Ok(None);
        }
        IndexCommit::from_infos(&self.infos, Arc::clone(&self.storage)).map(Some)
    }

    /// Per-segment readers in manifest order.
    pub fn segment_readers(&self) -> &[Arc<SegmentReader>] {
        &self.readers
    }

    /// The storage this reader reads from.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Shared cores of the segments, for sharing checks.
    pub fn cores(&self) -> Vec<Arc<SegmentCore>> {
        self.readers.iter().map(|r| Arc::clone(r.core())).collect()
    }

    /// Current reference count; zero once released.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Take a reference.
    pub fn inc_ref(&self) -> Result<()> {
        let mut count = self.ref_count();
        while count > 0 {
            match self.ref_count.compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => count = actual,
            }
        }
        Err(TesseraError::already_closed("this reader is closed"))
    }

    /// Release a reference; the last one releases the sub-readers and the
    /// files pinned in the writer.
    pub fn dec_ref(&self) -> Result<()> {
        let mut count = self.ref_count();
        loop {
            if count == 0 {
                return Err(TesseraError::already_closed("this reader is closed"));
            }
            match self.ref_count.compare_exchange_weak(
                count,
                count - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if count == 1 => return self.release(),
                Ok(_) => return Ok(()),
                Err(actual) => count = actual,
            }
        }
    }

    /// Close the reader. Closing twice is an error.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(TesseraError::already_closed("this reader is already closed"));
        }
        self.dec_ref()
    }

    fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut result = Ok(());
        for reader in &self.readers {
            if let Err(e) = reader.dec_ref() {
                result = Err(e);
            }
        }
        if let Some(link) = &self.writer {
            if let Some(writer) = link.writer.upgrade() {
                writer.release_files(&link.files);
            }
        }
        trace!(target: "tessera::reader", "released reader version {}", self.version());
        result
    }
}

impl CompositeReader for DirectoryReader {
    fn leaves(&self) -> Vec<LeafReaderContext> {
        self.leaves.clone()
    }
}

impl Drop for DirectoryReader {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(target: "tessera::reader", "releasing reader on drop failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, Field, Term};
    use crate::index::config::IndexWriterConfig;
    use crate::index::deletion_policy::NoDeletionPolicy;
    use crate::merge::{NoMergePolicy, SerialMergeScheduler};
    use crate::storage::MemoryStorage;

    fn config() -> IndexWriterConfig {
        IndexWriterConfig::default()
            .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()))
            .with_merge_policy(Arc::new(NoMergePolicy::new()))
    }

    fn doc(id: &str) -> Document {
        Document::new()
            .with(Field::string("id", id, true))
            .with(Field::text("body", "some text", false))
    }

    #[test]
    fn test_reopen_shares_unchanged_segments() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = IndexWriter::new(Arc::clone(&storage), config()).unwrap();
        writer.add_document(&doc("1")).unwrap();
        writer.commit().unwrap();

        let first = DirectoryReader::open(Arc::clone(&storage)).unwrap();
        assert!(first.is_current().unwrap());
        assert!(DirectoryReader::open_if_changed(&first).unwrap().is_none());

        writer.add_document(&doc("2")).unwrap();
        writer.commit().unwrap();
        assert!(!first.is_current().unwrap());

        let second = DirectoryReader::open_if_changed(&first).unwrap().unwrap();
        assert_eq!(second.leaves().len(), 2);
        assert!(Arc::ptr_eq(
            &first.segment_readers()[0],
            &second.segment_readers()[0]
        ));
        assert_eq!(second.segment_readers()[0].ref_count(), 2);

        first.close().unwrap();
        assert_eq!(second.segment_readers()[0].ref_count(), 1);
        assert_eq!(second.num_docs(), 2);
        second.close().unwrap();
    }

    #[test]
    fn test_reopen_after_deletes_shares_core() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = IndexWriter::new(Arc::clone(&storage), config()).unwrap();
        writer.add_document(&doc("1")).unwrap();
        writer.add_document(&doc("2")).unwrap();
        writer.commit().unwrap();
        let first = DirectoryReader::open(Arc::clone(&storage)).unwrap();

        writer.delete_documents(vec![Term::new("id", "1")]).unwrap();
        writer.commit().unwrap();
        let second = DirectoryReader::open_if_changed(&first).unwrap().unwrap();

        let (old, new) = (&first.segment_readers()[0], &second.segment_readers()[0]);
        assert!(!Arc::ptr_eq(old, new));
        assert!(Arc::ptr_eq(old.core(), new.core()));
        assert_eq!(first.num_docs(), 2);
        assert_eq!(second.num_docs(), 1);
        assert!(!second.is_live(0));
    }

    #[test]
    fn test_double_close_fails() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        IndexWriter::new(Arc::clone(&storage), config())
            .unwrap()
            .close()
            .unwrap();
        let reader = DirectoryReader::open(storage).unwrap();
        reader.close().unwrap();
        let err = reader.close().unwrap_err();
        assert!(matches!(err, TesseraError::AlreadyClosed(_)));
        assert!(reader.inc_ref().is_err());
    }

    #[test]
    fn test_inc_ref_keeps_reader_open() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = IndexWriter::new(Arc::clone(&storage), config()).unwrap();
        writer.add_document(&doc("1")).unwrap();
        writer.commit().unwrap();
        let reader = DirectoryReader::open(storage).unwrap();
        reader.inc_ref().unwrap();
        reader.close().unwrap();
        assert_eq!(reader.ref_count(), 1);
        assert_eq!(reader.segment_readers()[0].ref_count(), 1);
        reader.dec_ref().unwrap();
        assert_eq!(reader.segment_readers()[0].ref_count(), 0);
    }

    #[test]
    fn test_near_real_time_reader() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = IndexWriter::new(Arc::clone(&storage), config()).unwrap();
        writer.add_document(&doc("1")).unwrap();

        let nrt = DirectoryReader::open_from_writer(&writer, true).unwrap();
        assert_eq!(nrt.num_docs(), 1);
        assert!(nrt.is_current().unwrap());
        assert!(nrt.index_commit().unwrap().is_none());
        // Nothing was committed.
        assert!(DirectoryReader::open(Arc::clone(&storage)).is_err());

        writer.add_document(&doc("2")).unwrap();
        assert!(!nrt.is_current().unwrap());
        let reopened = DirectoryReader::open_if_changed(&nrt).unwrap().unwrap();
        assert_eq!(reopened.num_docs(), 2);
        assert!(Arc::ptr_eq(
            &nrt.segment_readers()[0],
            &reopened.segment_readers()[0]
        ));
        assert!(
            DirectoryReader::open_if_changed_with_writer(&reopened, &writer, true)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_near_real_time_reader_pins_files() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = IndexWriter::new(Arc::clone(&storage), config()).unwrap();
        writer.add_document(&doc("1")).unwrap();
        let nrt = DirectoryReader::open_from_writer(&writer, true).unwrap();
        let pinned = nrt.segment_infos().files(false);
        assert!(!pinned.is_empty());

        writer.delete_all().unwrap();
        writer.commit().unwrap();
        let files = storage.list_files().unwrap();
        assert!(pinned.iter().all(|f| files.contains(f)));

        nrt.close().unwrap();
        let files = storage.list_files().unwrap();
        assert!(pinned.iter().all(|f| !files.contains(f)));
    }

    #[test]
    fn test_open_older_commit() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = IndexWriter::new(
            Arc::clone(&storage),
            config().with_deletion_policy(Arc::new(NoDeletionPolicy::new())),
        )
        .unwrap();
        writer.add_document(&doc("1")).unwrap();
        writer.commit().unwrap();
        writer.add_document(&doc("2")).unwrap();
        writer.commit().unwrap();

        let commits = IndexCommit::list(Arc::clone(&storage), &DefaultCodec::new()).unwrap();
        assert_eq!(commits.len(), 2);
        let old = DirectoryReader::open_commit(&commits[0]).unwrap();
        assert_eq!(old.num_docs(), 1);
        assert_eq!(
            old.index_commit().unwrap().unwrap().generation(),
            commits[0].generation()
        );
        let newest = DirectoryReader::open(storage).unwrap();
        assert_eq!(newest.num_docs(), 2);
    }
}
