//! The index writer.
//!
//! [`IndexWriter`] is the single entry point for changing an index. Documents
//! are buffered by the [`DocumentsWriter`] and published here as flushed
//! segments, in ticket order, together with the global delete packets frozen
//! alongside them. Every change of the in-memory manifest is checkpointed
//! with the [`IndexFileDeleter`] and offered to the merge policy; merges run
//! on the configured scheduler and are committed back under the writer lock.
//!
//! Lock order: `commit_lock` before `state`; `state` before `tragedy` and
//! before the doc-values type map. The scheduler is never called while
//! `state` is held.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use log::{debug, error, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::codec::{self, Codec};
use crate::document::{DocId, DocValuesType, Document, Term};
use crate::error::{Result, TesseraError};
use crate::index::arena::ArenaContext;
use crate::index::buffered_updates::{BufferedUpdatesStream, FrozenBufferedUpdates};
use crate::index::config::{IndexWriterConfig, OpenMode};
use crate::index::delete_queue::DeleteOp;
use crate::index::deleter::IndexFileDeleter;
use crate::index::directory_reader::DirectoryReader;
use crate::index::doc_values::{DocValuesUpdate, DocValuesValue};
use crate::index::documents_writer::{DocumentsWriter, Publish};
use crate::index::flush_policy::FlushByRamOrCountsPolicy;
use crate::index::flush_ticket::PublishedTicket;
use crate::index::reader::{CompositeReader, LeafReader, locate};
use crate::index::reader_pool::{ReaderPool, ReadersAndUpdates};
use crate::index::segment::{SegmentCommitInfo, SegmentInfo};
use crate::index::segment_infos::SegmentInfos;
use crate::index::segment_reader::SegmentReader;
use crate::index::WRITE_LOCK_NAME;
use crate::merge::{
    MergeContext, MergePolicy, MergeScheduler, MergeSource, MergeState, MergeTrigger, OneMerge,
    SegmentMerger,
};
use crate::search::Query;
use crate::storage::{Storage, StorageLock};

const MERGE_WAIT: Duration = Duration::from_millis(100);

// ============================================================================
// Writer state
// ============================================================================

/// A prepared commit waiting for `finish_commit`.
#[derive(Debug)]
struct PendingCommit {
    /// `None` when nothing changed since the last commit.
    infos: Option<SegmentInfos>,
    /// Files referenced on behalf of the pending commit.
    files: BTreeSet<String>,
    change_count: u64,
    seq_no: u64,
}

/// Everything guarded by the writer lock.
#[derive(Debug)]
struct WriterState {
    /// The current in-memory manifest.
    segment_infos: SegmentInfos,

    /// The manifest `rollback` reverts to.
    rollback_infos: SegmentInfos,

    pending_commit: Option<PendingCommit>,

    /// Incremented on every change of the manifest or its segments.
    change_count: u64,

    /// `change_count` of the last successful commit.
    last_commit_change_count: u64,

    deleter: IndexFileDeleter,

    /// Pending deletes and doc-values updates per segment.
    pool: ReaderPool,

    /// Registered merges waiting for a scheduler thread.
    pending_merges: VecDeque<OneMerge>,

    /// Inputs of pending and running merges.
    merging_segments: BTreeSet<String>,

    /// Abort flags of merges handed to the scheduler, by merge id.
    running_merges: BTreeMap<u64, Arc<AtomicBool>>,

    /// Failures of background merges not yet reported.
    merge_exceptions: Vec<String>,

    /// Segments taking part in a forced merge; `true` for those that existed
    /// when it started.
    segments_to_merge: BTreeMap<String, bool>,

    stop_merges: bool,
    next_merge_id: u64,
}

impl WriterState {
    fn changed(&mut self) {
        self.change_count += 1;
        self.segment_infos.changed();
    }

    fn checkpoint(&mut self) -> Result<()> {
        self.deleter.checkpoint(&self.segment_infos, false)
    }
}

/// What merge policies see of the writer.
struct PoolMergeContext<'a> {
    pool: &'a ReaderPool,
    merging: &'a BTreeSet<String>,
}

impl MergeContext for PoolMergeContext<'_> {
    fn num_deletes_to_merge(&self, info: &SegmentCommitInfo) -> u32 {
        info.del_count
            + self
                .pool
                .peek(info.name())
                .map_or(0, ReadersAndUpdates::pending_delete_count)
    }

    fn merging_segments(&self) -> &BTreeSet<String> {
        self.merging
    }
}

#[derive(Debug)]
pub(crate) struct WriterInner {
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
    ctx: Arc<ArenaContext>,
    docs_writer: DocumentsWriter,
    updates_stream: BufferedUpdatesStream,
    state: Mutex<WriterState>,
    merge_done: Condvar,
    commit_lock: Mutex<()>,
    write_lock: Mutex<Option<Box<dyn StorageLock>>>,
    merge_policy: Arc<dyn MergePolicy>,
    merge_scheduler: Arc<dyn MergeScheduler>,
    commit_on_close: bool,
    closed: AtomicBool,
    closing: AtomicBool,
    tragedy: Mutex<Option<String>>,
    /// A segment was published since the last merge check.
    segment_flushed: AtomicBool,
    max_completed_seq_no: AtomicU64,
}

/// Adds, updates and deletes documents and commits the result.
///
/// The writer holds `write.lock` of its storage until it is closed or rolled
/// back. All methods take `&self` and may be called from many threads; each
/// indexing thread works on its own in-memory arena. Mutating operations
/// return a sequence number that totally orders them.
///
/// Dropping the writer closes it as [`IndexWriter::close`] would.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use tessera::document::{Document, Field, Term};
/// use tessera::index::{CompositeReader, DirectoryReader, IndexWriter, IndexWriterConfig};
/// use tessera::storage::{MemoryStorage, Storage};
///
/// let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
/// let writer = IndexWriter::new(Arc::clone(&storage), IndexWriterConfig::default()).unwrap();
/// let doc = Document::new().with(Field::string("id", "1", true));
/// writer.add_document(&doc).unwrap();
/// writer.update_document(Term::new("id", "1"), &doc).unwrap();
/// writer.commit().unwrap();
/// writer.close().unwrap();
///
/// let reader = DirectoryReader::open(storage).unwrap();
/// assert_eq!(reader.num_docs(), 1);
/// ```
#[derive(Debug)]
pub struct IndexWriter {
    inner: Arc<WriterInner>,
}

impl IndexWriter {
    /// Open a writer on `storage`.
    ///
    /// Fails with `LockObtainFailed` if another writer holds the index and
    /// with `IllegalState` if `config` already backs a writer.
    pub fn new(storage: Arc<dyn Storage>, config: IndexWriterConfig) -> Result<Self> {
        config.validate()?;
        config.acquire()?;
        Self::open(storage, config.clone()).inspect_err(|_| config.release())
    }

    fn open(storage: Arc<dyn Storage>, config: IndexWriterConfig) -> Result<Self> {
        let write_lock = storage.obtain_lock(WRITE_LOCK_NAME)?;
        let codec = Arc::clone(&config.codec);

        let files = storage.list_files()?;
        let index_exists = SegmentInfos::last_commit_generation(&files) != -1;
        let (segment_infos, create) = match (&config.index_commit, config.open_mode) {
            (Some(commit), _) => {
                if !Arc::ptr_eq(commit.storage(), &storage) {
                    return Err(TesseraError::illegal_argument(
                        "index_commit belongs to a different storage",
                    ));
                }
                let mut infos = SegmentInfos::read_commit(
                    storage.as_ref(),
                    codec.as_ref(),
                    commit.segments_file_name(),
                )?;
                // Continue numbering after the newest commit, not the opened one.
                let latest = SegmentInfos::read_latest(storage.as_ref(), codec.as_ref())?;
                infos.update_generation_version_and_counter(&latest);
                (infos, true)
            }
            (None, OpenMode::Create) => {
                let mut infos = SegmentInfos::new();
                if index_exists {
                    let latest = SegmentInfos::read_latest(storage.as_ref(), codec.as_ref())?;
                    infos.update_generation_version_and_counter(&latest);
                }
                (infos, true)
            }
            (None, OpenMode::Append) => (
                SegmentInfos::read_latest(storage.as_ref(), codec.as_ref())?,
                false,
            ),
            (None, OpenMode::CreateOrAppend) if index_exists => (
                SegmentInfos::read_latest(storage.as_ref(), codec.as_ref())?,
                false,
            ),
            (None, OpenMode::CreateOrAppend) => (SegmentInfos::new(), true),
        };

        let deleter = IndexFileDeleter::new(
            Arc::clone(&storage),
            codec.as_ref(),
            Arc::clone(&config.deletion_policy),
            &segment_infos,
        )?;

        let ctx = Arc::new(ArenaContext {
            storage: Arc::clone(&storage),
            codec: Arc::clone(&codec),
            analyzer: Arc::clone(&config.analyzer),
            similarity: Arc::clone(&config.similarity),
            use_compound_file: config.use_compound_file,
            name_counter: Arc::new(AtomicU64::new(segment_infos.counter)),
            doc_values_types: Arc::new(Mutex::new(AHashMap::new())),
        });
        let flush_policy = FlushByRamOrCountsPolicy::new(
            config.ram_buffer_size_mb,
            config.max_buffered_docs,
            config.max_buffered_delete_terms,
        );
        let docs_writer = DocumentsWriter::new(
            Arc::clone(&ctx),
            Arc::new(flush_policy),
            config.hard_limit_bytes(),
            config.stall_limit_bytes(),
            config.check_pending_flush_on_update,
            1,
        );

        debug!(
            target: "tessera::iw",
            "open writer: mode={:?} create={create} segments={} generation={}",
            config.open_mode,
            segment_infos.len(),
            segment_infos.last_generation()
        );

        let state = WriterState {
            rollback_infos: segment_infos.clone(),
            segment_infos,
            pending_commit: None,
            // A new index is committed even if nothing is added.
            change_count: u64::from(create),
            last_commit_change_count: 0,
            deleter,
            pool: ReaderPool::new(),
            pending_merges: VecDeque::new(),
            merging_segments: BTreeSet::new(),
            running_merges: BTreeMap::new(),
            merge_exceptions: Vec::new(),
            segments_to_merge: BTreeMap::new(),
            stop_merges: false,
            next_merge_id: 1,
        };

        Ok(IndexWriter {
            inner: Arc::new(WriterInner {
                storage,
                codec,
                ctx,
                docs_writer,
                updates_stream: BufferedUpdatesStream::new(),
                state: Mutex::new(state),
                merge_done: Condvar::new(),
                commit_lock: Mutex::new(()),
                write_lock: Mutex::new(Some(write_lock)),
                merge_policy: Arc::clone(&config.merge_policy),
                merge_scheduler: Arc::clone(&config.merge_scheduler),
                commit_on_close: config.commit_on_close,
                closed: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                tragedy: Mutex::new(None),
                segment_flushed: AtomicBool::new(false),
                max_completed_seq_no: AtomicU64::new(0),
            }),
        })
    }

    /// The storage this writer writes to.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    pub(crate) fn inner(&self) -> &Arc<WriterInner> {
        &self.inner
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    /// Add a document.
    pub fn add_document(&self, doc: &Document) -> Result<u64> {
        self.add_documents(std::slice::from_ref(doc))
    }

    /// Add a block of documents atomically: they get adjacent ids in the
    /// same segment and become visible together.
    pub fn add_documents(&self, docs: &[Document]) -> Result<u64> {
        self.inner
            .run_update(|dw, publish| dw.update_documents(docs, None, publish))
    }

    /// Delete the documents containing `term` and add `doc`, atomically.
    pub fn update_document(&self, term: Term, doc: &Document) -> Result<u64> {
        self.update_documents(term, std::slice::from_ref(doc))
    }

    /// Delete the documents containing `term` and add `docs` as a block.
    pub fn update_documents(&self, term: Term, docs: &[Document]) -> Result<u64> {
        self.inner.run_update(|dw, publish| {
            dw.update_documents(docs, Some(DeleteOp::Terms(vec![term])), publish)
        })
    }

    /// Delete the documents containing any of `terms`.
    pub fn delete_documents(&self, terms: Vec<Term>) -> Result<u64> {
        self.inner
            .run_update(|dw, publish| dw.delete_terms(terms, publish))
    }

    /// Delete the documents matching any of `queries`.
    pub fn delete_documents_by_query(&self, queries: Vec<Arc<dyn Query>>) -> Result<u64> {
        self.inner
            .run_update(|dw, publish| dw.delete_queries(queries, publish))
    }

    /// Set a numeric doc value on every document containing `term`. The
    /// field must already exist as a numeric doc-values field.
    pub fn update_numeric_doc_value(&self, term: Term, field: &str, value: i64) -> Result<u64> {
        self.inner
            .update_doc_value(term, field, DocValuesValue::Numeric(Some(value)))
    }

    /// Set a binary doc value on every document containing `term`. The
    /// field must already exist as a binary doc-values field.
    pub fn update_binary_doc_value(
        &self,
        term: Term,
        field: &str,
        value: Vec<u8>,
    ) -> Result<u64> {
        self.inner
            .update_doc_value(term, field, DocValuesValue::Binary(Some(value)))
    }

    /// Delete every document, buffered or published.
    pub fn delete_all(&self) -> Result<u64> {
        self.inner.delete_all()
    }

    /// Delete composite document `doc` of a near-real-time `reader` if its
    /// segment is still part of the index. Returns `None` if the segment
    /// was merged away in the meantime.
    pub fn try_delete_document(&self, reader: &DirectoryReader, doc: DocId) -> Result<Option<u64>> {
        self.inner.try_delete_document(reader, doc)
    }

    // ------------------------------------------------------------------
    // Flush, commit, rollback
    // ------------------------------------------------------------------

    /// Flush every buffered document to a segment and apply all buffered
    /// deletes. Nothing is committed.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush_internal(true).map(|_| ())
    }

    /// First phase of a two-phase commit: flush, write pending deletes and
    /// write and sync `pending_segments_N`. Returns the sequence number of
    /// the last operation included.
    pub fn prepare_commit(&self) -> Result<u64> {
        self.inner.prepare_commit()
    }

    /// Commit everything added, deleted and merged so far. Returns the
    /// sequence number of the last operation included.
    pub fn commit(&self) -> Result<u64> {
        self.inner.commit()
    }

    /// Discard every change since the last commit and close the writer.
    pub fn rollback(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.inner.rollback_internal()
    }

    /// Close the writer: commit and wait for merges if `commit_on_close`
    /// is set, roll back otherwise. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.inner.commit_on_close {
            self.inner.shutdown()
        } else {
            self.inner.rollback_internal()
        }
    }

    /// Attach user data to the next commit.
    pub fn set_live_commit_data(&self, data: BTreeMap<String, String>) -> Result<()> {
        self.inner.ensure_open()?;
        let mut state = self.inner.state.lock();
        state.segment_infos.set_user_data(data, false);
        state.changed();
        Ok(())
    }

    /// User data the next commit will carry.
    pub fn live_commit_data(&self) -> BTreeMap<String, String> {
        self.inner.state.lock().segment_infos.user_data.clone()
    }

    /// Let the deletion policy reconsider the kept commits, for instance
    /// after a snapshot was released.
    pub fn delete_unused_files(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.state.lock().deleter.revisit_policy()
    }

    // ------------------------------------------------------------------
    // Merging
    // ------------------------------------------------------------------

    /// Ask the merge policy for merges and hand them to the scheduler.
    pub fn maybe_merge(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.maybe_merge(MergeTrigger::Explicit)
    }

    /// Merge until at most `max_num_segments` segments remain, waiting for
    /// the merges. A failed merge is reported as an error.
    pub fn force_merge(&self, max_num_segments: usize) -> Result<()> {
        self.inner.force_merge(max_num_segments)
    }

    /// Merge away deleted documents, waiting for the merges.
    pub fn force_merge_deletes(&self) -> Result<()> {
        self.inner.force_merge_deletes()
    }

    /// Wait for every pending and running merge. Reports the first merge
    /// that failed since the last call.
    pub fn wait_for_merges(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.wait_merges()?;
        self.inner.take_merge_exception()
    }

    /// Whether registered merges wait for a scheduler thread.
    pub fn has_pending_merges(&self) -> bool {
        self.inner.has_pending_merges()
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// Whether anything changed since the last commit.
    pub fn has_uncommitted_changes(&self) -> bool {
        let state = self.inner.state.lock();
        state.change_count != state.last_commit_change_count || self.inner.docs_writer.any_changes()
    }

    /// Documents buffered in memory.
    pub fn num_ram_docs(&self) -> u64 {
        self.inner.docs_writer.num_docs_in_ram()
    }

    /// Bytes buffered in memory.
    pub fn ram_bytes_used(&self) -> usize {
        self.inner.docs_writer.ram_bytes_used()
    }

    /// Segments in the current manifest.
    pub fn segment_count(&self) -> usize {
        self.inner.state.lock().segment_infos.len()
    }

    /// Documents in the index, deleted and buffered ones included.
    pub fn max_doc(&self) -> u64 {
        self.inner.state.lock().segment_infos.total_max_doc() + self.num_ram_docs()
    }

    /// Live documents in published segments plus buffered documents.
    /// Deletes not yet applied are not reflected.
    pub fn num_docs(&self) -> u64 {
        let state = self.inner.state.lock();
        let ctx = PoolMergeContext {
            pool: &state.pool,
            merging: &state.merging_segments,
        };
        let published: u64 = state
            .segment_infos
            .iter()
            .map(|sci| (sci.info.max_doc - ctx.num_deletes_to_merge(sci).min(sci.info.max_doc)) as u64)
            .sum();
        published + self.num_ram_docs()
    }

    /// Highest sequence number of an operation that completed.
    pub fn max_completed_sequence_number(&self) -> u64 {
        self.inner.max_completed_seq_no.load(Ordering::Acquire)
    }

    /// The cause of the tragic event that closed this writer, if any.
    pub fn tragic_exception(&self) -> Option<String> {
        self.inner.tragedy.lock().clone()
    }

    /// Whether the writer was closed or rolled back.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The manifest the next commit would write.
    pub fn segment_infos(&self) -> SegmentInfos {
        self.inner.state.lock().segment_infos.clone()
    }

    /// Flush control of the documents writer, for accounting checks.
    pub fn documents_writer(&self) -> &DocumentsWriter {
        &self.inner.docs_writer
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(target: "tessera::iw", "closing writer on drop failed: {e}");
        }
    }
}

// ============================================================================
// Writer internals
// ============================================================================

impl WriterInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            if let Some(cause) = self.tragedy.lock().as_deref() {
                return Err(TesseraError::already_closed(format!(
                    "this writer hit an unrecoverable error: {cause}"
                )));
            }
            return Err(TesseraError::already_closed("this writer is closed"));
        }
        Ok(())
    }

    /// Record a failure that leaves the writer unusable. The caller rolls
    /// back once it holds no lock.
    fn tragic_event(&self, err: TesseraError, location: &str) -> TesseraError {
        error!(target: "tessera::iw", "tragic event in {location}: {err}");
        let mut tragedy = self.tragedy.lock();
        if tragedy.is_none() {
            *tragedy = Some(format!("{location}: {err}"));
        }
        err
    }

    fn check_tragedy<T>(self: &Arc<Self>, result: Result<T>) -> Result<T> {
        if result.is_err()
            && self.tragedy.lock().is_some()
            && !self.closed.load(Ordering::Acquire)
        {
            if let Err(e) = self.rollback_internal() {
                warn!(target: "tessera::iw", "rollback after tragic event failed: {e}");
            }
        }
        result
    }

    fn record_seq_no(&self, seq_no: u64) {
        self.max_completed_seq_no.fetch_max(seq_no, Ordering::AcqRel);
    }

    fn run_update<F>(self: &Arc<Self>, op: F) -> Result<u64>
    where
        F: FnOnce(&DocumentsWriter, Publish<'_>) -> Result<u64>,
    {
        self.ensure_open()?;
        let publish = |ticket: PublishedTicket| self.publish_ticket(ticket);
        let result = op(&self.docs_writer, &publish);
        let seq_no = self.check_tragedy(result)?;
        self.record_seq_no(seq_no);
        if self.segment_flushed.swap(false, Ordering::AcqRel) {
            self.maybe_merge(MergeTrigger::SegmentFlush)?;
        }
        Ok(seq_no)
    }

    // ------------------------------------------------------------------
    // Publishing flushed segments and delete packets
    // ------------------------------------------------------------------

    fn publish_ticket(&self, ticket: PublishedTicket) -> Result<()> {
        let mut state = self.state.lock();
        let mut changed = false;
        if let Some(packet) = ticket.global_updates.filter(FrozenBufferedUpdates::any) {
            self.apply_packet(&mut state, packet)?;
            changed = true;
        }
        if let Some(flushed) = ticket.segment {
            let mut sci = flushed.sci;
            // Packets published from now on apply to this segment.
            sci.buffered_deletes_gen = self.updates_stream.next_gen();
            debug!(
                target: "tessera::iw",
                "publish flushed segment {} ({} docs, {} deleted while buffered)",
                sci.name(),
                sci.info.max_doc,
                flushed.del_count
            );
            state.segment_infos.add(sci);
            self.segment_flushed.store(true, Ordering::Release);
            changed = true;
        }
        if changed {
            state.changed();
            state.checkpoint()?;
        }
        Ok(())
    }

    /// Apply a global packet to every published segment older than it.
    /// Failures are tragic: the packet would be half applied.
    fn apply_packet(&self, state: &mut WriterState, packet: FrozenBufferedUpdates) -> Result<()> {
        let packet = self.updates_stream.push(packet);
        let del_gen = packet.del_gen().unwrap_or(0);
        let WriterState {
            segment_infos,
            pool,
            merging_segments,
            ..
        } = state;

        let mut deleted = 0;
        let mut fully_deleted = Vec::new();
        for sci in segment_infos.iter().filter(|sci| sci.buffered_deletes_gen < del_gen) {
            let entry = pool.get(sci.name());
            deleted += entry
                .apply_packet(self.storage.as_ref(), self.codec.as_ref(), sci, &packet)
                .map_err(|e| self.tragic_event(e, "apply_deletes"))?;
            if entry.is_fully_deleted(sci) && !merging_segments.contains(sci.name()) {
                fully_deleted.push(sci.name().to_string());
            }
        }
        for name in &fully_deleted {
            debug!(target: "tessera::bd", "drop fully deleted segment {name}");
            segment_infos.remove(name);
            pool.drop_entry(name);
        }
        debug!(target: "tessera::bd", "applied {packet}: {deleted} newly deleted docs");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Updates outside the documents writer
    // ------------------------------------------------------------------

    fn update_doc_value(
        self: &Arc<Self>,
        term: Term,
        field: &str,
        value: DocValuesValue,
    ) -> Result<u64> {
        self.ensure_open()?;
        let kind = value.doc_values_type();
        match self.doc_values_type(field)? {
            None => {
                return Err(TesseraError::illegal_argument(format!(
                    "can only update existing doc values fields; \"{field}\" does not exist"
                )));
            }
            Some(existing) if existing != kind => {
                return Err(TesseraError::illegal_argument(format!(
                    "cannot update {kind:?} doc values of field \"{field}\" of type {existing:?}"
                )));
            }
            Some(_) => {}
        }
        let update = DocValuesUpdate {
            term,
            field: field.to_string(),
            value,
        };
        self.run_update(|dw, publish| dw.update_doc_values(vec![update], publish))
    }

    /// Doc-values type of `field`, looking at published segments when no
    /// buffered document declared it.
    fn doc_values_type(&self, field: &str) -> Result<Option<DocValuesType>> {
        if let Some(kind) = self.ctx.doc_values_types.lock().get(field) {
            return Ok(Some(*kind));
        }
        let mut state = self.state.lock();
        let WriterState {
            segment_infos,
            pool,
            ..
        } = &mut *state;
        for sci in segment_infos.iter() {
            let reader = pool
                .get(sci.name())
                .reader(self.storage.as_ref(), self.codec.as_ref(), sci)?;
            if let Some(kind) = reader.field_infos().get(field).and_then(|info| info.doc_values) {
                self.ctx
                    .doc_values_types
                    .lock()
                    .insert(field.to_string(), kind);
                return Ok(Some(kind));
            }
        }
        Ok(None)
    }

    fn delete_all(self: &Arc<Self>) -> Result<u64> {
        self.ensure_open()?;
        let _commit = self.commit_lock.lock();
        {
            let mut state = self.state.lock();
            self.abort_merges(&mut state);
            state.stop_merges = false;
        }
        let seq_no = self.docs_writer.abort();
        let mut state = self.state.lock();
        state.pool.drop_all();
        state.segment_infos.clear();
        state.segments_to_merge.clear();
        state.changed();
        state.checkpoint()?;
        drop(state);
        debug!(target: "tessera::iw", "delete all documents");
        self.record_seq_no(seq_no);
        Ok(seq_no)
    }

    fn try_delete_document(&self, reader: &DirectoryReader, doc: DocId) -> Result<Option<u64>> {
        self.ensure_open()?;
        if !Arc::ptr_eq(reader.storage(), &self.storage) {
            return Err(TesseraError::illegal_argument(
                "reader does not read this writer's index",
            ));
        }
        let (leaf, local) = locate(&reader.leaves(), doc)?;
        let Some(segment) = reader.segment_readers().get(leaf.ord) else {
            return Ok(None);
        };
        let mut state = self.state.lock();
        let Some(sci) = state.segment_infos.find(segment.name()).cloned() else {
            return Ok(None);
        };
        // A merging segment logs the delete and the merge carries it over.
        let entry = state.pool.get(sci.name());
        if entry.delete(self.storage.as_ref(), self.codec.as_ref(), &sci, local)? {
            let fully_deleted = entry.is_fully_deleted(&sci);
            if fully_deleted && !state.merging_segments.contains(sci.name()) {
                state.segment_infos.remove(sci.name());
                state.pool.drop_entry(sci.name());
            }
            state.changed();
            state.checkpoint()?;
        }
        drop(state);
        let seq_no = self.docs_writer.next_sequence_number();
        self.record_seq_no(seq_no);
        Ok(Some(seq_no))
    }

    // ------------------------------------------------------------------
    // Flush and commit
    // ------------------------------------------------------------------

    /// Flush all arenas and publish the frozen deletes. Returns whether
    /// anything was flushed.
    fn flush_internal(self: &Arc<Self>, trigger_merge: bool) -> Result<bool> {
        self.ensure_open()?;
        let publish = |ticket: PublishedTicket| self.publish_ticket(ticket);
        let result = self.docs_writer.flush_all_arenas(&publish);
        let flush = self.check_tragedy(result)?;
        self.segment_flushed.store(false, Ordering::Release);
        self.record_seq_no(flush.seq_no);
        if trigger_merge {
            self.maybe_merge(MergeTrigger::FullFlush)?;
        }
        Ok(flush.any_changes)
    }

    fn prepare_commit(self: &Arc<Self>) -> Result<u64> {
        self.ensure_open()?;
        let result = {
            let _commit = self.commit_lock.lock();
            self.prepare_commit_internal()
        };
        let seq_no = self.check_tragedy(result)?;
        self.maybe_merge(MergeTrigger::FullFlush)?;
        Ok(seq_no)
    }

    /// Caller holds `commit_lock`.
    fn prepare_commit_internal(&self) -> Result<u64> {
        if self.state.lock().pending_commit.is_some() {
            return Err(TesseraError::illegal_state(
                "prepare_commit was already called with no corresponding call to commit",
            ));
        }
        debug!(target: "tessera::iw", "prepare commit: start flush");
        let publish = |ticket: PublishedTicket| self.publish_ticket(ticket);
        let flush = self.docs_writer.flush_all_arenas(&publish)?;
        self.segment_flushed.store(false, Ordering::Release);
        let seq_no = flush.seq_no;

        let (mut to_commit, files, change_count) = {
            let mut state = self.state.lock();
            if self.write_pending_changes(&mut state)? {
                state.checkpoint()?;
            }
            state.segment_infos.counter = self.ctx.name_counter.load(Ordering::Acquire);
            if state.change_count == state.last_commit_change_count {
                debug!(target: "tessera::iw", "prepare commit: no changes pending");
                state.pending_commit = Some(PendingCommit {
                    infos: None,
                    files: BTreeSet::new(),
                    change_count: state.change_count,
                    seq_no,
                });
                return Ok(seq_no);
            }
            let to_commit = state.segment_infos.clone();
            let files = to_commit.files(false);
            state.deleter.inc_ref(&files);
            (to_commit, files, state.change_count)
        };

        let names: Vec<String> = files.iter().cloned().collect();
        let written = self
            .storage
            .sync(&names)
            .and_then(|_| to_commit.prepare_commit(self.storage.as_ref(), self.codec.as_ref()));
        if let Err(e) = written {
            self.state.lock().deleter.dec_ref(&files);
            return Err(self.tragic_event(e, "prepare_commit"));
        }
        debug!(
            target: "tessera::iw",
            "prepared commit generation {} with {} segments",
            to_commit.generation(),
            to_commit.len()
        );
        self.state.lock().pending_commit = Some(PendingCommit {
            infos: Some(to_commit),
            files,
            change_count,
            seq_no,
        });
        Ok(seq_no)
    }

    /// Write pending deletes and doc-values updates as generation files.
    /// Returns whether anything was written; failures are tragic.
    fn write_pending_changes(&self, state: &mut WriterState) -> Result<bool> {
        let WriterState {
            segment_infos,
            pool,
            ..
        } = state;
        let mut written = false;
        for name in pool.dirty_segments() {
            let Some(sci) = segment_infos.find_mut(&name) else {
                continue;
            };
            let entry = pool.get(&name);
            written |= entry
                .write_live_docs(self.storage.as_ref(), self.codec.as_ref(), sci)
                .map_err(|e| self.tragic_event(e, "write_live_docs"))?;
            written |= entry
                .write_dv_updates(self.storage.as_ref(), self.codec.as_ref(), sci)
                .map_err(|e| self.tragic_event(e, "write_doc_values_updates"))?;
        }
        Ok(written)
    }

    fn commit(self: &Arc<Self>) -> Result<u64> {
        self.ensure_open()?;
        let result = {
            let _commit = self.commit_lock.lock();
            self.commit_internal()
        };
        let seq_no = self.check_tragedy(result)?;
        self.record_seq_no(seq_no);
        self.maybe_merge(MergeTrigger::FullFlush)?;
        Ok(seq_no)
    }

    /// Caller holds `commit_lock`.
    fn commit_internal(&self) -> Result<u64> {
        let pending = self.state.lock().pending_commit.take();
        let pending = match pending {
            Some(pending) => pending,
            None => {
                self.prepare_commit_internal()?;
                self.state
                    .lock()
                    .pending_commit
                    .take()
                    .ok_or_else(|| TesseraError::illegal_state("commit was not prepared"))?
            }
        };
        let Some(mut infos) = pending.infos else {
            debug!(target: "tessera::iw", "commit: nothing to commit");
            return Ok(pending.seq_no);
        };

        let finished = infos.finish_commit(self.storage.as_ref());
        let mut state = self.state.lock();
        let file = match finished {
            Ok(file) => file,
            Err(e) => {
                state.deleter.dec_ref(&pending.files);
                return Err(self.tragic_event(e, "finish_commit"));
            }
        };
        if let Err(e) = state.deleter.checkpoint(&infos, true) {
            state.deleter.dec_ref(&pending.files);
            return Err(self.tragic_event(e, "checkpoint"));
        }
        state.deleter.dec_ref(&pending.files);
        state.segment_infos.update_generation(&infos);
        state.last_commit_change_count = pending.change_count;
        state.rollback_infos = infos;
        debug!(target: "tessera::iw", "commit: wrote {file}");
        Ok(pending.seq_no)
    }

    /// Flush, wait for merges, commit and close.
    fn shutdown(self: &Arc<Self>) -> Result<()> {
        let result = self
            .flush_internal(true)
            .and_then(|_| self.wait_merges())
            .and_then(|_| self.commit().map(|_| ()));
        if let Err(e) = self.take_merge_exception() {
            warn!(target: "tessera::iw", "merge failure while closing: {e}");
        }
        let rolled_back = if self.closed.load(Ordering::Acquire) {
            Ok(())
        } else {
            self.rollback_internal()
        };
        result.and(rolled_back)
    }

    /// Stop merging, discard buffered documents and the pending commit,
    /// revert to the last commit and release the write lock.
    fn rollback_internal(self: &Arc<Self>) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(target: "tessera::iw", "rollback");
        {
            let mut state = self.state.lock();
            self.abort_merges(&mut state);
        }
        let mut result = self.merge_scheduler.close();

        self.docs_writer.close();
        self.docs_writer.abort();

        {
            let _commit = self.commit_lock.lock();
            let mut state = self.state.lock();
            state.pool.drop_all();
            if let Some(pending) = state.pending_commit.take() {
                if let Some(mut infos) = pending.infos {
                    infos.rollback_commit(self.storage.as_ref());
                }
                state.deleter.dec_ref(&pending.files);
            }
            let rollback = state.rollback_infos.clone();
            let counter = state
                .segment_infos
                .counter
                .max(self.ctx.name_counter.load(Ordering::Acquire));
            state.segment_infos.replace(rollback.segments().to_vec());
            state.segment_infos.user_data = rollback.user_data.clone();
            state.segment_infos.counter = counter;
            state.changed();
            let reverted = state.checkpoint().and_then(|_| state.deleter.refresh());
            result = result.and(reverted);
        }

        if let Some(mut lock) = self.write_lock.lock().take() {
            if let Err(e) = lock.release() {
                warn!(target: "tessera::iw", "cannot release {WRITE_LOCK_NAME}: {e}");
            }
        }
        self.closed.store(true, Ordering::Release);
        self.merge_done.notify_all();
        debug!(target: "tessera::iw", "rollback: done");
        result
    }

    // ------------------------------------------------------------------
    // Merge registration
    // ------------------------------------------------------------------

    /// Abort pending and running merges and wait for the running ones.
    /// Leaves `stop_merges` set.
    fn abort_merges(&self, state: &mut parking_lot::MutexGuard<'_, WriterState>) {
        state.stop_merges = true;
        let pending: Vec<OneMerge> = state.pending_merges.drain(..).collect();
        for merge in pending {
            debug!(target: "tessera::iw", "abort pending merge {}", merge.seg_string());
            merge.abort();
            for name in merge.segment_names() {
                state.merging_segments.remove(&name);
            }
        }
        for flag in state.running_merges.values() {
            flag.store(true, Ordering::Release);
        }
        while !state.running_merges.is_empty() {
            debug!(
                target: "tessera::iw",
                "wait for {} running merges to abort",
                state.running_merges.len()
            );
            self.merge_done.wait_for(state, MERGE_WAIT);
        }
        state.segments_to_merge.clear();
    }

    fn maybe_merge(self: &Arc<Self>, trigger: MergeTrigger) -> Result<()> {
        let found = {
            let mut state = self.state.lock();
            self.update_pending_merges(&mut state, trigger, None)
        };
        let source: Arc<dyn MergeSource> = Arc::clone(self) as Arc<dyn MergeSource>;
        self.merge_scheduler.merge(source, trigger, found)
    }

    /// Ask the policy for merges and register them. Returns whether any
    /// was registered.
    fn update_pending_merges(
        &self,
        state: &mut WriterState,
        trigger: MergeTrigger,
        max_num_segments: Option<usize>,
    ) -> bool {
        if state.stop_merges || self.tragedy.lock().is_some() {
            return false;
        }
        let spec = {
            let ctx = PoolMergeContext {
                pool: &state.pool,
                merging: &state.merging_segments,
            };
            match max_num_segments {
                Some(max) => self.merge_policy.find_forced_merges(
                    &state.segment_infos,
                    max,
                    &state.segments_to_merge,
                    &ctx,
                ),
                None => self
                    .merge_policy
                    .find_merges(trigger, &state.segment_infos, &ctx),
            }
        };
        let Some(spec) = spec else {
            return false;
        };
        let mut found = false;
        for mut merge in spec.merges {
            merge.max_num_segments = max_num_segments;
            found |= self.register_merge(state, merge);
        }
        found
    }

    fn register_merge(&self, state: &mut WriterState, mut merge: OneMerge) -> bool {
        if merge.segments.is_empty() {
            return false;
        }
        for sci in &merge.segments {
            if state.merging_segments.contains(sci.name())
                || state.segment_infos.find(sci.name()).is_none()
            {
                debug!(
                    target: "tessera::iw",
                    "skip merge {}: {} is merging or gone",
                    merge.seg_string(),
                    sci.name()
                );
                return false;
            }
        }
        for sci in &merge.segments {
            state.merging_segments.insert(sci.name().to_string());
        }
        merge.id = state.next_merge_id;
        state.next_merge_id += 1;
        debug!(target: "tessera::iw", "register merge {}: {}", merge.id, merge.seg_string());
        state.pending_merges.push_back(merge);
        true
    }

    fn take_merge_exception(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.merge_exceptions.is_empty() {
            return Ok(());
        }
        let first = state.merge_exceptions.remove(0);
        state.merge_exceptions.clear();
        Err(TesseraError::index(format!("background merge hit exception: {first}")))
    }

    /// Run the scheduler and wait until no merge runs or waits. Merges a
    /// scheduler leaves pending (as `NoMergeScheduler` does) are not waited
    /// for.
    fn wait_merges(self: &Arc<Self>) -> Result<()> {
        loop {
            let source: Arc<dyn MergeSource> = Arc::clone(self) as Arc<dyn MergeSource>;
            self.merge_scheduler
                .merge(source, MergeTrigger::Explicit, false)?;
            let mut state = self.state.lock();
            if state.running_merges.is_empty() {
                return Ok(());
            }
            while !state.running_merges.is_empty() {
                self.merge_done.wait_for(&mut state, MERGE_WAIT);
            }
            if state.pending_merges.is_empty() || state.stop_merges {
                return Ok(());
            }
        }
    }

    fn force_merge(self: &Arc<Self>, max_num_segments: usize) -> Result<()> {
        self.ensure_open()?;
        if max_num_segments == 0 {
            return Err(TesseraError::illegal_argument(
                "max_num_segments must be at least 1",
            ));
        }
        debug!(target: "tessera::iw", "force merge to {max_num_segments} segments");
        self.flush_internal(true)?;
        {
            let mut state = self.state.lock();
            let names: Vec<String> = state
                .segment_infos
                .iter()
                .map(|sci| sci.name().to_string())
                .collect();
            state.segments_to_merge = names.into_iter().map(|name| (name, true)).collect();
        }

        let result = self.run_forced_merges(max_num_segments);
        self.state.lock().segments_to_merge.clear();
        result?;
        self.take_merge_exception()
    }

    fn run_forced_merges(self: &Arc<Self>, max_num_segments: usize) -> Result<()> {
        loop {
            let found = {
                let mut state = self.state.lock();
                self.update_pending_merges(&mut state, MergeTrigger::Explicit, Some(max_num_segments))
            };
            let source: Arc<dyn MergeSource> = Arc::clone(self) as Arc<dyn MergeSource>;
            self.merge_scheduler
                .merge(source, MergeTrigger::Explicit, found)?;

            let mut state = self.state.lock();
            if state.running_merges.is_empty() && !state.pending_merges.is_empty() {
                // The scheduler does not run merges.
                return Ok(());
            }
            while !state.running_merges.is_empty() {
                self.merge_done.wait_for(&mut state, MERGE_WAIT);
            }
            if !state.merge_exceptions.is_empty() || state.stop_merges {
                return Ok(());
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(TesseraError::already_closed(
                    "writer was closed during force_merge",
                ));
            }
            if !state.pending_merges.is_empty() {
                continue;
            }
            let more = {
                let ctx = PoolMergeContext {
                    pool: &state.pool,
                    merging: &state.merging_segments,
                };
                self.merge_policy.find_forced_merges(
                    &state.segment_infos,
                    max_num_segments,
                    &state.segments_to_merge,
                    &ctx,
                )
            };
            if more.is_none() {
                return Ok(());
            }
        }
    }

    fn force_merge_deletes(self: &Arc<Self>) -> Result<()> {
        self.ensure_open()?;
        self.flush_internal(true)?;
        let found = {
            let mut state = self.state.lock();
            let spec = {
                let ctx = PoolMergeContext {
                    pool: &state.pool,
                    merging: &state.merging_segments,
                };
                self.merge_policy
                    .find_forced_deletes_merges(&state.segment_infos, &ctx)
            };
            let mut found = false;
            for merge in spec.map(|spec| spec.merges).unwrap_or_default() {
                found |= self.register_merge(&mut state, merge);
            }
            found
        };
        debug!(target: "tessera::iw", "force merge deletes: registered={found}");
        let source: Arc<dyn MergeSource> = Arc::clone(self) as Arc<dyn MergeSource>;
        self.merge_scheduler
            .merge(source, MergeTrigger::Explicit, found)?;
        self.wait_merges()?;
        self.take_merge_exception()
    }

    // ------------------------------------------------------------------
    // Merge execution
    // ------------------------------------------------------------------

    /// Open merge readers for every input and start logging their changes.
    fn merge_init(&self, merge: &OneMerge) -> Result<Vec<SegmentReader>> {
        merge.check_aborted()?;
        let mut state = self.state.lock();
        if self.closed.load(Ordering::Acquire) || state.stop_merges {
            return Err(TesseraError::merge_aborted(merge.seg_string()));
        }
        let WriterState {
            segment_infos,
            pool,
            ..
        } = &mut *state;
        let mut readers = Vec::with_capacity(merge.segments.len());
        for input in &merge.segments {
            let sci = segment_infos.find(input.name()).ok_or_else(|| {
                TesseraError::illegal_state(format!(
                    "merge input {} is no longer part of the index",
                    input.name()
                ))
            })?;
            readers.push(pool.get(sci.name()).reader_for_merge(
                self.storage.as_ref(),
                self.codec.as_ref(),
                sci,
            )?);
        }
        Ok(readers)
    }

    fn merge_middle(&self, merge: &OneMerge, readers: Vec<SegmentReader>) -> Result<()> {
        let name = self.ctx.new_segment_name();
        debug!(target: "tessera::iw", "merge {} into {name}", merge.seg_string());

        let merger = SegmentMerger::new(readers, merge.abort_flag());
        let (data, merge_state) = merger.merge()?;
        merge.check_aborted()?;
        if merge_state.max_doc == 0 {
            return self.commit_merge(merge, None, &merge_state);
        }

        let mut info = SegmentInfo::new(&name, merge_state.max_doc, self.codec.name(), "merge");
        let inputs: Vec<String> = merge.segment_names().into_iter().collect();
        info.diagnostics
            .insert("merge_inputs".to_string(), inputs.join(","));
        info.diagnostics.insert(
            "merge_max_num_segments".to_string(),
            merge
                .max_num_segments
                .map_or_else(|| "-1".to_string(), |n| n.to_string()),
        );
        // Estimate the size from the inputs for the compound-file decision.
        let live_ratio = merge_state.max_doc as f64 / merge.total_max_doc.max(1) as f64;
        info.size_in_bytes = (merge.total_bytes_size() as f64 * live_ratio) as u64;
        let use_compound_file = {
            let state = self.state.lock();
            let ctx = PoolMergeContext {
                pool: &state.pool,
                merging: &state.merging_segments,
            };
            let provisional = SegmentCommitInfo::new(info.clone(), 0, -1, -1);
            self.merge_policy
                .use_compound_file(&state.segment_infos, &provisional, &ctx)
        };

        codec::write_new_segment(
            self.storage.as_ref(),
            self.codec.as_ref(),
            &mut info,
            &data,
            use_compound_file,
        )?;
        if let Err(e) = merge.check_aborted() {
            codec::delete_segment_files(self.storage.as_ref(), &name);
            return Err(e);
        }
        let result = self.commit_merge(merge, Some(info), &merge_state);
        if result.is_err() {
            codec::delete_segment_files(self.storage.as_ref(), &name);
        }
        result
    }

    /// Swap the inputs for the merged segment, carrying over deletes and
    /// doc-values updates the inputs received while the merge ran.
    fn commit_merge(
        &self,
        merge: &OneMerge,
        merged: Option<SegmentInfo>,
        merge_state: &MergeState,
    ) -> Result<()> {
        let mut state = self.state.lock();
        merge.check_aborted()?;
        if self.closed.load(Ordering::Acquire) || self.tragedy.lock().is_some() {
            return Err(TesseraError::merge_aborted(merge.seg_string()));
        }
        let names = merge.segment_names();
        if let Some(missing) = names.iter().find(|n| state.segment_infos.find(n).is_none()) {
            return Err(TesseraError::merge_aborted(format!(
                "{}: input {missing} was dropped",
                merge.seg_string()
            )));
        }

        let logs: Vec<_> = merge
            .segments
            .iter()
            .map(|input| state.pool.get(input.name()).finish_merge())
            .collect();

        let mut carried = 0;
        let merged = match merged {
            Some(info) => {
                let mut sci = SegmentCommitInfo::new(info, 0, -1, -1);
                sci.buffered_deletes_gen = self.updates_stream.next_gen();
                carried = state.pool.carry_over(
                    self.storage.as_ref(),
                    self.codec.as_ref(),
                    &sci,
                    logs,
                    merge_state,
                )?;
                if state.pool.get(sci.name()).is_fully_deleted(&sci) {
                    debug!(target: "tessera::iw", "merged segment {} is fully deleted", sci.name());
                    state.pool.drop_entry(sci.name());
                    codec::delete_segment_files(self.storage.as_ref(), sci.name());
                    None
                } else {
                    Some(sci)
                }
            }
            None => None,
        };

        let merged_name = merged.as_ref().map(|sci| sci.name().to_string());
        state.segment_infos.apply_merge_changes(&names, merged);
        for name in &names {
            state.pool.drop_entry(name);
            state.segments_to_merge.remove(name);
        }
        if let Some(name) = merged_name.as_ref().filter(|_| merge.max_num_segments.is_some()) {
            state.segments_to_merge.entry(name.clone()).or_insert(false);
        }
        state.changed();
        state.checkpoint()?;
        debug!(
            target: "tessera::iw",
            "commit merge {} into {} ({carried} carried deletes)",
            merge.seg_string(),
            merged_name.as_deref().unwrap_or("nothing")
        );
        Ok(())
    }

    /// Unregister a merge. After a successful merge the policy is asked for
    /// follow-up merges under the same lock.
    fn merge_finish(&self, merge: &OneMerge, succeeded: bool) {
        let mut state = self.state.lock();
        for name in merge.segment_names() {
            state.merging_segments.remove(&name);
            if state.pool.peek(&name).is_some_and(ReadersAndUpdates::is_merging) {
                state.pool.get(&name).finish_merge();
            }
        }
        state.running_merges.remove(&merge.id);
        let cascade = succeeded
            && !merge.is_aborted()
            && (merge.max_num_segments.is_some()
                || !(self.closed.load(Ordering::Acquire) || self.closing.load(Ordering::Acquire)));
        if cascade {
            self.update_pending_merges(&mut state, MergeTrigger::MergeFinished, merge.max_num_segments);
        }
        drop(state);
        self.merge_done.notify_all();
    }

    // ------------------------------------------------------------------
    // Near-real-time readers
    // ------------------------------------------------------------------

    /// Flush and open a reader over the current in-memory manifest. Its
    /// files stay referenced until the reader is closed.
    pub(crate) fn nrt_reader(self: &Arc<Self>, apply_all_deletes: bool) -> Result<DirectoryReader> {
        self.ensure_open()?;
        let any_changes = self.flush_internal(false)?;
        let (infos, readers, files) = {
            let mut state = self.state.lock();
            let WriterState {
                segment_infos,
                pool,
                deleter,
                ..
            } = &mut *state;
            let infos = segment_infos.clone();
            let mut readers = Vec::with_capacity(infos.len());
            for sci in infos.iter() {
                readers.push(pool.get(sci.name()).reader(
                    self.storage.as_ref(),
                    self.codec.as_ref(),
                    sci,
                )?);
            }
            let files = infos.files(false);
            deleter.inc_ref(&files);
            (infos, readers, files)
        };
        trace!(
            target: "tessera::iw",
            "nrt reader: version={} segments={} apply_all_deletes={apply_all_deletes}",
            infos.version,
            infos.len()
        );
        let reader = DirectoryReader::from_writer(
            Arc::clone(&self.storage),
            Arc::clone(&self.codec),
            infos,
            readers,
            Arc::downgrade(self),
            files,
            apply_all_deletes,
        );
        if any_changes {
            self.maybe_merge(MergeTrigger::FullFlush)?;
        }
        Ok(reader)
    }

    /// Release files a near-real-time reader pinned.
    pub(crate) fn release_files(&self, files: &BTreeSet<String>) {
        let mut state = self.state.lock();
        if !self.closed.load(Ordering::Acquire) {
            state.deleter.dec_ref(files);
        }
    }

    /// Whether a near-real-time reader of manifest version `version` sees
    /// every change.
    pub(crate) fn nrt_is_current(&self, version: u64) -> bool {
        let state = self.state.lock();
        state.segment_infos.version == version && !self.docs_writer.any_changes()
    }

    /// Sub-readers of a near-real-time reader are reused when the segment
    /// did not change since.
    pub(crate) fn same_segment_state(old: &SegmentReader, new: &SegmentReader) -> bool {
        Arc::ptr_eq(old.core(), new.core())
            && old.segment_info().del_count == new.segment_info().del_count
            && match (old.live_docs(), new.live_docs()) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            }
            && Arc::ptr_eq(old.overlay(), new.overlay())
    }
}

impl MergeSource for WriterInner {
    fn next_merge(&self) -> Option<OneMerge> {
        let mut state = self.state.lock();
        if state.stop_merges {
            return None;
        }
        let merge = state.pending_merges.pop_front()?;
        state.running_merges.insert(merge.id, merge.abort_flag());
        Some(merge)
    }

    fn has_pending_merges(&self) -> bool {
        let state = self.state.lock();
        !state.stop_merges && !state.pending_merges.is_empty()
    }

    fn merge(&self, merge: &mut OneMerge) -> Result<()> {
        let result = self
            .merge_init(merge)
            .and_then(|readers| self.merge_middle(merge, readers));
        if let Err(e) = &result {
            if !e.is_merge_aborted() {
                self.state
                    .lock()
                    .merge_exceptions
                    .push(format!("{}: {e}", merge.seg_string()));
            }
        }
        self.merge_finish(merge, result.is_ok());
        result
    }

    fn on_merge_finished(&self, merge: &OneMerge) {
        trace!(target: "tessera::iw", "merge {} finished", merge.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Field, FieldValue};
    use crate::index::reader::CompositeReader;
    use crate::index::IndexCommit;
    use crate::merge::{
        LogMergePolicy, LogMergePolicyConfig, NoMergePolicy, NoMergeScheduler, SerialMergeScheduler,
    };
    use crate::search::{IndexSearcher, TermQuery};
    use crate::storage::{FaultPoint, FaultyStorage, MemoryStorage};

    fn doc(id: &str, body: &str) -> Document {
        Document::new()
            .with(Field::string("id", id, true))
            .with(Field::text("body", body, true))
    }

    fn serial_config() -> IndexWriterConfig {
        IndexWriterConfig::default()
            .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()))
            .with_merge_policy(Arc::new(NoMergePolicy::new()))
    }

    fn count(storage: &Arc<dyn Storage>, term: Term) -> usize {
        let reader = DirectoryReader::open(Arc::clone(storage)).unwrap();
        IndexSearcher::new(&reader)
            .count(&TermQuery::new(term))
            .unwrap()
    }

    #[test]
    fn test_add_commit_and_read() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = IndexWriter::new(Arc::clone(&storage), serial_config()).unwrap();
        for i in 0..10 {
            writer.add_document(&doc(&i.to_string(), "hello world")).unwrap();
        }
        assert_eq!(writer.num_ram_docs(), 10);
        assert!(writer.has_uncommitted_changes());
        writer.commit().unwrap();
        assert!(!writer.has_uncommitted_changes());
        assert_eq!(writer.segment_count(), 1);
        assert_eq!(writer.max_doc(), 10);

        assert_eq!(count(&storage, Term::new("body", "hello")), 10);
        let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
        let stored = reader.document(3).unwrap();
        assert_eq!(stored.get_text("id"), Some("3"));
        writer.close().unwrap();
    }

    #[test]
    fn test_update_document_replaces() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = IndexWriter::new(Arc::clone(&storage), serial_config()).unwrap();
        writer.add_document(&doc("1", "old")).unwrap();
        writer.commit().unwrap();
        writer
            .update_document(Term::new("id", "1"), &doc("1", "new"))
            .unwrap();
        writer.commit().unwrap();

        assert_eq!(count(&storage, Term::new("body", "old")), 0);
        assert_eq!(count(&storage, Term::new("body", "new")), 1);
        assert_eq!(writer.num_docs(), 1);
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = IndexWriter::new(storage, serial_config()).unwrap();
        let a = writer.add_document(&doc("1", "a")).unwrap();
        let b = writer.delete_documents(vec![Term::new("id", "1")]).unwrap();
        let c = writer.add_document(&doc("2", "b")).unwrap();
        assert!(a < b && b < c);
        let committed = writer.commit().unwrap();
        assert!(committed >= c);
        assert!(writer.max_completed_sequence_number() >= c);
    }

    #[test]
    fn test_second_writer_is_locked_out() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = IndexWriter::new(Arc::clone(&storage), serial_config()).unwrap();
        let err = IndexWriter::new(Arc::clone(&storage), serial_config()).unwrap_err();
        assert!(matches!(err, TesseraError::LockObtainFailed(_)));
        writer.close().unwrap();
        IndexWriter::new(storage, serial_config()).unwrap();
    }

    #[test]
    fn test_config_cannot_be_reused() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let config = serial_config();
        let writer = IndexWriter::new(Arc::clone(&storage), config.clone()).unwrap();
        writer.close().unwrap();
        let err = IndexWriter::new(storage, config).unwrap_err();
        assert!(matches!(err, TesseraError::IllegalState(_)));
    }

    #[test]
    fn test_failed_open_keeps_config_usable() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let holder = IndexWriter::new(Arc::clone(&storage), serial_config()).unwrap();
        let config = serial_config();
        let err = IndexWriter::new(Arc::clone(&storage), config.clone()).unwrap_err();
        assert!(matches!(err, TesseraError::LockObtainFailed(_)));
        holder.close().unwrap();

        let writer = IndexWriter::new(Arc::clone(&storage), config.clone()).unwrap();
        writer.close().unwrap();
        let err = IndexWriter::new(storage, config).unwrap_err();
        assert!(matches!(err, TesseraError::IllegalState(_)));
    }

    #[test]
    fn test_open_modes() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let append = serial_config().with_open_mode(OpenMode::Append);
        assert!(IndexWriter::new(Arc::clone(&storage), append).is_err());

        let writer = IndexWriter::new(Arc::clone(&storage), serial_config()).unwrap();
        writer.add_document(&doc("1", "x")).unwrap();
        writer.close().unwrap();

        let writer = IndexWriter::new(
            Arc::clone(&storage),
            serial_config().with_open_mode(OpenMode::Append),
        )
        .unwrap();
        assert_eq!(writer.max_doc(), 1);
        writer.close().unwrap();

        let writer = IndexWriter::new(
            Arc::clone(&storage),
            serial_config().with_open_mode(OpenMode::Create),
        )
        .unwrap();
        assert_eq!(writer.max_doc(), 0);
        writer.commit().unwrap();
        writer.close().unwrap();
        assert_eq!(DirectoryReader::open(storage).unwrap().max_doc(), 0);
    }

    #[test]
    fn test_rollback_discards_uncommitted() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = IndexWriter::new(Arc::clone(&storage), serial_config()).unwrap();
        writer.add_document(&doc("1", "kept")).unwrap();
        writer.commit().unwrap();
        writer.add_document(&doc("2", "lost")).unwrap();
        writer.delete_documents(vec![Term::new("id", "1")]).unwrap();
        writer.flush().unwrap();
        writer.rollback().unwrap();
        assert!(writer.is_closed());
        assert!(writer.add_document(&doc("3", "x")).is_err());

        assert_eq!(count(&storage, Term::new("body", "kept")), 1);
        assert_eq!(count(&storage, Term::new("body", "lost")), 0);
        // Only files of the last commit survive.
        let commit = IndexCommit::list(Arc::clone(&storage), &crate::codec::DefaultCodec::new())
            .unwrap()
            .pop()
            .unwrap();
        for file in storage.list_files().unwrap() {
            if crate::index::is_index_file(&file) {
                assert!(commit.file_names().contains(&file), "leftover {file}");
            }
        }
    }

    #[test]
    fn test_commit_without_changes_writes_nothing() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = IndexWriter::new(Arc::clone(&storage), serial_config()).unwrap();
        writer.commit().unwrap();
        let generation = SegmentInfos::last_commit_generation(&storage.list_files().unwrap());
        writer.commit().unwrap();
        assert_eq!(
            SegmentInfos::last_commit_generation(&storage.list_files().unwrap()),
            generation
        );
    }

    #[test]
    fn test_live_commit_data() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = IndexWriter::new(Arc::clone(&storage), serial_config()).unwrap();
        let data = BTreeMap::from([("checkpoint".to_string(), "42".to_string())]);
        writer.set_live_commit_data(data.clone()).unwrap();
        writer.commit().unwrap();
        let commits =
            IndexCommit::list(Arc::clone(&storage), &crate::codec::DefaultCodec::new()).unwrap();
        assert_eq!(commits.last().unwrap().user_data(), &data);
        assert_eq!(writer.live_commit_data(), data);
    }

    #[test]
    fn test_doc_values_updates_are_validated() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = IndexWriter::new(Arc::clone(&storage), serial_config()).unwrap();
        let mut d = doc("1", "x");
        d.add(Field::numeric_doc_values("price", 10));
        writer.add_document(&d).unwrap();
        writer.commit().unwrap();

        assert!(writer
            .update_numeric_doc_value(Term::new("id", "1"), "missing", 1)
            .is_err());
        assert!(writer
            .update_binary_doc_value(Term::new("id", "1"), "price", b"x".to_vec())
            .is_err());
        writer
            .update_numeric_doc_value(Term::new("id", "1"), "price", 20)
            .unwrap();
        writer.commit().unwrap();
        let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
        assert_eq!(reader.numeric_doc_value("price", 0), Some(20));
    }

    #[test]
    fn test_delete_all() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = IndexWriter::new(Arc::clone(&storage), serial_config()).unwrap();
        writer.add_document(&doc("1", "x")).unwrap();
        writer.commit().unwrap();
        writer.add_document(&doc("2", "y")).unwrap();
        writer.delete_all().unwrap();
        writer.add_document(&doc("3", "z")).unwrap();
        writer.commit().unwrap();
        let reader = DirectoryReader::open(storage).unwrap();
        assert_eq!(reader.num_docs(), 1);
        assert_eq!(reader.document(0).unwrap().get_text("id"), Some("3"));
    }

    #[test]
    fn test_force_merge_to_one_segment() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let config = IndexWriterConfig::default()
            .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()))
            .with_merge_policy(Arc::new(LogMergePolicy::new(LogMergePolicyConfig::default())));
        let writer = IndexWriter::new(Arc::clone(&storage), config).unwrap();
        for i in 0..5 {
            writer.add_document(&doc(&i.to_string(), "merge me")).unwrap();
            writer.flush().unwrap();
        }
        writer.delete_documents(vec![Term::new("id", "2")]).unwrap();
        assert_eq!(writer.segment_count(), 5);
        writer.force_merge(1).unwrap();
        assert_eq!(writer.segment_count(), 1);
        writer.commit().unwrap();

        let reader = DirectoryReader::open(storage).unwrap();
        assert_eq!(reader.leaves().len(), 1);
        assert_eq!(reader.max_doc(), 4);
        let ids: Vec<String> = (0..4)
            .map(|d| reader.document(d).unwrap().get_text("id").unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["0", "1", "3", "4"]);
    }

    #[test]
    fn test_no_merge_scheduler_leaves_merges_pending() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let config = IndexWriterConfig::default()
            .with_merge_scheduler(Arc::new(NoMergeScheduler::new()))
            .with_merge_policy(Arc::new(LogMergePolicy::new(LogMergePolicyConfig::default())));
        let writer = IndexWriter::new(storage, config).unwrap();
        for i in 0..3 {
            writer.add_document(&doc(&i.to_string(), "x")).unwrap();
            writer.flush().unwrap();
        }
        writer.force_merge(1).unwrap();
        assert!(writer.has_pending_merges());
        assert_eq!(writer.segment_count(), 3);
        writer.wait_for_merges().unwrap();
    }

    #[test]
    fn test_tragic_commit_failure_closes_writer() {
        let memory: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let faulty = Arc::new(FaultyStorage::new(Arc::clone(&memory), 7));
        let storage: Arc<dyn Storage> = faulty.clone();
        let writer = IndexWriter::new(Arc::clone(&storage), serial_config()).unwrap();
        writer.add_document(&doc("1", "first")).unwrap();
        writer.commit().unwrap();

        writer.add_document(&doc("2", "second")).unwrap();
        faulty.fail_after(FaultPoint::Rename, 1);
        assert!(writer.commit().is_err());
        assert!(writer.tragic_exception().is_some());
        let err = writer.add_document(&doc("3", "third")).unwrap_err();
        assert!(matches!(err, TesseraError::AlreadyClosed(msg) if msg.contains("unrecoverable")));

        // The previous commit is intact and the lock was released.
        assert_eq!(count(&storage, Term::new("body", "first")), 1);
        assert_eq!(count(&storage, Term::new("body", "second")), 0);
        IndexWriter::new(storage, serial_config()).unwrap();
    }

    #[test]
    fn test_stored_bytes_across_segments() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = IndexWriter::new(Arc::clone(&storage), serial_config()).unwrap();
        let d = Document::new()
            .with(Field::string("id", "1", true))
            .with(Field::stored("blob", FieldValue::Bytes(vec![1, 2, 3])));
        writer.add_document(&d).unwrap();
        writer.flush().unwrap();
        writer.add_document(&doc("2", "x")).unwrap();
        writer.close().unwrap();
        let reader = DirectoryReader::open(storage).unwrap();
        assert_eq!(
            reader.document(0).unwrap().get("blob"),
            Some(&FieldValue::Bytes(vec![1, 2, 3]))
        );
    }
}
