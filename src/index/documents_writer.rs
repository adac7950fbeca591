//! Coordinates arenas, the update queue and flushing.
//!
//! Indexing threads check an arena out of the pool, add their documents
//! and return it. Adds, deletes and arena flushes hold the read side of
//! `gate`; a full flush (commit, NRT reopen) takes the write side just long
//! enough to check out every non-empty arena and freeze the global delete
//! buffer, then flushes those arenas without blocking indexing.
//!
//! Flushed segments are not published here. Every flush takes a ticket and
//! tickets are handed to the writer in order through a publish callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, trace};
use parking_lot::{Mutex, RwLock};

use crate::document::{Document, Term};
use crate::error::{Result, TesseraError};
use crate::index::arena::{Arena, ArenaContext};
use crate::index::delete_queue::{DeleteOp, DeleteQueue};
use crate::index::doc_values::DocValuesUpdate;
use crate::index::flush_control::FlushControl;
use crate::index::flush_policy::FlushPolicy;
use crate::index::flush_ticket::{FlushTicket, FlushTicketQueue, PublishedTicket};
use crate::search::Query;

/// Receives flush tickets in order.
pub type Publish<'a> = &'a dyn Fn(PublishedTicket) -> Result<()>;

/// Result of a full flush.
#[derive(Debug, Clone, Copy)]
pub struct FullFlush {
    /// Whether anything was flushed or frozen.
    pub any_changes: bool,
    /// Sequence number of the last operation the flush covers.
    pub seq_no: u64,
}

/// Buffers documents and updates until they are flushed.
#[derive(Debug)]
pub struct DocumentsWriter {
    ctx: Arc<ArenaContext>,
    delete_queue: Arc<DeleteQueue>,
    flush_control: FlushControl,
    tickets: FlushTicketQueue,
    gate: RwLock<()>,
    full_flush_lock: Mutex<()>,
    check_pending_flush_on_update: bool,
    closed: AtomicBool,
}

impl DocumentsWriter {
    /// Create a documents writer. Sequence numbers start at `start_seq_no`.
    pub fn new(
        ctx: Arc<ArenaContext>,
        policy: Arc<dyn FlushPolicy>,
        hard_limit_bytes: usize,
        stall_limit_bytes: Option<usize>,
        check_pending_flush_on_update: bool,
        start_seq_no: u64,
    ) -> Self {
        DocumentsWriter {
            ctx,
            delete_queue: Arc::new(DeleteQueue::new(0, start_seq_no)),
            flush_control: FlushControl::new(policy, hard_limit_bytes, stall_limit_bytes),
            tickets: FlushTicketQueue::new(),
            gate: RwLock::new(()),
            full_flush_lock: Mutex::new(()),
            check_pending_flush_on_update,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TesseraError::already_closed("documents writer is closed"));
        }
        Ok(())
    }

    /// Flush control, for accounting queries and tests.
    pub fn flush_control(&self) -> &FlushControl {
        &self.flush_control
    }

    /// Add documents, optionally deleting what `delete` matches in the same
    /// atomic step. Returns the sequence number of the operation.
    pub fn update_documents(
        &self,
        docs: &[Document],
        delete: Option<DeleteOp>,
        publish: Publish<'_>,
    ) -> Result<u64> {
        self.ensure_open()?;
        self.pre_update(publish)?;

        let is_update = delete.is_some();
        let result = {
            let _gate = self.gate.read();
            self.ensure_open()?;
            let mut arena = self.flush_control.obtain_arena(|id| {
                Arena::new(id, Arc::clone(&self.ctx), Arc::clone(&self.delete_queue))
            })?;
            let result = arena.update_documents(docs, delete);
            let flush_own = self.flush_control.do_after_document(
                &arena,
                is_update,
                self.delete_queue.bytes_used(),
                self.delete_queue.num_global_term_deletes(),
            );
            if flush_own {
                let flushed = self.do_flush(arena);
                result.and_then(|seq_no| flushed.map(|_| seq_no))
            } else {
                self.flush_control.return_arena(arena);
                result
            }
        };

        let post = self.post_update(publish);
        let seq_no = result?;
        post?;
        Ok(seq_no)
    }

    /// Delete documents containing any of `terms`.
    pub fn delete_terms(&self, terms: Vec<Term>, publish: Publish<'_>) -> Result<u64> {
        self.apply_op(DeleteOp::Terms(terms), publish)
    }

    /// Delete documents matching any of `queries`.
    pub fn delete_queries(&self, queries: Vec<Arc<dyn Query>>, publish: Publish<'_>) -> Result<u64> {
        self.apply_op(DeleteOp::Queries(queries), publish)
    }

    /// Queue doc-values updates.
    pub fn update_doc_values(
        &self,
        updates: Vec<DocValuesUpdate>,
        publish: Publish<'_>,
    ) -> Result<u64> {
        self.apply_op(DeleteOp::DocValuesUpdates(updates), publish)
    }

    fn apply_op(&self, op: DeleteOp, publish: Publish<'_>) -> Result<u64> {
        self.ensure_open()?;
        let seq_no = {
            let _gate = self.gate.read();
            let seq_no = self.delete_queue.add(op);
            self.flush_control.do_on_delete(
                self.delete_queue.bytes_used(),
                self.delete_queue.num_global_term_deletes(),
            );
            seq_no
        };
        self.apply_all_deletes_if_requested(publish)?;
        Ok(seq_no)
    }

    fn apply_all_deletes_if_requested(&self, publish: Publish<'_>) -> Result<()> {
        if self.flush_control.get_and_reset_apply_all_deletes() {
            let queued = {
                let _gate = self.gate.read();
                self.tickets.add_deletes_ticket(&self.delete_queue)
            };
            if queued {
                debug!(target: "tessera::dw", "apply all deletes requested by flush policy");
                self.tickets.force_purge(publish)?;
            }
        }
        Ok(())
    }

    /// Help flushing before adding: flush queued arenas and wait while
    /// indexing is stalled.
    fn pre_update(&self, publish: Publish<'_>) -> Result<()> {
        let mut first_error = None;
        loop {
            let stalled = self.flush_control.any_stalled_threads();
            let pending = self.flush_control.num_pending() > 0;
            if !stalled && !(pending && self.check_pending_flush_on_update) {
                break;
            }
            if let Err(e) = self.flush_pending_arenas() {
                first_error.get_or_insert(e);
            }
            if let Err(e) = self.tickets.try_purge(publish) {
                first_error.get_or_insert(e);
            }
            if stalled {
                trace!(target: "tessera::dw", "indexing stalled, waiting");
                self.flush_control.wait_if_stalled();
            }
            if first_error.is_some() || self.closed.load(Ordering::Acquire) {
                break;
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn post_update(&self, publish: Publish<'_>) -> Result<()> {
        let mut result = Ok(());
        if self.check_pending_flush_on_update {
            result = self.flush_pending_arenas();
        }
        let purged = self.tickets.try_purge(publish);
        let applied = self.apply_all_deletes_if_requested(publish);
        result.and(purged).and(applied)
    }

    fn flush_pending_arenas(&self) -> Result<()> {
        let _gate = self.gate.read();
        let mut result = Ok(());
        while let Some(arena) = self.flush_control.next_pending_flush() {
            let flushed = self.do_flush(arena);
            if result.is_ok() {
                result = flushed;
            }
        }
        result
    }

    /// Flush a checked-out arena. The caller holds the read gate.
    fn do_flush(&self, mut arena: Box<Arena>) -> Result<()> {
        let ticket = self.tickets.add_flush_ticket(&mut arena);
        self.flush_ticketed(arena, &ticket)
    }

    fn flush_ticketed(&self, mut arena: Box<Arena>, ticket: &FlushTicket) -> Result<()> {
        let result = arena.flush();
        let outcome = match result {
            Ok(segment) => {
                ticket.set_segment(segment);
                Ok(())
            }
            Err(e) => {
                debug!(target: "tessera::dw", "flush of arena {} failed: {e}", arena.id());
                ticket.set_failed();
                Err(e)
            }
        };
        self.flush_control.after_flush(arena);
        outcome
    }

    /// Flush every arena and freeze the global delete buffer. Tickets up to
    /// and including this flush are published before returning.
    pub fn flush_all_arenas(&self, publish: Publish<'_>) -> Result<FullFlush> {
        self.ensure_open()?;
        let _full = self.full_flush_lock.lock();
        let (arenas, deletes_queued, seq_no) = {
            let _gate = self.gate.write();
            let mut ticketed = Vec::new();
            for mut arena in self.flush_control.checkout_for_full_flush() {
                let ticket = self.tickets.add_flush_ticket(&mut arena);
                ticketed.push((arena, ticket));
            }
            let deletes_queued = self.tickets.add_deletes_ticket(&self.delete_queue);
            (ticketed, deletes_queued, self.delete_queue.last_sequence_number())
        };
        debug!(
            target: "tessera::dw",
            "full flush: {} arenas, deletes={deletes_queued}, seq_no={seq_no}",
            arenas.len()
        );

        let any_changes = !arenas.is_empty() || deletes_queued;
        let mut result = Ok(());
        for (arena, ticket) in arenas {
            let flushed = {
                let _gate = self.gate.read();
                self.flush_ticketed(arena, &ticket)
            };
            if result.is_ok() {
                result = flushed;
            }
        }
        let purged = self.tickets.force_purge(publish);
        result.and(purged)?;
        Ok(FullFlush {
            any_changes,
            seq_no,
        })
    }

    /// Discard every buffered document and update. Returns the sequence
    /// number of the discard.
    pub fn abort(&self) -> u64 {
        let _full = self.full_flush_lock.lock();
        let _gate = self.gate.write();
        self.flush_control.abort_all();
        self.delete_queue.clear();
        self.tickets.clear();
        debug!(target: "tessera::dw", "aborted all buffered documents");
        self.delete_queue.next_sequence_number()
    }

    /// Whether documents or updates are buffered or waiting to be published.
    pub fn any_changes(&self) -> bool {
        self.flush_control.num_docs_in_ram() > 0
            || self.delete_queue.any_changes()
            || self.tickets.has_tickets()
    }

    /// Documents buffered in arenas.
    pub fn num_docs_in_ram(&self) -> u64 {
        self.flush_control.num_docs_in_ram()
    }

    /// Bytes buffered by arenas and the global delete buffer.
    pub fn ram_bytes_used(&self) -> usize {
        self.flush_control.ram_bytes_used() + self.delete_queue.bytes_used()
    }

    /// Sequence number of the last operation.
    pub fn last_sequence_number(&self) -> u64 {
        self.delete_queue.last_sequence_number()
    }

    /// Take a sequence number for a writer-level operation.
    pub fn next_sequence_number(&self) -> u64 {
        self.delete_queue.next_sequence_number()
    }

    /// Refuse further updates.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.flush_control.close();
    }
}
