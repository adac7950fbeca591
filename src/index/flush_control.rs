//! RAM accounting, flush selection and indexing stalls.
//!
//! [`FlushControl`] owns the pool of idle arenas and tracks the bytes of
//! every arena. Bytes of an arena count as *active* while it takes
//! documents and move to *flush* bytes once the arena is marked pending.
//! The [`FlushPolicy`](crate::index::flush_policy::FlushPolicy) decides
//! what to mark. When flushing cannot keep up, [`StallControl`] blocks
//! indexing threads until the flush bytes drain.
//!
//! Lock order: `state` before `pool`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::error::{Result, TesseraError};
use crate::index::arena::Arena;
use crate::index::flush_policy::FlushPolicy;

#[derive(Debug, Default, Clone)]
struct ArenaAccount {
    bytes: usize,
    num_docs: u32,
    flush_pending: bool,
    flushing: bool,
}

#[derive(Debug, Default)]
struct FlushState {
    accounts: AHashMap<usize, ArenaAccount>,
    active_bytes: usize,
    flush_bytes: usize,
    num_pending: usize,
    num_flushing: usize,
    apply_all_deletes: bool,
    closed: bool,
    delete_bytes_used: usize,
    num_global_term_deletes: usize,
}

impl FlushState {
    fn set_flush_pending(&mut self, arena: usize) -> bool {
        let Some(account) = self.accounts.get_mut(&arena) else {
            return false;
        };
        if account.flush_pending || account.flushing || account.num_docs == 0 {
            return false;
        }
        account.flush_pending = true;
        self.active_bytes -= account.bytes;
        self.flush_bytes += account.bytes;
        self.num_pending += 1;
        true
    }

    fn commit_bytes(&mut self, arena: usize, bytes: usize, num_docs: u32) {
        let account = self.accounts.entry(arena).or_default();
        let previous = account.bytes;
        account.bytes = bytes;
        account.num_docs = num_docs;
        let counter = if account.flush_pending || account.flushing {
            &mut self.flush_bytes
        } else {
            &mut self.active_bytes
        };
        *counter = (*counter + bytes).saturating_sub(previous);
    }
}

/// What a [`FlushPolicy`] sees and may change. Only exists while the
/// flush-control lock is held.
#[derive(Debug)]
pub struct FlushControlView<'a> {
    state: &'a mut FlushState,
}

impl FlushControlView<'_> {
    /// Bytes of arenas that are not pending.
    pub fn active_bytes(&self) -> usize {
        self.state.active_bytes
    }

    /// Bytes of the global delete buffer.
    pub fn delete_bytes_used(&self) -> usize {
        self.state.delete_bytes_used
    }

    /// Term deletes in the global delete buffer.
    pub fn num_global_term_deletes(&self) -> usize {
        self.state.num_global_term_deletes
    }

    /// Documents buffered by `arena`.
    pub fn num_docs(&self, arena: usize) -> u32 {
        self.state.accounts.get(&arena).map_or(0, |a| a.num_docs)
    }

    /// Mark `arena` for flushing. Ignored for empty arenas.
    pub fn set_flush_pending(&mut self, arena: usize) {
        self.state.set_flush_pending(arena);
    }

    /// Ask the writer to apply buffered deletes to published segments.
    pub fn set_apply_all_deletes(&mut self) {
        self.state.apply_all_deletes = true;
    }

    /// The non-empty, non-pending arena using the most bytes. `current`
    /// wins ties.
    pub fn largest_non_pending(&self, current: usize) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (id, account) in &self.state.accounts {
            if account.flush_pending || account.flushing || account.num_docs == 0 {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_id, best_bytes)) => {
                    account.bytes > best_bytes
                        || (account.bytes == best_bytes && *id == current && best_id != current)
                }
            };
            if better {
                best = Some((*id, account.bytes));
            }
        }
        best.map(|(id, _)| id)
    }
}

#[derive(Debug, Default)]
struct StallState {
    num_waiting: usize,
    was_stalled: bool,
}

/// Blocks indexing threads while flushing falls behind.
///
/// A waiting thread wakes when the stall is lifted or after one second,
/// whichever comes first; the caller re-checks and may wait again.
#[derive(Debug, Default)]
pub struct StallControl {
    stalled: AtomicBool,
    state: Mutex<StallState>,
    cond: Condvar,
}

impl StallControl {
    /// Set the stall flag and wake waiters when it is lifted.
    pub fn update_stalled(&self, stalled: bool) {
        let mut state = self.state.lock();
        if self.stalled.swap(stalled, Ordering::AcqRel) != stalled {
            trace!(target: "tessera::fc", "stalled={stalled}");
        }
        if stalled {
            state.was_stalled = true;
        }
        self.cond.notify_all();
    }

    /// Wait while indexing is stalled, for at most one second.
    pub fn wait_if_stalled(&self) {
        if !self.stalled.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.lock();
        if self.stalled.load(Ordering::Acquire) {
            state.num_waiting += 1;
            self.cond.wait_for(&mut state, Duration::from_secs(1));
            state.num_waiting -= 1;
        }
    }

    /// Whether indexing is stalled right now.
    pub fn any_stalled_threads(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    /// Whether a thread is waiting.
    pub fn has_blocked(&self) -> bool {
        self.state.lock().num_waiting > 0
    }

    /// Whether indexing was ever stalled.
    pub fn was_stalled(&self) -> bool {
        self.state.lock().was_stalled
    }
}

/// Tracks arenas and decides when they flush.
#[derive(Debug)]
pub struct FlushControl {
    state: Mutex<FlushState>,
    pool: Mutex<Vec<Box<Arena>>>,
    policy: Arc<dyn FlushPolicy>,
    stall: StallControl,
    hard_limit_bytes: usize,
    stall_limit_bytes: Option<usize>,
    next_arena_id: AtomicUsize,
}

impl FlushControl {
    /// Create flush control. `stall_limit_bytes` of `None` never stalls.
    pub fn new(
        policy: Arc<dyn FlushPolicy>,
        hard_limit_bytes: usize,
        stall_limit_bytes: Option<usize>,
    ) -> Self {
        FlushControl {
            state: Mutex::new(FlushState::default()),
            pool: Mutex::new(Vec::new()),
            policy,
            stall: StallControl::default(),
            hard_limit_bytes,
            stall_limit_bytes,
            next_arena_id: AtomicUsize::new(0),
        }
    }

    /// Check out an idle arena, creating one if the pool has none that is
    /// free of a pending flush.
    pub fn obtain_arena<F>(&self, create: F) -> Result<Box<Arena>>
    where
        F: FnOnce(usize) -> Arena,
    {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TesseraError::already_closed("flush control is closed"));
        }
        let mut pool = self.pool.lock();
        let idle = pool.iter().position(|arena| {
            state
                .accounts
                .get(&arena.id())
                .is_none_or(|a| !a.flush_pending)
        });
        if let Some(idx) = idle {
            return Ok(pool.swap_remove(idx));
        }
        drop(pool);
        let id = self.next_arena_id.fetch_add(1, Ordering::AcqRel);
        state.accounts.insert(id, ArenaAccount::default());
        trace!(target: "tessera::fc", "new arena {id}");
        Ok(Box::new(create(id)))
    }

    /// Put an arena back into the pool.
    pub fn return_arena(&self, arena: Box<Arena>) {
        self.pool.lock().push(arena);
    }

    fn update_stall(&self, state: &FlushState) {
        let stalled = match self.stall_limit_bytes {
            Some(limit) => {
                state.active_bytes + state.flush_bytes > limit
                    && state.active_bytes < limit
                    && !state.closed
            }
            None => false,
        };
        self.stall.update_stalled(stalled);
    }

    /// Account for a document added to `arena`. Returns true when the
    /// caller must flush the arena itself; it is then checked out for
    /// flushing.
    pub fn do_after_document(
        &self,
        arena: &Arena,
        is_update: bool,
        delete_bytes_used: usize,
        num_global_term_deletes: usize,
    ) -> bool {
        let id = arena.id();
        let mut state = self.state.lock();
        state.delete_bytes_used = delete_bytes_used;
        state.num_global_term_deletes = num_global_term_deletes;
        state.commit_bytes(id, arena.bytes_used(), arena.num_docs());

        let pending = state.accounts.get(&id).is_some_and(|a| a.flush_pending);
        if !pending {
            let mut view = FlushControlView { state: &mut *state };
            if is_update {
                self.policy.on_update(&mut view, id);
            } else {
                self.policy.on_insert(&mut view, id);
            }
            let bytes = state.accounts.get(&id).map_or(0, |a| a.bytes);
            if bytes > self.hard_limit_bytes && state.set_flush_pending(id) {
                debug!(
                    target: "tessera::fc",
                    "arena {id} at {bytes} bytes exceeds hard limit {}, flushing",
                    self.hard_limit_bytes
                );
            }
        }

        let flush_own = match state.accounts.get_mut(&id) {
            Some(account) if account.flush_pending && !account.flushing => {
                account.flushing = true;
                true
            }
            _ => false,
        };
        if flush_own {
            state.num_pending -= 1;
            state.num_flushing += 1;
        }
        self.update_stall(&state);
        flush_own
    }

    /// Account for a delete outside of any document.
    pub fn do_on_delete(&self, delete_bytes_used: usize, num_global_term_deletes: usize) {
        let mut state = self.state.lock();
        state.delete_bytes_used = delete_bytes_used;
        state.num_global_term_deletes = num_global_term_deletes;
        let mut view = FlushControlView { state: &mut *state };
        self.policy.on_delete(&mut view, None);
    }

    /// Mark an arena for flushing.
    pub fn set_flush_pending(&self, arena: usize) {
        let mut state = self.state.lock();
        state.set_flush_pending(arena);
        self.update_stall(&state);
    }

    /// Check out the next idle arena marked pending.
    pub fn next_pending_flush(&self) -> Option<Box<Arena>> {
        let mut state = self.state.lock();
        if state.num_pending == 0 {
            return None;
        }
        let mut pool = self.pool.lock();
        let idx = pool.iter().position(|arena| {
            state
                .accounts
                .get(&arena.id())
                .is_some_and(|a| a.flush_pending && !a.flushing)
        })?;
        let arena = pool.swap_remove(idx);
        if let Some(account) = state.accounts.get_mut(&arena.id()) {
            account.flushing = true;
        }
        state.num_pending -= 1;
        state.num_flushing += 1;
        Some(arena)
    }

    /// Check out every non-empty arena for a full flush. The caller keeps
    /// other threads from obtaining arenas meanwhile.
    pub fn checkout_for_full_flush(&self) -> Vec<Box<Arena>> {
        let mut state = self.state.lock();
        let mut pool = self.pool.lock();
        let mut flushing = Vec::new();
        let mut idle = Vec::new();
        for arena in pool.drain(..) {
            if arena.num_docs() > 0 {
                flushing.push(arena);
            } else {
                idle.push(arena);
            }
        }
        *pool = idle;
        drop(pool);

        for arena in &flushing {
            let id = arena.id();
            state.commit_bytes(id, arena.bytes_used(), arena.num_docs());
            let was_pending = state.accounts.get(&id).is_some_and(|a| a.flush_pending);
            if !was_pending {
                state.set_flush_pending(id);
            }
            if let Some(account) = state.accounts.get_mut(&id) {
                account.flushing = true;
            }
            state.num_pending -= 1;
            state.num_flushing += 1;
        }
        self.update_stall(&state);
        flushing
    }

    /// An arena finished flushing (successfully or not) and was reset.
    /// Releases its bytes and returns it to the pool.
    pub fn after_flush(&self, arena: Box<Arena>) {
        let id = arena.id();
        let mut state = self.state.lock();
        if let Some(account) = state.accounts.get_mut(&id) {
            let bytes = account.bytes;
            let was_flushing = account.flushing;
            *account = ArenaAccount::default();
            state.flush_bytes -= bytes.min(state.flush_bytes);
            if was_flushing {
                state.num_flushing -= 1;
            }
        }
        self.pool.lock().push(arena);
        self.update_stall(&state);
    }

    /// Abort every pooled arena. The caller guarantees no arena is checked
    /// out.
    pub fn abort_all(&self) {
        let mut state = self.state.lock();
        let mut pool = self.pool.lock();
        for arena in pool.iter_mut() {
            arena.abort();
            if let Some(account) = state.accounts.get_mut(&arena.id()) {
                *account = ArenaAccount::default();
            }
        }
        drop(pool);
        state.active_bytes = 0;
        state.flush_bytes = state
            .accounts
            .values()
            .filter(|a| a.flushing)
            .map(|a| a.bytes)
            .sum();
        state.num_pending = 0;
        self.update_stall(&state);
    }

    /// Whether an arena is marked pending and waits in the pool.
    pub fn num_pending(&self) -> usize {
        self.state.lock().num_pending
    }

    /// Arenas being flushed right now.
    pub fn num_flushing(&self) -> usize {
        self.state.lock().num_flushing
    }

    /// Bytes of arenas taking documents.
    pub fn active_bytes(&self) -> usize {
        self.state.lock().active_bytes
    }

    /// Bytes of arenas pending or flushing.
    pub fn flush_bytes(&self) -> usize {
        self.state.lock().flush_bytes
    }

    /// Bytes buffered by all arenas.
    pub fn ram_bytes_used(&self) -> usize {
        let state = self.state.lock();
        state.active_bytes + state.flush_bytes
    }

    /// Documents buffered by all arenas.
    pub fn num_docs_in_ram(&self) -> u64 {
        self.state
            .lock()
            .accounts
            .values()
            .map(|a| a.num_docs as u64)
            .sum()
    }

    /// Whether the policy asked for deletes to be applied; clears the
    /// request.
    pub fn get_and_reset_apply_all_deletes(&self) -> bool {
        std::mem::take(&mut self.state.lock().apply_all_deletes)
    }

    /// Request applying deletes.
    pub fn set_apply_all_deletes(&self) {
        self.state.lock().apply_all_deletes = true;
    }

    /// Wait while indexing is stalled.
    pub fn wait_if_stalled(&self) {
        self.stall.wait_if_stalled();
    }

    /// Whether indexing is stalled.
    pub fn any_stalled_threads(&self) -> bool {
        self.stall.any_stalled_threads()
    }

    /// The stall gate.
    pub fn stall_control(&self) -> &StallControl {
        &self.stall
    }

    /// Check the byte counters against the accounts and the pooled arenas.
    pub fn assert_active_bytes(&self) -> bool {
        let state = self.state.lock();
        let pool = self.pool.lock();
        let mut active = 0;
        let mut flushing = 0;
        for account in state.accounts.values() {
            if account.flush_pending || account.flushing {
                flushing += account.bytes;
            } else {
                active += account.bytes;
            }
        }
        let pooled_match = pool.iter().all(|arena| {
            state
                .accounts
                .get(&arena.id())
                .is_some_and(|a| a.bytes == arena.bytes_used())
        });
        active == state.active_bytes && flushing == state.flush_bytes && pooled_match
    }

    /// Refuse new arenas and lift any stall.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.update_stall(&state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::thread;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::analysis::StandardAnalyzer;
    use crate::codec::DefaultCodec;
    use crate::document::{Document, Field};
    use crate::index::arena::ArenaContext;
    use crate::index::delete_queue::DeleteQueue;
    use crate::index::flush_policy::FlushByRamOrCountsPolicy;
    use crate::index::similarity::DefaultSimilarity;
    use crate::storage::MemoryStorage;

    fn factory() -> impl Fn(usize) -> Arena {
        let ctx = Arc::new(ArenaContext {
            storage: Arc::new(MemoryStorage::new()),
            codec: Arc::new(DefaultCodec::new()),
            analyzer: Arc::new(StandardAnalyzer::new()),
            similarity: Arc::new(DefaultSimilarity::default()),
            use_compound_file: false,
            name_counter: Arc::new(AtomicU64::new(0)),
            doc_values_types: Default::default(),
        });
        let queue = Arc::new(DeleteQueue::new(0, 1));
        move |id| Arena::new(id, Arc::clone(&ctx), Arc::clone(&queue))
    }

    fn add_doc(arena: &mut Arena) {
        let doc = Document::new().with(Field::text("body", "some words to index", true));
        arena.update_documents(&[doc], None).unwrap();
    }

    #[test]
    fn test_max_buffered_docs_marks_own_arena() {
        let policy = Arc::new(FlushByRamOrCountsPolicy::new(None, Some(2), None));
        let control = FlushControl::new(policy, usize::MAX, None);
        let factory = factory();

        let mut arena = control.obtain_arena(&factory).unwrap();
        add_doc(&mut arena);
        assert!(!control.do_after_document(&arena, false, 0, 0));
        assert!(control.active_bytes() > 0);
        add_doc(&mut arena);
        assert!(control.do_after_document(&arena, false, 0, 0));
        assert_eq!(control.active_bytes(), 0);
        assert_eq!(control.num_flushing(), 1);

        arena.prepare_flush();
        arena.flush().unwrap();
        control.after_flush(arena);
        assert_eq!(control.ram_bytes_used(), 0);
        assert_eq!(control.num_flushing(), 0);
        assert!(control.assert_active_bytes());
    }

    #[test]
    fn test_largest_non_pending() {
        let mut state = FlushState::default();
        for (id, bytes, docs) in [(0, 100, 1), (1, 300, 2), (2, 300, 2), (3, 900, 0)] {
            state.commit_bytes(id, bytes, docs);
        }
        let mut view = FlushControlView { state: &mut state };
        assert_eq!(view.largest_non_pending(2), Some(2));
        view.set_flush_pending(2);
        assert_eq!(view.largest_non_pending(2), Some(1));
        assert_eq!(view.active_bytes(), 1300);
        // Empty arenas are never marked.
        view.set_flush_pending(3);
        assert_eq!(state.num_pending, 1);
        assert_eq!(state.flush_bytes, 300);
    }

    #[test]
    fn test_ram_trigger_flushes_arena() {
        let policy = Arc::new(FlushByRamOrCountsPolicy::new(Some(0.0001), None, None));
        let control = FlushControl::new(policy, usize::MAX, None);
        let factory = factory();

        let mut arena = control.obtain_arena(&factory).unwrap();
        add_doc(&mut arena);
        assert!(control.do_after_document(&arena, false, 0, 0));
        assert_eq!(control.active_bytes(), 0);
        assert!(control.assert_active_bytes());
    }

    #[test]
    fn test_full_flush_checks_out_non_empty_arenas() {
        let policy = Arc::new(FlushByRamOrCountsPolicy::new(None, Some(100), None));
        let control = FlushControl::new(policy, usize::MAX, None);
        let factory = factory();

        let mut first = control.obtain_arena(&factory).unwrap();
        let empty = control.obtain_arena(&factory).unwrap();
        add_doc(&mut first);
        control.do_after_document(&first, false, 0, 0);
        control.return_arena(first);
        control.return_arena(empty);

        let arenas = control.checkout_for_full_flush();
        assert_eq!(arenas.len(), 1);
        assert_eq!(control.active_bytes(), 0);
        assert!(control.flush_bytes() > 0);
        for mut arena in arenas {
            arena.prepare_flush();
            arena.flush().unwrap();
            control.after_flush(arena);
        }
        assert_eq!(control.ram_bytes_used(), 0);
        assert_eq!(control.num_docs_in_ram(), 0);
    }

    #[test]
    fn test_stall_blocks_until_flush_bytes_drain() {
        let policy = Arc::new(FlushByRamOrCountsPolicy::new(None, Some(1), None));
        let control = Arc::new(FlushControl::new(policy, usize::MAX, Some(1)));
        let factory = factory();

        let mut arena = control.obtain_arena(&factory).unwrap();
        add_doc(&mut arena);
        assert!(control.do_after_document(&arena, false, 0, 0));
        assert!(control.any_stalled_threads());

        let waiter = {
            let control = Arc::clone(&control);
            thread::spawn(move || {
                while control.any_stalled_threads() {
                    control.wait_if_stalled();
                }
            })
        };
        arena.prepare_flush();
        arena.flush().unwrap();
        control.after_flush(arena);
        assert!(!control.any_stalled_threads());
        waiter.join().unwrap();
        assert!(control.stall_control().was_stalled());
    }

    #[test]
    fn test_random_stall_interleavings_release_waiters() {
        let stall = Arc::new(StallControl::default());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let stall = Arc::clone(&stall);
                thread::spawn(move || {
                    for _ in 0..200 {
                        stall.wait_if_stalled();
                    }
                })
            })
            .collect();

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            stall.update_stalled(rng.random_bool(0.5));
            if rng.random_bool(0.1) {
                thread::yield_now();
            }
        }
        stall.update_stalled(false);
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert!(!stall.has_blocked());
    }

    #[test]
    fn test_closed_control_refuses_arenas() {
        let policy = Arc::new(FlushByRamOrCountsPolicy::new(None, Some(10), None));
        let control = FlushControl::new(policy, usize::MAX, None);
        control.close();
        assert!(control.obtain_arena(factory()).is_err());
    }
}
