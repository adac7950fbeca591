//! Merge schedulers.
//!
//! The writer registers the merges a policy proposes and then hands itself
//! to the scheduler as a [`MergeSource`]. The scheduler pulls merges out of
//! it and decides where they run: on the calling thread
//! ([`SerialMergeScheduler`]), on dedicated threads
//! ([`ConcurrentMergeScheduler`]) or nowhere ([`NoMergeScheduler`]).

use std::cell::Cell;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::error::{Result, TesseraError};
use crate::merge::policy::{MergeTrigger, OneMerge};

/// Where a scheduler gets merges from. Implemented by the writer.
pub trait MergeSource: Send + Sync {
    /// Take the next registered merge, `None` if there is none or merging
    /// was stopped.
    fn next_merge(&self) -> Option<OneMerge>;

    /// Whether registered merges are waiting for a thread.
    fn has_pending_merges(&self) -> bool;

    /// Run `merge` to completion on the current thread.
    fn merge(&self, merge: &mut OneMerge) -> Result<()>;

    /// Called once `merge` is done, whatever its outcome.
    fn on_merge_finished(&self, merge: &OneMerge);
}

/// Runs the merges of a [`MergeSource`].
pub trait MergeScheduler: Debug + Send + Sync {
    /// Run or launch the pending merges of `source`.
    fn merge(
        &self,
        source: Arc<dyn MergeSource>,
        trigger: MergeTrigger,
        new_merges_found: bool,
    ) -> Result<()>;

    /// Wait for running merges and release resources.
    fn close(&self) -> Result<()>;
}

fn run_one(source: &dyn MergeSource, mut merge: OneMerge) {
    let seg_string = merge.seg_string();
    match source.merge(&mut merge) {
        Ok(()) => {}
        Err(e) if e.is_merge_aborted() => {
            debug!(target: "tessera::ms", "merge {seg_string} aborted");
        }
        Err(e) => {
            warn!(target: "tessera::ms", "merge {seg_string} failed: {e}");
        }
    }
    source.on_merge_finished(&merge);
}

/// Runs merges one at a time on the thread that triggered them.
#[derive(Debug, Default)]
pub struct SerialMergeScheduler {
    lock: Mutex<()>,
}

impl SerialMergeScheduler {
    /// Create the scheduler.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MergeScheduler for SerialMergeScheduler {
    fn merge(
        &self,
        source: Arc<dyn MergeSource>,
        trigger: MergeTrigger,
        _new_merges_found: bool,
    ) -> Result<()> {
        let _serial = self.lock.lock();
        while let Some(merge) = source.next_merge() {
            debug!(target: "tessera::ms", "{trigger}: run merge {} serially", merge.seg_string());
            run_one(source.as_ref(), merge);
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Never runs merges; registered merges stay pending.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMergeScheduler;

impl NoMergeScheduler {
    /// Create the scheduler.
    pub fn new() -> Self {
        Self
    }
}

impl MergeScheduler for NoMergeScheduler {
    fn merge(
        &self,
        _source: Arc<dyn MergeSource>,
        _trigger: MergeTrigger,
        _new_merges_found: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

thread_local! {
    static IN_MERGE_THREAD: Cell<bool> = const { Cell::new(false) };
}

const STALL_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Default)]
struct CmsState {
    /// Merge threads alive, waiting for a slot or merging.
    threads: usize,
    /// Threads holding a running slot.
    running: usize,
    handles: Vec<JoinHandle<()>>,
    next_thread_id: u64,
}

struct CmsInner {
    max_thread_count: usize,
    max_merge_count: usize,
    state: Mutex<CmsState>,
    slot_freed: Condvar,
    /// Holds at most one "a merge thread exited" signal.
    done_tx: Sender<()>,
    done_rx: Receiver<()>,
}

/// Runs each merge on its own thread.
///
/// At most `max_thread_count` merges make progress at once; further merge
/// threads wait for a slot. Once `max_merge_count` merge threads exist, a
/// thread asking for more merges is stalled until one of them finishes, so
/// indexing cannot outrun merging indefinitely. Merge threads themselves
/// never stall.
#[derive(Clone)]
pub struct ConcurrentMergeScheduler {
    inner: Arc<CmsInner>,
}

impl Debug for ConcurrentMergeScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConcurrentMergeScheduler")
            .field("max_thread_count", &self.inner.max_thread_count)
            .field("max_merge_count", &self.inner.max_merge_count)
            .field("threads", &state.threads)
            .field("running", &state.running)
            .finish()
    }
}

impl Default for ConcurrentMergeScheduler {
    fn default() -> Self {
        let max_thread_count = (num_cpus::get() / 2).clamp(1, 4);
        Self::build(max_thread_count + 5, max_thread_count)
    }
}

impl ConcurrentMergeScheduler {
    /// A scheduler sized after the number of CPUs.
    pub fn new() -> Self {
        Self::default()
    }

    /// A scheduler allowing `max_merge_count` merge threads of which
    /// `max_thread_count` run at once.
    pub fn with_limits(max_merge_count: usize, max_thread_count: usize) -> Result<Self> {
        if max_thread_count == 0 {
            return Err(TesseraError::illegal_argument(
                "max_thread_count must be at least 1",
            ));
        }
        if max_merge_count < max_thread_count {
            return Err(TesseraError::illegal_argument(format!(
                "max_merge_count ({max_merge_count}) must be >= max_thread_count ({max_thread_count})"
            )));
        }
        Ok(Self::build(max_merge_count, max_thread_count))
    }

    fn build(max_merge_count: usize, max_thread_count: usize) -> Self {
        let (done_tx, done_rx) = bounded(1);
        ConcurrentMergeScheduler {
            inner: Arc::new(CmsInner {
                max_thread_count,
                max_merge_count,
                state: Mutex::new(CmsState::default()),
                slot_freed: Condvar::new(),
                done_tx,
                done_rx,
            }),
        }
    }

    /// Merges allowed to make progress at once.
    pub fn max_thread_count(&self) -> usize {
        self.inner.max_thread_count
    }

    /// Merge threads allowed before callers stall.
    pub fn max_merge_count(&self) -> usize {
        self.inner.max_merge_count
    }

    /// Merge threads currently alive.
    pub fn merge_thread_count(&self) -> usize {
        self.inner.state.lock().threads
    }

    fn spawn(&self, source: Arc<dyn MergeSource>, merge: OneMerge) -> Result<()> {
        let mut state = self.inner.state.lock();
        let id = state.next_thread_id;
        state.next_thread_id += 1;
        state.threads += 1;
        debug!(
            target: "tessera::ms",
            "launch merge thread {id} for {} ({} threads)",
            merge.seg_string(),
            state.threads
        );

        let scheduler = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("tessera-merge-{id}"))
            .spawn(move || scheduler.run_merge_thread(source, merge));
        match spawned {
            Ok(handle) => {
                state.handles.retain(|h| !h.is_finished());
                state.handles.push(handle);
                Ok(())
            }
            Err(e) => {
                state.threads -= 1;
                Err(e.into())
            }
        }
    }

    fn run_merge_thread(&self, source: Arc<dyn MergeSource>, merge: OneMerge) {
        IN_MERGE_THREAD.with(|f| f.set(true));
        {
            let mut state = self.inner.state.lock();
            while state.running >= self.inner.max_thread_count {
                self.inner.slot_freed.wait(&mut state);
            }
            state.running += 1;
        }

        run_one(source.as_ref(), merge);

        {
            let mut state = self.inner.state.lock();
            state.running -= 1;
            state.threads -= 1;
        }
        self.inner.slot_freed.notify_one();
        // A full channel already wakes the stalled caller.
        let _ = self.inner.done_tx.try_send(());

        // Pick up merges the finished one made eligible.
        if let Err(e) = self.merge(source, MergeTrigger::MergeFinished, true) {
            warn!(target: "tessera::ms", "failed to launch follow-up merges: {e}");
        }
    }

    /// Block while too many merge threads exist. Returns false when the
    /// caller is a merge thread that must not launch more.
    fn maybe_stall(&self, source: &dyn MergeSource) -> bool {
        let in_merge_thread = IN_MERGE_THREAD.with(Cell::get);
        loop {
            // Drop a stale signal before checking; a thread exiting after
            // the check leaves a fresh one.
            let _ = self.inner.done_rx.try_recv();
            if !source.has_pending_merges()
                || self.merge_thread_count() < self.inner.max_merge_count
            {
                return true;
            }
            if in_merge_thread {
                return false;
            }
            debug!(target: "tessera::ms", "too many merges; stalling");
            let _ = self.inner.done_rx.recv_timeout(STALL_POLL);
        }
    }

    #[cfg(test)]
    fn pending_exit_signals(&self) -> usize {
        self.inner.done_rx.len()
    }
}

impl MergeScheduler for ConcurrentMergeScheduler {
    fn merge(
        &self,
        source: Arc<dyn MergeSource>,
        trigger: MergeTrigger,
        _new_merges_found: bool,
    ) -> Result<()> {
        loop {
            if !self.maybe_stall(source.as_ref()) {
                return Ok(());
            }
            let Some(merge) = source.next_merge() else {
                return Ok(());
            };
            debug!(target: "tessera::ms", "{trigger}: consider merge {}", merge.seg_string());
            self.spawn(Arc::clone(&source), merge)?;
        }
    }

    fn close(&self) -> Result<()> {
        if IN_MERGE_THREAD.with(Cell::get) {
            return Ok(());
        }
        loop {
            let handles = std::mem::take(&mut self.inner.state.lock().handles);
            if handles.is_empty() {
                return Ok(());
            }
            for handle in handles {
                if handle.join().is_err() {
                    warn!(target: "tessera::ms", "merge thread panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crossbeam_channel::unbounded;

    use super::*;
    use crate::merge::policy::tests::segment;

    #[derive(Default)]
    struct QueueSource {
        pending: Mutex<VecDeque<OneMerge>>,
        /// When set, each merge waits for one message before finishing.
        gate: Option<Receiver<()>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
        finished: AtomicUsize,
        fail: bool,
    }

    impl QueueSource {
        fn with_merges(n: usize) -> Self {
            let source = QueueSource::default();
            for i in 0..n {
                source
                    .pending
                    .lock()
                    .push_back(OneMerge::new(vec![segment(&format!("_{i}"), 1, 1)]));
            }
            source
        }
    }

    impl MergeSource for QueueSource {
        fn next_merge(&self) -> Option<OneMerge> {
            self.pending.lock().pop_front()
        }

        fn has_pending_merges(&self) -> bool {
            !self.pending.lock().is_empty()
        }

        fn merge(&self, _merge: &mut OneMerge) -> Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            match &self.gate {
                Some(gate) => {
                    let _ = gate.recv();
                }
                None => thread::sleep(Duration::from_millis(5)),
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err(TesseraError::index("disk full"));
            }
            Ok(())
        }

        fn on_merge_finished(&self, _merge: &OneMerge) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_serial_runs_everything_in_order() {
        let source = Arc::new(QueueSource::with_merges(4));
        let scheduler = SerialMergeScheduler::new();
        scheduler
            .merge(source.clone(), MergeTrigger::Explicit, true)
            .unwrap();
        assert_eq!(source.finished.load(Ordering::SeqCst), 4);
        assert_eq!(source.max_running.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failures_do_not_stop_the_loop() {
        let mut source = QueueSource::with_merges(3);
        source.fail = true;
        let source = Arc::new(source);
        SerialMergeScheduler::new()
            .merge(source.clone(), MergeTrigger::Explicit, true)
            .unwrap();
        assert_eq!(source.finished.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_no_merge_scheduler_leaves_merges_pending() {
        let source = Arc::new(QueueSource::with_merges(2));
        NoMergeScheduler::new()
            .merge(source.clone(), MergeTrigger::Explicit, true)
            .unwrap();
        assert!(source.has_pending_merges());
    }

    #[test]
    fn test_concurrent_respects_thread_limit() {
        let source = Arc::new(QueueSource::with_merges(12));
        let scheduler = ConcurrentMergeScheduler::with_limits(8, 2).unwrap();
        scheduler
            .merge(source.clone(), MergeTrigger::Explicit, true)
            .unwrap();
        scheduler.close().unwrap();
        assert_eq!(source.finished.load(Ordering::SeqCst), 12);
        assert!(source.max_running.load(Ordering::SeqCst) <= 2);
        assert_eq!(scheduler.merge_thread_count(), 0);
    }

    #[test]
    fn test_concurrent_stalls_caller() {
        let source = Arc::new(QueueSource::with_merges(5));
        let scheduler = ConcurrentMergeScheduler::with_limits(1, 1).unwrap();
        scheduler
            .merge(source.clone(), MergeTrigger::Explicit, true)
            .unwrap();
        // The caller only returns once every merge got a thread.
        assert!(!source.has_pending_merges());
        scheduler.close().unwrap();
        assert_eq!(source.finished.load(Ordering::SeqCst), 5);
        assert_eq!(source.max_running.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stalled_caller_is_released_when_a_merge_finishes() {
        let (open, gate) = unbounded();
        let mut source = QueueSource::with_merges(2);
        source.gate = Some(gate);
        let source = Arc::new(source);
        let scheduler = ConcurrentMergeScheduler::with_limits(1, 1).unwrap();

        let caller = {
            let source = Arc::clone(&source);
            let scheduler = scheduler.clone();
            thread::spawn(move || scheduler.merge(source, MergeTrigger::Explicit, true))
        };
        thread::sleep(Duration::from_millis(200));
        assert!(!caller.is_finished());
        assert!(source.has_pending_merges());
        assert_eq!(scheduler.merge_thread_count(), 1);

        open.send(()).unwrap();
        open.send(()).unwrap();
        caller.join().unwrap().unwrap();
        scheduler.close().unwrap();
        assert_eq!(source.finished.load(Ordering::SeqCst), 2);
        assert_eq!(source.max_running.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exit_signals_do_not_accumulate() {
        let scheduler = ConcurrentMergeScheduler::with_limits(100, 4).unwrap();
        for _ in 0..10 {
            let source = Arc::new(QueueSource::with_merges(20));
            scheduler
                .merge(source.clone(), MergeTrigger::Explicit, true)
                .unwrap();
            scheduler.close().unwrap();
            assert_eq!(source.finished.load(Ordering::SeqCst), 20);
        }
        assert!(scheduler.pending_exit_signals() <= 1);
    }

    #[test]
    fn test_invalid_limits() {
        assert!(ConcurrentMergeScheduler::with_limits(1, 2).is_err());
        assert!(ConcurrentMergeScheduler::with_limits(3, 0).is_err());
        let cms = ConcurrentMergeScheduler::new();
        assert_eq!(cms.max_merge_count(), cms.max_thread_count() + 5);
    }
}
