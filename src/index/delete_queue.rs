//! The buffered update queue.
//!
//! Deletes and doc-values updates are appended to a singly linked list of
//! nodes shared by every arena. Each arena keeps a [`DeleteSlice`], a
//! `(head, tail]` window over the list: after adding a document the arena
//! moves its tail to the global tail and applies the nodes in between to its
//! own documents, limited to the documents it already holds. The queue also
//! keeps a global slice feeding a global buffer; that buffer is frozen on
//! flush and applied to the segments that were already published.
//!
//! Appends only take the narrow tail lock. Sequence numbers come from an
//! atomic counter incremented under that lock, so list order and sequence
//! order agree.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::document::{DocId, Term};
use crate::index::buffered_updates::{BufferedUpdates, FrozenBufferedUpdates, MAX_DOC_UPTO};
use crate::index::doc_values::DocValuesUpdate;
use crate::search::Query;

/// One queued operation.
#[derive(Debug, Clone)]
pub enum DeleteOp {
    /// Delete documents containing any of the terms.
    Terms(Vec<Term>),
    /// Delete documents matching any of the queries.
    Queries(Vec<Arc<dyn Query>>),
    /// Update doc values of documents containing the update terms.
    DocValuesUpdates(Vec<DocValuesUpdate>),
}

impl DeleteOp {
    fn apply(&self, updates: &mut BufferedUpdates, doc_id_upto: DocId) {
        match self {
            DeleteOp::Terms(terms) => {
                for term in terms {
                    updates.add_term(term.clone(), doc_id_upto);
                }
            }
            DeleteOp::Queries(queries) => {
                for query in queries {
                    updates.add_query(Arc::clone(query), doc_id_upto);
                }
            }
            DeleteOp::DocValuesUpdates(dv_updates) => {
                for update in dv_updates {
                    updates.add_doc_values_update(update.clone(), doc_id_upto);
                }
            }
        }
    }
}

#[derive(Debug)]
struct Node {
    op: Option<DeleteOp>,
    seq_no: u64,
    next: OnceLock<Arc<Node>>,
}

impl Node {
    fn sentinel() -> Arc<Node> {
        Arc::new(Node {
            op: None,
            seq_no: 0,
            next: OnceLock::new(),
        })
    }
}

impl Drop for Node {
    // Unlink iteratively; a long chain would overflow the stack otherwise.
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => next = node.next.take(),
                Err(_) => break,
            }
        }
    }
}

/// A cursor over the queue. `head` is exclusive, `tail` inclusive.
#[derive(Debug, Clone)]
pub struct DeleteSlice {
    head: Arc<Node>,
    tail: Arc<Node>,
}

impl DeleteSlice {
    fn new(tail: Arc<Node>) -> Self {
        DeleteSlice {
            head: Arc::clone(&tail),
            tail,
        }
    }

    /// Apply every node in the slice to `updates` with the given doc limit
    /// and move the head to the tail.
    pub fn apply(&mut self, updates: &mut BufferedUpdates, doc_id_upto: DocId) {
        if self.is_empty() {
            return;
        }
        let mut current = Arc::clone(&self.head);
        while let Some(next) = current.next.get().cloned() {
            if let Some(op) = &next.op {
                op.apply(updates, doc_id_upto);
            }
            let reached_tail = Arc::ptr_eq(&next, &self.tail);
            current = next;
            if reached_tail {
                break;
            }
        }
        self.reset();
    }

    /// Drop the nodes of the slice without applying them.
    pub fn reset(&mut self) {
        self.head = Arc::clone(&self.tail);
    }

    /// Whether the slice holds no node.
    pub fn is_empty(&self) -> bool {
        Arc::ptr_eq(&self.head, &self.tail)
    }

    /// Whether `seq_no` is the last node of the slice.
    pub fn is_tail_seq_no(&self, seq_no: u64) -> bool {
        self.tail.op.is_some() && self.tail.seq_no == seq_no
    }
}

#[derive(Debug)]
struct GlobalBuffer {
    slice: DeleteSlice,
    updates: BufferedUpdates,
}

/// The shared update queue of one writer generation.
#[derive(Debug)]
pub struct DeleteQueue {
    tail: Mutex<Arc<Node>>,
    global: Mutex<GlobalBuffer>,
    next_seq_no: AtomicU64,
    num_global_term_deletes: AtomicUsize,
    global_bytes_used: AtomicUsize,
    generation: u64,
}

impl DeleteQueue {
    /// A queue whose first operation gets `start_seq_no`.
    pub fn new(generation: u64, start_seq_no: u64) -> Self {
        let sentinel = Node::sentinel();
        DeleteQueue {
            tail: Mutex::new(Arc::clone(&sentinel)),
            global: Mutex::new(GlobalBuffer {
                slice: DeleteSlice::new(sentinel),
                updates: BufferedUpdates::new(),
            }),
            next_seq_no: AtomicU64::new(start_seq_no.max(1)),
            num_global_term_deletes: AtomicUsize::new(0),
            global_bytes_used: AtomicUsize::new(0),
            generation,
        }
    }

    /// Queue generation; bumped when the queue is replaced.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn append(&self, op: DeleteOp) -> Arc<Node> {
        let mut tail = self.tail.lock();
        let node = Arc::new(Node {
            op: Some(op),
            seq_no: self.next_seq_no.fetch_add(1, Ordering::AcqRel),
            next: OnceLock::new(),
        });
        // The tail lock is held, so nobody else can link after `tail`.
        let _ = tail.next.set(Arc::clone(&node));
        *tail = Arc::clone(&node);
        node
    }

    /// Append an operation and fold it into the global buffer if the buffer
    /// is not busy. Returns its sequence number.
    pub fn add(&self, op: DeleteOp) -> u64 {
        let seq_no = self.append(op).seq_no;
        self.try_apply_global_slice();
        seq_no
    }

    /// Append an operation and make it the tail of `slice`, so the caller
    /// applies it to its own documents.
    pub fn add_to_slice(&self, op: DeleteOp, slice: &mut DeleteSlice) -> u64 {
        let node = self.append(op);
        let seq_no = node.seq_no;
        slice.tail = node;
        seq_no
    }

    /// Delete documents containing any of `terms`.
    pub fn add_delete_terms(&self, terms: Vec<Term>) -> u64 {
        self.add(DeleteOp::Terms(terms))
    }

    /// Delete documents matching any of `queries`.
    pub fn add_delete_queries(&self, queries: Vec<Arc<dyn Query>>) -> u64 {
        self.add(DeleteOp::Queries(queries))
    }

    /// Update doc values.
    pub fn add_doc_values_updates(&self, updates: Vec<DocValuesUpdate>) -> u64 {
        self.add(DeleteOp::DocValuesUpdates(updates))
    }

    /// A slice positioned at the current tail.
    pub fn new_slice(&self) -> DeleteSlice {
        DeleteSlice::new(Arc::clone(&self.tail.lock()))
    }

    /// Take a sequence number for a document and move `slice` to the
    /// global tail. Returns whether the slice gained nodes.
    pub fn update_slice(&self, slice: &mut DeleteSlice) -> (u64, bool) {
        let tail = self.tail.lock();
        let seq_no = self.next_seq_no.fetch_add(1, Ordering::AcqRel);
        if Arc::ptr_eq(&slice.tail, &tail) {
            (seq_no, false)
        } else {
            slice.tail = Arc::clone(&tail);
            (seq_no, true)
        }
    }

    fn current_tail(&self) -> Arc<Node> {
        Arc::clone(&self.tail.lock())
    }

    fn fold_global(&self, global: &mut GlobalBuffer, tail: Arc<Node>) {
        if !Arc::ptr_eq(&global.slice.tail, &tail) {
            global.slice.tail = tail;
            let GlobalBuffer { slice, updates } = global;
            slice.apply(updates, MAX_DOC_UPTO);
        }
        self.num_global_term_deletes
            .store(global.updates.num_term_deletes(), Ordering::Release);
        self.global_bytes_used
            .store(global.updates.bytes_used(), Ordering::Release);
    }

    /// Fold new nodes into the global buffer unless another thread holds
    /// it.
    pub fn try_apply_global_slice(&self) {
        if let Some(mut global) = self.global.try_lock() {
            let tail = self.current_tail();
            self.fold_global(&mut global, tail);
        }
    }

    /// Fold every queued node into the global buffer and freeze it. The
    /// caller's slice, if any, is moved to the same tail so that it covers
    /// exactly the nodes the packet covers.
    pub fn freeze_global_buffer(
        &self,
        caller_slice: Option<&mut DeleteSlice>,
    ) -> Option<FrozenBufferedUpdates> {
        let mut global = self.global.lock();
        let tail = self.current_tail();
        if let Some(slice) = caller_slice {
            slice.tail = Arc::clone(&tail);
        }
        self.fold_global(&mut global, tail);
        let packet = if global.updates.any() {
            let packet = FrozenBufferedUpdates::new(&global.updates);
            global.updates.clear();
            Some(packet)
        } else {
            None
        };
        self.num_global_term_deletes.store(0, Ordering::Release);
        self.global_bytes_used.store(0, Ordering::Release);
        packet
    }

    /// Whether anything was queued and not yet frozen.
    pub fn any_changes(&self) -> bool {
        let global = self.global.lock();
        let tail = self.current_tail();
        global.updates.any() || !global.slice.is_empty() || !Arc::ptr_eq(&global.slice.tail, &tail)
    }

    /// Term deletes folded into the global buffer since the last freeze.
    pub fn num_global_term_deletes(&self) -> usize {
        self.num_global_term_deletes.load(Ordering::Acquire)
    }

    /// Heap usage of the global buffer.
    pub fn bytes_used(&self) -> usize {
        self.global_bytes_used.load(Ordering::Acquire)
    }

    /// Sequence number of the last operation handed out.
    pub fn last_sequence_number(&self) -> u64 {
        self.next_seq_no.load(Ordering::Acquire) - 1
    }

    /// Take a sequence number for an operation that is not queued.
    pub fn next_sequence_number(&self) -> u64 {
        self.next_seq_no.fetch_add(1, Ordering::AcqRel)
    }

    /// Forget everything queued so far.
    pub fn clear(&self) {
        let mut global = self.global.lock();
        let tail = self.current_tail();
        global.slice = DeleteSlice::new(tail);
        global.updates.clear();
        self.num_global_term_deletes.store(0, Ordering::Release);
        self.global_bytes_used.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn term(text: &str) -> Term {
        Term::new("id", text)
    }

    #[test]
    fn test_slice_captures_each_node_once() {
        let queue = DeleteQueue::new(0, 1);
        let mut slice = queue.new_slice();
        queue.add_delete_terms(vec![term("a")]);
        queue.add_delete_terms(vec![term("b")]);

        let mut updates = BufferedUpdates::new();
        let (_, changed) = queue.update_slice(&mut slice);
        assert!(changed);
        slice.apply(&mut updates, 4);
        assert_eq!(updates.delete_terms.len(), 2);
        assert_eq!(updates.delete_terms[&term("a")], 4);

        let (_, changed) = queue.update_slice(&mut slice);
        assert!(!changed);
        slice.apply(&mut updates, 9);
        assert_eq!(updates.delete_terms[&term("a")], 4);
    }

    #[test]
    fn test_sequence_numbers_follow_list_order() {
        let queue = DeleteQueue::new(0, 1);
        let first = queue.add_delete_terms(vec![term("a")]);
        let mut slice = queue.new_slice();
        let second = queue.add_to_slice(DeleteOp::Terms(vec![term("b")]), &mut slice);
        assert!(second > first);
        assert!(slice.is_tail_seq_no(second));
        assert_eq!(queue.last_sequence_number(), second);
    }

    #[test]
    fn test_freeze_resets_global_counts() {
        let queue = DeleteQueue::new(0, 1);
        queue.add_delete_terms(vec![term("a"), term("b")]);
        queue.try_apply_global_slice();
        assert_eq!(queue.num_global_term_deletes(), 2);
        assert!(queue.any_changes());

        let mut slice = queue.new_slice();
        let packet = queue.freeze_global_buffer(Some(&mut slice)).unwrap();
        assert_eq!(packet.terms.len(), 2);
        assert_eq!(queue.num_global_term_deletes(), 0);
        assert!(!queue.any_changes());
        assert!(queue.freeze_global_buffer(None).is_none());

        queue.add_delete_terms(vec![term("c")]);
        assert_eq!(queue.num_global_term_deletes(), 1);
    }

    #[test]
    fn test_concurrent_appends_are_all_seen() {
        let queue = Arc::new(DeleteQueue::new(0, 1));
        let mut slice = queue.new_slice();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..250 {
                        queue.add_delete_terms(vec![term(&format!("{t}-{i}"))]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut updates = BufferedUpdates::new();
        queue.update_slice(&mut slice);
        slice.apply(&mut updates, MAX_DOC_UPTO);
        assert_eq!(updates.delete_terms.len(), 1000);

        let packet = queue.freeze_global_buffer(None).unwrap();
        assert_eq!(packet.terms.len(), 1000);
    }

    #[test]
    fn test_long_chain_drops_without_overflow() {
        let queue = DeleteQueue::new(0, 1);
        let mut slice = queue.new_slice();
        for i in 0..200_000 {
            queue.add_delete_terms(vec![term(&i.to_string())]);
        }
        queue.clear();
        slice.reset();
        drop(slice);
        drop(queue);
    }
}
