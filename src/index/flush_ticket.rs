//! Ordered publication of flushed segments.
//!
//! Arenas flush concurrently but their segments, and the global delete
//! packets frozen alongside them, must reach the writer in the order the
//! packets were frozen. Every flush takes a ticket while holding the queue
//! lock, so ticket order equals freeze order; tickets are published strictly
//! from the head of the queue once their flush completed.

use std::collections::VecDeque;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::error::Result;
use crate::index::arena::{Arena, FlushedSegment};
use crate::index::buffered_updates::FrozenBufferedUpdates;
use crate::index::delete_queue::DeleteQueue;

#[derive(Debug)]
enum Outcome {
    Pending,
    Flushed(Option<FlushedSegment>),
    Failed,
}

#[derive(Debug)]
struct TicketState {
    global_updates: Option<FrozenBufferedUpdates>,
    outcome: Outcome,
}

/// One entry of the ticket queue.
#[derive(Debug)]
pub struct FlushTicket {
    state: Mutex<TicketState>,
}

impl FlushTicket {
    fn new(global_updates: Option<FrozenBufferedUpdates>, has_segment: bool) -> Self {
        FlushTicket {
            state: Mutex::new(TicketState {
                global_updates,
                outcome: if has_segment {
                    Outcome::Pending
                } else {
                    Outcome::Flushed(None)
                },
            }),
        }
    }

    /// Record the flushed segment (`None` if it was fully deleted).
    pub fn set_segment(&self, segment: Option<FlushedSegment>) {
        self.state.lock().outcome = Outcome::Flushed(segment);
    }

    /// Record that the flush failed. The frozen packet is still published.
    pub fn set_failed(&self) {
        self.state.lock().outcome = Outcome::Failed;
    }

    fn can_publish(&self) -> bool {
        !matches!(self.state.lock().outcome, Outcome::Pending)
    }

    fn take(&self) -> PublishedTicket {
        let mut state = self.state.lock();
        let segment = match std::mem::replace(&mut state.outcome, Outcome::Failed) {
            Outcome::Flushed(segment) => segment,
            _ => None,
        };
        PublishedTicket {
            global_updates: state.global_updates.take(),
            segment,
        }
    }
}

/// What the writer receives for a ticket.
#[derive(Debug)]
pub struct PublishedTicket {
    /// Global deletes frozen with the ticket.
    pub global_updates: Option<FrozenBufferedUpdates>,
    /// The flushed segment, if the flush produced one.
    pub segment: Option<FlushedSegment>,
}

/// FIFO of flush tickets.
#[derive(Debug, Default)]
pub struct FlushTicketQueue {
    queue: Mutex<VecDeque<Arc<FlushTicket>>>,
    purge_lock: Mutex<()>,
}

impl FlushTicketQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Freeze the global buffer for `arena`'s flush and enqueue its ticket.
    pub fn add_flush_ticket(&self, arena: &mut Arena) -> Arc<FlushTicket> {
        let mut queue = self.queue.lock();
        let global = arena.prepare_flush();
        let ticket = Arc::new(FlushTicket::new(global, true));
        queue.push_back(Arc::clone(&ticket));
        ticket
    }

    /// Enqueue a ticket carrying only the frozen global buffer. Returns
    /// false if there was nothing to freeze.
    pub fn add_deletes_ticket(&self, delete_queue: &DeleteQueue) -> bool {
        let mut queue = self.queue.lock();
        match delete_queue.freeze_global_buffer(None) {
            Some(global) => {
                queue.push_back(Arc::new(FlushTicket::new(Some(global), false)));
                true
            }
            None => false,
        }
    }

    /// Whether tickets wait for publication.
    pub fn has_tickets(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Number of queued tickets.
    pub fn ticket_count(&self) -> usize {
        self.queue.lock().len()
    }

    /// Publish ready tickets unless another thread is already doing so.
    pub fn try_purge<F>(&self, publish: F) -> Result<()>
    where
        F: FnMut(PublishedTicket) -> Result<()>,
    {
        match self.purge_lock.try_lock() {
            Some(_guard) => self.inner_purge(publish),
            None => Ok(()),
        }
    }

    /// Publish ready tickets, waiting for a concurrent purge to finish.
    pub fn force_purge<F>(&self, publish: F) -> Result<()>
    where
        F: FnMut(PublishedTicket) -> Result<()>,
    {
        let _guard = self.purge_lock.lock();
        self.inner_purge(publish)
    }

    fn inner_purge<F>(&self, mut publish: F) -> Result<()>
    where
        F: FnMut(PublishedTicket) -> Result<()>,
    {
        loop {
            let head = {
                let queue = self.queue.lock();
                match queue.front() {
                    Some(ticket) if ticket.can_publish() => Arc::clone(ticket),
                    _ => return Ok(()),
                }
            };
            let published = head.take();
            trace!(
                target: "tessera::dw",
                "publish ticket segment={:?} deletes={}",
                published.segment.as_ref().map(|s| s.sci.name().to_string()),
                published.global_updates.is_some()
            );
            let result = publish(published);
            self.queue.lock().pop_front();
            result?;
        }
    }

    /// Drop every queued ticket.
    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Term;

    #[test]
    fn test_publishes_in_ticket_order() {
        let queue = FlushTicketQueue::new();
        let deletes = DeleteQueue::new(0, 1);

        let first = Arc::new(FlushTicket::new(None, true));
        queue.queue.lock().push_back(Arc::clone(&first));
        deletes.add_delete_terms(vec![Term::new("id", "1")]);
        assert!(queue.add_deletes_ticket(&deletes));
        assert!(!queue.add_deletes_ticket(&deletes));

        let mut published = Vec::new();
        queue
            .force_purge(|t| {
                published.push(t.global_updates.is_some());
                Ok(())
            })
            .unwrap();
        // The pending head blocks the deletes ticket behind it.
        assert!(published.is_empty());
        assert_eq!(queue.ticket_count(), 2);

        first.set_failed();
        queue
            .try_purge(|t| {
                published.push(t.global_updates.is_some());
                Ok(())
            })
            .unwrap();
        assert_eq!(published, vec![false, true]);
        assert!(!queue.has_tickets());
    }

    #[test]
    fn test_failed_publish_still_pops() {
        let queue = FlushTicketQueue::new();
        let deletes = DeleteQueue::new(0, 1);
        deletes.add_delete_terms(vec![Term::new("id", "1")]);
        queue.add_deletes_ticket(&deletes);
        let result = queue.force_purge(|_| Err(crate::error::TesseraError::other("boom")));
        assert!(result.is_err());
        assert!(!queue.has_tickets());
    }
}
