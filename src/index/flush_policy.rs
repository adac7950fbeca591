//! When to flush.
//!
//! A [`FlushPolicy`] is consulted by flush control after every document
//! and every delete. It decides whether an arena should be marked flush
//! pending and whether buffered deletes should be applied to the published
//! segments. The policy runs under the flush-control lock and sees the
//! state through a [`FlushControlView`].

use std::fmt::Debug;

use log::debug;

use crate::index::flush_control::FlushControlView;

/// Decides which arenas to flush.
pub trait FlushPolicy: Send + Sync + Debug {
    /// Called for each delete. `arena` is set when the delete is part of an
    /// update.
    fn on_delete(&self, control: &mut FlushControlView<'_>, arena: Option<usize>);

    /// Called for each added document.
    fn on_insert(&self, control: &mut FlushControlView<'_>, arena: usize);

    /// Called for each updated document.
    fn on_update(&self, control: &mut FlushControlView<'_>, arena: usize) {
        self.on_insert(control, arena);
        self.on_delete(control, Some(arena));
    }
}

/// Flushes by buffered document count or by RAM, and applies deletes by
/// delete-term count or when deletes alone exceed the RAM buffer.
///
/// With a RAM limit the largest non-pending arena is marked once active
/// bytes plus delete bytes reach the limit.
#[derive(Debug, Clone)]
pub struct FlushByRamOrCountsPolicy {
    ram_buffer_bytes: Option<usize>,
    max_buffered_docs: Option<usize>,
    max_buffered_delete_terms: Option<usize>,
}

impl FlushByRamOrCountsPolicy {
    /// Create the policy. `None` disables a trigger.
    pub fn new(
        ram_buffer_size_mb: Option<f64>,
        max_buffered_docs: Option<usize>,
        max_buffered_delete_terms: Option<usize>,
    ) -> Self {
        FlushByRamOrCountsPolicy {
            ram_buffer_bytes: ram_buffer_size_mb.map(|mb| (mb * 1024.0 * 1024.0) as usize),
            max_buffered_docs,
            max_buffered_delete_terms,
        }
    }

    fn mark_largest_pending(&self, control: &mut FlushControlView<'_>, arena: usize, total: usize) {
        if let Some(largest) = control.largest_non_pending(arena) {
            debug!(
                target: "tessera::fc",
                "force flush due to RAM: {total} bytes >= limit, marking arena {largest}"
            );
            control.set_flush_pending(largest);
        }
    }
}

impl FlushPolicy for FlushByRamOrCountsPolicy {
    fn on_delete(&self, control: &mut FlushControlView<'_>, _arena: Option<usize>) {
        if let Some(max_terms) = self.max_buffered_delete_terms {
            if control.num_global_term_deletes() >= max_terms {
                control.set_apply_all_deletes();
            }
        }
        if let Some(limit) = self.ram_buffer_bytes {
            if control.delete_bytes_used() > limit {
                debug!(
                    target: "tessera::fc",
                    "force apply deletes: {} delete bytes > {limit}",
                    control.delete_bytes_used()
                );
                control.set_apply_all_deletes();
            }
        }
    }

    fn on_insert(&self, control: &mut FlushControlView<'_>, arena: usize) {
        if let Some(max_docs) = self.max_buffered_docs {
            if control.num_docs(arena) as usize >= max_docs {
                control.set_flush_pending(arena);
                return;
            }
        }
        if let Some(limit) = self.ram_buffer_bytes {
            let total = control.active_bytes() + control.delete_bytes_used();
            if total >= limit {
                self.mark_largest_pending(control, arena, total);
            }
        }
    }
}
