//! The uplink request queue.
//!
//! Bounded slot table with the Free → New → Pending → Processing →
//! Free state machine. A request whose byte range is entirely covered
//! by an existing New/Pending entry attaches to it instead of going
//! upstream again; the attached entry must land at a slot index
//! strictly greater than its parent, otherwise it could starve on the
//! reverse-order reply dispatch.

use dnbd_error::{DnbdError, Result};
use dnbd_image::ReplySink;
use std::sync::Arc;
use std::time::Instant;

/// Maximum outstanding entries per uplink.
pub const QUEUE_CAPACITY: usize = 64;

/// Queue length above which freeing the terminal entry shrinks the
/// table.
const SHRINK_THRESHOLD: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Free,
    New,
    Pending,
    Processing,
}

pub struct QueueSlot {
    pub status: SlotStatus,
    pub from: u64,
    pub to: u64,
    pub handle: u64,
    /// `None` marks a background replication entry: no client waits
    /// for it, the payload only lands in the cache.
    pub sink: Option<Arc<dyn ReplySink>>,
    pub entered: Instant,
    pub sent_at: Option<Instant>,
}

/// Outcome of [`RequestQueue::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A fresh entry; the caller must transmit it upstream.
    Fresh,
    /// Attached to an in-flight superset request.
    Attached,
}

#[derive(Default)]
pub struct RequestQueue {
    slots: Vec<QueueSlot>,
}

impl RequestQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.status == SlotStatus::Free)
    }

    /// Number of non-Free entries that belong to clients (not
    /// background replication).
    #[must_use]
    pub fn active_client_entries(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.status != SlotStatus::Free && s.sink.is_some())
            .count()
    }

    /// True if a background replication entry is still in flight.
    #[must_use]
    pub fn has_background_entry(&self) -> bool {
        self.slots
            .iter()
            .any(|s| s.status != SlotStatus::Free && s.sink.is_none())
    }

    #[must_use]
    pub fn status(&self, idx: usize) -> SlotStatus {
        self.slots[idx].status
    }

    #[must_use]
    pub fn slot(&self, idx: usize) -> &QueueSlot {
        &self.slots[idx]
    }

    /// Insert a request for `start..start + length`.
    pub fn insert(
        &mut self,
        sink: Option<Arc<dyn ReplySink>>,
        handle: u64,
        start: u64,
        length: u32,
    ) -> Result<InsertOutcome> {
        let end = start + u64::from(length);
        let mut free_slot = None;
        let mut parent = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if free_slot.is_none() && slot.status == SlotStatus::Free {
                free_slot = Some(i);
            }
            if !matches!(slot.status, SlotStatus::New | SlotStatus::Pending) {
                continue;
            }
            if slot.from <= start && slot.to >= end {
                parent = Some(i);
                break;
            }
        }
        // An attached entry must sit after its parent, or the reply
        // dispatch could answer the parent and never see the child.
        let slot_idx = match (free_slot, parent) {
            (Some(free), None) => free,
            (Some(free), Some(p)) if free > p => free,
            _ => {
                if self.slots.len() >= QUEUE_CAPACITY {
                    return Err(DnbdError::QueueFull);
                }
                self.slots.push(QueueSlot {
                    status: SlotStatus::Free,
                    from: 0,
                    to: 0,
                    handle: 0,
                    sink: None,
                    entered: Instant::now(),
                    sent_at: None,
                });
                self.slots.len() - 1
            }
        };
        let status = if parent.is_some() {
            SlotStatus::Pending
        } else {
            SlotStatus::New
        };
        self.slots[slot_idx] = QueueSlot {
            status,
            from: start,
            to: end,
            handle,
            sink,
            entered: Instant::now(),
            sent_at: None,
        };
        Ok(if parent.is_some() {
            InsertOutcome::Attached
        } else {
            InsertOutcome::Fresh
        })
    }

    /// Collect entries to (re)transmit and mark them Pending. With
    /// `new_only`, Pending entries are left alone; without, they are
    /// re-sent too (connection switch).
    pub fn take_sendable(&mut self, new_only: bool) -> Vec<(u64, u32)> {
        let now = Instant::now();
        let mut out = Vec::new();
        for slot in &mut self.slots {
            let resend = match slot.status {
                SlotStatus::New => true,
                SlotStatus::Pending => !new_only,
                _ => false,
            };
            if !resend {
                continue;
            }
            slot.status = SlotStatus::Pending;
            slot.sent_at = Some(now);
            out.push((slot.from, (slot.to - slot.from) as u32));
        }
        out
    }

    /// Flip every Pending entry whose range lies entirely inside
    /// `start..end` to Processing. Returns the age of the oldest
    /// matched in-flight request, the production-path RTT sample.
    pub fn match_reply(&mut self, start: u64, end: u64) -> Option<std::time::Duration> {
        let mut oldest = None;
        for slot in &mut self.slots {
            debug_assert!(slot.status != SlotStatus::Processing);
            if slot.status != SlotStatus::Pending {
                continue;
            }
            if slot.from >= start && slot.to <= end {
                slot.status = SlotStatus::Processing;
                if let Some(sent) = slot.sent_at {
                    let age = sent.elapsed();
                    if oldest.is_none_or(|o| age > o) {
                        oldest = Some(age);
                    }
                }
            }
        }
        oldest
    }

    /// Free slot `idx` and hand back what is needed to answer the
    /// client. Call with the queue lock held; the actual send happens
    /// with the lock dropped.
    pub fn take_for_dispatch(
        &mut self,
        idx: usize,
    ) -> (u64, u64, u64, Option<Arc<dyn ReplySink>>) {
        let slot = &mut self.slots[idx];
        debug_assert_eq!(slot.status, SlotStatus::Processing);
        slot.status = SlotStatus::Free;
        let sink = slot.sink.take();
        (slot.handle, slot.from, slot.to, sink)
    }

    /// Shrink the table if `idx` was the terminal entry of a long
    /// queue, so steady-state traffic does not pin the high-water mark.
    pub fn shrink_tail(&mut self, idx: usize) {
        if idx > SHRINK_THRESHOLD
            && idx + 1 == self.slots.len()
            && self.slots[idx].status == SlotStatus::Free
        {
            self.slots.pop();
        }
    }

    /// Fail and free every entry; used on shutdown.
    pub fn fail_all(&mut self) -> Vec<(u64, Arc<dyn ReplySink>)> {
        let mut failed = Vec::new();
        for slot in &mut self.slots {
            if slot.status == SlotStatus::Free {
                continue;
            }
            slot.status = SlotStatus::Free;
            if let Some(sink) = slot.sink.take() {
                failed.push((slot.handle, sink));
            }
        }
        self.slots.clear();
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        delivered: Mutex<Vec<u64>>,
        failed: Mutex<Vec<u64>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
                failed: Mutex::new(Vec::new()),
            })
        }
    }

    impl ReplySink for Recorder {
        fn deliver(&self, handle: u64, _data: &[u8]) {
            self.delivered.lock().push(handle);
        }
        fn fail(&self, handle: u64) {
            self.failed.lock().push(handle);
        }
    }

    #[test]
    fn superset_request_attaches() {
        let sink = Recorder::new();
        let mut q = RequestQueue::new();
        assert_eq!(
            q.insert(Some(sink.clone()), 1, 0, 65536).unwrap(),
            InsertOutcome::Fresh
        );
        assert_eq!(
            q.insert(Some(sink.clone()), 2, 4096, 4096).unwrap(),
            InsertOutcome::Attached
        );
        // Only the parent goes upstream.
        assert_eq!(q.take_sendable(true), vec![(0, 65536)]);
        assert_eq!(q.take_sendable(true), Vec::new());
    }

    #[test]
    fn attached_entry_lands_after_parent() {
        let sink = Recorder::new();
        let mut q = RequestQueue::new();
        q.insert(Some(sink.clone()), 1, 0, 8192).unwrap();
        q.insert(Some(sink.clone()), 2, 1 << 20, 4096).unwrap();
        q.take_sendable(true);
        // Free slot 0, then attach to the entry at slot 1: must not
        // reuse slot 0.
        q.match_reply(0, 8192);
        let (h, ..) = q.take_for_dispatch(0);
        assert_eq!(h, 1);
        q.insert(Some(sink.clone()), 3, 1 << 20, 1024).unwrap();
        assert_eq!(q.slot(2).handle, 3);
        assert_eq!(q.status(0), SlotStatus::Free);
    }

    #[test]
    fn queue_overflows_at_capacity() {
        let sink = Recorder::new();
        let mut q = RequestQueue::new();
        for i in 0..QUEUE_CAPACITY as u64 {
            q.insert(Some(sink.clone()), i, i << 20, 4096).unwrap();
        }
        let err = q
            .insert(Some(sink.clone()), 999, 999 << 20, 4096)
            .unwrap_err();
        assert!(matches!(err, DnbdError::QueueFull));
    }

    #[test]
    fn switch_resends_pending_unchanged() {
        let sink = Recorder::new();
        let mut q = RequestQueue::new();
        for i in 0..5_u64 {
            q.insert(Some(sink.clone()), i, i << 20, 4096).unwrap();
        }
        assert_eq!(q.take_sendable(true).len(), 5);
        // All Pending now; a new-only pass sends nothing...
        assert_eq!(q.take_sendable(true).len(), 0);
        // ...but the post-switch full pass repeats all five ranges.
        let resent = q.take_sendable(false);
        assert_eq!(resent.len(), 5);
        assert_eq!(resent[3], (3 << 20, 4096));
    }

    #[test]
    fn match_only_covers_contained_ranges() {
        let sink = Recorder::new();
        let mut q = RequestQueue::new();
        q.insert(Some(sink.clone()), 1, 0, 4096).unwrap();
        q.insert(Some(sink.clone()), 2, 4096, 8192).unwrap();
        q.take_sendable(true);
        q.match_reply(0, 8192);
        assert_eq!(q.status(0), SlotStatus::Processing);
        // Entry 2 extends past the reply and stays pending.
        assert_eq!(q.status(1), SlotStatus::Pending);
    }

    #[test]
    fn fail_all_reports_owners_once() {
        let sink = Recorder::new();
        let mut q = RequestQueue::new();
        q.insert(Some(sink.clone()), 1, 0, 4096).unwrap();
        q.insert(None, 2, 4096, 4096).unwrap();
        let failed = q.fail_all();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, 1);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn tail_shrinks_only_past_threshold() {
        let sink = Recorder::new();
        let mut q = RequestQueue::new();
        for i in 0..24_u64 {
            q.insert(Some(sink.clone()), i, i << 20, 4096).unwrap();
        }
        q.take_sendable(true);
        q.match_reply(23 << 20, (23 << 20) + 4096);
        q.take_for_dispatch(23);
        q.shrink_tail(23);
        assert_eq!(q.len(), 23);
        // Below the threshold nothing shrinks.
        q.match_reply(0, 4096);
        q.take_for_dispatch(0);
        q.shrink_tail(0);
        assert_eq!(q.len(), 23);
    }
}
