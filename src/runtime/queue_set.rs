use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::thread::PointerQueue;

/// The collector-side half of a per-thread log: full buffers are handed off
/// here and handed back out as fresh buffers. Two instances exist, one for
/// the SATB log and one for the dirty-card log.
///
/// Hand-off is lock free; the mutator's only slow operation is the refill
/// call that lands here, bounded in frequency by the buffer capacity.
pub struct QueueSet {
    name: &'static str,
    capacity_words: usize,
    completed: SegQueue<Vec<usize>>,
    completed_entries: AtomicUsize,
}

impl QueueSet {
    pub fn new(name: &'static str, capacity_words: usize) -> Self {
        QueueSet {
            name,
            capacity_words,
            completed: SegQueue::new(),
            completed_entries: AtomicUsize::new(0),
        }
    }

    /// The capacity, in words, of buffers this set hands out.
    pub fn capacity_words(&self) -> usize {
        self.capacity_words
    }

    /// Allocate a fresh thread-local queue for this set.
    pub fn allocate_queue(&self) -> PointerQueue {
        PointerQueue::new(self.capacity_words)
    }

    /// The "handle zero index" operation: take the thread's filled entries
    /// into the completed list and leave the thread with an empty buffer, so
    /// the caller's retry succeeds. Called from the generated slow paths
    /// (via the refill runtime entries) when `index == 0`.
    pub fn handle_zero_index(&self, queue: &mut PointerQueue) {
        debug_assert!(queue.is_full(), "refill requested on a non-full buffer");
        self.retire(queue);
    }

    /// Push `value`, retiring the buffer first if it is full. This is the
    /// runtime-entry equivalent of the emitted insertion sequence.
    pub fn enqueue(&self, queue: &mut PointerQueue, value: usize) {
        if !queue.try_push(value) {
            self.handle_zero_index(queue);
            let pushed = queue.try_push(value);
            debug_assert!(pushed, "push must succeed after refill");
        }
    }

    /// Hand any buffered entries to the collector, regardless of fill level.
    /// Used when a thread detaches or at a marking handshake.
    pub fn flush(&self, queue: &mut PointerQueue) {
        if queue.filled_words() > 0 {
            self.retire(queue);
        }
    }

    fn retire(&self, queue: &mut PointerQueue) {
        let entries = queue.drain();
        trace!(
            "{}: retiring buffer with {} entries",
            self.name,
            entries.len()
        );
        self.completed_entries.fetch_add(entries.len(), Ordering::Relaxed);
        self.completed.push(entries);
    }

    /// Pop one completed buffer, if any. Collector-side.
    pub fn pop_completed(&self) -> Option<Vec<usize>> {
        let buffer = self.completed.pop();
        if let Some(ref b) = buffer {
            self.completed_entries.fetch_sub(b.len(), Ordering::Relaxed);
        }
        buffer
    }

    /// The number of completed buffers awaiting the collector.
    pub fn completed_buffers(&self) -> usize {
        self.completed.len()
    }

    /// The total number of entries across completed buffers.
    pub fn completed_entries(&self) -> usize {
        self.completed_entries.load(Ordering::Relaxed)
    }
}
