use atomic::{Atomic, Ordering};
use memoffset::offset_of;

use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;

/// Default capacity, in words, of each barrier log buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 256;

// The emitted marking-active test loads exactly one byte.
assert_eq_size!(Atomic<u8>, u8);

/// A thread-local log buffer with a descending index cursor.
///
/// `index` counts bytes remaining: it starts at the buffer capacity and each
/// push decrements it by one word and writes at `buffer + index`, so the
/// buffer fills from the high end toward zero and `index == 0` means full.
/// This is exactly the layout the emitted queue-insertion sequence
/// manipulates, so the struct is `repr(C)` and its field offsets are part of
/// the code-generation contract (see [`ThreadLayout`]).
///
/// Only the owning thread pushes. The collector drains and resets out of
/// band, under a handshake outside this crate's scope.
#[repr(C)]
pub struct PointerQueue {
    index: usize,
    buffer: *mut usize,
    // Not read by emitted code; kept after the fields the generated
    // sequences address so their offsets stay compact.
    capacity_bytes: usize,
}

// The buffer pointer is only dereferenced by the owning thread; moving the
// queue between threads moves ownership of the buffer with it.
unsafe impl Send for PointerQueue {}

impl PointerQueue {
    pub fn new(capacity_words: usize) -> Self {
        assert!(capacity_words > 0, "queue buffer cannot be empty");
        let buffer = vec![0usize; capacity_words].into_boxed_slice();
        let capacity_bytes = capacity_words * BYTES_IN_WORD;
        PointerQueue {
            index: capacity_bytes,
            buffer: Box::into_raw(buffer) as *mut usize,
            capacity_bytes,
        }
    }

    /// The buffer capacity in bytes.
    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// The buffer capacity in words.
    pub fn capacity_words(&self) -> usize {
        self.capacity_bytes / BYTES_IN_WORD
    }

    /// The current index cursor (bytes remaining).
    pub fn index(&self) -> usize {
        self.index
    }

    /// The buffer base address.
    pub fn buffer_base(&self) -> Address {
        Address::from_mut_ptr(self.buffer)
    }

    /// Is the buffer full (`index == 0`)?
    pub fn is_full(&self) -> bool {
        self.index == 0
    }

    /// The number of entries currently in the buffer.
    pub fn filled_words(&self) -> usize {
        (self.capacity_bytes - self.index) / BYTES_IN_WORD
    }

    fn check_invariants(&self) {
        #[cfg(feature = "extreme_assertions")]
        {
            assert!(self.index <= self.capacity_bytes, "index out of range");
            assert!(self.index % BYTES_IN_WORD == 0, "index not word aligned");
        }
    }

    /// Attempt the lock-free push the emitted fast path performs: fail if
    /// full, otherwise decrement the index and store at the new offset.
    pub fn try_push(&mut self, value: usize) -> bool {
        self.check_invariants();
        if self.index == 0 {
            return false;
        }
        self.index -= BYTES_IN_WORD;
        unsafe {
            *self.slot(self.index) = value;
        }
        true
    }

    /// Remove and return every entry, leaving the buffer empty.
    /// Entries are returned most-recently-pushed first (ascending offsets).
    pub fn drain(&mut self) -> Vec<usize> {
        self.check_invariants();
        let filled = self.filled_words();
        let mut entries = Vec::with_capacity(filled);
        for i in 0..filled {
            entries.push(unsafe { *self.slot(self.index + i * BYTES_IN_WORD) });
        }
        self.index = self.capacity_bytes;
        entries
    }

    /// Reset the cursor, discarding any entries.
    pub fn reset(&mut self) {
        self.index = self.capacity_bytes;
    }

    fn slot(&self, byte_offset: usize) -> *mut usize {
        debug_assert!(byte_offset < self.capacity_bytes);
        (self.buffer as usize + byte_offset) as *mut usize
    }
}

impl Drop for PointerQueue {
    fn drop(&mut self) {
        let words = self.capacity_words();
        unsafe {
            drop(Box::from_raw(std::slice::from_raw_parts_mut(
                self.buffer,
                words,
            )));
        }
    }
}

/// The per-thread barrier state the generated code addresses through the
/// pinned thread register: the SATB active flag, the SATB log and the
/// dirty-card log.
///
/// `repr(C)` because emitted code reads and writes these fields at fixed
/// byte offsets; [`MutatorThreadData::layout`] is the single source of those
/// offsets.
#[repr(C)]
pub struct MutatorThreadData {
    // One byte, tested by the emitted marking-active predicate. Written by
    // collector threads at marking phase changes, read by the owning thread
    // with a plain load.
    satb_active: Atomic<u8>,
    satb: PointerQueue,
    dirty_card: PointerQueue,
}

/// Byte offsets of the per-thread fields the barrier generator addresses:
/// the SATB active byte and the two queues' `{index, buffer}` pairs. Part of
/// [`crate::codegen::BarrierConfig`]; derived from the real struct layout,
/// never written out by hand.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ThreadLayout {
    pub satb_active_offset: i32,
    pub satb_index_offset: i32,
    pub satb_buffer_offset: i32,
    pub dirty_card_index_offset: i32,
    pub dirty_card_buffer_offset: i32,
}

impl MutatorThreadData {
    pub fn new(satb_capacity_words: usize, dirty_card_capacity_words: usize) -> Self {
        MutatorThreadData {
            satb_active: Atomic::new(0),
            satb: PointerQueue::new(satb_capacity_words),
            dirty_card: PointerQueue::new(dirty_card_capacity_words),
        }
    }

    /// The field offsets of this struct, for emission-time configuration.
    pub fn layout() -> ThreadLayout {
        let satb = offset_of!(MutatorThreadData, satb);
        let dirty_card = offset_of!(MutatorThreadData, dirty_card);
        let index = offset_of!(PointerQueue, index);
        let buffer = offset_of!(PointerQueue, buffer);
        ThreadLayout {
            satb_active_offset: offset_of!(MutatorThreadData, satb_active) as i32,
            satb_index_offset: (satb + index) as i32,
            satb_buffer_offset: (satb + buffer) as i32,
            dirty_card_index_offset: (dirty_card + index) as i32,
            dirty_card_buffer_offset: (dirty_card + buffer) as i32,
        }
    }

    /// The address emitted code expects in the thread register.
    pub fn base_address(&self) -> Address {
        Address::from_ref(self)
    }

    /// Is the SATB barrier active for this thread?
    pub fn satb_active(&self) -> bool {
        self.satb_active.load(Ordering::Relaxed) != 0
    }

    /// Set the SATB active flag. Called at marking phase transitions, under
    /// whatever handshake the collector uses to reach the thread.
    pub fn set_satb_active(&self, active: bool) {
        self.satb_active.store(active as u8, Ordering::Relaxed);
    }

    pub fn satb(&self) -> &PointerQueue {
        &self.satb
    }

    pub fn satb_mut(&mut self) -> &mut PointerQueue {
        &mut self.satb
    }

    pub fn dirty_card(&self) -> &PointerQueue {
        &self.dirty_card
    }

    pub fn dirty_card_mut(&mut self) -> &mut PointerQueue {
        &mut self.dirty_card
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_fills_from_the_high_end() {
        let mut q = PointerQueue::new(4);
        assert_eq!(q.index(), 4 * BYTES_IN_WORD);
        assert!(q.try_push(0x10));
        assert_eq!(q.index(), 3 * BYTES_IN_WORD);
        assert!(q.try_push(0x20));
        assert!(q.try_push(0x30));
        assert!(q.try_push(0x40));
        assert!(q.is_full());
        assert!(!q.try_push(0x50));
        // The failed push must not move the cursor.
        assert_eq!(q.index(), 0);
        assert_eq!(q.drain(), vec![0x40, 0x30, 0x20, 0x10]);
        assert_eq!(q.index(), 4 * BYTES_IN_WORD);
    }

    #[test]
    fn drain_partial_buffer() {
        let mut q = PointerQueue::new(8);
        q.try_push(1);
        q.try_push(2);
        assert_eq!(q.filled_words(), 2);
        assert_eq!(q.drain(), vec![2, 1]);
        assert_eq!(q.filled_words(), 0);
    }

    #[test]
    fn layout_offsets_match_the_struct() {
        let thread = MutatorThreadData::new(4, 4);
        let layout = MutatorThreadData::layout();
        let base = thread.base_address();

        thread.set_satb_active(true);
        let active =
            unsafe { (base + layout.satb_active_offset as isize).load::<u8>() };
        assert_eq!(active, 1);

        let index =
            unsafe { (base + layout.satb_index_offset as isize).load::<usize>() };
        assert_eq!(index, thread.satb().index());

        let buffer =
            unsafe { (base + layout.satb_buffer_offset as isize).load::<usize>() };
        assert_eq!(buffer, thread.satb().buffer_base().as_usize());

        let dc_index =
            unsafe { (base + layout.dirty_card_index_offset as isize).load::<usize>() };
        assert_eq!(dc_index, thread.dirty_card().index());
    }

    #[test]
    fn raw_field_mutation_is_visible() {
        // Emitted code updates the index field directly in memory; the typed
        // accessors must observe it.
        let mut thread = MutatorThreadData::new(4, 4);
        let layout = MutatorThreadData::layout();
        let base = Address::from_mut_ptr(&mut thread as *mut MutatorThreadData);
        let index_addr = base + layout.satb_index_offset as isize;

        let index = unsafe { index_addr.load::<usize>() };
        unsafe { index_addr.store(index - BYTES_IN_WORD) };
        assert_eq!(thread.satb().filled_words(), 1);
        thread.satb_mut().reset();
        assert_eq!(thread.satb().filled_words(), 0);
    }
}
