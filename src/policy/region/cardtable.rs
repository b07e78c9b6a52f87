use atomic::{Atomic, Ordering};

use super::card::CardState;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;

/// The card table: one byte per card for a contiguous heap range, read and
/// written by mutators through emitted barrier code and read by collector
/// refinement threads.
///
/// Single-byte stores are the only mutation. Races between mutators dirtying
/// the same card are benign; the idempotent "already dirty" re-check keeps the
/// refinement log free of duplicates in the common case, and a duplicate card
/// entry is harmless to refinement anyway.
pub struct CardTable {
    heap_start: Address,
    heap_end: Address,
    log_card_bytes: u8,
    table: Box<[Atomic<u8>]>,
}

impl CardTable {
    pub fn new(heap_start: Address, heap_end: Address, log_card_bytes: u8) -> Self {
        assert!(heap_end > heap_start, "empty heap range");
        assert!(
            heap_start.is_aligned_to(1 << log_card_bytes)
                && heap_end.is_aligned_to(1 << log_card_bytes),
            "heap range must be card aligned"
        );
        let cards = (heap_end - heap_start) >> log_card_bytes as usize;
        let mut table = Vec::with_capacity(cards);
        table.resize_with(cards, || Atomic::new(CardState::Clean as u8));
        CardTable {
            heap_start,
            heap_end,
            log_card_bytes,
            table: table.into_boxed_slice(),
        }
    }

    /// log2 of the card size in bytes.
    pub fn log_card_bytes(&self) -> u8 {
        self.log_card_bytes
    }

    /// The number of cards tracked by this table.
    pub fn num_cards(&self) -> usize {
        self.table.len()
    }

    fn index_of(&self, addr: Address) -> usize {
        debug_assert!(
            addr >= self.heap_start && addr < self.heap_end,
            "address {} outside the card-tracked heap [{}, {})",
            addr,
            self.heap_start,
            self.heap_end
        );
        (addr - self.heap_start) >> self.log_card_bytes as usize
    }

    /// The biased table base: the constant `B` such that the card byte for a
    /// heap address `a` lives at `B + (a >> log_card_bytes)`. Emitted barrier
    /// code materializes this constant and never performs the
    /// `a - heap_start` subtraction.
    ///
    /// The bias may wrap below zero for high heap bases; the wrapping
    /// arithmetic cancels out when the shifted address is added back.
    pub fn biased_base(&self) -> u64 {
        let table_base = self.table.as_ptr() as u64;
        table_base.wrapping_sub((self.heap_start >> self.log_card_bytes as usize) as u64)
    }

    /// The address of the card byte covering `addr`. This is the value the
    /// post-write barrier logs into the dirty-card queue.
    pub fn byte_for(&self, addr: Address) -> Address {
        Address::from_ptr(&self.table[self.index_of(addr)])
    }

    /// Read the state of the card covering `addr`.
    pub fn get_state(&self, addr: Address) -> CardState {
        CardState::from_byte(self.table[self.index_of(addr)].load(Ordering::Relaxed))
    }

    /// Set the state of the card covering `addr`.
    pub fn set_state(&self, addr: Address, state: CardState) {
        self.table[self.index_of(addr)].store(state as u8, Ordering::Relaxed);
    }

    /// Dirty the card covering `addr` unless it is young or already dirty.
    /// Returns the card byte address if the card was newly dirtied and should
    /// be enqueued for refinement.
    ///
    /// This mirrors the emitted post-write sequence: young test, store-load
    /// fence, dirty re-test, dirty store. The fence keeps a preceding
    /// reference store from being reordered past the reload on weakly ordered
    /// machines, so a refinement thread that observes the clean-to-dirty
    /// transition also observes the store that caused it.
    pub fn mark_dirty(&self, addr: Address) -> Option<Address> {
        let entry = &self.table[self.index_of(addr)];
        if entry.load(Ordering::Relaxed) == CardState::Young as u8 {
            return None;
        }
        std::sync::atomic::fence(Ordering::SeqCst);
        if entry.load(Ordering::Relaxed) == CardState::Dirty as u8 {
            return None;
        }
        entry.store(CardState::Dirty as u8, Ordering::Relaxed);
        Some(Address::from_ptr(entry))
    }

    /// Dirty every card covering `[start, start + count * BYTES_IN_WORD)`,
    /// returning the byte addresses of the cards that were newly dirtied.
    /// Used by the bulk array post-write entry point.
    pub fn mark_range_dirty(&self, start: Address, count: usize) -> Vec<Address> {
        let mut dirtied = vec![];
        let end = start + count * BYTES_IN_WORD;
        let mut cursor = start.align_down(1 << self.log_card_bytes);
        while cursor < end {
            if let Some(card) = self.mark_dirty(cursor) {
                dirtied.push(card);
            }
            cursor += 1usize << self.log_card_bytes;
        }
        dirtied
    }

    /// Reset every non-young card to clean. Refinement-side operation, used
    /// after a scan pass and by tests.
    pub fn clear_all(&self) {
        for entry in self.table.iter() {
            if entry.load(Ordering::Relaxed) != CardState::Young as u8 {
                entry.store(CardState::Clean as u8, Ordering::Relaxed);
            }
        }
    }
}
