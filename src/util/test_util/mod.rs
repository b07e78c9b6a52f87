//! Test support: the mock emission boundary and fixtures that lay out a
//! simulated thread block, log buffers and card table in mock memory.

mod mock;

pub use self::mock::*;

use crate::codegen::BarrierConfig;
use crate::policy::region::CardState;
use crate::runtime::MutatorThreadData;
use crate::util::constants::BYTES_IN_WORD;

/// Simulated addresses for the structures generated code touches. The
/// thread block uses the real [`MutatorThreadData`] field offsets, so these
/// tests also pin the emission contract to the actual struct layout.
pub struct BarrierFixture {
    pub config: BarrierConfig,
    pub thread_addr: u64,
    pub satb_buffer: u64,
    pub dirty_card_buffer: u64,
    pub capacity_words: usize,
    pub heap_start: u64,
    pub heap_end: u64,
    card_table: u64,
}

impl Default for BarrierFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl BarrierFixture {
    /// Geometry matching the barrier scenarios used throughout the tests:
    /// 4096-byte regions, 512-byte cards, a heap at `[0, 0x10_0000)` and
    /// four-entry log buffers.
    pub fn new() -> Self {
        let heap_start = 0u64;
        let heap_end = 0x10_0000u64;
        let card_table = 0x30_0000u64;
        let log_card_bytes = 9;
        let config = BarrierConfig {
            log_region_bytes: 12,
            log_card_bytes,
            // Biased base over a zero heap start is the table base itself.
            card_table_base: card_table - (heap_start >> log_card_bytes),
            young_card: CardState::Young as u8,
            dirty_card: CardState::Dirty as u8,
            compressed_refs: false,
            compressed_base_nonzero: false,
            thread: MutatorThreadData::layout(),
        };
        BarrierFixture {
            config,
            thread_addr: 0x10_0000,
            satb_buffer: 0x20_0000,
            dirty_card_buffer: 0x28_0000,
            capacity_words: 4,
            heap_start,
            heap_end,
            card_table,
        }
    }

    /// The same geometry with narrow reference encoding enabled.
    pub fn with_compressed_refs() -> Self {
        let mut fixture = Self::new();
        fixture.config.compressed_refs = true;
        fixture
    }

    /// Write the thread block, empty buffers and an all-clean card table
    /// into mock memory, and point the thread register at the block.
    pub fn install(&self, machine: &mut MockMachine) {
        let layout = &self.config.thread;
        let capacity_bytes = (self.capacity_words * BYTES_IN_WORD) as u64;
        machine.write_u8(self.thread_addr + layout.satb_active_offset as u64, 0);
        machine.write_u64(
            self.thread_addr + layout.satb_index_offset as u64,
            capacity_bytes,
        );
        machine.write_u64(
            self.thread_addr + layout.satb_buffer_offset as u64,
            self.satb_buffer,
        );
        machine.write_u64(
            self.thread_addr + layout.dirty_card_index_offset as u64,
            capacity_bytes,
        );
        machine.write_u64(
            self.thread_addr + layout.dirty_card_buffer_offset as u64,
            self.dirty_card_buffer,
        );
        let cards = (self.heap_end - self.heap_start) >> self.config.log_card_bytes;
        for i in 0..cards {
            machine.write_u8(self.card_table + i, CardState::Clean as u8);
        }
        machine.set_reg(THREAD, self.thread_addr);
    }

    pub fn set_marking_active(&self, machine: &mut MockMachine, active: bool) {
        machine.write_u8(
            self.thread_addr + self.config.thread.satb_active_offset as u64,
            active as u8,
        );
    }

    fn queue_index(&self, machine: &MockMachine, index_offset: i32) -> u64 {
        machine.read_u64(self.thread_addr + index_offset as u64)
    }

    fn queue_entries(&self, machine: &MockMachine, index_offset: i32, buffer: u64) -> Vec<u64> {
        let capacity_bytes = (self.capacity_words * BYTES_IN_WORD) as u64;
        let index = self.queue_index(machine, index_offset);
        assert!(index <= capacity_bytes && index % BYTES_IN_WORD as u64 == 0);
        (index..capacity_bytes)
            .step_by(BYTES_IN_WORD)
            .map(|offset| machine.read_u64(buffer + offset))
            .collect()
    }

    /// The SATB log contents, most recent entry first.
    pub fn satb_entries(&self, machine: &MockMachine) -> Vec<u64> {
        self.queue_entries(machine, self.config.thread.satb_index_offset, self.satb_buffer)
    }

    /// The dirty-card log contents, most recent entry first.
    pub fn dirty_card_entries(&self, machine: &MockMachine) -> Vec<u64> {
        self.queue_entries(
            machine,
            self.config.thread.dirty_card_index_offset,
            self.dirty_card_buffer,
        )
    }

    pub fn satb_index(&self, machine: &MockMachine) -> u64 {
        self.queue_index(machine, self.config.thread.satb_index_offset)
    }

    pub fn dirty_card_index(&self, machine: &MockMachine) -> u64 {
        self.queue_index(machine, self.config.thread.dirty_card_index_offset)
    }

    /// Force a queue's cursor, e.g. to zero to simulate a full buffer.
    pub fn set_satb_index(&self, machine: &mut MockMachine, index: u64) {
        machine.write_u64(
            self.thread_addr + self.config.thread.satb_index_offset as u64,
            index,
        );
    }

    pub fn set_dirty_card_index(&self, machine: &mut MockMachine, index: u64) {
        machine.write_u64(
            self.thread_addr + self.config.thread.dirty_card_index_offset as u64,
            index,
        );
    }

    /// The simulated address of the card byte covering `heap_addr`.
    pub fn card_byte_addr(&self, heap_addr: u64) -> u64 {
        self.config.card_table_base + (heap_addr >> self.config.log_card_bytes)
    }

    pub fn card_state(&self, machine: &MockMachine, heap_addr: u64) -> u8 {
        machine.read_u8(self.card_byte_addr(heap_addr))
    }

    pub fn set_card_state(&self, machine: &mut MockMachine, heap_addr: u64, state: CardState) {
        machine.write_u8(self.card_byte_addr(heap_addr), state as u8);
    }

    /// A handler that services the refill entries by resetting the
    /// corresponding queue cursor, like the real queue sets do.
    pub fn refill_handler(&self) -> RuntimeHandler {
        let thread_addr = self.thread_addr;
        let layout = self.config.thread;
        let capacity_bytes = (self.capacity_words * BYTES_IN_WORD) as u64;
        Box::new(move |machine, entry, _args| {
            use crate::isa::RuntimeEntry;
            match entry {
                RuntimeEntry::SatbRefill => {
                    machine.write_u64(thread_addr + layout.satb_index_offset as u64, capacity_bytes);
                }
                RuntimeEntry::DirtyCardRefill => {
                    machine.write_u64(
                        thread_addr + layout.dirty_card_index_offset as u64,
                        capacity_bytes,
                    );
                }
                _ => {}
            }
        })
    }
}
