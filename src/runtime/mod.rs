//! The runtime half of the barrier scheme: per-thread log buffers, the
//! global queue sets, the card table, and the entry points the generated
//! slow paths call.
//!
//! Everything here is steady-state machinery. "Failure" paths (buffer full,
//! card already dirty, marking inactive, null value) are expected branches,
//! not errors; nothing in this module returns a `Result`.

pub mod queue_set;
pub mod thread;

pub use self::queue_set::QueueSet;
pub use self::thread::{MutatorThreadData, PointerQueue, ThreadLayout, DEFAULT_BUFFER_CAPACITY};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::policy::region::{CardTable, LOG_BYTES_IN_CARD};
use crate::util::Address;

/// The process-wide barrier runtime: the card table and the two queue sets,
/// plus the global marking flag that thread-local SATB active flags mirror.
pub struct BarrierRuntime {
    satb_set: QueueSet,
    dirty_card_set: QueueSet,
    card_table: CardTable,
    marking_active: AtomicBool,
}

impl BarrierRuntime {
    /// Create a runtime covering `[heap_start, heap_end)` with default card
    /// geometry and buffer capacity.
    pub fn new(heap_start: Address, heap_end: Address) -> Self {
        Self::with_geometry(heap_start, heap_end, LOG_BYTES_IN_CARD, DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_geometry(
        heap_start: Address,
        heap_end: Address,
        log_card_bytes: u8,
        buffer_capacity_words: usize,
    ) -> Self {
        BarrierRuntime {
            satb_set: QueueSet::new("satb", buffer_capacity_words),
            dirty_card_set: QueueSet::new("dirty-card", buffer_capacity_words),
            card_table: CardTable::new(heap_start, heap_end, log_card_bytes),
            marking_active: AtomicBool::new(false),
        }
    }

    pub fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    pub fn satb_set(&self) -> &QueueSet {
        &self.satb_set
    }

    pub fn dirty_card_set(&self) -> &QueueSet {
        &self.dirty_card_set
    }

    /// Is concurrent marking active?
    pub fn marking_active(&self) -> bool {
        self.marking_active.load(Ordering::Relaxed)
    }

    /// Record a marking phase change. Threads observe it when the collector
    /// reaches them with [`BarrierRuntime::on_marking_phase_change`]; that
    /// handshake is outside this crate's scope.
    pub fn set_marking_active(&self, active: bool) {
        self.marking_active.store(active, Ordering::SeqCst);
    }

    /// Create the barrier state for a newly attached mutator thread.
    pub fn create_thread(&self) -> MutatorThreadData {
        let thread = MutatorThreadData::new(
            self.satb_set.capacity_words(),
            self.dirty_card_set.capacity_words(),
        );
        thread.set_satb_active(self.marking_active());
        thread
    }

    /// Propagate the global marking flag to one thread, flushing its SATB
    /// buffer when the barrier deactivates.
    pub fn on_marking_phase_change(&self, thread: &mut MutatorThreadData) {
        let active = self.marking_active();
        if !active {
            self.satb_set.flush(thread.satb_mut());
        }
        thread.set_satb_active(active);
    }

    /// Hand all of a thread's buffered entries to the collector, e.g. when
    /// the thread detaches.
    pub fn flush_thread(&self, thread: &mut MutatorThreadData) {
        self.satb_set.flush(thread.satb_mut());
        self.dirty_card_set.flush(thread.dirty_card_mut());
    }

    // --- Runtime entry points (the targets of `RuntimeEntry`) ---

    /// `RuntimeEntry::PreWrite`: log an overwritten reference value. Called
    /// by generated code only when marking is active, the value is non-null
    /// and the thread's SATB buffer is full.
    pub fn pre_write_entry(&self, thread: &mut MutatorThreadData, value: Address) {
        debug_assert!(!value.is_zero(), "null values are filtered by the barrier");
        self.satb_set.enqueue(thread.satb_mut(), value.as_usize());
    }

    /// `RuntimeEntry::PostWrite`: log a card byte address. Called by
    /// generated code only after it has dirtied the card and found the
    /// thread's dirty-card buffer full.
    pub fn post_write_entry(&self, thread: &mut MutatorThreadData, card_addr: Address) {
        self.dirty_card_set
            .enqueue(thread.dirty_card_mut(), card_addr.as_usize());
    }

    /// `RuntimeEntry::ArrayPreWrite`: log every non-null old value in
    /// `count` reference slots starting at `dest`. The generated caller has
    /// already established that marking is active and the destination is
    /// initialized.
    ///
    /// # Safety
    /// `dest` must point to `count` readable, word-aligned reference slots.
    pub unsafe fn array_pre_write_entry(
        &self,
        thread: &mut MutatorThreadData,
        dest: Address,
        count: usize,
    ) {
        debug_assert!(thread.satb_active(), "bulk pre-write with marking inactive");
        for i in 0..count {
            let old = (dest + i * crate::util::constants::BYTES_IN_WORD).load::<usize>();
            if old != 0 {
                self.satb_set.enqueue(thread.satb_mut(), old);
            }
        }
    }

    /// `RuntimeEntry::ArrayPostWrite`: dirty and log every card covering
    /// `count` reference slots starting at `dest`.
    pub fn array_post_write_entry(
        &self,
        thread: &mut MutatorThreadData,
        dest: Address,
        count: usize,
    ) {
        for card in self.card_table.mark_range_dirty(dest, count) {
            self.dirty_card_set
                .enqueue(thread.dirty_card_mut(), card.as_usize());
        }
    }

    /// `RuntimeEntry::SatbRefill`: retire the thread's full SATB buffer so
    /// the generated restart loop can push.
    pub fn satb_refill(&self, thread: &mut MutatorThreadData) {
        self.satb_set.handle_zero_index(thread.satb_mut());
    }

    /// `RuntimeEntry::DirtyCardRefill`: likewise for the dirty-card buffer.
    pub fn dirty_card_refill(&self, thread: &mut MutatorThreadData) {
        self.dirty_card_set.handle_zero_index(thread.dirty_card_mut());
    }
}

lazy_static! {
    static ref GLOBAL: RwLock<Option<Arc<BarrierRuntime>>> = RwLock::new(None);
}

/// Install the process-wide barrier runtime. Panics on double
/// initialization; a host embeds exactly one collector.
pub fn initialize(heap_start: Address, heap_end: Address) -> Arc<BarrierRuntime> {
    // Make sure logging is initialized even if the host never did so.
    let _ = crate::util::logger::try_init();
    let mut global = GLOBAL.write().unwrap();
    assert!(global.is_none(), "barrier runtime already initialized");
    let runtime = Arc::new(BarrierRuntime::new(heap_start, heap_end));
    *global = Some(runtime.clone());
    runtime
}

/// The process-wide barrier runtime. Panics if [`initialize`] has not run.
pub fn global() -> Arc<BarrierRuntime> {
    GLOBAL
        .read()
        .unwrap()
        .clone()
        .expect("barrier runtime not initialized")
}

/// Free-function forms of the entry points, in the argument order the
/// generated calls use. A host wires its emitter's `RuntimeEntry` mapping to
/// these (or to the methods on its own [`BarrierRuntime`] instance).
pub fn pre_write_entry(value: Address, thread: &mut MutatorThreadData) {
    global().pre_write_entry(thread, value);
}

pub fn post_write_entry(card_addr: Address, thread: &mut MutatorThreadData) {
    global().post_write_entry(thread, card_addr);
}

/// # Safety
/// See [`BarrierRuntime::array_pre_write_entry`].
pub unsafe fn array_pre_write_entry(
    dest: Address,
    count: usize,
    thread: &mut MutatorThreadData,
) {
    global().array_pre_write_entry(thread, dest, count);
}

pub fn array_post_write_entry(dest: Address, count: usize, thread: &mut MutatorThreadData) {
    global().array_post_write_entry(thread, dest, count);
}

pub fn satb_refill(thread: &mut MutatorThreadData) {
    global().satb_refill(thread);
}

pub fn dirty_card_refill(thread: &mut MutatorThreadData) {
    global().dirty_card_refill(thread);
}
