//! The write-barrier code generator.
//!
//! Every routine here is an emission-time decision tree: it appends
//! instructions to an [`Emitter`] and returns. The generated sequences keep
//! two metadata structures current for the collector (the card table and
//! the per-thread SATB/dirty-card logs) without the mutator ever blocking.
//! The only slow operation in any generated path is the runtime call taken
//! when a log buffer fills, bounded in frequency by the buffer capacity.
//!
//! The slow path is materialized in one of two ways, selected by
//! [`SlowPathStrategy`]: a call sequence emitted inline at the branch
//! target, or a shared out-of-line stub reached by a call and returned from
//! with a `ret`. Both converge on the same [`RuntimeEntry`] points with the
//! same arguments; they differ only in code layout.

mod array;
mod post_write;
mod pre_write;
mod ref_access;
mod stub;

pub use self::stub::StubPool;

use crate::isa::{Emitter, RuntimeEntry};
use crate::policy::region::{CardState, LOG_BYTES_IN_REGION};
use crate::runtime::{BarrierRuntime, MutatorThreadData, ThreadLayout};
use crate::util::constants::BYTES_IN_WORD;

/// The number of low tag bits in an opaque handle value.
pub const HANDLE_TAG_BITS: u8 = 2;
/// The tag bit marking a handle as weak. Only weakly tagged handles get
/// pre-write treatment when resolved.
pub const WEAK_HANDLE_TAG: u64 = 0b1;

/// Emission-time configuration, read once when barriers are generated. None
/// of these values are runtime state; changing any of them requires
/// recompilation of the affected code.
#[derive(Copy, Clone, Debug)]
pub struct BarrierConfig {
    /// log2 of the region size in bytes. Power of two by construction.
    pub log_region_bytes: u8,
    /// log2 of the card size in bytes.
    pub log_card_bytes: u8,
    /// The biased card-table base: the card byte for address `a` lives at
    /// `card_table_base + (a >> log_card_bytes)`.
    pub card_table_base: u64,
    /// The byte value marking a young card.
    pub young_card: u8,
    /// The byte value marking a dirty card.
    pub dirty_card: u8,
    /// Are references stored in narrow (compressed) form?
    pub compressed_refs: bool,
    /// Does narrow-reference decoding add a non-zero base? Affects where
    /// the post-write barrier may place its null check: a narrow null would
    /// decode to the base address, so with a non-zero base the null check
    /// must precede the decode.
    pub compressed_base_nonzero: bool,
    /// Byte offsets of the per-thread queue fields.
    pub thread: ThreadLayout,
}

impl BarrierConfig {
    /// Build a configuration for a [`BarrierRuntime`] instance, with the
    /// crate's thread layout and default region geometry.
    pub fn for_runtime(runtime: &BarrierRuntime, compressed_refs: bool) -> Self {
        BarrierConfig {
            log_region_bytes: LOG_BYTES_IN_REGION,
            log_card_bytes: runtime.card_table().log_card_bytes(),
            card_table_base: runtime.card_table().biased_base(),
            young_card: CardState::Young as u8,
            dirty_card: CardState::Dirty as u8,
            compressed_refs,
            compressed_base_nonzero: false,
            thread: MutatorThreadData::layout(),
        }
    }

    fn validate(&self) {
        assert!(self.log_region_bytes < 64 && self.log_card_bytes < 64);
        assert!(
            self.log_card_bytes <= self.log_region_bytes,
            "cards cannot be larger than regions"
        );
        assert_ne!(self.young_card, self.dirty_card);
    }
}

/// Named attributes of a reference access, replacing a packed decorator
/// bitmask. Each field gates one emission decision.
#[derive(Copy, Clone, Debug, Default)]
pub struct AccessAttrs {
    /// The caller guarantees the value (old value for a preloaded pre-write
    /// barrier, new value for a post-write barrier) is non-null. The null
    /// filter is replaced by a debug-build trap.
    pub value_not_null: bool,
    /// The access targets an array element; the post-write barrier needs
    /// the precise element address, not the object base.
    pub is_array: bool,
    /// The field offset is not statically known (e.g. reflective access);
    /// addressed precisely, like an array element.
    pub unknown_offset: bool,
    /// The destination of a bulk array write is statically known to be
    /// uninitialized, so there are no old values to snapshot.
    pub dest_uninitialized: bool,
    /// The loaded field is a weak reference; its referent must be logged on
    /// load so concurrent marking sees it.
    pub weak_ref: bool,
    /// The loaded field is a phantom reference; treated like weak for
    /// logging purposes.
    pub phantom_ref: bool,
}

/// How much caller state an embedded runtime call must save and restore: a
/// caller-selectable trade-off between emission size and call-site
/// simplicity. Levels are cumulative.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PreservationLevel {
    /// The call site tolerates clobbered volatile state.
    None,
    /// Save the link state and push an ABI frame.
    FrameLink,
    /// Additionally save the caller-saved general-purpose registers.
    FrameLinkGpRegs,
    /// Additionally save the caller-saved floating-point registers.
    FrameLinkGpFpRegs,
}

impl PreservationLevel {
    pub fn needs_frame(self) -> bool {
        self >= PreservationLevel::FrameLink
    }

    pub fn preserve_gp(self) -> bool {
        self >= PreservationLevel::FrameLinkGpRegs
    }

    pub fn preserve_fp(self) -> bool {
        self >= PreservationLevel::FrameLinkGpFpRegs
    }
}

/// Slow-path materialization strategy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlowPathStrategy {
    /// Emit the runtime call sequence inline at the slow-path branch
    /// target, saving state per the caller's [`PreservationLevel`].
    InlineCall,
    /// Emit only the cheapest filtering test inline and reach the remaining
    /// slow-path logic through a shared, deduplicated out-of-line stub.
    /// Smaller fast paths at the cost of an extra branch. Stubs manage
    /// their own register preservation, so callers pass
    /// [`PreservationLevel::None`].
    SharedStub,
}

/// The barrier code generator: emission-time configuration plus the pool of
/// out-of-line stubs accumulated for the current compilation.
///
/// Typical use: construct one per compilation unit, call the barrier and
/// access-composition methods while emitting the method body, then call
/// [`BarrierAssembler::emit_stubs`] once the main code stream is closed.
pub struct BarrierAssembler<'a, E: Emitter> {
    config: &'a BarrierConfig,
    strategy: SlowPathStrategy,
    stubs: StubPool<E>,
}

impl<'a, E: Emitter> BarrierAssembler<'a, E> {
    pub fn new(config: &'a BarrierConfig, strategy: SlowPathStrategy) -> Self {
        config.validate();
        BarrierAssembler {
            config,
            strategy,
            stubs: StubPool::default(),
        }
    }

    pub fn config(&self) -> &'a BarrierConfig {
        self.config
    }

    pub fn strategy(&self) -> SlowPathStrategy {
        self.strategy
    }

    /// The number of out-of-line stubs registered and not yet emitted.
    pub fn pending_stubs(&self) -> usize {
        self.stubs.pending()
    }

    pub(crate) fn stubs_mut(&mut self) -> &mut StubPool<E> {
        &mut self.stubs
    }
}

/// Load the thread's SATB active byte into the scratch register and return
/// it; the caller branches on zero to skip the barrier.
pub(crate) fn emit_marking_active_test<E: Emitter>(masm: &mut E, config: &BarrierConfig) -> E::Reg {
    let scratch = masm.scratch_reg();
    masm.load_byte(scratch, masm.thread_reg(), config.thread.satb_active_offset);
    scratch
}

/// The shared queue-insertion sequence (both logs use it): branch to
/// `slow_path` if the buffer is full, otherwise decrement the index by one
/// word and store `value` at the new offset. The buffer fills from the high
/// end toward zero. No atomics: only the owning thread pushes.
///
/// Clobbers `tmp` and the scratch register.
pub(crate) fn emit_queue_insertion<E: Emitter>(
    masm: &mut E,
    index_offset: i32,
    buffer_offset: i32,
    slow_path: &E::Label,
    value: E::Reg,
    tmp: E::Reg,
) {
    debug_assert!(value != tmp && value != masm.scratch_reg());
    let thread = masm.thread_reg();
    let scratch = masm.scratch_reg();
    masm.load_word(tmp, thread, index_offset); // tmp := *(index address)
    masm.branch_if_zero(tmp, slow_path); // full buffer
    masm.load_word(scratch, thread, buffer_offset); // scratch := buffer address
    masm.add_imm(tmp, tmp, -(BYTES_IN_WORD as i64)); // tmp := next index
    masm.store_word(tmp, thread, index_offset); // *(index address) := next index
    masm.store_word_indexed(value, scratch, tmp); // *(buffer + next index) := value
}

/// Wrap `call` in the preservation measures the level requests: volatile
/// register save (gp, optionally fp), link save and an ABI frame.
pub(crate) fn emit_preserved_runtime_call<E: Emitter>(
    masm: &mut E,
    preservation: PreservationLevel,
    call: impl FnOnce(&mut E),
) {
    let needs_frame = preservation.needs_frame();
    let preserve_gp = preservation.preserve_gp();
    let preserve_fp = preservation.preserve_fp();
    if needs_frame {
        if preserve_gp {
            masm.save_volatile_regs(preserve_fp);
        }
        masm.save_link();
        masm.push_frame();
    }
    call(masm);
    if needs_frame {
        masm.pop_frame();
        masm.restore_link();
        if preserve_gp {
            masm.restore_volatile_regs(preserve_fp);
        }
    }
}

/// The frame-and-volatile sequence stub-local runtime calls use: stubs own
/// their preservation contract instead of taking a caller level.
pub(crate) fn emit_stub_runtime_call<E: Emitter>(
    masm: &mut E,
    entry: RuntimeEntry,
    args: &[E::Reg],
) {
    masm.save_volatile_regs(false);
    masm.save_link();
    masm.push_frame();
    masm.call_runtime(entry, args);
    masm.pop_frame();
    masm.restore_link();
    masm.restore_volatile_regs(false);
}
