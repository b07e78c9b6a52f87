use std::fmt::Debug;

/// The runtime entry points the generated slow paths call into. An
/// [`Emitter`] maps each discriminant to a concrete call target; the barrier
/// generator never deals in raw code addresses.
///
/// Both slow-path materialization strategies converge on these entries with
/// identical argument conventions.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    enum_map::Enum,
    strum_macros::EnumCount,
    strum_macros::IntoStaticStr,
)]
pub enum RuntimeEntry {
    /// `pre_write_entry(value, thread)`: log an overwritten reference when
    /// the thread's SATB buffer is full.
    PreWrite,
    /// `post_write_entry(card_address, thread)`: log a dirtied card when the
    /// thread's dirty-card buffer is full.
    PostWrite,
    /// `array_pre_write_entry(dest, count)`: bulk pre-write logging for
    /// reference-array stores.
    ArrayPreWrite,
    /// `array_post_write_entry(dest, count)`: bulk card dirtying for
    /// reference-array stores.
    ArrayPostWrite,
    /// `satb_refill(thread)`: hand the thread's full SATB buffer to the
    /// collector and install a fresh one.
    SatbRefill,
    /// `dirty_card_refill(thread)`: likewise for the dirty-card buffer.
    DirtyCardRefill,
}

/// A field position that is either a statically known byte offset or an index
/// held in a register, for addressing modes where the exact offset is not
/// known at emission time (array elements, unknown-field accesses).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegOrOffset<R> {
    /// The byte offset is in a register.
    Reg(R),
    /// The byte offset is an emission-time constant.
    Offset(i32),
}

impl<R> RegOrOffset<R> {
    /// Is this a statically known offset?
    pub fn is_const(&self) -> bool {
        matches!(self, RegOrOffset::Offset(_))
    }
}

/// The instruction-emission primitives the barrier generator relies on.
///
/// Implementations append instructions to the current code buffer; every
/// method is an emission-time operation with no runtime effect of its own.
/// The trait deliberately exposes a fused compare-and-branch style rather
/// than condition codes, so it maps onto both flag-based and
/// compare-register ISAs.
///
/// Register discipline: the generator only touches the registers it is
/// handed, plus [`Emitter::scratch_reg`], which the target must reserve for
/// emission helpers (the analog of a fixed assembler temp). The thread
/// register is pinned and never clobbered.
pub trait Emitter {
    /// The target's register name type.
    type Reg: Copy + PartialEq + Eq + Debug;
    /// A code label. Labels may be branched to before they are bound.
    type Label: Clone;

    // --- Labels and control flow ---

    /// Create a fresh, unbound label.
    fn fresh_label(&mut self) -> Self::Label;
    /// Bind `label` to the current code position.
    fn bind(&mut self, label: &Self::Label);
    /// Unconditional branch.
    fn jump(&mut self, target: &Self::Label);
    /// Branch if `reg` is zero.
    fn branch_if_zero(&mut self, reg: Self::Reg, target: &Self::Label);
    /// Branch if `reg` equals the immediate.
    fn branch_if_eq_imm(&mut self, reg: Self::Reg, imm: u64, target: &Self::Label);
    /// Call a stub bound at `target`; the stub returns with [`Emitter::ret`].
    fn call_label(&mut self, target: &Self::Label);
    /// Return from a stub entered via [`Emitter::call_label`].
    fn ret(&mut self);

    // --- Loads and stores ---

    /// Load a word from `base + offset`.
    fn load_word(&mut self, dst: Self::Reg, base: Self::Reg, offset: i32);
    /// Load a word from `base + index`.
    fn load_word_indexed(&mut self, dst: Self::Reg, base: Self::Reg, index: Self::Reg);
    /// Load a zero-extended narrow (compressed-reference width) value from
    /// `base + offset`.
    fn load_narrow(&mut self, dst: Self::Reg, base: Self::Reg, offset: i32);
    /// Load a zero-extended narrow value from `base + index`.
    fn load_narrow_indexed(&mut self, dst: Self::Reg, base: Self::Reg, index: Self::Reg);
    /// Load a zero-extended byte from `base + offset`.
    fn load_byte(&mut self, dst: Self::Reg, base: Self::Reg, offset: i32);
    /// Load a zero-extended byte from `base + index`.
    fn load_byte_indexed(&mut self, dst: Self::Reg, base: Self::Reg, index: Self::Reg);
    /// Store a word to `base + offset`.
    fn store_word(&mut self, src: Self::Reg, base: Self::Reg, offset: i32);
    /// Store a word to `base + index`.
    fn store_word_indexed(&mut self, src: Self::Reg, base: Self::Reg, index: Self::Reg);
    /// Store the low byte of `src` to `base + offset`.
    fn store_byte(&mut self, src: Self::Reg, base: Self::Reg, offset: i32);
    /// Store the low byte of `src` to `base + index`.
    fn store_byte_indexed(&mut self, src: Self::Reg, base: Self::Reg, index: Self::Reg);

    // --- Reference-typed accesses (the host's plain access emission) ---

    /// Emit the host's plain reference store of `val` (or a null constant)
    /// to `base + field`, including any compressed-reference encoding. This
    /// is the raw store the barriers wrap; it performs no barrier work.
    fn store_ref(&mut self, val: Option<Self::Reg>, base: Self::Reg, field: RegOrOffset<Self::Reg>);
    /// Emit the host's plain reference load from `base + field` into `dst`,
    /// including any compressed-reference decoding.
    fn load_ref(&mut self, dst: Self::Reg, base: Self::Reg, field: RegOrOffset<Self::Reg>);
    /// Decode a narrow reference in `src` to full width in `dst`. The value
    /// must be known non-null (a narrow null need not decode to a full null).
    fn decode_ref(&mut self, dst: Self::Reg, src: Self::Reg);

    // --- Arithmetic ---

    /// Materialize a constant.
    fn load_const(&mut self, dst: Self::Reg, value: u64);
    /// Register move.
    fn move_reg(&mut self, dst: Self::Reg, src: Self::Reg);
    /// `dst = a + b`.
    fn add(&mut self, dst: Self::Reg, a: Self::Reg, b: Self::Reg);
    /// `dst = src + imm` (imm may be negative).
    fn add_imm(&mut self, dst: Self::Reg, src: Self::Reg, imm: i64);
    /// `dst = a ^ b`.
    fn xor(&mut self, dst: Self::Reg, a: Self::Reg, b: Self::Reg);
    /// `dst = src >> shift` (logical).
    fn shift_right_imm(&mut self, dst: Self::Reg, src: Self::Reg, shift: u8);
    /// `dst = src & imm`.
    fn and_imm(&mut self, dst: Self::Reg, src: Self::Reg, imm: u64);
    /// `dst = src` with the low `bits` bits cleared (handle untagging).
    fn clear_low_bits(&mut self, dst: Self::Reg, src: Self::Reg, bits: u8);

    // --- Fences ---

    /// A store-load fence. Emitted between the card-dirty store-side check
    /// and its reload so a dirtying store cannot hide in the store buffer
    /// from concurrent refinement.
    fn membar_store_load(&mut self);

    // --- Frames, preservation and calls ---

    /// Save the link/return-address state clobbered by calls. A no-op on
    /// targets without a link register.
    fn save_link(&mut self);
    /// Restore the state saved by [`Emitter::save_link`].
    fn restore_link(&mut self);
    /// Push an ABI-compatible frame for an embedded runtime call.
    fn push_frame(&mut self);
    /// Pop the frame pushed by [`Emitter::push_frame`].
    fn pop_frame(&mut self);
    /// Save the target's caller-saved register set (optionally including
    /// floating-point registers).
    fn save_volatile_regs(&mut self, include_fp: bool);
    /// Restore the set saved by [`Emitter::save_volatile_regs`].
    fn restore_volatile_regs(&mut self, include_fp: bool);
    /// Save an explicit register set across a call.
    fn save_regs(&mut self, regs: &[Self::Reg]);
    /// Restore the set saved by the matching [`Emitter::save_regs`].
    fn restore_regs(&mut self, regs: &[Self::Reg]);
    /// Call a runtime entry point with the given argument registers.
    fn call_runtime(&mut self, entry: RuntimeEntry, args: &[Self::Reg]);

    // --- Environment ---

    /// The pinned register holding the current thread pointer.
    fn thread_reg(&self) -> Self::Reg;
    /// The emission scratch register reserved for the generator's helpers.
    /// Never one of the registers callers pass in.
    fn scratch_reg(&self) -> Self::Reg;
    /// Is `reg` in the target's caller-saved (volatile) set?
    fn is_caller_saved(&self, reg: Self::Reg) -> bool;

    // --- Debug-build support ---

    /// Emit a trap that halts execution with `msg` if `reg` is zero. Only
    /// emitted by debug builds of the generator, for caller-contract checks.
    fn emit_assert_nonzero(&mut self, reg: Self::Reg, msg: &'static str);
}
