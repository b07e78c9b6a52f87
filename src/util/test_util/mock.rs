//! A mock implementation of the instruction-emission boundary.
//!
//! [`MockEmitter`] records emitted instructions for a small virtual ISA and
//! [`MockMachine`] executes them against simulated registers and
//! byte-addressed memory, so the behavior of generated barrier sequences is
//! testable without a real assembler. Runtime calls are recorded (and
//! optionally handled by a test-installed hook); caller-saved registers can
//! be clobbered across calls to exercise preservation contracts.

use std::collections::HashMap;
use std::fmt;

use enum_map::EnumMap;

use crate::isa::{Emitter, RegOrOffset, RuntimeEntry};

/// The number of registers in the mock ISA.
pub const NUM_REGS: usize = 32;
/// Registers below this bound are caller-saved.
const NUM_CALLER_SAVED: u8 = 16;
/// The pinned thread register.
pub const THREAD: MockReg = MockReg(29);
/// The emission scratch register.
pub const SCRATCH: MockReg = MockReg(31);

/// A mock register name.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct MockReg(pub u8);

impl fmt::Debug for MockReg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A label in a mock instruction stream. Resolved when the stream runs.
#[derive(Clone, Debug)]
pub struct MockLabel(usize);

/// One mock instruction. Branch targets are label ids into the emitter's
/// label table.
#[derive(Clone, Debug)]
pub enum Inst {
    LoadWord { dst: MockReg, base: MockReg, offset: i32 },
    LoadWordIndexed { dst: MockReg, base: MockReg, index: MockReg },
    LoadNarrow { dst: MockReg, base: MockReg, offset: i32 },
    LoadNarrowIndexed { dst: MockReg, base: MockReg, index: MockReg },
    LoadByte { dst: MockReg, base: MockReg, offset: i32 },
    LoadByteIndexed { dst: MockReg, base: MockReg, index: MockReg },
    StoreWord { src: MockReg, base: MockReg, offset: i32 },
    StoreWordIndexed { src: MockReg, base: MockReg, index: MockReg },
    StoreByte { src: MockReg, base: MockReg, offset: i32 },
    StoreByteIndexed { src: MockReg, base: MockReg, index: MockReg },
    LoadRef { dst: MockReg, base: MockReg, field: RegOrOffset<MockReg>, narrow: bool },
    StoreRef { val: Option<MockReg>, base: MockReg, field: RegOrOffset<MockReg>, narrow: bool },
    DecodeRef { dst: MockReg, src: MockReg },
    LoadConst { dst: MockReg, value: u64 },
    MoveReg { dst: MockReg, src: MockReg },
    Add { dst: MockReg, a: MockReg, b: MockReg },
    AddImm { dst: MockReg, src: MockReg, imm: i64 },
    Xor { dst: MockReg, a: MockReg, b: MockReg },
    ShrImm { dst: MockReg, src: MockReg, shift: u8 },
    AndImm { dst: MockReg, src: MockReg, imm: u64 },
    ClearLowBits { dst: MockReg, src: MockReg, bits: u8 },
    Jump { target: usize },
    BranchZero { reg: MockReg, target: usize },
    BranchEqImm { reg: MockReg, imm: u64, target: usize },
    CallLabel { target: usize },
    Ret,
    CallRuntime { entry: RuntimeEntry, args: Vec<MockReg> },
    MembarStoreLoad,
    SaveLink,
    RestoreLink,
    PushFrame,
    PopFrame,
    SaveVolatile { include_fp: bool },
    RestoreVolatile { include_fp: bool },
    SaveRegs { regs: Vec<MockReg> },
    RestoreRegs { regs: Vec<MockReg> },
    AssertNonZero { reg: MockReg, msg: &'static str },
}

/// Records instructions emitted through the [`Emitter`] trait.
pub struct MockEmitter {
    compressed_refs: bool,
    insts: Vec<Inst>,
    labels: Vec<Option<usize>>,
}

impl Default for MockEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEmitter {
    /// An emitter for a full-width-reference target.
    pub fn new() -> Self {
        MockEmitter {
            compressed_refs: false,
            insts: vec![],
            labels: vec![],
        }
    }

    /// An emitter whose plain reference accesses use narrow encoding.
    pub fn with_compressed_refs() -> Self {
        MockEmitter {
            compressed_refs: true,
            ..Self::new()
        }
    }

    /// The instructions emitted so far.
    pub fn insts(&self) -> &[Inst] {
        &self.insts
    }

    /// The number of instructions emitted so far.
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// Count instructions matching a predicate, e.g. to assert fast-path
    /// size or fence placement.
    pub fn count_matching(&self, pred: impl Fn(&Inst) -> bool) -> usize {
        self.insts.iter().filter(|i| pred(i)).count()
    }

    fn label_target(&self, id: usize) -> usize {
        self.labels[id].expect("branch to an unbound label")
    }

    fn push(&mut self, inst: Inst) {
        self.insts.push(inst);
    }
}

impl Emitter for MockEmitter {
    type Reg = MockReg;
    type Label = MockLabel;

    fn fresh_label(&mut self) -> MockLabel {
        self.labels.push(None);
        MockLabel(self.labels.len() - 1)
    }

    fn bind(&mut self, label: &MockLabel) {
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.insts.len());
    }

    fn jump(&mut self, target: &MockLabel) {
        self.push(Inst::Jump { target: target.0 });
    }

    fn branch_if_zero(&mut self, reg: MockReg, target: &MockLabel) {
        self.push(Inst::BranchZero { reg, target: target.0 });
    }

    fn branch_if_eq_imm(&mut self, reg: MockReg, imm: u64, target: &MockLabel) {
        self.push(Inst::BranchEqImm { reg, imm, target: target.0 });
    }

    fn call_label(&mut self, target: &MockLabel) {
        self.push(Inst::CallLabel { target: target.0 });
    }

    fn ret(&mut self) {
        self.push(Inst::Ret);
    }

    fn load_word(&mut self, dst: MockReg, base: MockReg, offset: i32) {
        self.push(Inst::LoadWord { dst, base, offset });
    }

    fn load_word_indexed(&mut self, dst: MockReg, base: MockReg, index: MockReg) {
        self.push(Inst::LoadWordIndexed { dst, base, index });
    }

    fn load_narrow(&mut self, dst: MockReg, base: MockReg, offset: i32) {
        self.push(Inst::LoadNarrow { dst, base, offset });
    }

    fn load_narrow_indexed(&mut self, dst: MockReg, base: MockReg, index: MockReg) {
        self.push(Inst::LoadNarrowIndexed { dst, base, index });
    }

    fn load_byte(&mut self, dst: MockReg, base: MockReg, offset: i32) {
        self.push(Inst::LoadByte { dst, base, offset });
    }

    fn load_byte_indexed(&mut self, dst: MockReg, base: MockReg, index: MockReg) {
        self.push(Inst::LoadByteIndexed { dst, base, index });
    }

    fn store_word(&mut self, src: MockReg, base: MockReg, offset: i32) {
        self.push(Inst::StoreWord { src, base, offset });
    }

    fn store_word_indexed(&mut self, src: MockReg, base: MockReg, index: MockReg) {
        self.push(Inst::StoreWordIndexed { src, base, index });
    }

    fn store_byte(&mut self, src: MockReg, base: MockReg, offset: i32) {
        self.push(Inst::StoreByte { src, base, offset });
    }

    fn store_byte_indexed(&mut self, src: MockReg, base: MockReg, index: MockReg) {
        self.push(Inst::StoreByteIndexed { src, base, index });
    }

    fn store_ref(&mut self, val: Option<MockReg>, base: MockReg, field: RegOrOffset<MockReg>) {
        let narrow = self.compressed_refs;
        self.push(Inst::StoreRef { val, base, field, narrow });
    }

    fn load_ref(&mut self, dst: MockReg, base: MockReg, field: RegOrOffset<MockReg>) {
        let narrow = self.compressed_refs;
        self.push(Inst::LoadRef { dst, base, field, narrow });
    }

    fn decode_ref(&mut self, dst: MockReg, src: MockReg) {
        self.push(Inst::DecodeRef { dst, src });
    }

    fn load_const(&mut self, dst: MockReg, value: u64) {
        self.push(Inst::LoadConst { dst, value });
    }

    fn move_reg(&mut self, dst: MockReg, src: MockReg) {
        self.push(Inst::MoveReg { dst, src });
    }

    fn add(&mut self, dst: MockReg, a: MockReg, b: MockReg) {
        self.push(Inst::Add { dst, a, b });
    }

    fn add_imm(&mut self, dst: MockReg, src: MockReg, imm: i64) {
        self.push(Inst::AddImm { dst, src, imm });
    }

    fn xor(&mut self, dst: MockReg, a: MockReg, b: MockReg) {
        self.push(Inst::Xor { dst, a, b });
    }

    fn shift_right_imm(&mut self, dst: MockReg, src: MockReg, shift: u8) {
        self.push(Inst::ShrImm { dst, src, shift });
    }

    fn and_imm(&mut self, dst: MockReg, src: MockReg, imm: u64) {
        self.push(Inst::AndImm { dst, src, imm });
    }

    fn clear_low_bits(&mut self, dst: MockReg, src: MockReg, bits: u8) {
        self.push(Inst::ClearLowBits { dst, src, bits });
    }

    fn membar_store_load(&mut self) {
        self.push(Inst::MembarStoreLoad);
    }

    fn save_link(&mut self) {
        self.push(Inst::SaveLink);
    }

    fn restore_link(&mut self) {
        self.push(Inst::RestoreLink);
    }

    fn push_frame(&mut self) {
        self.push(Inst::PushFrame);
    }

    fn pop_frame(&mut self) {
        self.push(Inst::PopFrame);
    }

    fn save_volatile_regs(&mut self, include_fp: bool) {
        self.push(Inst::SaveVolatile { include_fp });
    }

    fn restore_volatile_regs(&mut self, include_fp: bool) {
        self.push(Inst::RestoreVolatile { include_fp });
    }

    fn save_regs(&mut self, regs: &[MockReg]) {
        self.push(Inst::SaveRegs { regs: regs.to_vec() });
    }

    fn restore_regs(&mut self, regs: &[MockReg]) {
        self.push(Inst::RestoreRegs { regs: regs.to_vec() });
    }

    fn call_runtime(&mut self, entry: RuntimeEntry, args: &[MockReg]) {
        self.push(Inst::CallRuntime { entry, args: args.to_vec() });
    }

    fn thread_reg(&self) -> MockReg {
        THREAD
    }

    fn scratch_reg(&self) -> MockReg {
        SCRATCH
    }

    fn is_caller_saved(&self, reg: MockReg) -> bool {
        reg.0 < NUM_CALLER_SAVED
    }

    fn emit_assert_nonzero(&mut self, reg: MockReg, msg: &'static str) {
        self.push(Inst::AssertNonZero { reg, msg });
    }
}

/// A test hook invoked on every executed runtime call.
pub type RuntimeHandler = Box<dyn FnMut(&mut MockMachine, RuntimeEntry, &[u64])>;

/// Executes mock instruction streams against simulated registers and
/// byte-addressed memory. Unwritten memory reads as zero.
pub struct MockMachine {
    pub regs: [u64; NUM_REGS],
    mem: HashMap<u64, u8>,
    /// Every runtime call executed, in order, with its argument values.
    pub calls: Vec<(RuntimeEntry, Vec<u64>)>,
    /// Per-entry call counts.
    pub call_counts: EnumMap<RuntimeEntry, usize>,
    /// The number of store-load fences executed.
    pub fence_count: usize,
    /// When set, runtime calls overwrite every caller-saved register with a
    /// poison value, exercising preservation contracts.
    pub clobber_on_call: bool,
    /// Narrow-reference decode parameters: full = base + (narrow << shift).
    pub compressed_base: u64,
    pub compressed_shift: u8,
    handler: Option<RuntimeHandler>,
    call_stack: Vec<usize>,
    volatile_stack: Vec<(Vec<u64>, bool)>,
    reg_save_stack: Vec<Vec<(MockReg, u64)>>,
    link_depth: usize,
    frame_depth: usize,
}

impl Default for MockMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMachine {
    pub fn new() -> Self {
        MockMachine {
            regs: [0; NUM_REGS],
            mem: HashMap::new(),
            calls: vec![],
            call_counts: EnumMap::default(),
            fence_count: 0,
            clobber_on_call: false,
            compressed_base: 0,
            compressed_shift: 0,
            handler: None,
            call_stack: vec![],
            volatile_stack: vec![],
            reg_save_stack: vec![],
            link_depth: 0,
            frame_depth: 0,
        }
    }

    /// Install a hook that runs on every runtime call, after recording.
    pub fn set_runtime_handler(&mut self, handler: RuntimeHandler) {
        self.handler = Some(handler);
    }

    pub fn reg(&self, reg: MockReg) -> u64 {
        self.regs[reg.0 as usize]
    }

    pub fn set_reg(&mut self, reg: MockReg, value: u64) {
        self.regs[reg.0 as usize] = value;
    }

    pub fn read_u8(&self, addr: u64) -> u8 {
        *self.mem.get(&addr).unwrap_or(&0)
    }

    pub fn write_u8(&mut self, addr: u64, value: u8) {
        self.mem.insert(addr, value);
    }

    pub fn read_u32(&self, addr: u64) -> u32 {
        let mut value = 0u32;
        for i in 0..4 {
            value |= (self.read_u8(addr + i) as u32) << (8 * i);
        }
        value
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        for i in 0..4 {
            self.write_u8(addr + i, (value >> (8 * i)) as u8);
        }
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        let mut value = 0u64;
        for i in 0..8 {
            value |= (self.read_u8(addr + i) as u64) << (8 * i);
        }
        value
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        for i in 0..8 {
            self.write_u8(addr + i, (value >> (8 * i)) as u8);
        }
    }

    fn decode(&self, narrow: u64) -> u64 {
        if narrow == 0 {
            0
        } else {
            self.compressed_base + (narrow << self.compressed_shift)
        }
    }

    fn encode(&self, full: u64) -> u32 {
        if full == 0 {
            return 0;
        }
        let narrow = (full - self.compressed_base) >> self.compressed_shift;
        debug_assert_eq!(self.decode(narrow), full, "value not encodable");
        narrow as u32
    }

    fn field_addr(&self, base: MockReg, field: RegOrOffset<MockReg>) -> u64 {
        match field {
            RegOrOffset::Offset(offset) => self.reg(base).wrapping_add(offset as i64 as u64),
            RegOrOffset::Reg(index) => self.reg(base).wrapping_add(self.reg(index)),
        }
    }

    /// Execute from the first instruction until the stream halts.
    pub fn run(&mut self, emitter: &MockEmitter) {
        self.run_at(emitter, 0);
    }

    /// Execute from a bound label until the stream halts (e.g. to drive a
    /// stub directly).
    pub fn run_from(&mut self, emitter: &MockEmitter, label: &MockLabel) {
        self.run_at(emitter, emitter.label_target(label.0));
    }

    fn run_at(&mut self, emitter: &MockEmitter, start: usize) {
        let mut pc = start;
        let mut steps = 0usize;
        loop {
            if pc >= emitter.insts.len() {
                break;
            }
            steps += 1;
            assert!(steps < 1_000_000, "mock program did not halt");
            let inst = emitter.insts[pc].clone();
            pc += 1;
            match inst {
                Inst::LoadWord { dst, base, offset } => {
                    let addr = self.reg(base).wrapping_add(offset as i64 as u64);
                    self.regs[dst.0 as usize] = self.read_u64(addr);
                }
                Inst::LoadWordIndexed { dst, base, index } => {
                    let addr = self.reg(base).wrapping_add(self.reg(index));
                    self.regs[dst.0 as usize] = self.read_u64(addr);
                }
                Inst::LoadNarrow { dst, base, offset } => {
                    let addr = self.reg(base).wrapping_add(offset as i64 as u64);
                    self.regs[dst.0 as usize] = self.read_u32(addr) as u64;
                }
                Inst::LoadNarrowIndexed { dst, base, index } => {
                    let addr = self.reg(base).wrapping_add(self.reg(index));
                    self.regs[dst.0 as usize] = self.read_u32(addr) as u64;
                }
                Inst::LoadByte { dst, base, offset } => {
                    let addr = self.reg(base).wrapping_add(offset as i64 as u64);
                    self.regs[dst.0 as usize] = self.read_u8(addr) as u64;
                }
                Inst::LoadByteIndexed { dst, base, index } => {
                    let addr = self.reg(base).wrapping_add(self.reg(index));
                    self.regs[dst.0 as usize] = self.read_u8(addr) as u64;
                }
                Inst::StoreWord { src, base, offset } => {
                    let addr = self.reg(base).wrapping_add(offset as i64 as u64);
                    self.write_u64(addr, self.reg(src));
                }
                Inst::StoreWordIndexed { src, base, index } => {
                    let addr = self.reg(base).wrapping_add(self.reg(index));
                    self.write_u64(addr, self.reg(src));
                }
                Inst::StoreByte { src, base, offset } => {
                    let addr = self.reg(base).wrapping_add(offset as i64 as u64);
                    self.write_u8(addr, self.reg(src) as u8);
                }
                Inst::StoreByteIndexed { src, base, index } => {
                    let addr = self.reg(base).wrapping_add(self.reg(index));
                    self.write_u8(addr, self.reg(src) as u8);
                }
                Inst::LoadRef { dst, base, field, narrow } => {
                    let addr = self.field_addr(base, field);
                    self.regs[dst.0 as usize] = if narrow {
                        self.decode(self.read_u32(addr) as u64)
                    } else {
                        self.read_u64(addr)
                    };
                }
                Inst::StoreRef { val, base, field, narrow } => {
                    let addr = self.field_addr(base, field);
                    let value = val.map(|r| self.reg(r)).unwrap_or(0);
                    if narrow {
                        self.write_u32(addr, self.encode(value));
                    } else {
                        self.write_u64(addr, value);
                    }
                }
                Inst::DecodeRef { dst, src } => {
                    let narrow = self.reg(src);
                    self.regs[dst.0 as usize] =
                        self.compressed_base + (narrow << self.compressed_shift);
                }
                Inst::LoadConst { dst, value } => self.regs[dst.0 as usize] = value,
                Inst::MoveReg { dst, src } => self.regs[dst.0 as usize] = self.reg(src),
                Inst::Add { dst, a, b } => {
                    self.regs[dst.0 as usize] = self.reg(a).wrapping_add(self.reg(b))
                }
                Inst::AddImm { dst, src, imm } => {
                    self.regs[dst.0 as usize] = self.reg(src).wrapping_add(imm as u64)
                }
                Inst::Xor { dst, a, b } => {
                    self.regs[dst.0 as usize] = self.reg(a) ^ self.reg(b)
                }
                Inst::ShrImm { dst, src, shift } => {
                    self.regs[dst.0 as usize] = self.reg(src) >> shift
                }
                Inst::AndImm { dst, src, imm } => {
                    self.regs[dst.0 as usize] = self.reg(src) & imm
                }
                Inst::ClearLowBits { dst, src, bits } => {
                    self.regs[dst.0 as usize] = self.reg(src) & !((1u64 << bits) - 1)
                }
                Inst::Jump { target } => pc = emitter.label_target(target),
                Inst::BranchZero { reg, target } => {
                    if self.reg(reg) == 0 {
                        pc = emitter.label_target(target);
                    }
                }
                Inst::BranchEqImm { reg, imm, target } => {
                    if self.reg(reg) == imm {
                        pc = emitter.label_target(target);
                    }
                }
                Inst::CallLabel { target } => {
                    self.call_stack.push(pc);
                    pc = emitter.label_target(target);
                }
                Inst::Ret => match self.call_stack.pop() {
                    Some(ret) => pc = ret,
                    None => break,
                },
                Inst::CallRuntime { entry, args } => {
                    let values: Vec<u64> = args.iter().map(|r| self.reg(*r)).collect();
                    trace!(
                        "mock runtime call {}({:x?})",
                        <&'static str>::from(entry),
                        values
                    );
                    self.calls.push((entry, values.clone()));
                    self.call_counts[entry] += 1;
                    if let Some(mut handler) = self.handler.take() {
                        handler(self, entry, &values);
                        self.handler = Some(handler);
                    }
                    if self.clobber_on_call {
                        for i in 0..NUM_CALLER_SAVED {
                            self.regs[i as usize] = 0xDEAD_0000 + i as u64;
                        }
                    }
                }
                Inst::MembarStoreLoad => self.fence_count += 1,
                Inst::SaveLink => self.link_depth += 1,
                Inst::RestoreLink => {
                    assert!(self.link_depth > 0, "unbalanced link restore");
                    self.link_depth -= 1;
                }
                Inst::PushFrame => self.frame_depth += 1,
                Inst::PopFrame => {
                    assert!(self.frame_depth > 0, "unbalanced frame pop");
                    self.frame_depth -= 1;
                }
                Inst::SaveVolatile { include_fp } => {
                    let snapshot = self.regs[..NUM_CALLER_SAVED as usize].to_vec();
                    self.volatile_stack.push((snapshot, include_fp));
                }
                Inst::RestoreVolatile { include_fp } => {
                    let (snapshot, saved_fp) =
                        self.volatile_stack.pop().expect("unbalanced volatile restore");
                    assert_eq!(saved_fp, include_fp, "mismatched volatile save/restore");
                    self.regs[..NUM_CALLER_SAVED as usize].copy_from_slice(&snapshot);
                }
                Inst::SaveRegs { regs } => {
                    let saved = regs.iter().map(|r| (*r, self.reg(*r))).collect();
                    self.reg_save_stack.push(saved);
                }
                Inst::RestoreRegs { regs } => {
                    let saved = self.reg_save_stack.pop().expect("unbalanced register restore");
                    assert_eq!(
                        saved.iter().map(|(r, _)| *r).collect::<Vec<_>>(),
                        regs,
                        "mismatched register save/restore sets"
                    );
                    for (reg, value) in saved {
                        self.regs[reg.0 as usize] = value;
                    }
                }
                Inst::AssertNonZero { reg, msg } => {
                    if self.reg(reg) == 0 {
                        panic!("{}", msg);
                    }
                }
            }
        }
        assert_eq!(self.frame_depth, 0, "halted with a frame still pushed");
        assert_eq!(self.link_depth, 0, "halted with link state still saved");
        assert!(self.volatile_stack.is_empty(), "halted with saved volatiles");
        assert!(self.reg_save_stack.is_empty(), "halted with saved registers");
        assert!(self.call_stack.is_empty(), "halted inside a stub call");
    }
}
