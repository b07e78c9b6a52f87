//! Out-of-line slow-path stubs.
//!
//! Under [`SlowPathStrategy::SharedStub`] the barrier fast paths shrink to a
//! filtering test and a call; the remaining logic lives in stubs emitted
//! after the main code stream. A stub is keyed by its register assignment
//! and shared across call sites whose assignments match. Entering by call
//! and leaving by return is what makes the sharing sound, since the
//! continuation point travels with the caller.
//!
//! This module also provides the reusable refill stubs: restart loops that
//! insert into a log buffer and call the refill runtime entries when the
//! buffer is full, retrying until the insertion lands.

use super::{
    emit_marking_active_test, emit_queue_insertion, emit_stub_runtime_call, BarrierAssembler,
    BarrierConfig, SlowPathStrategy,
};
use crate::isa::{Emitter, RegOrOffset, RuntimeEntry};
use crate::util::constants::BYTES_IN_WORD;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
struct PreStubKey<R> {
    obj: Option<R>,
    field: RegOrOffset<R>,
    pre_val: R,
    tmp1: R,
    tmp2: R,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
struct PostStubKey<R> {
    card_base: R,
    card_index: R,
}

struct Stub<K, L> {
    key: K,
    entry: L,
    emitted: bool,
}

/// The stubs registered during one compilation, deduplicated by register
/// assignment.
pub struct StubPool<E: Emitter> {
    pre: Vec<Stub<PreStubKey<E::Reg>, E::Label>>,
    post: Vec<Stub<PostStubKey<E::Reg>, E::Label>>,
}

impl<E: Emitter> Default for StubPool<E> {
    fn default() -> Self {
        StubPool {
            pre: vec![],
            post: vec![],
        }
    }
}

impl<E: Emitter> StubPool<E> {
    /// The total number of stubs registered.
    pub fn len(&self) -> usize {
        self.pre.len() + self.post.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of stubs registered and not yet emitted.
    pub fn pending(&self) -> usize {
        self.pre.iter().filter(|s| !s.emitted).count()
            + self.post.iter().filter(|s| !s.emitted).count()
    }

    pub(crate) fn get_or_insert_pre(
        &mut self,
        masm: &mut E,
        obj: Option<E::Reg>,
        field: RegOrOffset<E::Reg>,
        pre_val: E::Reg,
        tmp1: E::Reg,
        tmp2: E::Reg,
    ) -> E::Label {
        let key = PreStubKey {
            obj,
            field,
            pre_val,
            tmp1,
            tmp2,
        };
        if let Some(stub) = self.pre.iter().find(|s| s.key == key) {
            debug!("sharing pre-write stub for {:?}", key);
            return stub.entry.clone();
        }
        let entry = masm.fresh_label();
        self.pre.push(Stub {
            key,
            entry: entry.clone(),
            emitted: false,
        });
        entry
    }

    pub(crate) fn get_or_insert_post(
        &mut self,
        masm: &mut E,
        card_base: E::Reg,
        card_index: E::Reg,
    ) -> E::Label {
        let key = PostStubKey {
            card_base,
            card_index,
        };
        if let Some(stub) = self.post.iter().find(|s| s.key == key) {
            debug!("sharing post-write stub for {:?}", key);
            return stub.entry.clone();
        }
        let entry = masm.fresh_label();
        self.post.push(Stub {
            key,
            entry: entry.clone(),
            emitted: false,
        });
        entry
    }
}

impl<'a, E: Emitter> BarrierAssembler<'a, E> {
    /// Materialize every pending stub. Call once after the main code stream
    /// is closed (the last instruction before the stubs must not fall
    /// through into them).
    pub fn emit_stubs(&mut self, masm: &mut E) {
        debug_assert!(
            self.strategy() == SlowPathStrategy::SharedStub || self.pending_stubs() == 0
        );
        let config = self.config();
        let stubs = self.stubs_mut();
        for stub in stubs.pre.iter_mut().filter(|s| !s.emitted) {
            emit_pre_stub_body(masm, config, &stub.key, &stub.entry);
            stub.emitted = true;
        }
        for stub in stubs.post.iter_mut().filter(|s| !s.emitted) {
            emit_post_stub_body(masm, config, &stub.key, &stub.entry);
            stub.emitted = true;
        }
    }

    /// Emit a reusable SATB refill stub: the insert-or-refill restart loop
    /// shared by call sites that keep the logged value in `pre_val`.
    /// Returns the stub entry; callers reach it with a call and get the
    /// insertion (or the refill round trip) before control returns.
    pub fn emit_satb_refill_stub(
        &self,
        masm: &mut E,
        pre_val: E::Reg,
        tmp1: E::Reg,
        tmp2: E::Reg,
    ) -> E::Label {
        debug_assert!(pre_val != tmp1 && pre_val != tmp2 && tmp1 != tmp2);
        let config = self.config();
        let thread = masm.thread_reg();

        let entry = masm.fresh_label();
        let restart = masm.fresh_label();
        let refill = masm.fresh_label();
        let done = masm.fresh_label();

        masm.bind(&entry);

        // Marking may have wound down since the caller's fast-path test.
        let active = emit_marking_active_test(masm, config);
        masm.branch_if_zero(active, &done);

        masm.bind(&restart);
        masm.load_word(tmp1, thread, config.thread.satb_index_offset);
        masm.branch_if_zero(tmp1, &refill);
        masm.load_word(tmp2, thread, config.thread.satb_buffer_offset);
        masm.add_imm(tmp1, tmp1, -(BYTES_IN_WORD as i64));
        masm.store_word(tmp1, thread, config.thread.satb_index_offset);
        masm.store_word_indexed(pre_val, tmp2, tmp1);

        masm.bind(&done);
        masm.ret();

        masm.bind(&refill);
        emit_stub_runtime_call(masm, RuntimeEntry::SatbRefill, &[thread]);
        masm.jump(&restart);

        entry
    }

    /// Emit a reusable dirty-card refill stub taking the raw store address
    /// in `store_addr`: recomputes the card, re-runs the young/dirty
    /// filters, dirties, and inserts with the refill restart loop.
    pub fn emit_dirty_card_refill_stub(
        &self,
        masm: &mut E,
        store_addr: E::Reg,
        tmp1: E::Reg,
        tmp2: E::Reg,
    ) -> E::Label {
        debug_assert!(store_addr != tmp1 && store_addr != tmp2 && tmp1 != tmp2);
        let config = self.config();
        let thread = masm.thread_reg();
        let scratch = masm.scratch_reg();

        let entry = masm.fresh_label();
        let restart = masm.fresh_label();
        let refill = masm.fresh_label();
        let done = masm.fresh_label();

        masm.bind(&entry);

        masm.shift_right_imm(tmp1, store_addr, config.log_card_bytes);
        masm.load_const(tmp2, config.card_table_base);
        masm.add(tmp1, tmp2, tmp1); // tmp1 := the card byte address

        masm.load_byte(scratch, tmp1, 0);
        masm.branch_if_eq_imm(scratch, config.young_card as u64, &done);

        // Must reload after the store-load fence: concurrent refinement.
        masm.membar_store_load();
        masm.load_byte(scratch, tmp1, 0);
        masm.branch_if_eq_imm(scratch, config.dirty_card as u64, &done);

        masm.load_const(scratch, config.dirty_card as u64);
        masm.store_byte(scratch, tmp1, 0);

        masm.bind(&restart);
        masm.load_word(tmp2, thread, config.thread.dirty_card_index_offset);
        masm.branch_if_zero(tmp2, &refill);
        masm.load_word(scratch, thread, config.thread.dirty_card_buffer_offset);
        masm.add_imm(tmp2, tmp2, -(BYTES_IN_WORD as i64));
        masm.store_word(tmp2, thread, config.thread.dirty_card_index_offset);
        masm.store_word_indexed(tmp1, scratch, tmp2);

        masm.bind(&done);
        masm.ret();

        masm.bind(&refill);
        emit_stub_runtime_call(masm, RuntimeEntry::DirtyCardRefill, &[thread]);
        masm.jump(&restart);

        entry
    }
}

fn emit_pre_stub_body<E: Emitter>(
    masm: &mut E,
    config: &BarrierConfig,
    key: &PreStubKey<E::Reg>,
    entry: &E::Label,
) {
    let thread = masm.thread_reg();
    let done = masm.fresh_label();
    let runtime = masm.fresh_label();

    masm.bind(entry);

    // Load the previous value unless the caller preloaded it.
    if let Some(obj) = key.obj {
        match (config.compressed_refs, key.field) {
            (true, RegOrOffset::Offset(offset)) => masm.load_narrow(key.pre_val, obj, offset),
            (true, RegOrOffset::Reg(index)) => masm.load_narrow_indexed(key.pre_val, obj, index),
            (false, RegOrOffset::Offset(offset)) => masm.load_word(key.pre_val, obj, offset),
            (false, RegOrOffset::Reg(index)) => masm.load_word_indexed(key.pre_val, obj, index),
        }
    }
    masm.branch_if_zero(key.pre_val, &done);

    // A value loaded above is still narrow; a preloaded one is already full
    // width. The log stores full-width references only.
    let logged = if key.obj.is_some() && config.compressed_refs {
        masm.decode_ref(key.tmp2, key.pre_val);
        key.tmp2
    } else {
        key.pre_val
    };

    emit_queue_insertion(
        masm,
        config.thread.satb_index_offset,
        config.thread.satb_buffer_offset,
        &runtime,
        logged,
        key.tmp1,
    );
    masm.jump(&done);

    masm.bind(&runtime);
    emit_stub_runtime_call(masm, RuntimeEntry::PreWrite, &[logged, thread]);

    masm.bind(&done);
    masm.ret();
}

fn emit_post_stub_body<E: Emitter>(
    masm: &mut E,
    config: &BarrierConfig,
    key: &PostStubKey<E::Reg>,
    entry: &E::Label,
) {
    let thread = masm.thread_reg();
    let scratch = masm.scratch_reg();
    let done = masm.fresh_label();
    let runtime = masm.fresh_label();

    masm.bind(entry);

    // The fast path stopped after the young test; re-check dirtiness under
    // the store-load fence, then dirty and enqueue.
    masm.membar_store_load();
    masm.load_byte_indexed(scratch, key.card_base, key.card_index);
    masm.branch_if_eq_imm(scratch, config.dirty_card as u64, &done);

    masm.load_const(scratch, config.dirty_card as u64);
    masm.store_byte_indexed(scratch, key.card_base, key.card_index);

    // The enqueued value is the card byte address; clobbers the base
    // register, which is dead in the caller past this point.
    masm.add(key.card_base, key.card_base, key.card_index);
    emit_queue_insertion(
        masm,
        config.thread.dirty_card_index_offset,
        config.thread.dirty_card_buffer_offset,
        &runtime,
        key.card_base,
        key.card_index,
    );
    masm.jump(&done);

    masm.bind(&runtime);
    emit_stub_runtime_call(masm, RuntimeEntry::PostWrite, &[key.card_base, thread]);

    masm.bind(&done);
    masm.ret();
}
