//! Post-write (card marking) barrier emission.
//!
//! Emitted after every reference store: if the store created a pointer from
//! one region into another, the source card is dirtied and its address
//! logged for the collector's refinement pass. Each test in the sequence is
//! a possible early exit; the common case filters out before touching the
//! card table.

use super::{
    emit_queue_insertion, AccessAttrs, BarrierAssembler, PreservationLevel, SlowPathStrategy,
};
use crate::isa::{Emitter, RuntimeEntry};

impl<'a, E: Emitter> BarrierAssembler<'a, E> {
    /// Emit the post-write barrier.
    ///
    /// Arguments:
    /// * `store_addr`: the address stored to (precise for array/unknown
    ///   accesses, the object base otherwise).
    /// * `new_val`: the stored value. With `decode_new_val`, a narrow value
    ///   that must be decoded before the region-crossing test.
    /// * `tmp1`, `tmp2`, `tmp3`: scratch registers; `tmp3` ends up holding
    ///   the card address handed to the slow path.
    /// * `preservation`: must be [`PreservationLevel::None`]; the post
    ///   barrier does not support higher levels and a caller requesting one
    ///   is in violation of its contract.
    #[allow(clippy::too_many_arguments)]
    pub fn post_write_barrier(
        &mut self,
        masm: &mut E,
        attrs: AccessAttrs,
        store_addr: E::Reg,
        new_val: E::Reg,
        tmp1: E::Reg,
        tmp2: E::Reg,
        tmp3: E::Reg,
        preservation: PreservationLevel,
        decode_new_val: bool,
    ) {
        debug_assert!(store_addr != new_val && store_addr != tmp1 && store_addr != tmp2);
        debug_assert!(new_val != tmp1 && tmp1 != tmp2 && tmp3 != tmp1 && tmp3 != tmp2);
        debug_assert!(store_addr != masm.scratch_reg() && new_val != masm.scratch_reg());
        debug_assert!(
            preservation == PreservationLevel::None,
            "post-write barrier does not support preservation levels above None"
        );
        debug_assert!(!decode_new_val || self.config().compressed_refs);
        match self.strategy() {
            SlowPathStrategy::InlineCall => self.post_write_inline(
                masm, attrs, store_addr, new_val, tmp1, tmp2, tmp3, decode_new_val,
            ),
            SlowPathStrategy::SharedStub => self.post_write_with_stub(
                masm, attrs, store_addr, new_val, tmp1, tmp2, decode_new_val,
            ),
        }
    }

    /// Emit the filtering tests shared by both strategies, up to the card
    /// byte load. On fall-through, `tmp1` holds the biased table base and
    /// `tmp2` the card index; the scratch register holds the card byte, not
    /// yet compared against "young".
    #[allow(clippy::too_many_arguments)]
    fn post_write_filters(
        &self,
        masm: &mut E,
        attrs: AccessAttrs,
        store_addr: E::Reg,
        new_val: E::Reg,
        tmp1: E::Reg,
        tmp2: E::Reg,
        decode_new_val: bool,
        filtered: &E::Label,
    ) {
        let config = self.config();
        let scratch = masm.scratch_reg();

        // With a non-zero decode base, a narrow null would decode to the
        // base address and slip past the later null check, so check before
        // decoding. With a zero base we prefer the check after the region
        // test, where most stores have already filtered out.
        let mut null_checked = false;
        let mut new_val = new_val;
        if decode_new_val {
            if !attrs.value_not_null && config.compressed_base_nonzero {
                masm.branch_if_zero(new_val, filtered);
                null_checked = true;
            }
            masm.decode_ref(tmp2, new_val);
            new_val = tmp2;
        }

        // Does the store cross regions? The XOR also collapses to "same
        // region" for some null stores, which is why the explicit null
        // check below must stay.
        masm.xor(scratch, store_addr, new_val);
        masm.shift_right_imm(scratch, scratch, config.log_region_bytes);
        masm.branch_if_zero(scratch, filtered);

        // Crosses regions; storing null?
        if attrs.value_not_null {
            // Checked by the caller; trap in debug builds only.
            if cfg!(debug_assertions) {
                masm.emit_assert_nonzero(new_val, "null value not allowed (post-write)");
            }
        } else if !null_checked {
            masm.branch_if_zero(new_val, filtered);
        }

        // Card lookup. Young cards are never refined through this path.
        masm.load_const(tmp1, config.card_table_base);
        masm.shift_right_imm(tmp2, store_addr, config.log_card_bytes);
        masm.load_byte_indexed(scratch, tmp1, tmp2);
    }

    #[allow(clippy::too_many_arguments)]
    fn post_write_inline(
        &self,
        masm: &mut E,
        attrs: AccessAttrs,
        store_addr: E::Reg,
        new_val: E::Reg,
        tmp1: E::Reg,
        tmp2: E::Reg,
        tmp3: E::Reg,
        decode_new_val: bool,
    ) {
        let config = self.config();
        let thread = masm.thread_reg();
        let scratch = masm.scratch_reg();

        let filtered = masm.fresh_label();
        let runtime = masm.fresh_label();

        self.post_write_filters(
            masm, attrs, store_addr, new_val, tmp1, tmp2, decode_new_val, &filtered,
        );
        masm.branch_if_eq_imm(scratch, config.young_card as u64, &filtered);

        // Re-check under a store-load fence: the preceding reference store
        // must not be reorderable past this reload, or concurrent
        // refinement could miss it.
        masm.membar_store_load();
        masm.load_byte_indexed(scratch, tmp1, tmp2);
        masm.branch_if_eq_imm(scratch, config.dirty_card as u64, &filtered);

        // Not dirty. Dirty it, then enqueue the card address.
        masm.load_const(scratch, config.dirty_card as u64);
        masm.store_byte_indexed(scratch, tmp1, tmp2);

        masm.add(tmp3, tmp1, tmp2); // tmp3 := the card address to enqueue
        emit_queue_insertion(
            masm,
            config.thread.dirty_card_index_offset,
            config.thread.dirty_card_buffer_offset,
            &runtime,
            tmp3,
            tmp1,
        );
        masm.jump(&filtered);

        masm.bind(&runtime);
        masm.call_runtime(RuntimeEntry::PostWrite, &[tmp3, thread]);
        masm.bind(&filtered);
    }

    /// The stub-tier fast path: filters through the card-young test inline,
    /// with the fence, dirtying and enqueueing out of line. The stub
    /// contract fixes `tmp1` as the biased table base and `tmp2` as the
    /// card index.
    #[allow(clippy::too_many_arguments)]
    fn post_write_with_stub(
        &mut self,
        masm: &mut E,
        attrs: AccessAttrs,
        store_addr: E::Reg,
        new_val: E::Reg,
        tmp1: E::Reg,
        tmp2: E::Reg,
        decode_new_val: bool,
    ) {
        let young_card = self.config().young_card;
        let done = masm.fresh_label();
        self.post_write_filters(
            masm, attrs, store_addr, new_val, tmp1, tmp2, decode_new_val, &done,
        );
        masm.branch_if_eq_imm(masm.scratch_reg(), young_card as u64, &done);
        let stub = self.stubs_mut().get_or_insert_post(masm, tmp1, tmp2);
        masm.call_label(&stub);
        masm.bind(&done);
    }
}
