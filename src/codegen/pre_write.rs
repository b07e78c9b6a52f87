//! Pre-write (SATB) barrier emission.
//!
//! Emitted before every reference store while concurrent marking may be
//! active: the value about to be overwritten is logged so the marker's
//! snapshot-at-the-beginning view of reachability survives the overwrite.

use super::{
    emit_marking_active_test, emit_preserved_runtime_call, emit_queue_insertion, AccessAttrs,
    BarrierAssembler, PreservationLevel, SlowPathStrategy,
};
use crate::isa::{Emitter, RegOrOffset, RuntimeEntry};

impl<'a, E: Emitter> BarrierAssembler<'a, E> {
    /// Emit the pre-write barrier.
    ///
    /// Arguments:
    /// * `obj`: the base register of the store target, or `None` if the old
    ///   value is already in `pre_val` (e.g. when barriering a weak-reference
    ///   load rather than a store).
    /// * `field`: the field position relative to `obj`; ignored when the
    ///   value is preloaded.
    /// * `pre_val`: receives (or already holds) the old value.
    /// * `tmp1`, `tmp2`: scratch registers. With a preloaded value in a
    ///   caller-saved register and no register set saved around the runtime
    ///   call, one of them must be callee-saved.
    /// * `preservation`: how much caller state the runtime call must
    ///   preserve. Must be [`PreservationLevel::None`] under
    ///   [`SlowPathStrategy::SharedStub`]; stubs own their preservation.
    #[allow(clippy::too_many_arguments)]
    pub fn pre_write_barrier(
        &mut self,
        masm: &mut E,
        attrs: AccessAttrs,
        obj: Option<E::Reg>,
        field: RegOrOffset<E::Reg>,
        pre_val: E::Reg,
        tmp1: E::Reg,
        tmp2: E::Reg,
        preservation: PreservationLevel,
    ) {
        debug_assert!(pre_val != tmp1 && pre_val != tmp2 && tmp1 != tmp2);
        debug_assert!(pre_val != masm.scratch_reg() && tmp1 != masm.scratch_reg());
        match self.strategy() {
            SlowPathStrategy::InlineCall => {
                self.pre_write_inline(masm, attrs, obj, field, pre_val, tmp1, tmp2, preservation)
            }
            SlowPathStrategy::SharedStub => {
                debug_assert!(
                    preservation == PreservationLevel::None,
                    "stubs own their preservation; callers pass PreservationLevel::None"
                );
                self.pre_write_with_stub(masm, obj, field, pre_val, tmp1, tmp2)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn pre_write_inline(
        &self,
        masm: &mut E,
        attrs: AccessAttrs,
        obj: Option<E::Reg>,
        field: RegOrOffset<E::Reg>,
        pre_val: E::Reg,
        tmp1: E::Reg,
        tmp2: E::Reg,
        preservation: PreservationLevel,
    ) {
        let config = self.config();
        let preloaded = obj.is_none();
        let thread = masm.thread_reg();

        let filtered = masm.fresh_label();
        let runtime = masm.fresh_label();

        // A preloaded value in a caller-saved register would be trashed by
        // the runtime call unless the volatile set is saved anyway; park it
        // in a callee-saved temp across the call.
        let mut nv_save = None;
        if preloaded && masm.is_caller_saved(pre_val) && !preservation.preserve_gp() {
            let candidate = if !masm.is_caller_saved(tmp1) { tmp1 } else { tmp2 };
            debug_assert!(
                !masm.is_caller_saved(candidate),
                "need one callee-saved temp when pre_val lives in a caller-saved register"
            );
            nv_save = Some(candidate);
        }

        let active = emit_marking_active_test(masm, config);
        masm.branch_if_zero(active, &filtered);

        // Do we need to load the previous value?
        if let Some(obj) = obj {
            match (config.compressed_refs, field) {
                (true, RegOrOffset::Offset(offset)) => masm.load_narrow(pre_val, obj, offset),
                (true, RegOrOffset::Reg(index)) => masm.load_narrow_indexed(pre_val, obj, index),
                (false, RegOrOffset::Offset(offset)) => masm.load_word(pre_val, obj, offset),
                (false, RegOrOffset::Reg(index)) => masm.load_word_indexed(pre_val, obj, index),
            }
        }

        // Is the previous value null?
        if preloaded && attrs.value_not_null {
            // Checked by the caller; trap in debug builds only.
            if cfg!(debug_assertions) {
                masm.emit_assert_nonzero(pre_val, "null value not allowed (pre-write)");
            }
        } else {
            masm.branch_if_zero(pre_val, &filtered);
        }

        // The log stores full-width references only.
        if !preloaded && config.compressed_refs {
            masm.decode_ref(pre_val, pre_val);
        }

        // Can we store the original value in the thread's buffer?
        emit_queue_insertion(
            masm,
            config.thread.satb_index_offset,
            config.thread.satb_buffer_offset,
            &runtime,
            pre_val,
            tmp1,
        );
        masm.jump(&filtered);

        masm.bind(&runtime);
        emit_preserved_runtime_call(masm, preservation, |masm| {
            if let Some(nv) = nv_save {
                masm.move_reg(nv, pre_val);
            }
            masm.call_runtime(RuntimeEntry::PreWrite, &[pre_val, thread]);
            if let Some(nv) = nv_save {
                masm.move_reg(pre_val, nv);
            }
        });
        masm.bind(&filtered);
    }

    /// The stub-tier fast path: just the marking-active test, with the rest
    /// of the decision tree out of line.
    fn pre_write_with_stub(
        &mut self,
        masm: &mut E,
        obj: Option<E::Reg>,
        field: RegOrOffset<E::Reg>,
        pre_val: E::Reg,
        tmp1: E::Reg,
        tmp2: E::Reg,
    ) {
        let done = masm.fresh_label();
        let active = emit_marking_active_test(masm, self.config());
        masm.branch_if_zero(active, &done);
        let stub = self
            .stubs_mut()
            .get_or_insert_pre(masm, obj, field, pre_val, tmp1, tmp2);
        masm.call_label(&stub);
        masm.bind(&done);
    }
}
