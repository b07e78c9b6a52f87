//! Bulk barriers for reference-array writes: one runtime call covering the
//! whole destination range instead of a per-element sequence.

use super::{emit_marking_active_test, AccessAttrs, BarrierAssembler};
use crate::isa::{Emitter, RuntimeEntry};

impl<'a, E: Emitter> BarrierAssembler<'a, E> {
    /// Emit the bulk pre-write barrier for a reference-array copy of
    /// `count` elements from `from` to `to`. Skipped entirely when the
    /// destination is statically known uninitialized: there are no old
    /// values to snapshot. Registers in `preserve` survive the call along
    /// with the three arguments.
    pub fn array_write_pre_barrier(
        &mut self,
        masm: &mut E,
        attrs: AccessAttrs,
        from: E::Reg,
        to: E::Reg,
        count: E::Reg,
        preserve: &[E::Reg],
    ) {
        if attrs.dest_uninitialized {
            return;
        }

        let filtered = masm.fresh_label();
        let active = emit_marking_active_test(masm, self.config());
        masm.branch_if_zero(active, &filtered);

        let mut saved = vec![from, to, count];
        saved.extend_from_slice(preserve);

        masm.save_link();
        masm.push_frame();
        masm.save_regs(&saved);
        masm.call_runtime(RuntimeEntry::ArrayPreWrite, &[to, count]);
        masm.restore_regs(&saved);
        masm.pop_frame();
        masm.restore_link();

        masm.bind(&filtered);
    }

    /// Emit the bulk post-write barrier for `count` reference slots written
    /// starting at `addr`: the runtime dirties and logs every card covering
    /// the range.
    pub fn array_write_post_barrier(
        &mut self,
        masm: &mut E,
        addr: E::Reg,
        count: E::Reg,
        preserve: &[E::Reg],
    ) {
        masm.save_link();
        masm.push_frame();
        masm.save_regs(preserve);
        masm.call_runtime(RuntimeEntry::ArrayPostWrite, &[addr, count]);
        masm.restore_regs(preserve);
        masm.pop_frame();
        masm.restore_link();
    }
}
