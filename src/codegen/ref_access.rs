//! Reference load/store composition: the entry points a compiler backend
//! calls when emitting a reference-typed access. They wrap the host's plain
//! access emission with the pre/post barrier calls and handle precise
//! addressing and opaque-handle resolution.

use super::{
    AccessAttrs, BarrierAssembler, PreservationLevel, HANDLE_TAG_BITS, WEAK_HANDLE_TAG,
};
use crate::isa::{Emitter, RegOrOffset};

impl<'a, E: Emitter> BarrierAssembler<'a, E> {
    /// Emit a barriered reference store: pre-write barrier (old-value reload
    /// mode), the raw store, then, unless the stored value is a compile-time
    /// null, the post-write barrier on the precise address.
    ///
    /// Array and unknown-offset accesses fold `field` into `base` before the
    /// post barrier, clobbering `base`; field stores pass the object base,
    /// which card granularity makes sufficient.
    #[allow(clippy::too_many_arguments)]
    pub fn ref_store_at(
        &mut self,
        masm: &mut E,
        attrs: AccessAttrs,
        base: E::Reg,
        field: RegOrOffset<E::Reg>,
        val: Option<E::Reg>,
        tmp1: E::Reg,
        tmp2: E::Reg,
        tmp3: E::Reg,
        preservation: PreservationLevel,
    ) {
        let precise = attrs.is_array || attrs.unknown_offset;

        // Load and record the previous value.
        self.pre_write_barrier(
            masm,
            attrs,
            Some(base),
            field,
            tmp1,
            tmp2,
            tmp3,
            preservation,
        );

        masm.store_ref(val, base, field);

        // No need for a post barrier when storing null.
        if let Some(val) = val {
            if precise {
                match field {
                    RegOrOffset::Offset(offset) => masm.add_imm(base, base, offset as i64),
                    RegOrOffset::Reg(index) => masm.add(base, index, base),
                }
            }
            self.post_write_barrier(
                masm,
                attrs,
                base,
                val,
                tmp1,
                tmp2,
                tmp3,
                preservation,
                false,
            );
        }
    }

    /// Emit a barriered reference load. Weak and phantom referents are
    /// logged through the pre-write barrier in preloaded mode, so a referent
    /// resurrected by this load is also visible to concurrent marking;
    /// the barrier is skipped when the loaded value is null.
    #[allow(clippy::too_many_arguments)]
    pub fn ref_load_at(
        &mut self,
        masm: &mut E,
        attrs: AccessAttrs,
        base: E::Reg,
        field: RegOrOffset<E::Reg>,
        dst: E::Reg,
        tmp1: E::Reg,
        tmp2: E::Reg,
        preservation: PreservationLevel,
    ) {
        let on_reference = attrs.weak_ref || attrs.phantom_ref;
        let done = masm.fresh_label();

        // Load the value of the referent field.
        masm.load_ref(dst, base, field);

        if on_reference {
            masm.branch_if_zero(dst, &done);
            // Log the referent in the SATB buffer. With these arguments the
            // pre barrier does not reload the value; we only reach here if
            // it is non-null.
            self.pre_write_barrier(
                masm,
                AccessAttrs {
                    value_not_null: true,
                    ..attrs
                },
                None,
                RegOrOffset::Offset(0),
                dst,
                tmp1,
                tmp2,
                preservation,
            );
        }
        masm.bind(&done);
    }

    /// Resolve an opaque handle in `value` (a tagged pointer-to-pointer)
    /// to the reference it designates. Only weakly tagged handles get the
    /// pre-write treatment after dereferencing; a null handle resolves to
    /// null as-is.
    pub fn resolve_handle(
        &mut self,
        masm: &mut E,
        value: E::Reg,
        tmp1: E::Reg,
        tmp2: E::Reg,
        preservation: PreservationLevel,
    ) {
        let done = masm.fresh_label();
        let not_weak = masm.fresh_label();

        masm.branch_if_zero(value, &done); // use null as-is

        masm.clear_low_bits(tmp1, value, HANDLE_TAG_BITS);
        masm.and_imm(tmp2, value, WEAK_HANDLE_TAG);
        masm.load_word(value, tmp1, 0); // resolve the untagged handle

        masm.branch_if_zero(tmp2, &not_weak);
        // A weak handle's referent may have been cleared concurrently, so
        // the pre barrier's own null filter stays in play here.
        self.pre_write_barrier(
            masm,
            AccessAttrs {
                phantom_ref: true,
                ..AccessAttrs::default()
            },
            None,
            RegOrOffset::Offset(0),
            value,
            tmp1,
            tmp2,
            preservation,
        );
        masm.bind(&not_weak);
        masm.bind(&done);
    }
}
