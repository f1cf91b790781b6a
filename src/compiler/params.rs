//! Runtime call ABI: the parameter block and batch elements.
//!
//! The generated function has the C signature `void(const BrgemmParams *)`.
//! Field offsets are taken with `offset_of!`, so the Rust layout is the
//! single source of truth for the code generator.

use std::mem::offset_of;
use std::ptr;

/// One batch element.
///
/// In `Addr` mode `a`/`b` are pointers, in `Offs` mode byte offsets from
/// `ptr_a`/`ptr_b`. In `Strd` mode only the vpad fields are read.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchElement {
    pub a: u64,
    pub b: u64,
    /// Rows at the top of the M range whose A row is virtual padding.
    pub vpad_top: i64,
    /// Rows at the bottom of the M range whose A row is virtual padding.
    pub vpad_bottom: i64,
}

impl BatchElement {
    pub fn pointers(a: *const u8, b: *const u8) -> Self {
        BatchElement {
            a: a as u64,
            b: b as u64,
            ..Self::default()
        }
    }

    pub fn offsets(a: usize, b: usize) -> Self {
        BatchElement {
            a: a as u64,
            b: b as u64,
            ..Self::default()
        }
    }

    pub fn with_vpad(self, top: usize, bottom: usize) -> Self {
        BatchElement {
            vpad_top: top as i64,
            vpad_bottom: bottom as i64,
            ..self
        }
    }
}

pub(crate) const BATCH_A: i32 = offset_of!(BatchElement, a) as i32;
pub(crate) const BATCH_B: i32 = offset_of!(BatchElement, b) as i32;
pub(crate) const BATCH_VPAD_TOP: i32 = offset_of!(BatchElement, vpad_top) as i32;
pub(crate) const BATCH_VPAD_BOTTOM: i32 = offset_of!(BatchElement, vpad_bottom) as i32;
pub(crate) const BATCH_STRIDE: usize = std::mem::size_of::<BatchElement>();

/// Per-call parameter block.
///
/// Pointers the descriptor does not use may stay null. Flags are tested
/// against zero.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BrgemmParams {
    pub ptr_a: *const u8,
    pub ptr_b: *const u8,
    pub batch: *const BatchElement,
    pub ptr_c: *mut u8,
    pub ptr_d: *mut u8,
    /// Runtime batch size, at most the descriptor's `max_bs`.
    pub bs: u64,
    pub ptr_bias: *const u8,
    pub ptr_scales: *const f32,
    /// s8s8 compensation, one s32 per N column.
    pub ptr_compensation: *const i32,
    pub do_post_ops: u64,
    pub do_apply_comp: u64,
    pub skip_accm: u64,
    pub zp_a_val: i64,
    /// `-Σ_k B[k, n]`, one s32 per N column.
    pub zp_comp_a: *const i32,
    /// Per-row B zero-point compensation.
    pub zp_comp_b: *const i32,
    pub zp_c_values: *const i32,
    pub dst_scales: *const f32,
    pub ptr_wei_scales: *const f32,
    pub ptr_wei_zp: *const u8,
    /// K index of the first reduction element (grouped scales).
    pub ic: u64,
    pub ptr_src_scales: *const f32,
    /// One f32 operand per binary post-op.
    pub post_ops_rhs: *const *const f32,
}

impl Default for BrgemmParams {
    fn default() -> Self {
        BrgemmParams {
            ptr_a: ptr::null(),
            ptr_b: ptr::null(),
            batch: ptr::null(),
            ptr_c: ptr::null_mut(),
            ptr_d: ptr::null_mut(),
            bs: 0,
            ptr_bias: ptr::null(),
            ptr_scales: ptr::null(),
            ptr_compensation: ptr::null(),
            do_post_ops: 1,
            do_apply_comp: 1,
            skip_accm: 0,
            zp_a_val: 0,
            zp_comp_a: ptr::null(),
            zp_comp_b: ptr::null(),
            zp_c_values: ptr::null(),
            dst_scales: ptr::null(),
            ptr_wei_scales: ptr::null(),
            ptr_wei_zp: ptr::null(),
            ic: 0,
            ptr_src_scales: ptr::null(),
            post_ops_rhs: ptr::null(),
        }
    }
}

/// Byte offsets of the parameter fields read by the prologue.
pub(crate) mod off {
    use super::BrgemmParams;
    use std::mem::offset_of;

    pub const PTR_A: i32 = offset_of!(BrgemmParams, ptr_a) as i32;
    pub const PTR_B: i32 = offset_of!(BrgemmParams, ptr_b) as i32;
    pub const BATCH: i32 = offset_of!(BrgemmParams, batch) as i32;
    pub const PTR_C: i32 = offset_of!(BrgemmParams, ptr_c) as i32;
    pub const PTR_D: i32 = offset_of!(BrgemmParams, ptr_d) as i32;
    pub const BS: i32 = offset_of!(BrgemmParams, bs) as i32;
    pub const BIAS: i32 = offset_of!(BrgemmParams, ptr_bias) as i32;
    pub const SCALES: i32 = offset_of!(BrgemmParams, ptr_scales) as i32;
    pub const COMP: i32 = offset_of!(BrgemmParams, ptr_compensation) as i32;
    pub const DO_POST_OPS: i32 = offset_of!(BrgemmParams, do_post_ops) as i32;
    pub const DO_COMP: i32 = offset_of!(BrgemmParams, do_apply_comp) as i32;
    pub const SKIP_ACCM: i32 = offset_of!(BrgemmParams, skip_accm) as i32;
    pub const ZP_A_VAL: i32 = offset_of!(BrgemmParams, zp_a_val) as i32;
    pub const ZP_COMP_A: i32 = offset_of!(BrgemmParams, zp_comp_a) as i32;
    pub const ZP_COMP_B: i32 = offset_of!(BrgemmParams, zp_comp_b) as i32;
    pub const ZP_C: i32 = offset_of!(BrgemmParams, zp_c_values) as i32;
    pub const DST_SCALES: i32 = offset_of!(BrgemmParams, dst_scales) as i32;
    pub const WEI_SCALES: i32 = offset_of!(BrgemmParams, ptr_wei_scales) as i32;
    pub const WEI_ZP: i32 = offset_of!(BrgemmParams, ptr_wei_zp) as i32;
    pub const IC: i32 = offset_of!(BrgemmParams, ic) as i32;
    pub const SRC_SCALES: i32 = offset_of!(BrgemmParams, ptr_src_scales) as i32;
    pub const POST_OPS_RHS: i32 = offset_of!(BrgemmParams, post_ops_rhs) as i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_element_layout() {
        assert_eq!(BATCH_STRIDE, 32);
        assert_eq!(BATCH_A, 0);
        assert_eq!(BATCH_B, 8);
        assert_eq!(BATCH_VPAD_TOP, 16);
        assert_eq!(BATCH_VPAD_BOTTOM, 24);
    }

    #[test]
    fn test_params_are_qword_slots() {
        assert_eq!(std::mem::size_of::<BrgemmParams>() % 8, 0);
        assert_eq!(off::PTR_A, 0);
        assert_eq!(off::POST_OPS_RHS as usize, std::mem::size_of::<BrgemmParams>() - 8);
    }

    #[test]
    fn test_constructors() {
        let e = BatchElement::offsets(64, 128).with_vpad(1, 2);
        assert_eq!((e.a, e.b, e.vpad_top, e.vpad_bottom), (64, 128, 1, 2));
        let d = BrgemmParams::default();
        assert_eq!(d.do_post_ops, 1);
        assert!(d.batch.is_null());
    }
}
