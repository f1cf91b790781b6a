//! Stack scratch frame.
//!
//! The prologue copies the parameter fields the kernel reads after entry
//! into `FrameSlots`, and the loop nest spills its outer state there during
//! accumulation. Tile kernels additionally carve staging buffers for C, A
//! and B tiles after the slots.

use std::mem::size_of;

use crate::desc::BrgemmDesc;
use crate::dispatch::ComputeEngine;

use super::regs::CALLEE_SAVED;

#[repr(C)]
#[derive(Debug, Default)]
pub struct FrameSlots {
    // Copied from the parameter block.
    pub batch: u64,
    pub bias: u64,
    pub scales: u64,
    pub comp: u64,
    pub zp_comp_a: u64,
    pub zp_comp_b: u64,
    pub zp_c: u64,
    pub dst_scales: u64,
    pub wei_scales: u64,
    pub wei_zp: u64,
    pub src_scales: u64,
    pub post_ops_rhs: u64,
    pub do_post_ops: u64,
    pub do_comp: u64,
    pub skip_accm: u64,
    pub zp_a_val: u64,
    pub ic: u64,
    // Outer-loop spills.
    pub d: u64,
    pub aux_d: u64,
    pub bdb: u64,
    pub ldb: u64,
    /// First N column of the current ld block.
    pub n_idx: u64,
    /// `n_idx * 4`
    pub n_off4: u64,
    /// First M row of the current bd block.
    pub m_idx: u64,
    /// `m_idx * 4`
    pub m_off4: u64,
    /// `m_idx * src_scale_stride * 4`
    pub m_src_off: u64,
    /// Running K index for grouped scales.
    pub aux_ic: u64,
    pub save_rax: u64,
    pub save_rdx: u64,
    /// Current batch element for vpad in strided mode.
    pub vpad_cur: u64,
}

macro_rules! slot {
    ($field:ident) => {
        ::std::mem::offset_of!($crate::compiler::codegen::frame::FrameSlots, $field)
    };
}
pub(crate) use slot;

/// Bytes of one tile staging buffer (16 rows × 64 bytes).
pub const TILE_BYTES: usize = 1024;
/// Row stride inside a staging buffer.
pub const STAGE_STRIDE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    /// Bytes subtracted from rsp after the callee-saved pushes.
    pub size: usize,
    pub c_stage: Option<usize>,
    pub a_stage: Option<usize>,
    pub b_stage: Option<usize>,
    bd_block2: usize,
    ld_block2: usize,
}

impl FrameLayout {
    pub fn new(desc: &BrgemmDesc) -> Self {
        let mut end = size_of::<FrameSlots>();
        let (mut c_stage, mut a_stage, mut b_stage) = (None, None, None);
        let blk = &desc.blocking;
        if desc.engine == ComputeEngine::Amx {
            end = end.next_multiple_of(64);
            c_stage = Some(end);
            end += TILE_BYTES;
            a_stage = Some(end);
            end += blk.bd_block2 * TILE_BYTES;
            b_stage = Some(end);
            end += blk.ld_block2 * TILE_BYTES;
        }
        // Entry rsp is 8 mod 16; the pushes and the frame restore 16-byte
        // alignment.
        let pushed = 8 + 8 * CALLEE_SAVED.len();
        let mut size = end.next_multiple_of(16);
        if (pushed + size) % 16 != 0 {
            size += 8;
        }
        FrameLayout {
            size,
            c_stage,
            a_stage,
            b_stage,
            bd_block2: blk.bd_block2,
            ld_block2: blk.ld_block2,
        }
    }

    pub fn a_stage(&self, bd: usize) -> usize {
        debug_assert!(bd < self.bd_block2);
        self.a_stage.unwrap_or(0) + bd * TILE_BYTES
    }

    pub fn b_stage(&self, ld: usize) -> usize {
        debug_assert!(ld < self.ld_block2);
        self.b_stage.unwrap_or(0) + ld * TILE_BYTES
    }

    pub fn c_stage(&self) -> usize {
        self.c_stage.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::IsaCaps;
    use crate::types::DataType;

    #[test]
    fn test_slots_are_distinct_qwords() {
        let offs = [
            slot!(batch),
            slot!(ic),
            slot!(d),
            slot!(aux_d),
            slot!(n_idx),
            slot!(m_idx),
            slot!(vpad_cur),
        ];
        for (i, a) in offs.iter().enumerate() {
            assert_eq!(a % 8, 0);
            for b in &offs[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_frame_alignment() {
        let d = BrgemmDesc::builder(DataType::F32, DataType::F32, 4, 16, 16)
            .isa(ComputeEngine::Avx512, IsaCaps::avx512_core())
            .build()
            .unwrap();
        let f = FrameLayout::new(&d);
        assert_eq!((8 + 48 + f.size) % 16, 0);
        assert!(f.c_stage.is_none());
    }

    #[test]
    fn test_tile_staging() {
        let d = BrgemmDesc::builder(DataType::Bf16, DataType::Bf16, 32, 32, 64)
            .isa(ComputeEngine::Amx, IsaCaps::amx())
            .build()
            .unwrap();
        let f = FrameLayout::new(&d);
        let c = f.c_stage();
        assert_eq!(c % 64, 0);
        assert_eq!(f.a_stage(0), c + TILE_BYTES);
        assert_eq!(f.b_stage(0), c + TILE_BYTES * (1 + d.blocking.bd_block2));
        assert!(f.size >= f.b_stage(d.blocking.ld_block2 - 1) + TILE_BYTES);
    }
}
