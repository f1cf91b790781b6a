//! Byte offsets into A, B, C, D and the auxiliary arrays.
//!
//! Pure functions of the descriptor. The loop nest keeps running pointers
//! at block starts; everything inside a block is a compile-time
//! displacement computed here.

use crate::desc::BrgemmDesc;

#[derive(Debug, Clone, Copy)]
pub struct Offsets<'a> {
    desc: &'a BrgemmDesc,
}

fn disp(bytes: usize) -> i32 {
    debug_assert!(bytes <= i32::MAX as usize, "displacement {bytes} overflows");
    bytes as i32
}

impl<'a> Offsets<'a> {
    pub fn new(desc: &'a BrgemmDesc) -> Self {
        Offsets { desc }
    }

    /// A element `(bd, k)` relative to the A block pointer.
    pub fn a(&self, bd: usize, k: usize) -> i32 {
        let ts = self.desc.dt_a.size_bytes();
        disp(bd * self.desc.lda * ts + k * ts)
    }

    /// B at reduction index `k` (a multiple of the K unit) and ld block
    /// `ld`, relative to the B block pointer.
    pub fn b(&self, k: usize, ld: usize) -> i32 {
        let blk = &self.desc.blocking;
        debug_assert_eq!(k % blk.k_unit(), 0);
        disp(self.rd_step_b(k) as usize + ld * self.ld_step_b(1))
    }

    /// Row stride of one packed B row (`ld_step` K values per column).
    pub fn b_row(&self) -> usize {
        self.desc.blocking.ld_step * self.desc.ldb * self.desc.dt_b.size_bytes()
    }

    pub fn c(&self, bd: usize, ld: usize) -> i32 {
        let ts = self.desc.dt_c.size_bytes();
        disp(bd * self.desc.ldc * ts + ld * self.desc.blocking.ld_block * ts)
    }

    pub fn d(&self, bd: usize, ld: usize) -> i32 {
        let ts = self.desc.dt_d.size_bytes();
        disp(bd * self.desc.ldd * ts + ld * self.desc.blocking.ld_block * ts)
    }

    /// Per-N auxiliary element of ld block `ld`, relative to the element
    /// at the current ld block start.
    pub fn per_n(&self, ld: usize, esize: usize) -> i32 {
        disp(ld * self.desc.blocking.ld_block * esize)
    }

    /// Advance of the A pointer across `rows` bd rows.
    pub fn bd_step_a(&self, rows: usize) -> usize {
        rows * self.desc.lda * self.desc.dt_a.size_bytes()
    }

    pub fn bd_step_c(&self, rows: usize) -> usize {
        rows * self.desc.ldc * self.desc.dt_c.size_bytes()
    }

    pub fn bd_step_d(&self, rows: usize) -> usize {
        rows * self.desc.ldd * self.desc.dt_d.size_bytes()
    }

    /// Advance of the B pointer across `blocks` ld blocks.
    pub fn ld_step_b(&self, blocks: usize) -> usize {
        let blk = &self.desc.blocking;
        blocks * blk.ld_block * blk.ld_step * self.desc.dt_b.size_bytes()
    }

    pub fn ld_step_c(&self, blocks: usize) -> usize {
        blocks * self.desc.blocking.ld_block * self.desc.dt_c.size_bytes()
    }

    pub fn ld_step_d(&self, blocks: usize) -> usize {
        blocks * self.desc.blocking.ld_block * self.desc.dt_d.size_bytes()
    }

    /// Advance of the A pointer across `k` reduction elements.
    pub fn rd_step_a(&self, k: usize) -> i32 {
        disp(k * self.desc.dt_a.size_bytes())
    }

    /// Advance of the B pointer across `k` reduction elements (a multiple
    /// of the K unit).
    pub fn rd_step_b(&self, k: usize) -> i32 {
        let blk = &self.desc.blocking;
        disp(k / blk.k_unit() * self.b_row())
    }
}
