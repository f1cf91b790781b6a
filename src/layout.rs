//! Packed B layouts.
//!
//! B is stored as "rows" of `g` consecutive K values per column (`g` is the
//! descriptor's `ld_step`): element `(k, n)` sits at element
//! `(k/g)*LDB*g + n*g + k%g`. 4-bit types pack two such rows into one byte
//! row, the first `g` K values of each `g*2` group in the high nibble. K is
//! zero-padded to a whole number of packed rows.

use crate::desc::BrgemmDesc;

/// Geometry of one packed B operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BLayout {
    /// K values interleaved per column.
    pub g: usize,
    /// Elements per byte along K.
    pub p: usize,
    pub ldb: usize,
    /// Bytes per stored element (per byte for 4-bit types).
    pub ts: usize,
    pub k: usize,
}

impl BLayout {
    pub fn of(desc: &BrgemmDesc) -> Self {
        BLayout {
            g: desc.blocking.ld_step,
            p: desc.blocking.pack,
            ldb: desc.ldb,
            ts: desc.dt_b.size_bytes(),
            k: desc.k,
        }
    }

    /// Packed rows after padding K to a multiple of `g * p`.
    pub fn rows(&self) -> usize {
        self.k.div_ceil(self.g * self.p) * self.g
    }

    pub fn len_bytes(&self) -> usize {
        self.rows() * self.ldb * self.ts
    }

    /// Byte offset of the element (or nibble-carrying byte) `(k, n)`.
    pub fn byte_index(&self, k: usize, n: usize) -> usize {
        let gp = self.g * self.p;
        ((k / gp) * self.g * self.ldb + n * self.g + k % self.g) * self.ts
    }

    /// For 4-bit layouts: whether `(k, *)` lives in the high nibble.
    pub fn is_high_nibble(&self, k: usize) -> bool {
        k % (self.g * self.p) < self.g
    }

    /// Pack a row-major `k × n` matrix of `ts`-byte elements (`src_ld`
    /// elements per row).
    pub fn pack(&self, src: &[u8], n: usize, src_ld: usize) -> Vec<u8> {
        debug_assert_eq!(self.p, 1);
        let mut out = vec![0u8; self.len_bytes()];
        for k in 0..self.k {
            for j in 0..n {
                let s = (k * src_ld + j) * self.ts;
                let d = self.byte_index(k, j);
                out[d..d + self.ts].copy_from_slice(&src[s..s + self.ts]);
            }
        }
        out
    }

    /// Pack a row-major `k × n` matrix of 4-bit codes, one code per byte in
    /// the low nibble.
    pub fn pack_nibbles(&self, codes: &[u8], n: usize, src_ld: usize) -> Vec<u8> {
        debug_assert_eq!(self.p, 2);
        let mut out = vec![0u8; self.len_bytes()];
        for k in 0..self.k {
            for j in 0..n {
                let code = codes[k * src_ld + j] & 0x0F;
                let d = self.byte_index(k, j);
                if self.is_high_nibble(k) {
                    out[d] |= code << 4;
                } else {
                    out[d] |= code;
                }
            }
        }
        out
    }
}

/// Byte offset of B element `(k, n)` for `desc`.
pub fn b_byte_index(desc: &BrgemmDesc, k: usize, n: usize) -> usize {
    BLayout::of(desc).byte_index(k, n)
}

/// Pack a row-major B into the layout `desc` expects.
///
/// `src` holds raw elements of `desc.dt_b` (4-bit types: one code per byte).
pub fn pack_b(desc: &BrgemmDesc, src: &[u8], src_ld: usize) -> Vec<u8> {
    let layout = BLayout::of(desc);
    if layout.p == 2 {
        layout.pack_nibbles(src, desc.n, src_ld)
    } else {
        layout.pack(src, desc.n, src_ld)
    }
}
