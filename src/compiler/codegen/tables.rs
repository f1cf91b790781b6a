//! Constant pool and tile configurations.
//!
//! Everything the generated code reads besides its arguments lives here:
//! replicated vector constants, tail masks, the nf4 codebook and the
//! `ldtilecfg` blocks. The pool is appended after the last instruction and
//! addressed RIP-relative, so it is owned by the kernel's code pages.

use std::collections::HashMap;

use iced_x86::code_asm::{CodeAssembler, CodeLabel};

use crate::types::BrgemmResult;

struct PoolEntry {
    label: CodeLabel,
    bytes: Vec<u8>,
}

/// Deduplicating pool of byte blobs, one label per distinct blob.
#[derive(Default)]
pub struct ConstPool {
    entries: Vec<PoolEntry>,
    index: HashMap<Vec<u8>, usize>,
}

impl ConstPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, asm: &mut CodeAssembler, bytes: Vec<u8>) -> CodeLabel {
        if let Some(&i) = self.index.get(&bytes) {
            return self.entries[i].label;
        }
        let label = asm.create_label();
        self.index.insert(bytes.clone(), self.entries.len());
        self.entries.push(PoolEntry { label, bytes });
        label
    }

    /// Total bytes the pool adds after the code.
    pub fn size(&self) -> usize {
        self.entries.iter().map(|e| e.bytes.len()).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append every blob to the instruction stream.
    pub fn emit(&mut self, asm: &mut CodeAssembler) -> BrgemmResult<()> {
        for entry in &mut self.entries {
            asm.set_label(&mut entry.label)?;
            asm.db(&entry.bytes)?;
        }
        Ok(())
    }
}

/// `n` copies of a little-endian dword.
pub fn replicate_u32(value: u32, lanes: usize) -> Vec<u8> {
    (0..lanes).flat_map(|_| value.to_le_bytes()).collect()
}

/// Dword lane mask with the first `valid` lanes set, for `vmaskmovps`.
pub fn lane_mask(valid: usize, lanes: usize) -> Vec<u8> {
    (0..lanes)
        .flat_map(|i| if i < valid { u32::MAX } else { 0 }.to_le_bytes())
        .collect()
}

/// TILECFG palette 1 block (64 bytes, loaded via LDTILECFG).
///
/// Layout (Intel SDM Vol. 2, Table 3-2):
///   byte  0:     palette (must be 1)
///   byte  1:     start_row
///   bytes 16-31: colsb[0..7] as u16
///   bytes 48-55: rows[0..7] as u8
#[repr(C, align(64))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileCfg {
    pub data: [u8; 64],
}

/// Tile numbering for a `bd_block2 × ld_block2` grid: C tiles first,
/// then one A tile per bd block, then one B tile per ld block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub bd_block2: usize,
    pub ld_block2: usize,
}

impl TileGrid {
    pub fn c(&self, bd: usize, ld: usize) -> u8 {
        (bd * self.ld_block2 + ld) as u8
    }

    pub fn a(&self, bd: usize) -> u8 {
        (self.bd_block2 * self.ld_block2 + bd) as u8
    }

    pub fn b(&self, ld: usize) -> u8 {
        (self.bd_block2 * self.ld_block2 + self.bd_block2 + ld) as u8
    }

    pub fn count(&self) -> usize {
        self.bd_block2 * self.ld_block2 + self.bd_block2 + self.ld_block2
    }
}

impl TileCfg {
    pub fn zeroed() -> Self {
        TileCfg { data: [0u8; 64] }
    }

    /// Configuration for one shape variant.
    ///
    /// `rows` is the C/A row count, `c_cols` the valid columns of the first
    /// ld block (later ld blocks are always full), `b_rows` the reduction
    /// rows of B (`rd_block / ld_step`) and `b_row_bytes_per_col` the bytes
    /// one B column occupies per row (`ld_step * element size`).
    pub fn variant(
        grid: TileGrid,
        rows: usize,
        c_cols: usize,
        ld_block: usize,
        b_rows: usize,
        b_row_bytes_per_col: usize,
    ) -> Self {
        let mut cfg = Self::zeroed();
        cfg.data[0] = 1;
        for bd in 0..grid.bd_block2 {
            for ld in 0..grid.ld_block2 {
                let cols = if ld == 0 { c_cols } else { ld_block };
                cfg.set_tile(grid.c(bd, ld), rows as u8, (cols * 4) as u16);
            }
            cfg.set_tile(grid.a(bd), rows as u8, 64);
        }
        for ld in 0..grid.ld_block2 {
            let cols = if ld == 0 { c_cols } else { ld_block };
            cfg.set_tile(grid.b(ld), b_rows as u8, (cols * b_row_bytes_per_col) as u16);
        }
        cfg
    }

    fn set_tile(&mut self, idx: u8, rows: u8, colsb: u16) {
        let i = idx as usize;
        let cb = colsb.to_le_bytes();
        self.data[16 + 2 * i] = cb[0];
        self.data[16 + 2 * i + 1] = cb[1];
        self.data[48 + i] = rows;
    }

    pub fn rows(&self, idx: u8) -> u8 {
        self.data[48 + idx as usize]
    }

    pub fn colsb(&self, idx: u8) -> u16 {
        let i = idx as usize;
        u16::from_le_bytes([self.data[16 + 2 * i], self.data[17 + 2 * i]])
    }
}
