//! Tile microkernel (AMX).
//!
//! A group of `bd_blocks × lds` C tiles is accumulated with one A tile per
//! bd block and one B tile per ld block. Full reduction blocks of 16/32-bit
//! inputs are loaded straight from memory; reduction tails and fp8 inputs
//! go through the frame staging buffers (zero-padded, fp8 widened to f16)
//! and are loaded with a 64-byte stride.

use iced_x86::code_asm::*;

use super::{r64, reg, LoopState, MicrokernelBody};
use crate::compiler::codegen::emitter::{tmm, Emitter, V, K_STAGE_A, K_STAGE_B};
use crate::compiler::codegen::fetch::decode_e4m3;
use crate::compiler::codegen::frame::STAGE_STRIDE;
use crate::compiler::codegen::regs::{GprRole, Vmm};
use crate::compiler::codegen::store::{emit_store, StoreShape};
use crate::compiler::codegen::tables::{TileCfg, TileGrid};
use crate::compiler::codegen::Ctx;
use crate::desc::BrgemmDesc;
use crate::types::{BrgemmError, BrgemmResult, DataType};

/// B rows of one tile: `rd_block / ld_step`.
const TILE_ROWS: usize = 16;

#[derive(Debug, Clone)]
struct Variant {
    rows: usize,
    cols: usize,
    cfg: TileCfg,
}

pub struct TileBody {
    grid: TileGrid,
    variants: Vec<Variant>,
    /// No store-time work: `tilestored` straight into C.
    direct_store: bool,
}

impl TileBody {
    pub fn new(desc: &BrgemmDesc) -> Self {
        let blk = &desc.blocking;
        let grid = TileGrid {
            bd_block2: blk.bd_block2,
            ld_block2: blk.ld_block2,
        };
        let mut rows = Vec::new();
        if blk.bdb > 0 {
            rows.push(blk.bd_block);
        }
        if blk.bdb_tail > 0 {
            rows.push(blk.bdb_tail);
        }
        let mut cols = Vec::new();
        if desc.n >= blk.ld_block {
            cols.push(blk.ld_block);
        }
        if blk.ldb_tail > 0 {
            cols.push(blk.ldb_tail);
        }
        let b_row_bytes = blk.ld_step * desc.tile_ts_a();
        let variants = rows
            .iter()
            .flat_map(|&r| cols.iter().map(move |&c| (r, c)))
            .map(|(rows, cols)| Variant {
                rows,
                cols,
                cfg: TileCfg::variant(grid, rows, cols, blk.ld_block, TILE_ROWS, b_row_bytes),
            })
            .collect();
        TileBody {
            grid,
            variants,
            direct_store: !desc.post_ops_applicable()
                && desc.alpha == 1.0
                && desc.beta == 0.0
                && !desc.has_compensation(),
        }
    }

    fn variant(&self, st: &LoopState, ctx: &Ctx<'_>) -> BrgemmResult<&Variant> {
        let cols = st.ld_tail.unwrap_or(ctx.desc.blocking.ld_block);
        self.variants
            .iter()
            .find(|v| v.rows == st.rows && v.cols == cols)
            .ok_or_else(|| {
                BrgemmError::Assembler(format!("no tile configuration for {}x{cols}", st.rows))
            })
    }

    fn load_cfg(&self, e: &mut Emitter, v: &Variant) -> BrgemmResult<()> {
        log::trace!("brgemm tile config {}x{}", v.rows, v.cols);
        let cfg = e.blob(v.cfg.data.to_vec());
        e.asm.ldtilecfg(cfg)?;
        Ok(())
    }

    fn dot(&self, e: &mut Emitter, ctx: &Ctx<'_>, c: u8, a: u8, b: u8) -> BrgemmResult<()> {
        use DataType::*;
        let (c, a, b) = (tmm(c)?, tmm(a)?, tmm(b)?);
        let d = ctx.desc;
        match (d.dt_a, d.dt_b) {
            (Bf16, Bf16) => e.asm.tdpbf16ps(c, a, b)?,
            (S8, S8) => e.asm.tdpbssd(c, a, b)?,
            (S8, U8) => e.asm.tdpbsud(c, a, b)?,
            (U8, S8) => e.asm.tdpbusd(c, a, b)?,
            (U8, U8) => e.asm.tdpbuud(c, a, b)?,
            // f16 and fp8 staged as f16
            _ => e.asm.tdpfp16ps(c, a, b)?,
        }
        Ok(())
    }
}

/// Widen `valid` fp8 values at `src` to f16 at `[rsp + dst]` (one 64-byte
/// row). Values past `valid` are written as zero.
fn stage_fp8_row(
    e: &mut Emitter,
    dt: DataType,
    src: AsmMemoryOperand,
    src_hi: AsmMemoryOperand,
    dst: usize,
    valid: usize,
    k: u8,
) -> BrgemmResult<()> {
    let v = e.v(Vmm(0));
    let out = ptr(rsp + dst as i32);
    if dt == DataType::F8E5M2 {
        let load = if valid < 32 { v.kz(k) } else { v };
        e.vpmovzxbw(load, src)?;
        e.vpsllw(v, v, 8)?;
        return e.vmovups_st(out, v);
    }
    // e4m3: two halves of 16 through f32.
    for (half, m) in [(0usize, src), (1, src_hi)] {
        let n = valid.saturating_sub(16 * half).min(16);
        let dst_half = ptr(rsp + (dst + 32 * half) as i32);
        if n == 0 {
            let y = e.h(Vmm(0));
            e.vzero(y)?;
            e.vmovups_st(dst_half, y)?;
            continue;
        }
        let load = if n < 16 { v.kz(k) } else { v };
        e.vpmovzxbd(load, m)?;
        decode_e4m3(e, Vmm(0), Vmm(1))?;
        e.vcvtps2ph(dst_half.into(), v)?;
    }
    Ok(())
}

/// Opmask for a partial fp8 row: word lanes for e5m2, the partial half's
/// dword lanes for e4m3.
fn fp8_mask_bits(dt: DataType, valid: usize) -> usize {
    if dt == DataType::F8E5M2 {
        valid
    } else {
        valid % 16
    }
}

impl TileBody {
    /// Copy the A rows of every bd block of the group to the staging area.
    fn stage_a(&self, e: &mut Emitter, ctx: &Ctx<'_>, st: &LoopState, k: usize) -> BrgemmResult<()> {
        let d = ctx.desc;
        let aux_a = reg(GprRole::AuxA);
        let raw = d.dt_a.size_bytes();
        if d.dt_a.is_fp8() {
            let bits = fp8_mask_bits(d.dt_a, k);
            if bits > 0 {
                e.set_kmask(K_STAGE_A, bits, reg(GprRole::Local0))?;
            }
        } else {
            e.set_kmask(K_STAGE_A, k * raw, reg(GprRole::Local0))?;
        }
        let v = e.v(Vmm(0));
        for bd in 0..st.bd_blocks {
            for r in 0..st.rows {
                let disp = ctx.off.a(bd * st.rows + r, 0);
                let dst = ctx.frame.a_stage(bd) + r * STAGE_STRIDE;
                let src = ptr(aux_a.r64() + disp);
                if d.dt_a.is_fp8() {
                    let hi = ptr(aux_a.r64() + disp + 16);
                    stage_fp8_row(e, d.dt_a, src, hi, dst, k, K_STAGE_A)?;
                } else {
                    e.vmovdqu8(v.kz(K_STAGE_A), src)?;
                    e.vmovups_st(ptr(rsp + dst as i32), v)?;
                }
            }
        }
        Ok(())
    }

    /// Copy the B rows of every ld block to the staging area, zero rows
    /// past the reduction tail.
    fn stage_b(&self, e: &mut Emitter, ctx: &Ctx<'_>, st: &LoopState, k: usize) -> BrgemmResult<()> {
        let d = ctx.desc;
        let g = d.blocking.ld_step;
        let aux_b = reg(GprRole::AuxB);
        let b_rows = k.div_ceil(g);
        let v = e.v(Vmm(0));
        for ld in 0..st.lds {
            let cols = st.tail_of(ld).unwrap_or(d.blocking.ld_block);
            // Elements (or bytes for 16/32-bit types) of one B row.
            let valid = cols * g;
            let fp8 = d.dt_b.is_fp8();
            if fp8 {
                let bits = fp8_mask_bits(d.dt_b, valid);
                if bits > 0 {
                    e.set_kmask(K_STAGE_B, bits, reg(GprRole::Local0))?;
                }
            } else {
                e.set_kmask(K_STAGE_B, valid * d.dt_b.size_bytes(), reg(GprRole::Local0))?;
            }
            for r in 0..TILE_ROWS {
                let dst = ctx.frame.b_stage(ld) + r * STAGE_STRIDE;
                if r >= b_rows {
                    e.vzero(v)?;
                    e.vmovups_st(ptr(rsp + dst as i32), v)?;
                    continue;
                }
                let disp = ctx.off.b(0, ld) + (r * ctx.off.b_row()) as i32;
                let src = ptr(aux_b.r64() + disp);
                if fp8 {
                    let hi = ptr(aux_b.r64() + disp + 16);
                    stage_fp8_row(e, d.dt_b, src, hi, dst, valid, K_STAGE_B)?;
                } else {
                    e.vmovdqu8(v.kz(K_STAGE_B), src)?;
                    e.vmovups_st(ptr(rsp + dst as i32), v)?;
                }
            }
        }
        Ok(())
    }
}

impl MicrokernelBody for TileBody {
    fn prologue(&self, e: &mut Emitter, _cx: &Ctx<'_>) -> BrgemmResult<()> {
        match self.variants.as_slice() {
            [only] => self.load_cfg(e, only),
            _ => Ok(()),
        }
    }

    fn enter_regime(&self, e: &mut Emitter, ctx: &Ctx<'_>, st: &LoopState) -> BrgemmResult<()> {
        if self.variants.len() > 1 {
            let v = self.variant(st, ctx)?;
            self.load_cfg(e, v)?;
        }
        Ok(())
    }

    fn zero(&self, e: &mut Emitter, _cx: &Ctx<'_>, st: &LoopState) -> BrgemmResult<()> {
        for bd in 0..st.bd_blocks {
            for ld in 0..st.lds {
                e.asm.tilezero(tmm(self.grid.c(bd, ld))?)?;
            }
        }
        Ok(())
    }

    fn reduce(&self, e: &mut Emitter, ctx: &Ctx<'_>, st: &LoopState, k: usize) -> BrgemmResult<()> {
        let d = ctx.desc;
        let staged = k < d.blocking.rd_block || d.dt_a.is_fp8() || d.dt_b.is_fp8();
        let (l0, l1) = (r64(GprRole::Local0), r64(GprRole::Local1));
        let (aux_a, aux_b) = (r64(GprRole::AuxA), r64(GprRole::AuxB));

        if staged {
            self.stage_a(e, ctx, st, k)?;
            self.stage_b(e, ctx, st, k)?;
            e.asm.mov(l0, STAGE_STRIDE as u64)?;
            for bd in 0..st.bd_blocks {
                let off = ctx.frame.a_stage(bd) as i32;
                e.asm.tileloadd(tmm(self.grid.a(bd))?, ptr(rsp + l0 + off))?;
            }
            for ld in 0..st.lds {
                let off = ctx.frame.b_stage(ld) as i32;
                e.asm.tileloadd(tmm(self.grid.b(ld))?, ptr(rsp + l0 + off))?;
            }
        } else {
            e.asm.mov(l0, (d.lda * d.dt_a.size_bytes()) as u64)?;
            e.asm.mov(l1, ctx.off.b_row() as u64)?;
            for bd in 0..st.bd_blocks {
                let disp = ctx.off.a(bd * st.rows, 0);
                e.asm.tileloadd(tmm(self.grid.a(bd))?, ptr(aux_a + l0 + disp))?;
            }
            for ld in 0..st.lds {
                let disp = ctx.off.b(0, ld);
                e.asm.tileloadd(tmm(self.grid.b(ld))?, ptr(aux_b + l1 + disp))?;
            }
        }
        for bd in 0..st.bd_blocks {
            for ld in 0..st.lds {
                self.dot(e, ctx, self.grid.c(bd, ld), self.grid.a(bd), self.grid.b(ld))?;
            }
        }
        Ok(())
    }

    fn store(&self, e: &mut Emitter, ctx: &Ctx<'_>, st: &LoopState) -> BrgemmResult<()> {
        let d = ctx.desc;
        let stride = r64(GprRole::Scratch);
        let aux_c = r64(GprRole::AuxC);
        if self.direct_store {
            e.asm.mov(stride, (d.ldc * d.dt_c.size_bytes()) as u64)?;
            for bd in 0..st.bd_blocks {
                for ld in 0..st.lds {
                    let disp = ctx.off.c(bd * st.rows, ld);
                    e.asm.tilestored(ptr(aux_c + stride + disp), tmm(self.grid.c(bd, ld))?)?;
                }
            }
            return Ok(());
        }
        let c_stage = ctx.frame.c_stage();
        for bd in 0..st.bd_blocks {
            for ld in 0..st.lds {
                e.asm.mov(stride, STAGE_STRIDE as u64)?;
                e.asm.tilestored(ptr(rsp + stride + c_stage as i32), tmm(self.grid.c(bd, ld))?)?;
                for r in 0..st.rows {
                    let row: V = e.v(ctx.regs.tile_row(r));
                    e.vmovups(row, ptr(rsp + (c_stage + r * STAGE_STRIDE) as i32))?;
                }
                let shape = StoreShape {
                    rows: st.rows,
                    lds: 1,
                    ld_tail: st.tail_of(ld),
                    row_base: bd * st.rows,
                    ld_base: ld,
                };
                emit_store(e, ctx, &shape)?;
            }
        }
        Ok(())
    }

    fn epilogue(&self, e: &mut Emitter, _cx: &Ctx<'_>) -> BrgemmResult<()> {
        e.asm.tilerelease()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::codegen::generate;
    use crate::dispatch::{ComputeEngine, IsaCaps};
    use iced_x86::{Decoder, DecoderOptions, Mnemonic};

    fn mnemonics(desc: &BrgemmDesc) -> Vec<Mnemonic> {
        let code = generate(desc).unwrap();
        let mut dec = Decoder::with_ip(64, &code.bytes[..code.code_len()], 0, DecoderOptions::NONE);
        let mut out = Vec::new();
        while dec.can_decode() {
            out.push(dec.decode().mnemonic());
        }
        out
    }

    fn count(m: &[Mnemonic], x: Mnemonic) -> usize {
        m.iter().filter(|&&i| i == x).count()
    }

    #[test]
    fn test_variants_cover_tails() {
        let d = BrgemmDesc::builder(DataType::Bf16, DataType::Bf16, 40, 40, 64)
            .isa(ComputeEngine::Amx, IsaCaps::amx())
            .build()
            .unwrap();
        let body = TileBody::new(&d);
        // rows {16, 8} × cols {16, 8}
        assert_eq!(body.variants.len(), 4);
        assert!(body.direct_store);
    }

    #[test]
    fn test_single_variant_configures_once() {
        let d = BrgemmDesc::builder(DataType::Bf16, DataType::Bf16, 32, 32, 64)
            .isa(ComputeEngine::Amx, IsaCaps::amx())
            .build()
            .unwrap();
        let m = mnemonics(&d);
        assert_eq!(count(&m, Mnemonic::Ldtilecfg), 1);
        assert_eq!(count(&m, Mnemonic::Tilerelease), 1);
        assert!(m.contains(&Mnemonic::Tdpbf16ps));
        assert!(!m.contains(&Mnemonic::Vmovdqu8));
    }

    #[test]
    fn test_int8_tile_dot_matches_signedness() {
        let d = BrgemmDesc::builder(DataType::U8, DataType::S8, 16, 16, 64)
            .isa(ComputeEngine::Amx, IsaCaps::amx())
            .build()
            .unwrap();
        assert!(mnemonics(&d).contains(&Mnemonic::Tdpbusd));
    }

    #[test]
    fn test_reduction_tail_is_staged() {
        let d = BrgemmDesc::builder(DataType::Bf16, DataType::Bf16, 16, 16, 40)
            .isa(ComputeEngine::Amx, IsaCaps::amx())
            .build()
            .unwrap();
        let m = mnemonics(&d);
        assert!(m.contains(&Mnemonic::Vmovdqu8));
        assert!(m.contains(&Mnemonic::Kmovq));
    }

    #[test]
    fn test_post_ops_go_through_c_staging() {
        let d = BrgemmDesc::builder(DataType::Bf16, DataType::Bf16, 16, 16, 32)
            .isa(ComputeEngine::Amx, IsaCaps::amx())
            .beta(1.0)
            .build()
            .unwrap();
        assert!(!TileBody::new(&d).direct_store);
        let m = mnemonics(&d);
        assert!(m.contains(&Mnemonic::Tilestored));
        assert!(m.contains(&Mnemonic::Vaddps));
    }

    #[test]
    fn test_fp8_staged_as_f16() {
        let d = BrgemmDesc::builder(DataType::F8E4M3, DataType::F8E5M2, 16, 16, 32)
            .isa(ComputeEngine::Amx, IsaCaps::amx_fp16())
            .build()
            .unwrap();
        let m = mnemonics(&d);
        assert!(m.contains(&Mnemonic::Tdpfp16ps));
        assert!(m.contains(&Mnemonic::Vcvtps2ph));
        assert!(m.contains(&Mnemonic::Vpmovzxbw));
    }
}
