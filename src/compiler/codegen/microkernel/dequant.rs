//! Dequantizing microkernels.
//!
//! `DecompBody` decodes u8/s8/u4/s4/nf4 weights to f32 in registers,
//! subtracts the zero-point, applies the scale and feeds `vfmadd231ps`.
//! `DynQuantBody` keeps the int8 dot product: per reduction block it
//! accumulates `Σ A·(B - zp)` in s32, then folds the block into the f32
//! accumulators with the row's src scale and the column's weight scale.
//!
//! Scale and zero-point pointers are recomputed at the start of every
//! reduction block from the running K index, so grouped tensors follow the
//! block across group boundaries.

use iced_x86::code_asm::*;

use super::{group_index, quant_pointer, reg, LoopState, MicrokernelBody};
use crate::compiler::codegen::emitter::{at, frame, Emitter};
use crate::compiler::codegen::fetch::{broadcast_as_f32, broadcast_dword, load_widen};
use crate::compiler::codegen::frame::slot;
use crate::compiler::codegen::regs::{GprRole, Vmm, VmmRole};
use crate::compiler::codegen::store::{emit_store, StoreShape};
use crate::compiler::codegen::Ctx;
use crate::desc::QuantParam;
use crate::dispatch::ComputeEngine;
use crate::types::{BrgemmError, BrgemmResult, DataType};

use brgemm_scalar_ops::formats::NF4_CODEBOOK;

fn zero_block(e: &mut Emitter, ctx: &Ctx<'_>, st: &LoopState) -> BrgemmResult<()> {
    for bd in 0..st.rows {
        for ld in 0..st.lds {
            let v = e.v(ctx.regs.accm(bd, ld));
            e.vzero(v)?;
        }
    }
    Ok(())
}

fn advance_ic(e: &mut Emitter, ctx: &Ctx<'_>, k: usize) -> BrgemmResult<()> {
    if ctx.desc.group_size().is_some() {
        e.add_frame(slot!(aux_ic), k)?;
    }
    Ok(())
}

fn codebook_bytes(range: std::ops::Range<usize>) -> Vec<u8> {
    NF4_CODEBOOK[range]
        .iter()
        .flat_map(|v| v.to_bits().to_le_bytes())
        .collect()
}

// ---------------------------------------------------------------------------
// Weight decompression
// ---------------------------------------------------------------------------

pub struct DecompBody;

impl DecompBody {
    fn nf4_lookup(e: &mut Emitter, ctx: &Ctx<'_>, x: Vmm) -> BrgemmResult<()> {
        let regs = &ctx.regs;
        let v = e.v(x);
        let lo = e.v(regs.get(VmmRole::Nf4Table(0))?);
        if ctx.desc.engine != ComputeEngine::Avx2 {
            return e.vpermps(v, v, lo);
        }
        // ymm vpermps sees 3 index bits: look up both halves and blend on
        // index > 7.
        let hi = e.v(regs.get(VmmRole::Nf4Table(1))?);
        let seven = e.v(regs.get(VmmRole::Nf4Seven)?);
        let tmp = e.v(regs.get(VmmRole::Nf4Tmp)?);
        let mask = e.v(regs.get(VmmRole::DecodeTmp)?);
        e.vpcmpgtd(mask, v, seven)?;
        e.vpermps(tmp, v, hi)?;
        e.vpermps(v, v, lo)?;
        e.vblendvps(v, v, tmp, mask)
    }

    /// Decode B column block `ld` at reduction offset `kk` into `Load(ld)`
    /// and, for 4-bit types with a second K value, `Load2(ld)`.
    fn decode(
        &self,
        e: &mut Emitter,
        ctx: &Ctx<'_>,
        st: &LoopState,
        ld: usize,
        kk: usize,
        second: bool,
    ) -> BrgemmResult<()> {
        let d = ctx.desc;
        let regs = &ctx.regs;
        let tail = st.tail_of(ld);
        let tmp = regs.get(VmmRole::DecodeTmp)?;
        let dst = regs.load(ld);
        let v = e.v(dst);
        let aux_b = reg(GprRole::AuxB);
        let disp = ctx.off.b(kk, ld);
        let mut outs = vec![dst];

        match d.dt_b {
            DataType::U8 | DataType::S8 => {
                load_widen(e, dst, d.dt_b, aux_b, disp, tail, tmp)?;
                e.vcvtdq2ps(v, v)?;
            }
            DataType::U4 | DataType::Nf4 | DataType::S4 => {
                load_widen(e, dst, DataType::U8, aux_b, disp, tail, tmp)?;
                let low = regs.load2(ld);
                let l = e.v(low);
                if d.dt_b == DataType::S4 {
                    if second {
                        e.vpslld(l, v, 28)?;
                        e.vpsrad(l, l, 28)?;
                    }
                    e.vpslld(v, v, 24)?;
                    e.vpsrad(v, v, 28)?;
                } else {
                    if second {
                        let nib = e.constant(0x0F);
                        e.vand(l, v, nib)?;
                    }
                    e.vpsrld(v, v, 4)?;
                }
                if second {
                    outs.push(low);
                }
                for &r in &outs {
                    if d.dt_b == DataType::Nf4 {
                        Self::nf4_lookup(e, ctx, r)?;
                    } else {
                        let rv = e.v(r);
                        e.vcvtdq2ps(rv, rv)?;
                    }
                }
            }
            other => {
                return Err(BrgemmError::Unsupported(format!("{other} weights")));
            }
        }

        let Some(wd) = d.wei_decomp else {
            return Ok(());
        };
        let t = e.v(tmp);
        if let Some(zp) = wd.zero_points {
            let operand = if zp.param.is_per_n() {
                let esize = zp.dt.size_bytes();
                load_widen(e, tmp, zp.dt, reg(GprRole::Local1), ctx.off.per_n(ld, esize), tail, tmp)?;
                if zp.dt != DataType::F32 {
                    e.vcvtdq2ps(t, t)?;
                }
                t
            } else {
                e.v(regs.get(VmmRole::DecompZp)?)
            };
            for &r in &outs {
                let rv = e.v(r);
                e.vsubps(rv, rv, operand)?;
            }
        }
        if let Some(scales) = wd.scales {
            let operand = if scales.is_per_n() {
                load_widen(e, tmp, DataType::F32, reg(GprRole::Local0), ctx.off.per_n(ld, 4), tail, tmp)?;
                t
            } else {
                e.v(regs.get(VmmRole::DecompScale)?)
            };
            for &r in &outs {
                let rv = e.v(r);
                e.vmulps(rv, rv, operand)?;
            }
        }
        Ok(())
    }

    /// Point `Local0` at the scales and `Local1` at the zero-points of the
    /// current group, and load the per-tensor values.
    fn locate(&self, e: &mut Emitter, ctx: &Ctx<'_>) -> BrgemmResult<()> {
        let d = ctx.desc;
        let Some(wd) = d.wei_decomp else {
            return Ok(());
        };
        let (l0, l1) = (reg(GprRole::Local0), reg(GprRole::Local1));
        let group = match wd.group_size {
            Some(size) => {
                group_index(e, l1, size)?;
                Some(l1)
            }
            None => None,
        };
        if let Some(scales) = wd.scales {
            quant_pointer(e, l0, slot!(wei_scales), scales, 4, group)?;
            if !scales.is_per_n() {
                let v = e.v(ctx.regs.get(VmmRole::DecompScale)?);
                e.vbroadcastss(v, dword_ptr(l0.r64()))?;
            }
        }
        if let Some(zp) = wd.zero_points {
            quant_pointer(e, l1, slot!(wei_zp), zp.param, zp.dt.size_bytes(), group)?;
            if !zp.param.is_per_n() {
                let v = e.v(ctx.regs.get(VmmRole::DecompZp)?);
                if zp.dt == DataType::F32 {
                    e.vbroadcastss(v, dword_ptr(l1.r64()))?;
                } else {
                    e.vpbroadcastb(v, byte_ptr(l1.r64()))?;
                    let low = e.constant(0xFF);
                    e.vand(v, v, low)?;
                    e.vcvtdq2ps(v, v)?;
                }
            }
        }
        Ok(())
    }
}

impl MicrokernelBody for DecompBody {
    fn zero(&self, e: &mut Emitter, ctx: &Ctx<'_>, st: &LoopState) -> BrgemmResult<()> {
        zero_block(e, ctx, st)
    }

    fn begin(&self, e: &mut Emitter, ctx: &Ctx<'_>, _st: &LoopState) -> BrgemmResult<()> {
        if ctx.desc.dt_b != DataType::Nf4 {
            return Ok(());
        }
        let regs = &ctx.regs;
        if ctx.desc.engine == ComputeEngine::Avx2 {
            for (i, range) in [(0, 0..8), (1, 8..16)] {
                let v = e.v(regs.get(VmmRole::Nf4Table(i))?);
                let table = e.blob(codebook_bytes(range));
                e.vmovups(v, table)?;
            }
            let seven = e.v(regs.get(VmmRole::Nf4Seven)?);
            let c = e.constant(7);
            e.vmovups(seven, c)?;
        } else {
            let v = e.v(regs.get(VmmRole::Nf4Table(0))?);
            let table = e.blob(codebook_bytes(0..16));
            e.vmovups(v, table)?;
        }
        Ok(())
    }

    fn reduce(&self, e: &mut Emitter, ctx: &Ctx<'_>, st: &LoopState, k: usize) -> BrgemmResult<()> {
        let d = ctx.desc;
        let regs = &ctx.regs;
        self.locate(e, ctx)?;
        let pack = d.blocking.pack;
        let a = regs.bcst(0);
        let aux_a = reg(GprRole::AuxA);
        for u in 0..k.div_ceil(pack) {
            let kk = u * pack;
            let second = pack == 2 && kk + 1 < k;
            for ld in 0..st.lds {
                self.decode(e, ctx, st, ld, kk, second)?;
            }
            for bd in 0..st.rows {
                broadcast_as_f32(e, a, d.dt_a, aux_a, ctx.off.a(bd, kk), a)?;
                for ld in 0..st.lds {
                    let (acc, av, b) = (e.v(regs.accm(bd, ld)), e.v(a), e.v(regs.load(ld)));
                    e.vfmadd231ps(acc, av, b)?;
                }
                if second {
                    broadcast_as_f32(e, a, d.dt_a, aux_a, ctx.off.a(bd, kk + 1), a)?;
                    for ld in 0..st.lds {
                        let (acc, av, b) = (e.v(regs.accm(bd, ld)), e.v(a), e.v(regs.load2(ld)));
                        e.vfmadd231ps(acc, av, b)?;
                    }
                }
            }
        }
        advance_ic(e, ctx, k)
    }

    fn store(&self, e: &mut Emitter, ctx: &Ctx<'_>, st: &LoopState) -> BrgemmResult<()> {
        emit_store(e, ctx, &StoreShape::block(st))
    }
}

// ---------------------------------------------------------------------------
// Dynamic quantization
// ---------------------------------------------------------------------------

pub struct DynQuantBody;

impl DynQuantBody {
    /// Load the weight zero-points of the current group into `DynZp`,
    /// each byte of a dword holding the column's zero-point.
    fn load_zero_points(
        &self,
        e: &mut Emitter,
        ctx: &Ctx<'_>,
        st: &LoopState,
        zp: QuantParam,
    ) -> BrgemmResult<()> {
        let l1 = reg(GprRole::Local1);
        if !zp.is_per_n() {
            let v = e.v(ctx.regs.get(VmmRole::DynZp(0))?);
            return e.vpbroadcastb(v, byte_ptr(l1.r64()));
        }
        for ld in 0..st.lds {
            let r = ctx.regs.get(VmmRole::DynZp(ld))?;
            load_widen(e, r, DataType::U8, l1, ctx.off.per_n(ld, 1), st.tail_of(ld), r)?;
            let v = e.v(r);
            let spread = e.constant(0x0101_0101);
            e.vpmulld(v, v, spread)?;
        }
        Ok(())
    }

    fn locate(&self, e: &mut Emitter, ctx: &Ctx<'_>, st: &LoopState) -> BrgemmResult<()> {
        let Some(dq) = ctx.desc.dyn_quant else {
            return Err(BrgemmError::InvalidDescriptor(
                "dynamic quantization body without parameters".into(),
            ));
        };
        let (l0, l1) = (reg(GprRole::Local0), reg(GprRole::Local1));
        let load_group = |e: &mut Emitter| -> BrgemmResult<Option<_>> {
            match dq.group_size {
                Some(size) => {
                    group_index(e, l1, size)?;
                    Ok(Some(l1))
                }
                None => Ok(None),
            }
        };
        let group = load_group(e)?;
        quant_pointer(e, l0, slot!(wei_scales), dq.wei_scales, 4, group)?;
        if let Some(zp) = dq.wei_zero_points {
            quant_pointer(e, l1, slot!(wei_zp), zp, 1, group)?;
            self.load_zero_points(e, ctx, st, zp)?;
        }
        // src scales: [src_scales + m_src_off + group * 4]
        let group = load_group(e)?;
        let p = l1.r64();
        match group {
            Some(_) => {
                e.asm.shl(p, 2u32)?;
                e.asm.add(p, frame(slot!(src_scales)))?;
            }
            None => e.asm.mov(p, frame(slot!(src_scales)))?,
        }
        e.asm.add(p, frame(slot!(m_src_off)))?;
        Ok(())
    }
}

impl MicrokernelBody for DynQuantBody {
    fn zero(&self, e: &mut Emitter, ctx: &Ctx<'_>, st: &LoopState) -> BrgemmResult<()> {
        zero_block(e, ctx, st)
    }

    fn begin(&self, e: &mut Emitter, ctx: &Ctx<'_>, _st: &LoopState) -> BrgemmResult<()> {
        let regs = &ctx.regs;
        if regs.has(VmmRole::NegOne) {
            let v = e.v(regs.get(VmmRole::NegOne)?);
            let c = e.constant(u32::MAX);
            e.vmovups(v, c)?;
        }
        if regs.has(VmmRole::LowHalfMask) {
            let v = e.v(regs.get(VmmRole::LowHalfMask)?);
            let c = e.constant(0x0F0F_0F0F);
            e.vmovups(v, c)?;
        }
        Ok(())
    }

    fn reduce(&self, e: &mut Emitter, ctx: &Ctx<'_>, st: &LoopState, k: usize) -> BrgemmResult<()> {
        let d = ctx.desc;
        let regs = &ctx.regs;
        let dq = d.dyn_quant.ok_or_else(|| {
            BrgemmError::InvalidDescriptor("dynamic quantization body without parameters".into())
        })?;
        self.locate(e, ctx, st)?;

        for bd in 0..st.rows {
            for ld in 0..st.lds {
                let v = e.v(regs.accm_tmp(bd, ld));
                e.vzero(v)?;
            }
        }

        let four_bit = d.dt_b.is_4bit();
        let k_unit = d.blocking.k_unit();
        let a = regs.bcst(0);
        let aux_a = reg(GprRole::AuxA);
        let aux_b = reg(GprRole::AuxB);
        let zp_per_n = dq.wei_zero_points.map(|z| z.is_per_n());
        for u in 0..k.div_ceil(k_unit) {
            let kk = u * k_unit;
            for ld in 0..st.lds {
                let b = regs.load(ld);
                load_widen(e, b, DataType::S32, aux_b, ctx.off.b(kk, ld), st.tail_of(ld), b)?;
                if four_bit {
                    let mask = e.v(regs.get(VmmRole::LowHalfMask)?);
                    let (bv, lo) = (e.v(b), e.v(regs.load2(ld)));
                    // Low nibbles carry K values 4..7 of the group.
                    e.vand(lo, bv, mask)?;
                    e.vpsrld(bv, bv, 4)?;
                    e.vand(bv, bv, mask)?;
                }
            }
            let halves: &[(usize, bool)] = if four_bit { &[(0, false), (4, true)] } else { &[(0, false)] };
            for bd in 0..st.rows {
                for &(aoff, low) in halves {
                    if kk + aoff >= k {
                        continue;
                    }
                    let valid = 4.min(k - kk - aoff);
                    broadcast_dword(e, a, aux_a, ctx.off.a(bd, kk + aoff), valid, d.wary_tail_read)?;
                    for ld in 0..st.lds {
                        let b = if low { regs.load2(ld) } else { regs.load(ld) };
                        let (acc, bv, av) = (e.v(regs.accm_tmp(bd, ld)), e.v(b), e.v(a));
                        e.vpdpbusd(acc, bv, av)?;
                    }
                    if let Some(per_n) = zp_per_n {
                        let neg = e.v(regs.get(VmmRole::NegA)?);
                        let ones = e.v(regs.get(VmmRole::NegOne)?);
                        let av = e.v(a);
                        e.vxor(neg, av, ones)?;
                        e.vpsubb(neg, neg, ones)?;
                        for ld in 0..st.lds {
                            let zp = regs.get(VmmRole::DynZp(if per_n { ld } else { 0 }))?;
                            let (acc, zv) = (e.v(regs.accm_tmp(bd, ld)), e.v(zp));
                            e.vpdpbusd(acc, zv, neg)?;
                        }
                    }
                }
            }
        }

        // Fold: acc += f32(tmp) * src_scale[m] * wei_scale[n]
        let l0 = reg(GprRole::Local0);
        for ld in 0..st.lds {
            let s = regs.load(ld);
            if dq.wei_scales.is_per_n() {
                load_widen(e, s, DataType::F32, l0, ctx.off.per_n(ld, 4), st.tail_of(ld), s)?;
            } else {
                let v = e.v(s);
                e.vbroadcastss(v, dword_ptr(l0.r64()))?;
            }
        }
        let src_row = dq.src_scale_stride * 4;
        for bd in 0..st.rows {
            let av = e.v(a);
            e.vbroadcastss(av, at(reg(GprRole::Local1), (bd * src_row) as i32))?;
            for ld in 0..st.lds {
                let t = e.v(regs.accm_tmp(bd, ld));
                let acc = e.v(regs.accm(bd, ld));
                let s = e.v(regs.load(ld));
                e.vcvtdq2ps(t, t)?;
                e.vmulps(t, t, av)?;
                e.vfmadd231ps(acc, t, s)?;
            }
        }
        advance_ic(e, ctx, k)
    }

    fn store(&self, e: &mut Emitter, ctx: &Ctx<'_>, st: &LoopState) -> BrgemmResult<()> {
        emit_store(e, ctx, &StoreShape::block(st))
    }
}
