//! Vector microkernel: one accumulator per (row, ld block).
//!
//! Float inputs are widened to f32 and fed to `vfmadd231ps`, native bf16
//! pairs go through `vdpbf16ps`, and int8 dword groups through `vpdpbusd`
//! (or its `vpmaddubsw`/`vpmaddwd` emulation).

use iced_x86::code_asm::*;

use super::{dot_u8s8, r64, LoopState, MicrokernelBody};
use crate::compiler::codegen::emitter::Emitter;
use crate::compiler::codegen::fetch;
use crate::compiler::codegen::frame::slot;
use crate::compiler::codegen::regs::{GprPlan, GprRole, Vmm, VmmRole};
use crate::compiler::codegen::store::{emit_store, StoreShape};
use crate::compiler::codegen::Ctx;
use crate::desc::{BrgemmDesc, MicroKind, OperandReuse};
use crate::types::{BrgemmResult, DataType};

/// How padded rows and the A-side compensation interact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PadComp {
    None,
    /// Padded rows add back their share of the precomputed arrays.
    CancelPads,
    /// Valid rows subtract their compensation share in-kernel.
    InKernel,
}

pub struct VectorBody {
    kind: MicroKind,
    pad_comp: PadComp,
}

impl VectorBody {
    pub fn new(desc: &BrgemmDesc) -> Self {
        let pad_comp = if !desc.pads_touch_compensation() {
            PadComp::None
        } else if desc.req_cal_comp_pads {
            PadComp::InKernel
        } else {
            PadComp::CancelPads
        };
        VectorBody {
            kind: desc.kind,
            pad_comp,
        }
    }

    fn decode_tmp(ctx: &Ctx<'_>) -> Vmm {
        ctx.regs.get(VmmRole::DecodeTmp).unwrap_or(Vmm(0))
    }

    fn load_b(
        &self,
        e: &mut Emitter,
        ctx: &Ctx<'_>,
        dst: Vmm,
        kk: usize,
        ld: usize,
        tail: Option<usize>,
    ) -> BrgemmResult<()> {
        let aux_b = GprPlan::reg(GprRole::AuxB);
        let disp = ctx.off.b(kk, ld);
        match self.kind {
            MicroKind::VectorFma => {
                fetch::load_as_f32(e, dst, ctx.desc.dt_b, aux_b, disp, tail, Self::decode_tmp(ctx))
            }
            // bf16 pairs and int8 quads are moved as dwords.
            _ => fetch::load_widen(e, dst, DataType::S32, aux_b, disp, tail, dst),
        }
    }

    fn broadcast_a(
        &self,
        e: &mut Emitter,
        ctx: &Ctx<'_>,
        dst: Vmm,
        bd: usize,
        kk: usize,
        valid: usize,
    ) -> BrgemmResult<()> {
        let d = ctx.desc;
        let aux_a = GprPlan::reg(GprRole::AuxA);
        let disp = ctx.off.a(bd, kk);
        let exact = d.wary_tail_read;
        match self.kind {
            MicroKind::VectorFma => {
                fetch::broadcast_as_f32(e, dst, d.dt_a, aux_a, disp, Self::decode_tmp(ctx))
            }
            MicroKind::VectorBf16Dot => fetch::broadcast_dword(e, dst, aux_a, disp, valid * 2, exact),
            _ => {
                fetch::broadcast_dword(e, dst, aux_a, disp, valid, exact)?;
                if d.s8s8_compensation {
                    let v = e.v(dst);
                    let shift = e.v(ctx.regs.get(VmmRole::InpShift)?);
                    e.vxor(v, v, shift)?;
                }
                Ok(())
            }
        }
    }

    fn dot(&self, e: &mut Emitter, ctx: &Ctx<'_>, acc: Vmm, a: Vmm, b: Vmm) -> BrgemmResult<()> {
        match self.kind {
            MicroKind::VectorFma => {
                let (acc, a, b) = (e.v(acc), e.v(a), e.v(b));
                e.vfmadd231ps(acc, a, b)
            }
            MicroKind::VectorBf16Dot => {
                let (acc, a, b) = (e.v(acc), e.v(a), e.v(b));
                e.vdpbf16ps(acc, a, b)
            }
            _ => dot_u8s8(e, ctx, acc, a, b),
        }
    }

    /// `CompTmp = 128·Σb` (s8s8 shift) `+ zp_a·Σb` for one B vector: what
    /// the store-time compensation removes from a row that read real A.
    fn comp_share(&self, e: &mut Emitter, ctx: &Ctx<'_>, b: Vmm) -> BrgemmResult<Vmm> {
        let d = ctx.desc;
        let tmp = ctx.regs.get(VmmRole::CompTmp)?;
        let t = e.v(tmp);
        e.vzero(t)?;
        if d.zp_a {
            let ones = ctx.regs.get(VmmRole::OneBytes)?;
            let zp = e.v(ctx.regs.get(VmmRole::ZpAShift)?);
            dot_u8s8(e, ctx, tmp, ones, b)?;
            e.vpmulld(t, t, zp)?;
        }
        if d.s8s8_compensation {
            let shift = ctx.regs.get(VmmRole::InpShift)?;
            dot_u8s8(e, ctx, tmp, shift, b)?;
        }
        Ok(tmp)
    }

    /// Apply the compensation share of B vector `b` to column block `ld`.
    fn pad_compensation(
        &self,
        e: &mut Emitter,
        ctx: &Ctx<'_>,
        st: &LoopState,
        ld: usize,
        b: Vmm,
    ) -> BrgemmResult<()> {
        let regs = &ctx.regs;
        match self.pad_comp {
            PadComp::CancelPads if st.is_padded() => {
                let t = self.comp_share(e, ctx, b)?;
                let t = e.v(t);
                for bd in st.padded_rows() {
                    let a = e.v(regs.accm(bd, ld));
                    e.vpaddd(a, a, t)?;
                }
            }
            PadComp::InKernel if !st.valid_rows().is_empty() => {
                let t = self.comp_share(e, ctx, b)?;
                let t = e.v(t);
                for bd in st.valid_rows() {
                    let a = e.v(regs.accm(bd, ld));
                    e.vpsubd(a, a, t)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn unit(
        &self,
        e: &mut Emitter,
        ctx: &Ctx<'_>,
        st: &LoopState,
        kk: usize,
        valid: usize,
    ) -> BrgemmResult<()> {
        let regs = &ctx.regs;
        match regs.reuse {
            OperandReuse::BroadcastOnce => {
                for bd in st.valid_rows() {
                    self.broadcast_a(e, ctx, regs.bcst(bd), bd, kk, valid)?;
                }
                for ld in 0..st.lds {
                    let b = regs.load(ld);
                    self.load_b(e, ctx, b, kk, ld, st.tail_of(ld))?;
                    for bd in st.valid_rows() {
                        self.dot(e, ctx, regs.accm(bd, ld), regs.bcst(bd), b)?;
                    }
                    self.pad_compensation(e, ctx, st, ld, b)?;
                }
            }
            _ => {
                for ld in 0..st.lds {
                    self.load_b(e, ctx, regs.load(ld), kk, ld, st.tail_of(ld))?;
                }
                if ctx.desc.prefetch_b {
                    let ahead = ctx.off.rd_step_b(ctx.desc.blocking.rd_block);
                    for ld in 0..st.lds {
                        let disp = ctx.off.b(kk, ld) + ahead;
                        e.asm.prefetcht0(byte_ptr(r64(GprRole::AuxB) + disp))?;
                    }
                }
                for bd in st.valid_rows() {
                    let a = regs.bcst(0);
                    self.broadcast_a(e, ctx, a, bd, kk, valid)?;
                    for ld in 0..st.lds {
                        self.dot(e, ctx, regs.accm(bd, ld), a, regs.load(ld))?;
                    }
                }
                for ld in 0..st.lds {
                    self.pad_compensation(e, ctx, st, ld, regs.load(ld))?;
                }
            }
        }
        Ok(())
    }
}

impl MicrokernelBody for VectorBody {
    fn zero(&self, e: &mut Emitter, ctx: &Ctx<'_>, st: &LoopState) -> BrgemmResult<()> {
        for bd in 0..st.rows {
            for ld in 0..st.lds {
                let v = e.v(ctx.regs.accm(bd, ld));
                e.vzero(v)?;
            }
        }
        Ok(())
    }

    fn begin(&self, e: &mut Emitter, ctx: &Ctx<'_>, _st: &LoopState) -> BrgemmResult<()> {
        let regs = &ctx.regs;
        if regs.has(VmmRole::OnesWords) {
            let v = e.v(regs.get(VmmRole::OnesWords)?);
            let c = e.constant(0x0001_0001);
            e.vmovups(v, c)?;
        }
        if regs.has(VmmRole::InpShift) {
            let v = e.v(regs.get(VmmRole::InpShift)?);
            let c = e.constant(0x8080_8080);
            e.vmovups(v, c)?;
        }
        if regs.has(VmmRole::ZpAShift) {
            let v = e.v(regs.get(VmmRole::ZpAShift)?);
            e.vpbroadcastd(v, dword_ptr(rsp + slot!(zp_a_val) as i32))?;
            let ones = e.v(regs.get(VmmRole::OneBytes)?);
            let c = e.constant(0x0101_0101);
            e.vmovups(ones, c)?;
        }
        Ok(())
    }

    fn reduce(&self, e: &mut Emitter, ctx: &Ctx<'_>, st: &LoopState, k: usize) -> BrgemmResult<()> {
        if st.valid_rows().is_empty() && !(self.pad_comp == PadComp::CancelPads && st.is_padded()) {
            return Ok(());
        }
        let k_unit = ctx.desc.blocking.k_unit();
        for u in 0..k.div_ceil(k_unit) {
            let kk = u * k_unit;
            self.unit(e, ctx, st, kk, k_unit.min(k - kk))?;
        }
        Ok(())
    }

    fn store(&self, e: &mut Emitter, ctx: &Ctx<'_>, st: &LoopState) -> BrgemmResult<()> {
        emit_store(e, ctx, &StoreShape::block(st))
    }
}
