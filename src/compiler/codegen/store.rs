//! Store pipeline: from accumulators to C or D.
//!
//! Runs once per block after accumulation. Compensation and alpha/beta
//! always apply; everything from the int → f32 widening onward runs only
//! when `do_post_ops` is set at call time, in which case the result goes to
//! D in `dt_d`. Otherwise the accumulators go to C in the accumulator type.
//!
//! Scratch vectors are the four low registers; the register plan keeps
//! them clear of accumulators during this phase.

use iced_x86::code_asm::*;

use brgemm_scalar_ops::formats::{E4M3_MAX_CODE, E5M2_MAX_CODE, S32_UPPER_F32};

use super::microkernel::{r64, reg, LoopState};
use crate::compiler::codegen::emitter::{at, frame, kmem, Emitter, V, K_TAIL};
use crate::compiler::codegen::fetch::{load_as_f32, load_widen};
use crate::compiler::codegen::frame::slot;
use crate::compiler::codegen::post_ops::{Cell, RhsMeta};
use crate::compiler::codegen::regs::{Gpr, GprRole, Vmm};
use crate::compiler::codegen::Ctx;
use crate::desc::Broadcast;
use crate::types::{BrgemmError, BrgemmResult, DataType};

const TMP0: Vmm = Vmm(0);
const TMP1: Vmm = Vmm(1);
const TMP2: Vmm = Vmm(2);
const TMP3: Vmm = Vmm(3);

/// Accumulator cells to store and where they sit in C/D.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreShape {
    pub rows: usize,
    pub lds: usize,
    /// Valid columns of the last ld block when it is partial.
    pub ld_tail: Option<usize>,
    /// First row relative to the C/D block pointers.
    pub row_base: usize,
    /// First ld block relative to the C/D ld pointers.
    pub ld_base: usize,
}

impl StoreShape {
    pub fn block(st: &LoopState) -> Self {
        StoreShape {
            rows: st.rows,
            lds: st.lds,
            ld_tail: st.ld_tail,
            row_base: 0,
            ld_base: 0,
        }
    }

    fn tail_of(&self, ld: usize) -> Option<usize> {
        if ld + 1 == self.lds {
            self.ld_tail
        } else {
            None
        }
    }

    fn cells(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.rows).flat_map(move |bd| (0..self.lds).map(move |ld| (bd, ld)))
    }
}

struct Store<'c, 'a> {
    ctx: &'c Ctx<'a>,
    shape: &'c StoreShape,
}

impl Store<'_, '_> {
    fn acc(&self, bd: usize, ld: usize) -> Vmm {
        self.ctx.regs.accm(bd, ld)
    }

    fn c_disp(&self, bd: usize, ld: usize) -> i32 {
        self.ctx.off.c(self.shape.row_base + bd, self.shape.ld_base + ld)
    }

    fn d_disp(&self, bd: usize, ld: usize) -> i32 {
        self.ctx.off.d(self.shape.row_base + bd, self.shape.ld_base + ld)
    }

    fn per_n_disp(&self, ld: usize, esize: usize) -> i32 {
        self.ctx.off.per_n(self.shape.ld_base + ld, esize)
    }

    fn valid(&self, e: &Emitter, ld: usize) -> usize {
        self.shape.tail_of(ld).unwrap_or(e.lanes())
    }

    /// `vop acc, acc, src` over every cell.
    fn each_acc(
        &self,
        e: &mut Emitter,
        mut op: impl FnMut(&mut Emitter, Vmm) -> BrgemmResult<()>,
    ) -> BrgemmResult<()> {
        for (bd, ld) in self.shape.cells() {
            op(e, self.acc(bd, ld))?;
        }
        Ok(())
    }

    fn cvt_all(&self, e: &mut Emitter) -> BrgemmResult<()> {
        self.each_acc(e, |e, a| {
            let v = e.v(a);
            e.vcvtdq2ps(v, v)
        })
    }

    /// `Scratch3 = [slot] + n_idx * esize`: the per-N element of the
    /// current ld block.
    fn per_n_ptr(&self, e: &mut Emitter, base_slot: usize, esize: usize) -> BrgemmResult<Gpr> {
        let (p, n, out) = (r64(GprRole::Scratch), r64(GprRole::Scratch2), reg(GprRole::Scratch3));
        e.asm.mov(p, frame(base_slot))?;
        e.asm.mov(n, frame(slot!(n_idx)))?;
        e.asm.lea(out.r64(), ptr(p + n * esize as u32))?;
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // 1. Compensation
    // -----------------------------------------------------------------------

    fn compensate(&self, e: &mut Emitter) -> BrgemmResult<()> {
        let d = self.ctx.desc;
        let mut skip = e.label();
        e.asm.cmp(frame(slot!(do_comp)), 0)?;
        e.asm.je(skip)?;

        // With in-kernel compensation the A-side arrays are never read.
        let bulk_a = !d.comp_in_kernel();
        if d.zp_a && bulk_a {
            let p = self.per_n_ptr(e, slot!(zp_comp_a), 4)?;
            let zp = e.v(TMP1);
            e.vpbroadcastd(zp, dword_ptr(rsp + slot!(zp_a_val) as i32))?;
            for ld in 0..self.shape.lds {
                load_widen(e, TMP0, DataType::S32, p, self.per_n_disp(ld, 4), self.shape.tail_of(ld), TMP2)?;
                let t = e.v(TMP0);
                e.vpmulld(t, t, zp)?;
                for bd in 0..self.shape.rows {
                    let a = e.v(self.acc(bd, ld));
                    e.vpaddd(a, a, t)?;
                }
            }
        }
        if d.s8s8_compensation && bulk_a {
            let p = self.per_n_ptr(e, slot!(comp), 4)?;
            for ld in 0..self.shape.lds {
                load_widen(e, TMP0, DataType::S32, p, self.per_n_disp(ld, 4), self.shape.tail_of(ld), TMP2)?;
                let t = e.v(TMP0);
                for bd in 0..self.shape.rows {
                    let a = e.v(self.acc(bd, ld));
                    e.vpaddd(a, a, t)?;
                }
            }
        }
        if d.zp_b {
            let p = r64(GprRole::Scratch);
            e.asm.mov(p, frame(slot!(zp_comp_b)))?;
            e.asm.add(p, frame(slot!(m_off4)))?;
            let t = e.v(TMP0);
            for bd in 0..self.shape.rows {
                let row = ((self.shape.row_base + bd) * 4) as i32;
                e.vpbroadcastd(t, dword_ptr(p + row))?;
                for ld in 0..self.shape.lds {
                    let a = e.v(self.acc(bd, ld));
                    e.vpaddd(a, a, t)?;
                }
            }
        }
        e.bind(&mut skip)
    }

    // -----------------------------------------------------------------------
    // 2. alpha / beta
    // -----------------------------------------------------------------------

    /// Returns whether integer accumulators were converted to f32.
    fn alpha_beta(&self, e: &mut Emitter) -> BrgemmResult<bool> {
        let d = self.ctx.desc;
        let int = d.is_int_acc();
        let converted = int && (d.alpha != 1.0 || (d.beta != 0.0 && d.beta != 1.0));
        if converted {
            self.cvt_all(e)?;
        }
        if d.alpha != 1.0 {
            let alpha = e.constant_f32(d.alpha);
            self.each_acc(e, |e, a| {
                let v = e.v(a);
                e.vmulps(v, v, alpha)
            })?;
        }
        if d.beta == 0.0 {
            return Ok(converted);
        }
        let aux_c = reg(GprRole::AuxC);
        for (bd, ld) in self.shape.cells() {
            load_widen(e, TMP0, d.dt_c, aux_c, self.c_disp(bd, ld), self.shape.tail_of(ld), TMP1)?;
            let (a, t) = (e.v(self.acc(bd, ld)), e.v(TMP0));
            if converted {
                e.vcvtdq2ps(t, t)?;
            }
            if d.beta == 1.0 {
                if int && !converted {
                    e.vpaddd(a, a, t)?;
                } else {
                    e.vaddps(a, a, t)?;
                }
            } else {
                let beta = e.constant_f32(d.beta);
                e.vfmadd231ps(a, t, beta)?;
            }
        }
        Ok(converted)
    }

    // -----------------------------------------------------------------------
    // Raw path: accumulator type to C
    // -----------------------------------------------------------------------

    fn raw(&self, e: &mut Emitter, converted: bool) -> BrgemmResult<()> {
        let aux_c = reg(GprRole::AuxC);
        for (bd, ld) in self.shape.cells() {
            let a = self.acc(bd, ld);
            if converted {
                to_s32(e, a)?;
            }
            store_dwords(e, a, aux_c, self.c_disp(bd, ld), self.shape.tail_of(ld))?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Post path: f32 pipeline to D
    // -----------------------------------------------------------------------

    fn post(&self, e: &mut Emitter, converted: bool) -> BrgemmResult<()> {
        let d = self.ctx.desc;
        if d.is_int_acc() && !converted {
            self.cvt_all(e)?;
        }

        match d.scales {
            Some(Broadcast::PerN) => {
                let p = self.per_n_ptr(e, slot!(scales), 4)?;
                self.per_n_apply(e, p, DataType::F32, 4, |e, a, t| e.vmulps(a, a, t))?;
            }
            Some(Broadcast::PerTensor) => {
                self.broadcast_apply(e, slot!(scales), |e, a, t| e.vmulps(a, a, t))?;
            }
            None => {}
        }

        if let Some(dt) = d.dt_bias {
            let esize = dt.size_bytes();
            let p = self.per_n_ptr(e, slot!(bias), esize)?;
            self.per_n_apply(e, p, dt, esize, |e, a, t| e.vaddps(a, a, t))?;
        }

        if !d.post_ops.is_empty() {
            let cells: Vec<Cell> = self
                .shape
                .cells()
                .map(|(bd, ld)| Cell {
                    reg: self.acc(bd, ld),
                    ld: self.shape.ld_base + ld,
                    tail: self.shape.tail_of(ld),
                })
                .collect();
            let rhs = RhsMeta {
                ptr: reg(GprRole::Scratch),
                tmp: TMP0,
                tmp2: TMP1,
            };
            let mut sum = |e: &mut Emitter, scale: f32, zero_point: i32| self.sum(e, scale, zero_point);
            self.ctx.injector.compute_vector_range(e, &cells, &rhs, &mut sum)?;
        }

        if d.dst_scales {
            self.broadcast_apply(e, slot!(dst_scales), |e, a, t| e.vmulps(a, a, t))?;
        }

        match d.zp_c {
            Some(Broadcast::PerTensor) => {
                let p = r64(GprRole::Scratch);
                e.asm.mov(p, frame(slot!(zp_c)))?;
                let t = e.v(TMP0);
                e.vpbroadcastd(t, dword_ptr(p))?;
                e.vcvtdq2ps(t, t)?;
                self.each_acc(e, |e, a| {
                    let v = e.v(a);
                    e.vaddps(v, v, t)
                })?;
            }
            Some(Broadcast::PerN) => {
                let p = self.per_n_ptr(e, slot!(zp_c), 4)?;
                self.per_n_apply(e, p, DataType::S32, 4, |e, a, t| e.vaddps(a, a, t))?;
            }
            None => {}
        }

        let aux_d = reg(GprRole::AuxD);
        for (bd, ld) in self.shape.cells() {
            let tail = self.shape.tail_of(ld);
            let valid = self.valid(e, ld);
            convert_store(e, self.ctx, self.acc(bd, ld), aux_d, self.d_disp(bd, ld), tail, valid)?;
        }
        Ok(())
    }

    /// Load a per-N vector of `dt` as f32 per ld block and combine it into
    /// every row.
    fn per_n_apply(
        &self,
        e: &mut Emitter,
        p: Gpr,
        dt: DataType,
        esize: usize,
        op: impl Fn(&mut Emitter, V, V) -> BrgemmResult<()>,
    ) -> BrgemmResult<()> {
        for ld in 0..self.shape.lds {
            load_as_f32(e, TMP0, dt, p, self.per_n_disp(ld, esize), self.shape.tail_of(ld), TMP1)?;
            let t = e.v(TMP0);
            for bd in 0..self.shape.rows {
                let a = e.v(self.acc(bd, ld));
                op(e, a, t)?;
            }
        }
        Ok(())
    }

    /// Broadcast the f32 behind `[slot]` and combine it into every cell.
    fn broadcast_apply(
        &self,
        e: &mut Emitter,
        base_slot: usize,
        op: impl Fn(&mut Emitter, V, V) -> BrgemmResult<()>,
    ) -> BrgemmResult<()> {
        let p = r64(GprRole::Scratch);
        e.asm.mov(p, frame(base_slot))?;
        let t = e.v(TMP0);
        e.vbroadcastss(t, dword_ptr(p))?;
        self.each_acc(e, |e, a| {
            let v = e.v(a);
            op(e, v, t)
        })
    }

    /// `acc += scale · (D - zero_point)` with D read in `dt_d`.
    fn sum(&self, e: &mut Emitter, scale: f32, zero_point: i32) -> BrgemmResult<()> {
        let d = self.ctx.desc;
        let aux_d = reg(GprRole::AuxD);
        for (bd, ld) in self.shape.cells() {
            load_as_f32(e, TMP2, d.dt_d, aux_d, self.d_disp(bd, ld), self.shape.tail_of(ld), TMP3)?;
            let (a, t) = (e.v(self.acc(bd, ld)), e.v(TMP2));
            if zero_point != 0 {
                let zp = e.constant_f32(zero_point as f32);
                e.vsubps(t, t, zp)?;
            }
            if scale == 1.0 {
                e.vaddps(a, a, t)?;
            } else {
                let s = e.constant_f32(scale);
                e.vfmadd231ps(a, t, s)?;
            }
        }
        Ok(())
    }
}

/// f32 → s32 with saturation.
fn to_s32(e: &mut Emitter, x: Vmm) -> BrgemmResult<()> {
    clamp(e, x, -2_147_483_648.0, S32_UPPER_F32)?;
    let v = e.v(x);
    e.vcvtps2dq(v, v)
}

fn clamp(e: &mut Emitter, x: Vmm, lo: f32, hi: f32) -> BrgemmResult<()> {
    let v = e.v(x);
    let (l, h) = (e.constant_f32(lo), e.constant_f32(hi));
    e.vmaxps(v, v, l)?;
    e.vminps(v, v, h)
}

/// Store 32-bit lanes, masked on the ld tail.
fn store_dwords(e: &mut Emitter, x: Vmm, base: Gpr, disp: i32, tail: Option<usize>) -> BrgemmResult<()> {
    let v = e.v(x);
    let m = at(base, disp);
    match tail {
        None => e.vmovups_st(m, v),
        Some(_) if e.evex() => e.vmovups_st(kmem(m, K_TAIL), v),
        Some(n) => {
            let mask = e.v(TMP3);
            let lanes = e.tail_mask_vec(n);
            e.vmovups(mask, lanes)?;
            e.vmaskmovps_st(m, mask, v)
        }
    }
}

/// Store `valid` 16-bit lanes from the half-width register `h`.
fn store_words(e: &mut Emitter, h: Vmm, base: Gpr, disp: i32, tail: Option<usize>, valid: usize) -> BrgemmResult<()> {
    if !e.evex() {
        let x = e.x(h);
        return e.store_bytes(x, base, disp, valid * 2);
    }
    let v = e.h(h);
    let m = at(base, disp);
    match tail {
        Some(_) => e.vmovdqu16_st(kmem(m, K_TAIL), v),
        None => e.vmovups_st(m, v),
    }
}

/// Narrow dword lanes of `x` (each holding one byte value) into the low
/// bytes of `out`'s xmm. Values must already fit their byte range.
fn narrow_bytes(e: &mut Emitter, x: Vmm, out: Vmm, signed: bool) -> BrgemmResult<()> {
    let v = e.v(x);
    if e.evex() {
        let o = e.x(out);
        return e.vpmovdb(o.into(), v);
    }
    let (y, o) = (e.v(out), e.x(out));
    e.vpackssdw(y, v, v)?;
    e.vpermq(y, y, 0x08)?;
    if signed {
        e.vpacksswb(o, o, o)
    } else {
        e.vpackuswb(o, o, o)
    }
}

/// Narrow dword lanes (low 16 bits significant) into words of `out`'s half.
fn narrow_words(e: &mut Emitter, x: Vmm, out: Vmm) -> BrgemmResult<()> {
    let v = e.v(x);
    if e.evex() {
        let h = e.h(out);
        return e.vpmovdw(h.into(), v);
    }
    let y = e.v(out);
    e.vpackusdw(y, v, v)?;
    e.vpermq(y, y, 0x08)
}

/// bf16 round-to-nearest-even without native support: keep the high half
/// of `x + 0x7FFF + ((x >> 16) & 1)`.
fn emulate_bf16(e: &mut Emitter, x: Vmm, tmp: Vmm) -> BrgemmResult<()> {
    let (v, t) = (e.v(x), e.v(tmp));
    let one = e.constant(1);
    let bias = e.constant(0x7FFF);
    e.vpsrld(t, v, 16)?;
    e.vand(t, t, one)?;
    e.vpaddd(v, v, t)?;
    e.vpaddd(v, v, bias)?;
    e.vpsrld(v, v, 16)
}

/// f32 → fp8 code in each dword lane, round-to-nearest-even, saturating to
/// the largest finite code.
///
/// Scaling by `2^-(127 - bias)` lines the fp8 exponent up with the low f32
/// exponent range, so normals and denormals both end up with the fp8
/// fields at a fixed bit position.
fn encode_fp8(e: &mut Emitter, dt: DataType, x: Vmm, sign: Vmm) -> BrgemmResult<()> {
    let (scale, shift, max_code) = match dt {
        DataType::F8E4M3 => (0x0380_0000u32, 20, E4M3_MAX_CODE),
        _ => (0x0780_0000u32, 21, E5M2_MAX_CODE),
    };
    let (v, s) = (e.v(x), e.v(sign));
    let sign_bit = e.constant(0x80);
    let abs = e.constant(0x7FFF_FFFF);
    e.vpsrld(s, v, 24)?;
    e.vand(s, s, sign_bit)?;
    e.vand(v, v, abs)?;
    let scale = e.constant(scale);
    e.vmulps(v, v, scale)?;
    // round: + (lsb of the kept part) + half - 1
    let one = e.constant(1);
    let half = e.constant((1u32 << (shift - 1)) - 1);
    let t = e.v(TMP3);
    e.vpsrld(t, v, shift)?;
    e.vand(t, t, one)?;
    e.vpaddd(v, v, t)?;
    e.vpaddd(v, v, half)?;
    e.vpsrld(v, v, shift)?;
    let max = e.constant(u32::from(max_code));
    e.vpminud(v, v, max)?;
    e.vor(v, v, s)
}

/// Convert an f32 accumulator to `dt_d` and store it at `[base + disp]`.
fn convert_store(
    e: &mut Emitter,
    ctx: &Ctx<'_>,
    x: Vmm,
    base: Gpr,
    disp: i32,
    tail: Option<usize>,
    valid: usize,
) -> BrgemmResult<()> {
    let d = ctx.desc;
    match d.dt_d {
        DataType::F32 => store_dwords(e, x, base, disp, tail),
        DataType::S32 => {
            to_s32(e, x)?;
            store_dwords(e, x, base, disp, tail)
        }
        DataType::S8 | DataType::U8 => {
            let signed = d.dt_d == DataType::S8;
            let (lo, hi) = if signed { (-128.0, 127.0) } else { (0.0, 255.0) };
            clamp(e, x, lo, hi)?;
            let v = e.v(x);
            e.vcvtps2dq(v, v)?;
            narrow_bytes(e, x, TMP2, signed)?;
            let o = e.x(TMP2);
            e.store_bytes(o, base, disp, valid)
        }
        DataType::Bf16 => {
            if e.evex() && d.caps.avx512_bf16 {
                let (h, v) = (e.h(TMP2), e.v(x));
                e.vcvtneps2bf16(h, v)?;
            } else {
                emulate_bf16(e, x, TMP1)?;
                narrow_words(e, x, TMP2)?;
            }
            store_words(e, TMP2, base, disp, tail, valid)
        }
        DataType::F16 => {
            let (h, v) = (e.h(TMP2), e.v(x));
            e.vcvtps2ph(h.into(), v)?;
            store_words(e, TMP2, base, disp, tail, valid)
        }
        DataType::F8E5M2 | DataType::F8E4M3 => {
            encode_fp8(e, d.dt_d, x, TMP1)?;
            narrow_bytes(e, x, TMP2, false)?;
            let o = e.x(TMP2);
            e.store_bytes(o, base, disp, valid)
        }
        other => Err(BrgemmError::Unsupported(format!("destination type {other}"))),
    }
}

/// Run the store pipeline over the accumulators of `shape`.
pub fn emit_store(e: &mut Emitter, ctx: &Ctx<'_>, shape: &StoreShape) -> BrgemmResult<()> {
    let d = ctx.desc;
    let s = Store { ctx, shape };
    if d.has_compensation() {
        s.compensate(e)?;
    }
    let converted = s.alpha_beta(e)?;
    if !d.post_ops_applicable() {
        return s.raw(e, converted);
    }
    let mut raw = e.label();
    let mut done = e.label();
    e.asm.cmp(frame(slot!(do_post_ops)), 0)?;
    e.asm.je(raw)?;
    s.post(e, converted)?;
    e.asm.jmp(done)?;
    e.bind(&mut raw)?;
    s.raw(e, converted)?;
    e.bind(&mut done)
}
