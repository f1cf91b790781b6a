//! Microkernel bodies: the accumulation code of one block.
//!
//! The loop nest owns pointers and loop counters; a body only emits code at
//! fixed points of the nest, described by [`LoopState`]. One body is chosen
//! per descriptor from its [`MicroKind`].

pub mod dequant;
pub mod tile;
pub mod vector;

use std::ops::Range;

use iced_x86::code_asm::*;

use crate::compiler::codegen::emitter::{frame, Emitter};
use crate::compiler::codegen::frame::slot;
use crate::compiler::codegen::regs::{Gpr, GprPlan, GprRole, Vmm, VmmRole};
use crate::compiler::codegen::Ctx;
use crate::desc::{MicroKind, QuantParam};
use crate::types::BrgemmResult;

/// Shape of the block the nest is currently emitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopState {
    /// Rows per bd block.
    pub rows: usize,
    /// bd blocks in the group (tile engine; 1 for vector bodies).
    pub bd_blocks: usize,
    /// ld blocks in the group.
    pub lds: usize,
    /// Valid columns of the last ld block when it is partial.
    pub ld_tail: Option<usize>,
    /// Leading rows whose A row is virtual padding.
    pub pad_top: usize,
    /// Trailing rows whose A row is virtual padding.
    pub pad_bottom: usize,
}

impl LoopState {
    pub fn new(rows: usize, bd_blocks: usize, lds: usize, ld_tail: Option<usize>) -> Self {
        LoopState {
            rows,
            bd_blocks,
            lds,
            ld_tail,
            pad_top: 0,
            pad_bottom: 0,
        }
    }

    /// Same block with `top`/`bottom` rows padded, clamped to the block.
    pub fn padded(self, top: usize, bottom: usize) -> Self {
        let pad_top = top.min(self.rows);
        LoopState {
            pad_top,
            pad_bottom: bottom.min(self.rows - pad_top),
            ..self
        }
    }

    /// Rows that read A.
    pub fn valid_rows(&self) -> Range<usize> {
        self.pad_top..self.rows - self.pad_bottom
    }

    /// Rows whose A row is padding.
    pub fn padded_rows(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.pad_top).chain(self.rows - self.pad_bottom..self.rows)
    }

    pub fn is_padded(&self) -> bool {
        self.pad_top + self.pad_bottom > 0
    }

    /// Tail width of ld block `ld`, if it is the partial one.
    pub fn tail_of(&self, ld: usize) -> Option<usize> {
        if ld + 1 == self.lds {
            self.ld_tail
        } else {
            None
        }
    }
}

/// Accumulation strategy of one descriptor.
///
/// Every hook may clobber the vector registers the register plan gives its
/// phase. General-purpose registers are limited to the roles of the phase
/// the hook runs in.
pub trait MicrokernelBody {
    /// Once after the prologue.
    fn prologue(&self, _e: &mut Emitter, _cx: &Ctx<'_>) -> BrgemmResult<()> {
        Ok(())
    }

    /// Entry of an ld regime (outer phase; `Scratch` is free).
    fn enter_regime(&self, _e: &mut Emitter, _cx: &Ctx<'_>, _st: &LoopState) -> BrgemmResult<()> {
        Ok(())
    }

    fn zero(&self, e: &mut Emitter, ctx: &Ctx<'_>, st: &LoopState) -> BrgemmResult<()>;

    /// Before the batch loop of one accumulation. `RdbLoop` and the locals
    /// are free.
    fn begin(&self, _e: &mut Emitter, _cx: &Ctx<'_>, _st: &LoopState) -> BrgemmResult<()> {
        Ok(())
    }

    /// One reduction block of `k` elements at `AuxA`/`AuxB`.
    fn reduce(&self, e: &mut Emitter, ctx: &Ctx<'_>, st: &LoopState, k: usize) -> BrgemmResult<()>;

    /// Run the store pipeline over the accumulators of `st`.
    fn store(&self, e: &mut Emitter, ctx: &Ctx<'_>, st: &LoopState) -> BrgemmResult<()>;

    /// Before the final `ret`.
    fn epilogue(&self, _e: &mut Emitter, _cx: &Ctx<'_>) -> BrgemmResult<()> {
        Ok(())
    }
}

/// Pick the body for the descriptor's accumulation strategy.
pub fn select<'a>(ctx: &Ctx<'a>) -> BrgemmResult<Box<dyn MicrokernelBody + 'a>> {
    let d = ctx.desc;
    log::trace!("brgemm microkernel {:?} reuse {:?}", d.kind, ctx.regs.reuse);
    Ok(match d.kind {
        MicroKind::VectorFma | MicroKind::VectorBf16Dot | MicroKind::VectorInt8 => {
            Box::new(vector::VectorBody::new(d))
        }
        MicroKind::Decomp => Box::new(dequant::DecompBody),
        MicroKind::DynQuant => Box::new(dequant::DynQuantBody),
        MicroKind::Tile => Box::new(tile::TileBody::new(d)),
    })
}

pub(crate) fn reg(role: GprRole) -> Gpr {
    GprPlan::reg(role)
}

pub(crate) fn r64(role: GprRole) -> AsmRegister64 {
    GprPlan::reg(role).r64()
}

/// `acc += a · b` over u8 × s8 dword groups, native or emulated.
pub(crate) fn dot_u8s8(e: &mut Emitter, ctx: &Ctx<'_>, acc: Vmm, a: Vmm, b: Vmm) -> BrgemmResult<()> {
    let (acc, a, b) = (e.v(acc), e.v(a), e.v(b));
    if ctx.desc.caps.has_int8_vnni(ctx.desc.engine) {
        return e.vpdpbusd(acc, a, b);
    }
    let tmp = e.v(ctx.regs.get(VmmRole::DotTmp)?);
    let ones = e.v(ctx.regs.get(VmmRole::OnesWords)?);
    e.vpmaddubsw(tmp, a, b)?;
    e.vpmaddwd(tmp, tmp, ones)?;
    e.vpaddd(acc, acc, tmp)
}

/// `dst = [aux_ic] / group_size` (unsigned). Saves and restores rax/rdx
/// around `div` when the group size is not a power of two.
pub(crate) fn group_index(e: &mut Emitter, dst: Gpr, group_size: usize) -> BrgemmResult<()> {
    let d = dst.r64();
    e.asm.mov(d, frame(slot!(aux_ic)))?;
    if group_size.is_power_of_two() {
        e.asm.shr(d, group_size.trailing_zeros())?;
        return Ok(());
    }
    e.asm.mov(frame(slot!(save_rax)), rax)?;
    e.asm.mov(frame(slot!(save_rdx)), rdx)?;
    e.asm.mov(rax, d)?;
    e.asm.xor(edx, edx)?;
    e.asm.mov(d, group_size as u64)?;
    e.asm.div(d)?;
    e.asm.mov(d, rax)?;
    e.asm.mov(rax, frame(slot!(save_rax)))?;
    e.asm.mov(rdx, frame(slot!(save_rdx)))?;
    Ok(())
}

/// `dst = base_slot + group * stride * esize (+ per-N column offset)`.
///
/// `group` holds the group index or is `None` for ungrouped tensors.
pub(crate) fn quant_pointer(
    e: &mut Emitter,
    dst: Gpr,
    base_slot: usize,
    param: QuantParam,
    esize: usize,
    group: Option<Gpr>,
) -> BrgemmResult<()> {
    let d = dst.r64();
    match group {
        Some(g) if param.group_stride > 0 => {
            e.mov_gpr(dst, g)?;
            e.asm.imul_3(d, d, (param.group_stride * esize) as i32)?;
            e.asm.add(d, frame(base_slot))?;
        }
        _ => e.asm.mov(d, frame(base_slot))?,
    }
    if param.is_per_n() {
        let col = if esize == 4 { slot!(n_off4) } else { slot!(n_idx) };
        e.asm.add(d, frame(col))?;
    }
    Ok(())
}
