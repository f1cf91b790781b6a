//! Post-op injection.
//!
//! The store pipeline hands the injector a range of f32 accumulator cells
//! and a hook for the sum post-op, which only the core can evaluate since
//! it needs the destination pointer and type. The injector applies the
//! chain in order, one op over every cell before the next.

use iced_x86::code_asm::*;

use crate::compiler::codegen::emitter::{frame, Emitter, K_CMP};
use crate::compiler::codegen::fetch::load_widen;
use crate::compiler::codegen::frame::slot;
use crate::compiler::codegen::regs::{Gpr, Vmm};
use crate::desc::{BinaryOp, Broadcast, Eltwise, PostOp};
use crate::types::{BrgemmResult, DataType};

/// `_CMP_LT_OS`
const CMP_LT: i32 = 1;

/// One accumulator of the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub reg: Vmm,
    /// ld block relative to the current ld block pointer.
    pub ld: usize,
    /// Valid lanes when the block is the ld tail.
    pub tail: Option<usize>,
}

/// Resources the injector may clobber.
#[derive(Debug, Clone, Copy)]
pub struct RhsMeta {
    /// Holds the current binary operand pointer.
    pub ptr: Gpr,
    pub tmp: Vmm,
    pub tmp2: Vmm,
}

/// Emits `sum` post-ops: `(emitter, scale, zero_point)`.
pub type SumHook<'h> = dyn FnMut(&mut Emitter, f32, i32) -> BrgemmResult<()> + 'h;

pub trait PostOpInjector {
    /// Apply the post-op chain to every cell, in place.
    fn compute_vector_range(
        &self,
        e: &mut Emitter,
        cells: &[Cell],
        rhs: &RhsMeta,
        sum: &mut SumHook<'_>,
    ) -> BrgemmResult<()>;
}

/// Injector for the crate's own [`PostOp`] chain.
#[derive(Debug, Clone, Default)]
pub struct DefaultInjector {
    ops: Vec<PostOp>,
}

impl DefaultInjector {
    pub fn new(ops: &[PostOp]) -> Self {
        DefaultInjector { ops: ops.to_vec() }
    }

    fn eltwise(&self, e: &mut Emitter, op: Eltwise, cells: &[Cell], rhs: &RhsMeta) -> BrgemmResult<()> {
        for c in cells {
            let x = e.v(c.reg);
            match op {
                Eltwise::Relu { negative_slope } if negative_slope == 0.0 => {
                    let zero = e.constant(0);
                    e.vmaxps(x, x, zero)?;
                }
                Eltwise::Relu { negative_slope } => {
                    let slope = e.constant_f32(negative_slope);
                    if e.evex() {
                        let zero = e.constant(0);
                        e.vcmpps_k(K_CMP, x, zero, CMP_LT)?;
                        e.vmulps(x.k(K_CMP), x, slope)?;
                    } else {
                        let t = e.v(rhs.tmp);
                        e.vmulps(t, x, slope)?;
                        e.vblendvps(x, x, t, x)?;
                    }
                }
                Eltwise::Clip { lo, hi } => {
                    let (l, h) = (e.constant_f32(lo), e.constant_f32(hi));
                    e.vmaxps(x, x, l)?;
                    e.vminps(x, x, h)?;
                }
                Eltwise::Linear { alpha, beta } => {
                    let t = e.v(rhs.tmp);
                    let a = e.constant_f32(alpha);
                    e.vmovups(t, a)?;
                    let b = e.constant_f32(beta);
                    e.vfmadd213ps(x, t, b)?;
                }
                Eltwise::Abs => {
                    let mask = e.constant(0x7FFF_FFFF);
                    e.vand(x, x, mask)?;
                }
                Eltwise::Square => e.vmulps(x, x, x)?,
            }
        }
        Ok(())
    }

    fn binary(
        &self,
        e: &mut Emitter,
        index: usize,
        op: BinaryOp,
        bcast: Broadcast,
        cells: &[Cell],
        rhs: &RhsMeta,
    ) -> BrgemmResult<()> {
        let p = rhs.ptr.r64();
        e.asm.mov(p, frame(slot!(post_ops_rhs)))?;
        e.asm.mov(p, qword_ptr(p + (index * 8) as i32))?;
        let t = e.v(rhs.tmp);
        if bcast == Broadcast::PerTensor {
            e.vbroadcastss(t, dword_ptr(p))?;
        } else {
            e.asm.add(p, frame(slot!(n_off4)))?;
        }
        for c in cells {
            if bcast == Broadcast::PerN {
                let disp = (c.ld * e.vlen()) as i32;
                load_widen(e, rhs.tmp, DataType::F32, rhs.ptr, disp, c.tail, rhs.tmp2)?;
            }
            let x = e.v(c.reg);
            match op {
                BinaryOp::Add => e.vaddps(x, x, t)?,
                BinaryOp::Sub => e.vsubps(x, x, t)?,
                BinaryOp::Mul => e.vmulps(x, x, t)?,
                BinaryOp::Max => e.vmaxps(x, x, t)?,
                BinaryOp::Min => e.vminps(x, x, t)?,
            }
        }
        Ok(())
    }
}

impl PostOpInjector for DefaultInjector {
    fn compute_vector_range(
        &self,
        e: &mut Emitter,
        cells: &[Cell],
        rhs: &RhsMeta,
        sum: &mut SumHook<'_>,
    ) -> BrgemmResult<()> {
        let mut binary_index = 0;
        for op in &self.ops {
            match *op {
                PostOp::Eltwise(el) => self.eltwise(e, el, cells, rhs)?,
                PostOp::Binary { op, bcast } => {
                    self.binary(e, binary_index, op, bcast, cells, rhs)?;
                    binary_index += 1;
                }
                PostOp::Sum { scale, zero_point } => sum(e, scale, zero_point)?,
            }
        }
        Ok(())
    }
}
