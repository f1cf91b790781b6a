//! Loop nest: prologue, bd/ld block loops, batch and reduction loops,
//! epilogue.
//!
//! Shapes are specialized at generation time. Only block counts, the batch
//! size and the reduction block count loop at run time. Each (bd regime,
//! ld regime) pair gets its own copy of the microkernel and store code.
//!
//! ```text
//! for bd group:                      BdbLoop
//!   for ld group:                    LdbLoop
//!     zero
//!     for batch element:             BsLoop
//!       [vpad dispatch]
//!       for rd block:                RdbLoop
//!         reduce
//!     store
//! ```

use iced_x86::code_asm::*;

use super::microkernel::{r64, reg, LoopState, MicrokernelBody};
use super::padding;
use crate::compiler::codegen::emitter::{frame, Emitter, K_TAIL};
use crate::compiler::codegen::frame::slot;
use crate::compiler::codegen::regs::{Gpr, GprRole, CALLEE_SAVED};
use crate::compiler::codegen::Ctx;
use crate::compiler::params::{off, BATCH_A, BATCH_B, BATCH_STRIDE};
use crate::desc::{BatchKind, MicroKind};
use crate::types::BrgemmResult;

/// Parameter fields copied to frame slots by the prologue.
const PARAM_SLOTS: [(i32, usize); 17] = [
    (off::BATCH, slot!(batch)),
    (off::BIAS, slot!(bias)),
    (off::SCALES, slot!(scales)),
    (off::COMP, slot!(comp)),
    (off::ZP_COMP_A, slot!(zp_comp_a)),
    (off::ZP_COMP_B, slot!(zp_comp_b)),
    (off::ZP_C, slot!(zp_c)),
    (off::DST_SCALES, slot!(dst_scales)),
    (off::WEI_SCALES, slot!(wei_scales)),
    (off::WEI_ZP, slot!(wei_zp)),
    (off::SRC_SCALES, slot!(src_scales)),
    (off::POST_OPS_RHS, slot!(post_ops_rhs)),
    (off::DO_POST_OPS, slot!(do_post_ops)),
    (off::DO_COMP, slot!(do_comp)),
    (off::SKIP_ACCM, slot!(skip_accm)),
    (off::ZP_A_VAL, slot!(zp_a_val)),
    (off::IC, slot!(ic)),
];

/// Position counters maintained by the outer loops.
const COUNTER_SLOTS: [usize; 5] = [
    slot!(n_idx),
    slot!(n_off4),
    slot!(m_idx),
    slot!(m_off4),
    slot!(m_src_off),
];

/// A run of identically shaped groups: `count` iterations of `st`.
#[derive(Debug, Clone, Copy)]
struct Regime {
    count: usize,
    st: LoopState,
}

/// bd regimes as `(count, rows, bd_blocks)`.
fn bd_regimes(ctx: &Ctx<'_>) -> Vec<(usize, usize, usize)> {
    let blk = &ctx.desc.blocking;
    let mut out = Vec::new();
    if ctx.desc.kind == MicroKind::Tile {
        if blk.bdb2 > 0 {
            out.push((blk.bdb2, blk.bd_block, blk.bd_block2));
        }
        if blk.bdb2_tail > 0 {
            out.push((1, blk.bd_block, blk.bdb2_tail));
        }
    } else if blk.bdb > 0 {
        out.push((blk.bdb, blk.bd_block, 1));
    }
    if blk.bdb_tail > 0 {
        out.push((1, blk.bdb_tail, 1));
    }
    out
}

/// ld regimes for bd groups of `rows × bd_blocks`.
fn ld_regimes(ctx: &Ctx<'_>, rows: usize, bd_blocks: usize) -> Vec<Regime> {
    let blk = &ctx.desc.blocking;
    let mut out = Vec::new();
    if blk.ldb2 > 0 {
        out.push(Regime {
            count: blk.ldb2,
            st: LoopState::new(rows, bd_blocks, blk.ld_block2, None),
        });
    }
    if blk.ldb2_tail > 0 {
        out.push(Regime {
            count: 1,
            st: LoopState::new(rows, bd_blocks, blk.ldb2_tail, None),
        });
    }
    if blk.ldb_tail > 0 {
        out.push(Regime {
            count: 1,
            st: LoopState::new(rows, bd_blocks, 1, Some(blk.ldb_tail)),
        });
    }
    out
}

/// `count` runs of `f`, looping on `counter` when there is more than one.
fn counted(
    e: &mut Emitter,
    counter: Gpr,
    count: usize,
    mut f: impl FnMut(&mut Emitter) -> BrgemmResult<()>,
) -> BrgemmResult<()> {
    match count {
        0 => Ok(()),
        1 => f(e),
        _ => {
            let c = counter.r64();
            let mut top = e.label();
            e.asm.mov(c, count as u64)?;
            e.bind(&mut top)?;
            f(e)?;
            e.asm.dec(c)?;
            e.asm.jnz(top)?;
            Ok(())
        }
    }
}

struct LoopNest<'c, 'a> {
    ctx: &'c Ctx<'a>,
    body: &'c dyn MicrokernelBody,
}

impl LoopNest<'_, '_> {
    fn prologue(&self, e: &mut Emitter) -> BrgemmResult<()> {
        for g in CALLEE_SAVED {
            e.asm.push(g.r64())?;
        }
        e.asm.sub(rsp, self.ctx.frame.size as i32)?;

        let param = r64(GprRole::Param);
        let scratch = r64(GprRole::Scratch);
        for (src, dst) in PARAM_SLOTS {
            e.asm.mov(scratch, qword_ptr(param + src))?;
            e.asm.mov(frame(dst), scratch)?;
        }
        for s in COUNTER_SLOTS {
            e.asm.mov(frame(s), 0)?;
        }
        e.asm.mov(r64(GprRole::C), qword_ptr(param + off::PTR_C))?;
        e.asm.mov(r64(GprRole::D), qword_ptr(param + off::PTR_D))?;
        e.asm.mov(r64(GprRole::ABase), qword_ptr(param + off::PTR_A))?;
        e.asm.mov(r64(GprRole::BBase), qword_ptr(param + off::PTR_B))?;
        e.asm.mov(r64(GprRole::Bs), qword_ptr(param + off::BS))?;
        self.body.prologue(e, self.ctx)
    }

    fn epilogue(&self, e: &mut Emitter) -> BrgemmResult<()> {
        self.body.epilogue(e, self.ctx)?;
        e.asm.vzeroupper()?;
        e.asm.add(rsp, self.ctx.frame.size as i32)?;
        for g in CALLEE_SAVED.iter().rev() {
            e.asm.pop(g.r64())?;
        }
        e.asm.ret()?;
        Ok(())
    }

    fn bd_loops(&self, e: &mut Emitter) -> BrgemmResult<()> {
        let d = self.ctx.desc;
        e.asm.xor(r64(GprRole::AOffset), r64(GprRole::AOffset))?;
        for (count, rows, bd_blocks) in bd_regimes(self.ctx) {
            log::trace!("brgemm bd regime {count} x {bd_blocks} block(s) of {rows} rows");
            counted(e, reg(GprRole::BdbLoop), count, |e| {
                self.ld_loops(e, rows, bd_blocks)?;
                let group_rows = rows * bd_blocks;
                e.add_imm(reg(GprRole::C), self.ctx.off.bd_step_c(group_rows))?;
                e.add_imm(reg(GprRole::D), self.ctx.off.bd_step_d(group_rows))?;
                e.add_imm(reg(GprRole::AOffset), self.ctx.off.bd_step_a(group_rows))?;
                e.add_frame(slot!(m_idx), group_rows)?;
                e.add_frame(slot!(m_off4), group_rows * 4)?;
                if let Some(dq) = d.dyn_quant {
                    e.add_frame(slot!(m_src_off), group_rows * dq.src_scale_stride * 4)?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    fn ld_loops(&self, e: &mut Emitter, rows: usize, bd_blocks: usize) -> BrgemmResult<()> {
        let blk = &self.ctx.desc.blocking;
        e.mov_gpr(reg(GprRole::AuxC), reg(GprRole::C))?;
        e.mov_gpr(reg(GprRole::AuxD), reg(GprRole::D))?;
        e.asm.xor(r64(GprRole::BOffset), r64(GprRole::BOffset))?;
        e.asm.mov(frame(slot!(n_idx)), 0)?;
        e.asm.mov(frame(slot!(n_off4)), 0)?;
        for regime in ld_regimes(self.ctx, rows, bd_blocks) {
            let st = regime.st;
            if let (Some(tail), true) = (st.ld_tail, e.evex()) {
                e.set_kmask(K_TAIL, tail, reg(GprRole::Scratch))?;
            }
            self.body.enter_regime(e, self.ctx, &st)?;
            counted(e, reg(GprRole::LdbLoop), regime.count, |e| {
                self.accumulate(e, &st)?;
                self.body.store(e, self.ctx, &st)?;
                let cols = st.lds * blk.ld_block;
                e.add_imm(reg(GprRole::AuxC), self.ctx.off.ld_step_c(st.lds))?;
                e.add_imm(reg(GprRole::AuxD), self.ctx.off.ld_step_d(st.lds))?;
                e.add_imm(reg(GprRole::BOffset), self.ctx.off.ld_step_b(st.lds))?;
                e.add_frame(slot!(n_idx), cols)?;
                e.add_frame(slot!(n_off4), cols * 4)?;
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Registers the accumulate phase reuses are spilled around it.
    fn spill(&self, e: &mut Emitter) -> BrgemmResult<()> {
        e.asm.mov(frame(slot!(d)), r64(GprRole::D))?;
        e.asm.mov(frame(slot!(aux_d)), r64(GprRole::AuxD))?;
        e.asm.mov(frame(slot!(bdb)), r64(GprRole::BdbLoop))?;
        e.asm.mov(frame(slot!(ldb)), r64(GprRole::LdbLoop))?;
        Ok(())
    }

    fn restore(&self, e: &mut Emitter) -> BrgemmResult<()> {
        e.asm.mov(r64(GprRole::D), frame(slot!(d)))?;
        e.asm.mov(r64(GprRole::AuxD), frame(slot!(aux_d)))?;
        e.asm.mov(r64(GprRole::BdbLoop), frame(slot!(bdb)))?;
        e.asm.mov(r64(GprRole::LdbLoop), frame(slot!(ldb)))?;
        Ok(())
    }

    fn accumulate(&self, e: &mut Emitter, st: &LoopState) -> BrgemmResult<()> {
        let d = self.ctx.desc;
        self.spill(e)?;
        self.body.zero(e, self.ctx, st)?;
        let mut done = e.label();
        if d.skip_accumulation {
            e.asm.cmp(frame(slot!(skip_accm)), 0)?;
            e.asm.jne(done)?;
        }
        self.body.begin(e, self.ctx, st)?;
        if d.group_size().is_some() {
            let s = r64(GprRole::Scratch);
            e.asm.mov(s, frame(slot!(ic)))?;
            e.asm.mov(frame(slot!(aux_ic)), s)?;
        }

        let bs = r64(GprRole::Bs);
        e.asm.test(bs, bs)?;
        e.asm.jz(done)?;
        self.batch_init(e)?;
        if d.max_bs == 1 {
            self.batch_element(e, st)?;
        } else {
            let counter = r64(GprRole::BsLoop);
            let mut top = e.label();
            e.asm.mov(counter, bs)?;
            e.bind(&mut top)?;
            self.batch_element(e, st)?;
            self.batch_advance(e)?;
            e.asm.dec(counter)?;
            e.asm.jnz(top)?;
        }
        e.bind(&mut done)?;
        self.restore(e)
    }

    fn batch_init(&self, e: &mut Emitter) -> BrgemmResult<()> {
        let d = self.ctx.desc;
        match d.batch {
            BatchKind::Addr | BatchKind::Offs => {
                e.asm.mov(r64(GprRole::Aux1Batch), frame(slot!(batch)))?;
            }
            BatchKind::Strd { .. } => {
                e.mov_gpr(reg(GprRole::Aux1A), reg(GprRole::ABase))?;
                e.mov_gpr(reg(GprRole::Aux1B), reg(GprRole::BBase))?;
                if d.has_vpad() {
                    let s = r64(GprRole::Local1);
                    e.asm.mov(s, frame(slot!(batch)))?;
                    e.asm.mov(frame(slot!(vpad_cur)), s)?;
                }
            }
        }
        Ok(())
    }

    fn batch_advance(&self, e: &mut Emitter) -> BrgemmResult<()> {
        let d = self.ctx.desc;
        match d.batch {
            BatchKind::Addr | BatchKind::Offs => {
                e.add_imm(reg(GprRole::Aux1Batch), BATCH_STRIDE)?;
            }
            BatchKind::Strd { stride_a, stride_b } => {
                e.asm.add(r64(GprRole::Aux1A), stride_a as i32)?;
                e.asm.add(r64(GprRole::Aux1B), stride_b as i32)?;
                if d.has_vpad() {
                    e.add_frame(slot!(vpad_cur), BATCH_STRIDE)?;
                }
            }
        }
        Ok(())
    }

    /// Point `AuxA`/`AuxB` at the current element's block, then run the
    /// reduction (through the padding dispatch).
    fn batch_element(&self, e: &mut Emitter, st: &LoopState) -> BrgemmResult<()> {
        let d = self.ctx.desc;
        let (aux_a, aux_b) = (r64(GprRole::AuxA), r64(GprRole::AuxB));
        let (a_off, b_off) = (r64(GprRole::AOffset), r64(GprRole::BOffset));
        match d.batch {
            BatchKind::Addr => {
                let elem = r64(GprRole::Aux1Batch);
                e.asm.mov(aux_a, qword_ptr(elem + BATCH_A))?;
                e.asm.add(aux_a, a_off)?;
                e.asm.mov(aux_b, qword_ptr(elem + BATCH_B))?;
                e.asm.add(aux_b, b_off)?;
            }
            BatchKind::Offs => {
                let elem = r64(GprRole::Aux1Batch);
                e.asm.mov(aux_a, qword_ptr(elem + BATCH_A))?;
                e.asm.add(aux_a, r64(GprRole::ABase))?;
                e.asm.add(aux_a, a_off)?;
                e.asm.mov(aux_b, qword_ptr(elem + BATCH_B))?;
                e.asm.add(aux_b, r64(GprRole::BBase))?;
                e.asm.add(aux_b, b_off)?;
            }
            BatchKind::Strd { .. } => {
                e.asm.lea(aux_a, ptr(r64(GprRole::Aux1A) + a_off))?;
                e.asm.lea(aux_b, ptr(r64(GprRole::Aux1B) + b_off))?;
            }
        }
        padding::dispatch(e, d, st, |e, st| self.reduction(e, st))
    }

    fn reduction(&self, e: &mut Emitter, st: &LoopState) -> BrgemmResult<()> {
        let blk = &self.ctx.desc.blocking;
        let (aux_a, aux_b) = (reg(GprRole::AuxA), reg(GprRole::AuxB));
        let step_a = self.ctx.off.rd_step_a(blk.rd_block) as usize;
        let step_b = self.ctx.off.rd_step_b(blk.rd_block) as usize;
        let advance = blk.rdb_tail > 0 || blk.rdb > 1;
        counted(e, reg(GprRole::RdbLoop), blk.rdb, |e| {
            self.body.reduce(e, self.ctx, st, blk.rd_block)?;
            if advance {
                e.add_imm(aux_a, step_a)?;
                e.add_imm(aux_b, step_b)?;
            }
            Ok(())
        })?;
        if blk.rdb_tail > 0 {
            self.body.reduce(e, self.ctx, st, blk.rdb_tail)?;
        }
        Ok(())
    }
}

/// Emit the whole kernel for `ctx` with `body` as the accumulation strategy.
pub fn emit_kernel(e: &mut Emitter, ctx: &Ctx<'_>, body: &dyn MicrokernelBody) -> BrgemmResult<()> {
    let nest = LoopNest { ctx, body };
    nest.prologue(e)?;
    nest.bd_loops(e)?;
    nest.epilogue(e)
}
