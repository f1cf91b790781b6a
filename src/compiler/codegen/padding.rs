//! Virtual-padding dispatch.
//!
//! A batch element may declare that the first `vpad_top` and the last
//! `vpad_bottom` rows of the M range read padding instead of A. For the
//! current bd block the effective counts are
//!
//! ```text
//! top    = clamp(vpad_top - m_idx, 0, min(max_top, rows))
//! bottom = clamp(vpad_bottom - (m - m_idx - rows), 0, min(max_bottom, rows))
//! ```
//!
//! folded into one key `top * (max_bottom + 1) + bottom` in `Local0`. The
//! reduction is emitted once per key value, each specialized on its
//! [`LoopState::padded`] shape, and a compare chain picks one at run time.

use iced_x86::code_asm::*;

use super::microkernel::{r64, reg, LoopState};
use crate::compiler::codegen::emitter::{frame, Emitter};
use crate::compiler::codegen::frame::slot;
use crate::compiler::params::{BATCH_VPAD_BOTTOM, BATCH_VPAD_TOP};
use crate::compiler::codegen::regs::{Gpr, GprRole};
use crate::desc::{BatchKind, BrgemmDesc};
use crate::types::BrgemmResult;

/// Where the current batch element is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadSource {
    /// Pointer held in a register (addr/offs batches).
    Element(Gpr),
    /// Pointer spilled to the `vpad_cur` slot (strided batches).
    Frame,
}

impl PadSource {
    pub fn of(desc: &BrgemmDesc) -> Self {
        match desc.batch {
            BatchKind::Strd { .. } => PadSource::Frame,
            _ => PadSource::Element(reg(GprRole::Aux1Batch)),
        }
    }
}

/// `(top, bottom)` pairs other than `(0, 0)` reachable for a block of
/// `rows`, with their dispatch key.
pub fn variants(desc: &BrgemmDesc, rows: usize) -> Vec<(usize, usize, i32)> {
    let lim_top = desc.max_top_vpad.min(rows);
    let lim_bottom = desc.max_bottom_vpad.min(rows);
    let mut out = Vec::new();
    for top in 0..=lim_top {
        for bottom in 0..=lim_bottom {
            if top + bottom > 0 {
                out.push((top, bottom, key(desc, top, bottom)));
            }
        }
    }
    out
}

fn key(desc: &BrgemmDesc, top: usize, bottom: usize) -> i32 {
    (top * (desc.max_bottom_vpad + 1) + bottom) as i32
}

/// `r = clamp(r, 0, hi)`
fn clamp(e: &mut Emitter, r: AsmRegister64, hi: usize) -> BrgemmResult<()> {
    let mut above_zero = e.label();
    let mut below_hi = e.label();
    e.asm.cmp(r, 0)?;
    e.asm.jge(above_zero)?;
    e.asm.mov(r, 0u64)?;
    e.bind(&mut above_zero)?;
    e.asm.cmp(r, hi as i32)?;
    e.asm.jle(below_hi)?;
    e.asm.mov(r, hi as u64)?;
    e.bind(&mut below_hi)
}

/// Compute the padding key of the current batch element into `Local0`.
fn emit_key(e: &mut Emitter, desc: &BrgemmDesc, src: PadSource, rows: usize) -> BrgemmResult<()> {
    let (top, bottom) = (r64(GprRole::Local0), r64(GprRole::Local1));
    let elem = match src {
        PadSource::Element(g) => g.r64(),
        PadSource::Frame => {
            e.asm.mov(bottom, frame(slot!(vpad_cur)))?;
            bottom
        }
    };
    if desc.max_top_vpad > 0 {
        e.asm.mov(top, qword_ptr(elem + BATCH_VPAD_TOP))?;
        e.asm.sub(top, frame(slot!(m_idx)))?;
        clamp(e, top, desc.max_top_vpad.min(rows))?;
        e.asm.imul_3(top, top, (desc.max_bottom_vpad + 1) as i32)?;
    } else {
        e.asm.xor(top, top)?;
    }
    if desc.max_bottom_vpad > 0 {
        e.asm.mov(bottom, qword_ptr(elem + BATCH_VPAD_BOTTOM))?;
        e.asm.add(bottom, frame(slot!(m_idx)))?;
        e.asm.add(bottom, rows as i32 - desc.m as i32)?;
        clamp(e, bottom, desc.max_bottom_vpad.min(rows))?;
        e.asm.add(top, bottom)?;
    }
    Ok(())
}

/// Emit `reduce` once per padding variant of `st` behind a runtime
/// dispatch on the current batch element.
pub fn dispatch(
    e: &mut Emitter,
    desc: &BrgemmDesc,
    st: &LoopState,
    mut reduce: impl FnMut(&mut Emitter, &LoopState) -> BrgemmResult<()>,
) -> BrgemmResult<()> {
    if !desc.has_vpad() {
        return reduce(e, st);
    }
    let src = PadSource::of(desc);
    let mut plain = e.label();
    let mut done = e.label();
    if src == PadSource::Frame {
        // Strided batches without an element array are never padded.
        e.asm.cmp(frame(slot!(batch)), 0)?;
        e.asm.je(plain)?;
    }
    emit_key(e, desc, src, st.rows)?;
    let key_reg = r64(GprRole::Local0);
    let mut targets = Vec::new();
    for (top, bottom, k) in variants(desc, st.rows) {
        let label = e.label();
        e.asm.cmp(key_reg, k)?;
        e.asm.je(label)?;
        targets.push((label, st.padded(top, bottom)));
    }
    e.bind(&mut plain)?;
    reduce(e, st)?;
    e.asm.jmp(done)?;
    for (mut label, padded) in targets {
        log::trace!(
            "brgemm vpad variant top={} bottom={} rows={}",
            padded.pad_top,
            padded.pad_bottom,
            padded.rows
        );
        e.bind(&mut label)?;
        reduce(e, &padded)?;
        e.asm.jmp(done)?;
    }
    e.bind(&mut done)
}
