//! Register roles and their physical assignment.
//!
//! Both tables are pure functions of the descriptor. `GprPlan::verify` and
//! `RegisterPlan::verify` check, per phase, that every concurrently live role
//! has its own physical register.

use std::collections::HashMap;
use std::fmt;

use iced_x86::code_asm::*;

use crate::desc::{BatchKind, BrgemmDesc, MicroKind, OperandReuse};
use crate::dispatch::ComputeEngine;
use crate::types::{BrgemmError, BrgemmResult, DataType};

// ---------------------------------------------------------------------------
// General-purpose registers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gpr {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Gpr {
    pub fn r64(self) -> AsmRegister64 {
        match self {
            Gpr::Rax => rax,
            Gpr::Rbx => rbx,
            Gpr::Rcx => rcx,
            Gpr::Rdx => rdx,
            Gpr::Rsi => rsi,
            Gpr::Rdi => rdi,
            Gpr::Rbp => rbp,
            Gpr::Rsp => rsp,
            Gpr::R8 => r8,
            Gpr::R9 => r9,
            Gpr::R10 => r10,
            Gpr::R11 => r11,
            Gpr::R12 => r12,
            Gpr::R13 => r13,
            Gpr::R14 => r14,
            Gpr::R15 => r15,
        }
    }

    pub fn r32(self) -> AsmRegister32 {
        match self {
            Gpr::Rax => eax,
            Gpr::Rbx => ebx,
            Gpr::Rcx => ecx,
            Gpr::Rdx => edx,
            Gpr::Rsi => esi,
            Gpr::Rdi => edi,
            Gpr::Rbp => ebp,
            Gpr::Rsp => esp,
            Gpr::R8 => r8d,
            Gpr::R9 => r9d,
            Gpr::R10 => r10d,
            Gpr::R11 => r11d,
            Gpr::R12 => r12d,
            Gpr::R13 => r13d,
            Gpr::R14 => r14d,
            Gpr::R15 => r15d,
        }
    }
}

/// Callee-saved registers pushed by the prologue, in push order.
pub const CALLEE_SAVED: [Gpr; 6] = [Gpr::Rbx, Gpr::Rbp, Gpr::R12, Gpr::R13, Gpr::R14, Gpr::R15];

/// Program regions with distinct register liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Prologue: reading the parameter block.
    Entry,
    /// bd/ld loop control between microkernel and store.
    Outer,
    /// Batch and reduction loops.
    Accumulate,
    /// Store pipeline.
    Store,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Entry, Phase::Outer, Phase::Accumulate, Phase::Store];

    pub fn name(self) -> &'static str {
        match self {
            Phase::Entry => "entry",
            Phase::Outer => "outer",
            Phase::Accumulate => "accumulate",
            Phase::Store => "store",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GprRole {
    Param,
    /// C pointer at the current bd block.
    C,
    /// C pointer at the current ld block.
    AuxC,
    D,
    AuxD,
    /// `ptr_a` for offs/strd batches.
    ABase,
    /// `ptr_b` for offs/strd batches.
    BBase,
    /// Byte offset of the current bd block inside A.
    AOffset,
    /// Byte offset of the current ld block inside B.
    BOffset,
    /// Runtime batch size.
    Bs,
    BdbLoop,
    LdbLoop,
    BsLoop,
    /// Current batch element (addr/offs).
    Aux1Batch,
    /// Running A base (strd).
    Aux1A,
    /// Running B base (strd).
    Aux1B,
    AuxA,
    AuxB,
    RdbLoop,
    /// Accumulate-phase locals: vpad key, decomp pointers, tile strides.
    Local0,
    Local1,
    Scratch,
    Scratch2,
    Scratch3,
}

impl fmt::Display for GprRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Role → register table for the System V entry convention.
#[derive(Debug, Clone)]
pub struct GprPlan {
    needs_batch_ptr: bool,
    strd: bool,
    uses_locals: bool,
}

impl GprPlan {
    pub fn new(desc: &BrgemmDesc) -> Self {
        let strd = matches!(desc.batch, BatchKind::Strd { .. });
        GprPlan {
            needs_batch_ptr: !strd,
            strd,
            uses_locals: desc.has_vpad()
                || matches!(desc.kind, MicroKind::Decomp | MicroKind::DynQuant)
                || desc.engine == ComputeEngine::Amx,
        }
    }

    pub const fn reg(role: GprRole) -> Gpr {
        match role {
            GprRole::Param => Gpr::Rdi,
            GprRole::C => Gpr::R15,
            GprRole::AuxC => Gpr::R14,
            GprRole::D => Gpr::R11,
            GprRole::AuxD => Gpr::Rax,
            GprRole::ABase => Gpr::R13,
            GprRole::BBase => Gpr::R12,
            GprRole::AOffset => Gpr::Rdx,
            GprRole::BOffset => Gpr::Rsi,
            GprRole::Bs => Gpr::Rcx,
            GprRole::BdbLoop => Gpr::R9,
            GprRole::LdbLoop => Gpr::R8,
            GprRole::BsLoop => Gpr::Rax,
            GprRole::Aux1Batch => Gpr::Rbp,
            GprRole::Aux1A => Gpr::Rbp,
            GprRole::Aux1B => Gpr::Rdi,
            GprRole::AuxA => Gpr::R11,
            GprRole::AuxB => Gpr::R10,
            GprRole::RdbLoop => Gpr::Rbx,
            GprRole::Local0 => Gpr::R9,
            GprRole::Local1 => Gpr::R8,
            GprRole::Scratch => Gpr::Rbx,
            GprRole::Scratch2 => Gpr::Rbp,
            GprRole::Scratch3 => Gpr::R10,
        }
    }

    /// Roles live during `phase` for this descriptor.
    pub fn live(&self, phase: Phase) -> Vec<GprRole> {
        use GprRole::*;
        match phase {
            Phase::Entry => vec![Param, C, D, ABase, BBase, Bs, Scratch],
            Phase::Outer => vec![
                C, AuxC, D, AuxD, ABase, BBase, AOffset, BOffset, Bs, BdbLoop, LdbLoop, Scratch,
            ],
            Phase::Accumulate => {
                let mut roles = vec![
                    C, AuxC, ABase, BBase, AOffset, BOffset, Bs, BsLoop, AuxA, AuxB, RdbLoop,
                ];
                if self.needs_batch_ptr {
                    roles.push(Aux1Batch);
                }
                if self.strd {
                    roles.push(Aux1A);
                    roles.push(Aux1B);
                }
                if self.uses_locals {
                    roles.push(Local0);
                    roles.push(Local1);
                }
                roles
            }
            Phase::Store => vec![
                C, AuxC, D, AuxD, ABase, BBase, AOffset, BOffset, Bs, BdbLoop, LdbLoop, Scratch,
                Scratch2, Scratch3,
            ],
        }
    }

    pub fn verify(&self) -> BrgemmResult<()> {
        for phase in Phase::ALL {
            let mut seen: HashMap<Gpr, GprRole> = HashMap::new();
            for role in self.live(phase) {
                let reg = Self::reg(role);
                if reg == Gpr::Rsp {
                    return Err(BrgemmError::RegisterAlias {
                        first: role.to_string(),
                        second: "stack pointer".into(),
                        physical: "rsp".into(),
                        phase: phase.name(),
                    });
                }
                if let Some(prev) = seen.insert(reg, role) {
                    return Err(BrgemmError::RegisterAlias {
                        first: prev.to_string(),
                        second: role.to_string(),
                        physical: format!("{reg:?}").to_lowercase(),
                        phase: phase.name(),
                    });
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Vector registers
// ---------------------------------------------------------------------------

/// Vector register by index; width comes from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Vmm(pub u8);

impl Vmm {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmmRole {
    Accm { bd: usize, ld: usize },
    /// Integer partial sums of one reduction block (dynamic quantization).
    AccmTmp { bd: usize, ld: usize },
    Load(usize),
    /// Second decoded half of a packed 4-bit load.
    Load2(usize),
    Bcst(usize),
    OnesWords,
    DotTmp,
    InpShift,
    ZpAShift,
    OneBytes,
    CompTmp,
    DecodeTmp,
    Nf4Table(usize),
    Nf4Seven,
    Nf4Tmp,
    DecompZp,
    DecompScale,
    NegOne,
    NegA,
    LowHalfMask,
    DynZp(usize),
    StoreTmp(usize),
}

impl fmt::Display for VmmRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Number of low scratch registers the store pipeline uses.
pub const STORE_TMPS: usize = 4;

/// Deterministic role → vector register mapping.
///
/// Reservations sit at the top of the file, accumulators directly below
/// them, operand registers below the accumulators, and fixed helpers from
/// index 1 upward. Index 0 is the broadcast (LoadOnce) or load
/// (BroadcastOnce) register during accumulation.
#[derive(Debug, Clone)]
pub struct RegisterPlan {
    pub n_vregs: usize,
    pub bd_block: usize,
    pub ld_block2: usize,
    pub reuse: OperandReuse,
    acc_top: usize,
    tmp_acc_top: Option<usize>,
    operand_top: usize,
    load2: bool,
    reserved: HashMap<VmmRole, Vmm>,
    low: HashMap<VmmRole, Vmm>,
    needed: usize,
}

impl RegisterPlan {
    pub fn new(desc: &BrgemmDesc) -> BrgemmResult<Self> {
        let n = desc.engine.num_vregs();
        let blk = &desc.blocking;
        let (bd_block, ld_block2) = if desc.engine == ComputeEngine::Amx {
            // Tile store path: one ld block of up to 16 rows at a time.
            (blk.bd_block, 1)
        } else {
            (blk.bd_block, blk.ld_block2)
        };

        let mut reserved = HashMap::new();
        let mut top = n;
        let mut reserve = |role: VmmRole, reserved: &mut HashMap<VmmRole, Vmm>| {
            top = top.saturating_sub(1);
            reserved.insert(role, Vmm(top as u8));
        };

        let is_vector = desc.engine != ComputeEngine::Amx;
        let int8_emulated = is_vector
            && desc.kind == MicroKind::VectorInt8
            && !desc.caps.has_int8_vnni(desc.engine);
        if int8_emulated {
            reserve(VmmRole::OnesWords, &mut reserved);
            reserve(VmmRole::DotTmp, &mut reserved);
        }
        if desc.kind == MicroKind::DynQuant {
            if let Some(dq) = &desc.dyn_quant {
                if dq.wei_zero_points.is_some() {
                    reserve(VmmRole::NegOne, &mut reserved);
                    let count = if dq.wei_zero_points.map_or(false, |z| z.is_per_n()) {
                        ld_block2
                    } else {
                        1
                    };
                    for i in 0..count {
                        reserve(VmmRole::DynZp(i), &mut reserved);
                    }
                }
            }
            if desc.dt_b.is_4bit() {
                reserve(VmmRole::LowHalfMask, &mut reserved);
            }
        }
        if desc.kind == MicroKind::Decomp {
            if desc.dt_b == DataType::Nf4 {
                if desc.engine == ComputeEngine::Avx2 {
                    reserve(VmmRole::Nf4Table(0), &mut reserved);
                    reserve(VmmRole::Nf4Table(1), &mut reserved);
                    reserve(VmmRole::Nf4Seven, &mut reserved);
                    reserve(VmmRole::Nf4Tmp, &mut reserved);
                } else {
                    reserve(VmmRole::Nf4Table(0), &mut reserved);
                }
            }
            if let Some(wd) = &desc.wei_decomp {
                if wd.zero_points.map_or(false, |z| !z.param.is_per_n()) {
                    reserve(VmmRole::DecompZp, &mut reserved);
                }
                if wd.scales.map_or(false, |s| !s.is_per_n()) {
                    reserve(VmmRole::DecompScale, &mut reserved);
                }
            }
        }
        let n_reserved = n - top;

        // Fixed helpers from index 1.
        let mut low = HashMap::new();
        let mut next_low = 1usize;
        let mut low_reg = |role: VmmRole, low: &mut HashMap<VmmRole, Vmm>| {
            low.insert(role, Vmm(next_low as u8));
            next_low += 1;
        };
        if is_vector {
            if desc.s8s8_compensation {
                low_reg(VmmRole::InpShift, &mut low);
            }
            if desc.pads_touch_compensation() {
                if desc.zp_a {
                    low_reg(VmmRole::ZpAShift, &mut low);
                    low_reg(VmmRole::OneBytes, &mut low);
                }
                low_reg(VmmRole::CompTmp, &mut low);
            }
            if desc.needs_decode_tmp() {
                low_reg(VmmRole::DecodeTmp, &mut low);
            }
            if desc.kind == MicroKind::DynQuant
                && desc.dyn_quant.map_or(false, |d| d.wei_zero_points.is_some())
            {
                low_reg(VmmRole::NegA, &mut low);
            }
        }
        let n_low = next_low;

        let acc_count = bd_block * ld_block2;
        let acc_top = top.saturating_sub(1);
        let mut below = top.saturating_sub(acc_count);

        let tmp_acc_top = if desc.kind == MicroKind::DynQuant {
            let t = below.saturating_sub(1);
            below = below.saturating_sub(acc_count);
            Some(t)
        } else {
            None
        };

        let reuse = if is_vector { resolve_reuse(desc, n_reserved) } else { OperandReuse::LoadOnce };
        let load2 = desc.dt_b.is_4bit() && is_vector;
        let operand_count = if !is_vector {
            0
        } else {
            match reuse {
                OperandReuse::BroadcastOnce => bd_block,
                _ => ld_block2 * if load2 { 2 } else { 1 },
            }
        };
        let operand_top = below.saturating_sub(1);
        let operand_bottom = below.saturating_sub(operand_count);

        let tmp_acc = if tmp_acc_top.is_some() { acc_count } else { 0 };
        let store_low = if is_vector { n_low } else { n_low.max(STORE_TMPS) };
        let needed = n_reserved + acc_count + tmp_acc + operand_count + n_low.max(1);
        let needed_store = acc_count + STORE_TMPS;
        if needed > n
            || below < operand_count
            || operand_bottom < n_low
            || needed_store > n
            || store_low > n
        {
            return Err(BrgemmError::RegisterBudget {
                needed: needed.max(needed_store),
                available: n,
                context: format!(
                    "{:?} bd_block={} ld_block2={} reserved={} helpers={}",
                    desc.kind,
                    bd_block,
                    ld_block2,
                    n_reserved,
                    n_low - 1
                ),
            });
        }

        let plan = RegisterPlan {
            n_vregs: n,
            bd_block,
            ld_block2,
            reuse,
            acc_top,
            tmp_acc_top,
            operand_top,
            load2,
            reserved,
            low,
            needed,
        };
        plan.verify()?;
        Ok(plan)
    }

    /// Accumulator for cell `(bd, ld)` of an `bd × ld_blocks` shape.
    ///
    /// The mapping depends only on the full ld_block2, so tail shapes reuse
    /// the same registers as the full shape.
    pub fn accm(&self, bd: usize, ld: usize) -> Vmm {
        Vmm((self.acc_top - (bd * self.ld_block2 + ld)) as u8)
    }

    /// Accumulator rows of the tile store path (one ld block at a time).
    pub fn tile_row(&self, row: usize) -> Vmm {
        Vmm((self.acc_top - row) as u8)
    }

    pub fn accm_tmp(&self, bd: usize, ld: usize) -> Vmm {
        let top = self.tmp_acc_top.unwrap_or(self.acc_top);
        Vmm((top - (bd * self.ld_block2 + ld)) as u8)
    }

    pub fn load(&self, ld: usize) -> Vmm {
        match self.reuse {
            OperandReuse::BroadcastOnce => Vmm(0),
            _ => Vmm((self.operand_top - ld) as u8),
        }
    }

    pub fn load2(&self, ld: usize) -> Vmm {
        Vmm((self.operand_top - self.ld_block2 - ld) as u8)
    }

    pub fn bcst(&self, bd: usize) -> Vmm {
        match self.reuse {
            OperandReuse::BroadcastOnce => Vmm((self.operand_top - bd) as u8),
            _ => Vmm(0),
        }
    }

    pub fn has(&self, role: VmmRole) -> bool {
        self.reserved.contains_key(&role) || self.low.contains_key(&role)
    }

    /// Register of a reserved or helper role.
    pub fn get(&self, role: VmmRole) -> BrgemmResult<Vmm> {
        self.reserved
            .get(&role)
            .or_else(|| self.low.get(&role))
            .copied()
            .ok_or_else(|| BrgemmError::Assembler(format!("vector role {role} not allocated")))
    }

    /// Store-phase scratch; never overlaps accumulators.
    pub fn store_tmp(&self, i: usize) -> Vmm {
        Vmm(i as u8)
    }

    pub fn registers_used(&self) -> usize {
        self.needed
    }

    fn accumulate_roles(&self) -> Vec<(VmmRole, Vmm)> {
        let mut roles = Vec::new();
        for bd in 0..self.bd_block {
            for ld in 0..self.ld_block2 {
                roles.push((VmmRole::Accm { bd, ld }, self.accm(bd, ld)));
                if self.tmp_acc_top.is_some() {
                    roles.push((VmmRole::AccmTmp { bd, ld }, self.accm_tmp(bd, ld)));
                }
            }
        }
        match self.reuse {
            OperandReuse::BroadcastOnce => {
                for bd in 0..self.bd_block {
                    roles.push((VmmRole::Bcst(bd), self.bcst(bd)));
                }
                roles.push((VmmRole::Load(0), self.load(0)));
            }
            _ if self.operand_top >= self.ld_block2 => {
                for ld in 0..self.ld_block2 {
                    roles.push((VmmRole::Load(ld), self.load(ld)));
                    if self.load2 {
                        roles.push((VmmRole::Load2(ld), self.load2(ld)));
                    }
                }
                roles.push((VmmRole::Bcst(0), self.bcst(0)));
            }
            _ => {}
        }
        roles.extend(self.reserved.iter().map(|(r, v)| (*r, *v)));
        roles.extend(self.low.iter().map(|(r, v)| (*r, *v)));
        roles
    }

    fn store_roles(&self) -> Vec<(VmmRole, Vmm)> {
        let mut roles = Vec::new();
        for bd in 0..self.bd_block {
            for ld in 0..self.ld_block2 {
                roles.push((VmmRole::Accm { bd, ld }, self.accm(bd, ld)));
            }
        }
        for i in 0..STORE_TMPS {
            roles.push((VmmRole::StoreTmp(i), self.store_tmp(i)));
        }
        roles
    }

    /// Check both phases: indices in range and no aliasing.
    pub fn verify(&self) -> BrgemmResult<()> {
        for (phase, roles) in [
            (Phase::Accumulate, self.accumulate_roles()),
            (Phase::Store, self.store_roles()),
        ] {
            let mut seen: HashMap<Vmm, VmmRole> = HashMap::new();
            let mut sorted = roles;
            sorted.sort_by_key(|(_, v)| *v);
            for (role, vmm) in sorted {
                if vmm.idx() >= self.n_vregs {
                    return Err(BrgemmError::RegisterBudget {
                        needed: vmm.idx() + 1,
                        available: self.n_vregs,
                        context: format!("{role} during {}", phase.name()),
                    });
                }
                if let Some(prev) = seen.insert(vmm, role) {
                    return Err(BrgemmError::RegisterAlias {
                        first: prev.to_string(),
                        second: role.to_string(),
                        physical: format!("v{}", vmm.0),
                        phase: phase.name(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn resolve_reuse(desc: &BrgemmDesc, n_reserved: usize) -> OperandReuse {
    match desc.reuse {
        OperandReuse::Auto => {
            let blk = &desc.blocking;
            let budget = desc.engine.num_vregs() - n_reserved;
            let s8s8 = usize::from(desc.s8s8_compensation);
            if desc.kind == MicroKind::VectorInt8
                && blk.bd_block * (blk.ld_block2 + 1) < budget - s8s8
            {
                OperandReuse::BroadcastOnce
            } else {
                OperandReuse::LoadOnce
            }
        }
        OperandReuse::BroadcastOnce
            if matches!(desc.kind, MicroKind::Decomp | MicroKind::DynQuant) =>
        {
            OperandReuse::LoadOnce
        }
        other => other,
    }
}
