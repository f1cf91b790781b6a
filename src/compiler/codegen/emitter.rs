//! Emitter: width-generic wrapper over the iced-x86 `CodeAssembler`.
//!
//! Kernel generation is written once against vector register *indices*.
//! `V` binds an index to a width (zmm/ymm/xmm) plus an optional opmask, and
//! the methods here pick the concrete iced overload. Bitwise ops choose the
//! EVEX or VEX mnemonic from the engine, since the narrow engine has no
//! `vpandd` and the wide engines may use registers 16-31. For the same
//! reason the wide engines assemble with EVEX preferred: an xmm/ymm view of
//! register 16-31, or a masked one, has no VEX encoding.
//!
//! The emitter also owns the constant pool and enforces iced's one label per
//! instruction rule (`bind` pads with a `nop` when two labels would collide).

use iced_x86::code_asm::*;

use crate::compiler::codegen::regs::{Gpr, Vmm};
use crate::compiler::codegen::tables::{lane_mask, replicate_u32, ConstPool};
use crate::dispatch::ComputeEngine;
use crate::types::{BrgemmError, BrgemmResult};

const ZMM: [AsmRegisterZmm; 32] = [
    zmm0, zmm1, zmm2, zmm3, zmm4, zmm5, zmm6, zmm7, zmm8, zmm9, zmm10, zmm11, zmm12, zmm13, zmm14,
    zmm15, zmm16, zmm17, zmm18, zmm19, zmm20, zmm21, zmm22, zmm23, zmm24, zmm25, zmm26, zmm27,
    zmm28, zmm29, zmm30, zmm31,
];
const YMM: [AsmRegisterYmm; 32] = [
    ymm0, ymm1, ymm2, ymm3, ymm4, ymm5, ymm6, ymm7, ymm8, ymm9, ymm10, ymm11, ymm12, ymm13, ymm14,
    ymm15, ymm16, ymm17, ymm18, ymm19, ymm20, ymm21, ymm22, ymm23, ymm24, ymm25, ymm26, ymm27,
    ymm28, ymm29, ymm30, ymm31,
];
const XMM: [AsmRegisterXmm; 32] = [
    xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13, xmm14,
    xmm15, xmm16, xmm17, xmm18, xmm19, xmm20, xmm21, xmm22, xmm23, xmm24, xmm25, xmm26, xmm27,
    xmm28, xmm29, xmm30, xmm31,
];
const KREG: [AsmRegisterK; 8] = [k0, k1, k2, k3, k4, k5, k6, k7];
const TMM: [AsmRegisterTmm; 8] = [tmm0, tmm1, tmm2, tmm3, tmm4, tmm5, tmm6, tmm7];

/// Opmask holding the ld-tail lanes.
pub const K_TAIL: u8 = 3;
/// Byte masks used by tile staging (A row, B row).
pub const K_STAGE_A: u8 = 4;
pub const K_STAGE_B: u8 = 5;
/// Scratch opmask for compares.
pub const K_CMP: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Z,
    Y,
    X,
}

impl Width {
    pub fn bytes(self) -> usize {
        match self {
            Width::Z => 64,
            Width::Y => 32,
            Width::X => 16,
        }
    }

    fn half(self) -> Width {
        match self {
            Width::Z => Width::Y,
            _ => Width::X,
        }
    }
}

/// A vector register at a given width, optionally masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V {
    pub idx: u8,
    pub w: Width,
    mask: Option<(u8, bool)>,
}

macro_rules! masked {
    ($r:expr, $mask:expr) => {{
        let r = $r;
        match $mask {
            None => r,
            Some((k, zero)) => {
                let r = match k {
                    1 => r.k1(),
                    2 => r.k2(),
                    3 => r.k3(),
                    4 => r.k4(),
                    5 => r.k5(),
                    6 => r.k6(),
                    _ => r.k7(),
                };
                if zero {
                    r.z()
                } else {
                    r
                }
            }
        }
    }};
}

impl V {
    pub fn new(idx: u8, w: Width) -> Self {
        V { idx, w, mask: None }
    }

    /// Merge-masked by opmask `k`.
    pub fn k(self, k: u8) -> Self {
        V {
            mask: Some((k, false)),
            ..self
        }
    }

    /// Zero-masked by opmask `k`.
    pub fn kz(self, k: u8) -> Self {
        V {
            mask: Some((k, true)),
            ..self
        }
    }

    /// Same register one width down (zmm → ymm → xmm), unmasked.
    pub fn half(self) -> Self {
        V::new(self.idx, self.w.half())
    }

    pub fn xmm_of(self) -> Self {
        V::new(self.idx, Width::X)
    }

    pub fn zmm(self) -> AsmRegisterZmm {
        masked!(ZMM[self.idx as usize], self.mask)
    }

    pub fn ymm(self) -> AsmRegisterYmm {
        masked!(YMM[self.idx as usize], self.mask)
    }

    pub fn xmm(self) -> AsmRegisterXmm {
        masked!(XMM[self.idx as usize], self.mask)
    }
}

/// Register or memory source operand.
#[derive(Clone, Copy)]
pub enum Src {
    R(V),
    M(AsmMemoryOperand),
}

impl From<V> for Src {
    fn from(v: V) -> Self {
        Src::R(v)
    }
}

impl From<AsmMemoryOperand> for Src {
    fn from(m: AsmMemoryOperand) -> Self {
        Src::M(m)
    }
}

pub fn kreg(k: u8) -> AsmRegisterK {
    KREG[k as usize]
}

pub fn tmm(idx: u8) -> BrgemmResult<AsmRegisterTmm> {
    TMM.get(idx as usize)
        .copied()
        .ok_or_else(|| BrgemmError::Assembler(format!("tmm index {idx} out of range (0..7)")))
}

/// Memory destination merge-masked by opmask `k`.
pub fn kmem(m: AsmMemoryOperand, k: u8) -> AsmMemoryOperand {
    match k {
        1 => m.k1(),
        2 => m.k2(),
        3 => m.k3(),
        4 => m.k4(),
        5 => m.k5(),
        6 => m.k6(),
        _ => m.k7(),
    }
}

/// `[rsp + off]` as a qword.
pub fn frame(off: usize) -> AsmMemoryOperand {
    qword_ptr(rsp + off as i32)
}

/// `[reg + disp]`, unsized.
pub fn at(base: Gpr, disp: i32) -> AsmMemoryOperand {
    ptr(base.r64() + disp)
}

/// Same-width three-operand ops available at every width, reg or mem.
macro_rules! op3 {
    ($($name:ident),* $(,)?) => {$(
        pub fn $name(&mut self, d: V, a: V, b: impl Into<Src>) -> BrgemmResult<()> {
            match (d.w, b.into()) {
                (Width::Z, Src::R(b)) => self.asm.$name(d.zmm(), a.zmm(), b.zmm())?,
                (Width::Z, Src::M(m)) => self.asm.$name(d.zmm(), a.zmm(), m)?,
                (Width::Y, Src::R(b)) => self.asm.$name(d.ymm(), a.ymm(), b.ymm())?,
                (Width::Y, Src::M(m)) => self.asm.$name(d.ymm(), a.ymm(), m)?,
                (Width::X, Src::R(b)) => self.asm.$name(d.xmm(), a.xmm(), b.xmm())?,
                (Width::X, Src::M(m)) => self.asm.$name(d.xmm(), a.xmm(), m)?,
            }
            Ok(())
        }
    )*};
}

/// Same-width shifts by immediate.
macro_rules! shift_imm {
    ($($name:ident),* $(,)?) => {$(
        pub fn $name(&mut self, d: V, a: V, imm: i32) -> BrgemmResult<()> {
            match d.w {
                Width::Z => self.asm.$name(d.zmm(), a.zmm(), imm)?,
                Width::Y => self.asm.$name(d.ymm(), a.ymm(), imm)?,
                Width::X => self.asm.$name(d.xmm(), a.xmm(), imm)?,
            }
            Ok(())
        }
    )*};
}

/// Same-width two-operand ops (conversions, loads).
macro_rules! op2 {
    ($($name:ident),* $(,)?) => {$(
        pub fn $name(&mut self, d: V, s: impl Into<Src>) -> BrgemmResult<()> {
            match (d.w, s.into()) {
                (Width::Z, Src::R(s)) => self.asm.$name(d.zmm(), s.zmm())?,
                (Width::Z, Src::M(m)) => self.asm.$name(d.zmm(), m)?,
                (Width::Y, Src::R(s)) => self.asm.$name(d.ymm(), s.ymm())?,
                (Width::Y, Src::M(m)) => self.asm.$name(d.ymm(), m)?,
                (Width::X, Src::R(s)) => self.asm.$name(d.xmm(), s.xmm())?,
                (Width::X, Src::M(m)) => self.asm.$name(d.xmm(), m)?,
            }
            Ok(())
        }
    )*};
}

/// Broadcasts: the register source is always an xmm.
macro_rules! bcst {
    ($($name:ident),* $(,)?) => {$(
        pub fn $name(&mut self, d: V, s: impl Into<Src>) -> BrgemmResult<()> {
            match (d.w, s.into()) {
                (Width::Z, Src::R(s)) => self.asm.$name(d.zmm(), s.xmm())?,
                (Width::Z, Src::M(m)) => self.asm.$name(d.zmm(), m)?,
                (Width::Y, Src::R(s)) => self.asm.$name(d.ymm(), s.xmm())?,
                (Width::Y, Src::M(m)) => self.asm.$name(d.ymm(), m)?,
                (Width::X, Src::R(s)) => self.asm.$name(d.xmm(), s.xmm())?,
                (Width::X, Src::M(m)) => self.asm.$name(d.xmm(), m)?,
            }
            Ok(())
        }
    )*};
}

/// Widening ops whose register source is half the destination width.
macro_rules! widen_half {
    ($($name:ident),* $(,)?) => {$(
        pub fn $name(&mut self, d: V, s: impl Into<Src>) -> BrgemmResult<()> {
            match (d.w, s.into()) {
                (Width::Z, Src::R(s)) => self.asm.$name(d.zmm(), s.ymm())?,
                (Width::Z, Src::M(m)) => self.asm.$name(d.zmm(), m)?,
                (Width::Y, Src::R(s)) => self.asm.$name(d.ymm(), s.xmm())?,
                (Width::Y, Src::M(m)) => self.asm.$name(d.ymm(), m)?,
                (Width::X, Src::R(s)) => self.asm.$name(d.xmm(), s.xmm())?,
                (Width::X, Src::M(m)) => self.asm.$name(d.xmm(), m)?,
            }
            Ok(())
        }
    )*};
}

/// Widening ops whose register source is always an xmm (byte → dword).
macro_rules! widen_quarter {
    ($($name:ident),* $(,)?) => {$(
        pub fn $name(&mut self, d: V, s: impl Into<Src>) -> BrgemmResult<()> {
            match (d.w, s.into()) {
                (Width::Z, Src::R(s)) => self.asm.$name(d.zmm(), s.xmm())?,
                (Width::Z, Src::M(m)) => self.asm.$name(d.zmm(), m)?,
                (Width::Y, Src::R(s)) => self.asm.$name(d.ymm(), s.xmm())?,
                (Width::Y, Src::M(m)) => self.asm.$name(d.ymm(), m)?,
                (Width::X, Src::R(s)) => self.asm.$name(d.xmm(), s.xmm())?,
                (Width::X, Src::M(m)) => self.asm.$name(d.xmm(), m)?,
            }
            Ok(())
        }
    )*};
}

/// zmm-source narrowing stores (`vpmov*`), to an xmm/ymm register or memory.
macro_rules! narrow_zmm {
    ($($name:ident => $reg:ident),* $(,)?) => {$(
        pub fn $name(&mut self, d: Src, s: V) -> BrgemmResult<()> {
            match d {
                Src::R(d) => self.asm.$name(d.$reg(), s.zmm())?,
                Src::M(m) => self.asm.$name(m, s.zmm())?,
            }
            Ok(())
        }
    )*};
}

pub struct Emitter {
    pub asm: CodeAssembler,
    pub engine: ComputeEngine,
    pool: ConstPool,
    last_bind: Option<usize>,
}

impl Emitter {
    pub fn new(engine: ComputeEngine) -> BrgemmResult<Self> {
        let mut asm = CodeAssembler::new(64)?;
        asm.set_prefer_vex(!engine.has_opmask());
        Ok(Emitter {
            asm,
            engine,
            pool: ConstPool::new(),
            last_bind: None,
        })
    }

    fn width(&self) -> Width {
        match self.engine {
            ComputeEngine::Avx2 => Width::Y,
            ComputeEngine::Avx512 | ComputeEngine::Amx => Width::Z,
        }
    }

    /// Full-width view of a vector register.
    pub fn v(&self, r: Vmm) -> V {
        V::new(r.0, self.width())
    }

    /// Half-width view (ymm on zmm engines, xmm on the ymm engine).
    pub fn h(&self, r: Vmm) -> V {
        V::new(r.0, self.width().half())
    }

    pub fn x(&self, r: Vmm) -> V {
        V::new(r.0, Width::X)
    }

    pub fn evex(&self) -> bool {
        self.engine.has_opmask()
    }

    pub fn vlen(&self) -> usize {
        self.width().bytes()
    }

    pub fn lanes(&self) -> usize {
        self.vlen() / 4
    }

    pub fn label(&mut self) -> CodeLabel {
        self.asm.create_label()
    }

    /// Bind `label` to the next instruction.
    pub fn bind(&mut self, label: &mut CodeLabel) -> BrgemmResult<()> {
        let pos = self.asm.instructions().len();
        if self.last_bind == Some(pos) {
            self.asm.nop()?;
        }
        self.asm.set_label(label)?;
        self.last_bind = Some(self.asm.instructions().len());
        Ok(())
    }

    /// Number of instructions emitted so far.
    pub fn len(&self) -> usize {
        self.asm.instructions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full-width vector of one replicated dword from the constant pool.
    pub fn constant(&mut self, value: u32) -> AsmMemoryOperand {
        let lanes = self.lanes();
        let label = self.pool.intern(&mut self.asm, replicate_u32(value, lanes));
        ptr(label)
    }

    pub fn constant_f32(&mut self, value: f32) -> AsmMemoryOperand {
        self.constant(value.to_bits())
    }

    /// Arbitrary blob in the constant pool.
    pub fn blob(&mut self, bytes: Vec<u8>) -> AsmMemoryOperand {
        let label = self.pool.intern(&mut self.asm, bytes);
        ptr(label)
    }

    /// `vmaskmovps` lane mask for `valid` of the engine's dword lanes.
    pub fn tail_mask_vec(&mut self, valid: usize) -> AsmMemoryOperand {
        let lanes = self.lanes();
        self.blob(lane_mask(valid, lanes))
    }

    /// Load an opmask with the low `bits` bits set.
    pub fn set_kmask(&mut self, k: u8, bits: usize, tmp: Gpr) -> BrgemmResult<()> {
        let value: u64 = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
        self.asm.mov(tmp.r64(), value)?;
        self.asm.kmovq(kreg(k), tmp.r64())?;
        Ok(())
    }

    /// Append the constant pool and assemble.
    pub fn finish(mut self) -> BrgemmResult<(Vec<u8>, usize)> {
        let pool_bytes = self.pool.size();
        self.pool.emit(&mut self.asm)?;
        let code = self.asm.assemble(0)?;
        Ok((code, pool_bytes))
    }

    op3!(
        vfmadd231ps,
        vfmadd213ps,
        vmulps,
        vaddps,
        vsubps,
        vmaxps,
        vminps,
        vpaddd,
        vpsubd,
        vpmulld,
        vpdpbusd,
        vdpbf16ps,
        vpmaddubsw,
        vpmaddwd,
        vpsubb,
        vpminud,
        vpackssdw,
        vpackusdw,
        vpacksswb,
        vpackuswb,
    );

    shift_imm!(vpslld, vpsrld, vpsrad, vpsllw);

    op2!(vcvtdq2ps, vcvtps2dq, vmovups);

    bcst!(vbroadcastss, vpbroadcastd, vpbroadcastw, vpbroadcastb);

    widen_half!(vpmovzxwd, vcvtph2ps, vpmovzxbw);

    widen_quarter!(vpmovzxbd, vpmovsxbd);

    narrow_zmm!(
        vpmovdb => xmm,
        vpmovsdb => xmm,
        vpmovusdb => xmm,
        vpmovdw => ymm,
    );

    /// `d = a & b`
    pub fn vand(&mut self, d: V, a: V, b: impl Into<Src>) -> BrgemmResult<()> {
        if self.evex() {
            self.evex_logic(LogicOp::And, d, a, b.into())
        } else {
            self.vex_logic(LogicOp::And, d, a, b.into())
        }
    }

    pub fn vor(&mut self, d: V, a: V, b: impl Into<Src>) -> BrgemmResult<()> {
        if self.evex() {
            self.evex_logic(LogicOp::Or, d, a, b.into())
        } else {
            self.vex_logic(LogicOp::Or, d, a, b.into())
        }
    }

    pub fn vxor(&mut self, d: V, a: V, b: impl Into<Src>) -> BrgemmResult<()> {
        if self.evex() {
            self.evex_logic(LogicOp::Xor, d, a, b.into())
        } else {
            self.vex_logic(LogicOp::Xor, d, a, b.into())
        }
    }

    pub fn vzero(&mut self, d: V) -> BrgemmResult<()> {
        self.vxor(d, d, d)
    }

    fn evex_logic(&mut self, op: LogicOp, d: V, a: V, b: Src) -> BrgemmResult<()> {
        macro_rules! go {
            ($m:ident) => {
                match (d.w, b) {
                    (Width::Z, Src::R(b)) => self.asm.$m(d.zmm(), a.zmm(), b.zmm())?,
                    (Width::Z, Src::M(m)) => self.asm.$m(d.zmm(), a.zmm(), m)?,
                    (Width::Y, Src::R(b)) => self.asm.$m(d.ymm(), a.ymm(), b.ymm())?,
                    (Width::Y, Src::M(m)) => self.asm.$m(d.ymm(), a.ymm(), m)?,
                    (Width::X, Src::R(b)) => self.asm.$m(d.xmm(), a.xmm(), b.xmm())?,
                    (Width::X, Src::M(m)) => self.asm.$m(d.xmm(), a.xmm(), m)?,
                }
            };
        }
        match op {
            LogicOp::And => go!(vpandd),
            LogicOp::Or => go!(vpord),
            LogicOp::Xor => go!(vpxord),
        }
        Ok(())
    }

    fn vex_logic(&mut self, op: LogicOp, d: V, a: V, b: Src) -> BrgemmResult<()> {
        macro_rules! go {
            ($m:ident) => {
                match (d.w, b) {
                    (Width::Y, Src::R(b)) => self.asm.$m(d.ymm(), a.ymm(), b.ymm())?,
                    (Width::Y, Src::M(m)) => self.asm.$m(d.ymm(), a.ymm(), m)?,
                    (Width::X, Src::R(b)) => self.asm.$m(d.xmm(), a.xmm(), b.xmm())?,
                    (Width::X, Src::M(m)) => self.asm.$m(d.xmm(), a.xmm(), m)?,
                    (Width::Z, _) => {
                        return Err(BrgemmError::Assembler(
                            "zmm bitwise op on a VEX-only engine".into(),
                        ))
                    }
                }
            };
        }
        match op {
            LogicOp::And => go!(vpand),
            LogicOp::Or => go!(vpor),
            LogicOp::Xor => go!(vpxor),
        }
        Ok(())
    }

    /// Full-width store of 32-bit lanes.
    pub fn vmovups_st(&mut self, m: AsmMemoryOperand, s: V) -> BrgemmResult<()> {
        match s.w {
            Width::Z => self.asm.vmovups(m, s.zmm())?,
            Width::Y => self.asm.vmovups(m, s.ymm())?,
            Width::X => self.asm.vmovups(m, s.xmm())?,
        }
        Ok(())
    }

    /// Byte-granular load (EVEX only).
    pub fn vmovdqu8(&mut self, d: V, m: AsmMemoryOperand) -> BrgemmResult<()> {
        match d.w {
            Width::Z => self.asm.vmovdqu8(d.zmm(), m)?,
            Width::Y => self.asm.vmovdqu8(d.ymm(), m)?,
            Width::X => self.asm.vmovdqu8(d.xmm(), m)?,
        }
        Ok(())
    }

    pub fn vmovdqu8_st(&mut self, m: AsmMemoryOperand, s: V) -> BrgemmResult<()> {
        match s.w {
            Width::Z => self.asm.vmovdqu8(m, s.zmm())?,
            Width::Y => self.asm.vmovdqu8(m, s.ymm())?,
            Width::X => self.asm.vmovdqu8(m, s.xmm())?,
        }
        Ok(())
    }

    pub fn vmovdqu16_st(&mut self, m: AsmMemoryOperand, s: V) -> BrgemmResult<()> {
        match s.w {
            Width::Z => self.asm.vmovdqu16(m, s.zmm())?,
            Width::Y => self.asm.vmovdqu16(m, s.ymm())?,
            Width::X => self.asm.vmovdqu16(m, s.xmm())?,
        }
        Ok(())
    }

    /// `vpermps d, idx, table` (no xmm form).
    pub fn vpermps(&mut self, d: V, idx: V, table: V) -> BrgemmResult<()> {
        match d.w {
            Width::Z => self.asm.vpermps(d.zmm(), idx.zmm(), table.zmm())?,
            _ => self.asm.vpermps(d.ymm(), idx.ymm(), table.ymm())?,
        }
        Ok(())
    }

    /// `vcvtps2ph` from a full register into its half or memory.
    pub fn vcvtps2ph(&mut self, d: Src, s: V) -> BrgemmResult<()> {
        match (s.w, d) {
            (Width::Z, Src::R(d)) => self.asm.vcvtps2ph(d.ymm(), s.zmm(), 0)?,
            (Width::Z, Src::M(m)) => self.asm.vcvtps2ph(m, s.zmm(), 0)?,
            (_, Src::R(d)) => self.asm.vcvtps2ph(d.xmm(), s.ymm(), 0)?,
            (_, Src::M(m)) => self.asm.vcvtps2ph(m, s.ymm(), 0)?,
        }
        Ok(())
    }

    pub fn vcvtneps2bf16(&mut self, d: V, s: V) -> BrgemmResult<()> {
        match s.w {
            Width::Z => self.asm.vcvtneps2bf16(d.ymm(), s.zmm())?,
            _ => self.asm.vcvtneps2bf16(d.xmm(), s.ymm())?,
        }
        Ok(())
    }

    // Narrow-engine only.

    /// `vmaskmovps d, mask, [m]`
    pub fn vmaskmovps_ld(&mut self, d: V, mask: V, m: AsmMemoryOperand) -> BrgemmResult<()> {
        self.asm.vmaskmovps(d.ymm(), mask.ymm(), m)?;
        Ok(())
    }

    /// `vmaskmovps [m], mask, s`
    pub fn vmaskmovps_st(&mut self, m: AsmMemoryOperand, mask: V, s: V) -> BrgemmResult<()> {
        self.asm.vmaskmovps(m, mask.ymm(), s.ymm())?;
        Ok(())
    }

    pub fn vpermq(&mut self, d: V, s: V, imm: i32) -> BrgemmResult<()> {
        self.asm.vpermq(d.ymm(), s.ymm(), imm)?;
        Ok(())
    }

    pub fn vblendvps(&mut self, d: V, a: V, b: V, mask: V) -> BrgemmResult<()> {
        self.asm.vblendvps(d.ymm(), a.ymm(), b.ymm(), mask.ymm())?;
        Ok(())
    }

    /// Vector-destination signed compare (VEX).
    pub fn vpcmpgtd(&mut self, d: V, a: V, b: V) -> BrgemmResult<()> {
        self.asm.vpcmpgtd(d.ymm(), a.ymm(), b.ymm())?;
        Ok(())
    }

    pub fn vextracti128(&mut self, d: V, s: V, imm: i32) -> BrgemmResult<()> {
        self.asm.vextracti128(d.xmm(), s.ymm(), imm)?;
        Ok(())
    }

    // Wide-engine only.

    /// `vcmpps k, a, b, pred`
    pub fn vcmpps_k(&mut self, k: u8, a: V, b: impl Into<Src>, pred: i32) -> BrgemmResult<()> {
        match b.into() {
            Src::R(b) => self.asm.vcmpps(kreg(k), a.zmm(), b.zmm(), pred)?,
            Src::M(m) => self.asm.vcmpps(kreg(k), a.zmm(), m, pred)?,
        }
        Ok(())
    }

    /// Load `n <= 16` bytes from `[base + disp]` into the low bytes of
    /// `d` (xmm), zeroing the rest. Never touches memory past `n`.
    pub fn load_bytes(&mut self, d: V, base: Gpr, disp: i32, n: usize) -> BrgemmResult<()> {
        let x = d.xmm_of();
        self.vzero(x)?;
        let mut off = 0usize;
        while off < n {
            let left = n - off;
            let m = base.r64() + disp + off as i32;
            if left >= 8 {
                self.asm.vpinsrq(x.xmm(), x.xmm(), qword_ptr(m), (off / 8) as i32)?;
                off += 8;
            } else if left >= 4 {
                self.asm.vpinsrd(x.xmm(), x.xmm(), dword_ptr(m), (off / 4) as i32)?;
                off += 4;
            } else if left >= 2 {
                self.asm.vpinsrw(x.xmm(), x.xmm(), word_ptr(m), (off / 2) as i32)?;
                off += 2;
            } else {
                self.asm.vpinsrb(x.xmm(), x.xmm(), byte_ptr(m), off as i32)?;
                off += 1;
            }
        }
        Ok(())
    }

    /// Store the low `n <= 16` bytes of `s` (xmm) to `[base + disp]`.
    pub fn store_bytes(&mut self, s: V, base: Gpr, disp: i32, n: usize) -> BrgemmResult<()> {
        let x = s.xmm_of();
        let mut off = 0usize;
        while off < n {
            let left = n - off;
            let m = base.r64() + disp + off as i32;
            if left >= 16 {
                if self.evex() {
                    self.asm.vmovdqu8(xmmword_ptr(m), x.xmm())?;
                } else {
                    self.asm.vmovdqu(xmmword_ptr(m), x.xmm())?;
                }
                off += 16;
            } else if left >= 8 {
                self.asm.vpextrq(qword_ptr(m), x.xmm(), (off / 8) as i32)?;
                off += 8;
            } else if left >= 4 {
                self.asm.vpextrd(dword_ptr(m), x.xmm(), (off / 4) as i32)?;
                off += 4;
            } else if left >= 2 {
                self.asm.vpextrw(word_ptr(m), x.xmm(), (off / 2) as i32)?;
                off += 2;
            } else {
                self.asm.vpextrb(byte_ptr(m), x.xmm(), off as i32)?;
                off += 1;
            }
        }
        Ok(())
    }

    /// `dst = src` for general-purpose registers, skipped when equal.
    pub fn mov_gpr(&mut self, dst: Gpr, src: Gpr) -> BrgemmResult<()> {
        if dst != src {
            self.asm.mov(dst.r64(), src.r64())?;
        }
        Ok(())
    }

    /// `reg += imm`, skipped for zero.
    pub fn add_imm(&mut self, reg: Gpr, imm: usize) -> BrgemmResult<()> {
        if imm != 0 {
            self.asm.add(reg.r64(), imm as i32)?;
        }
        Ok(())
    }

    /// `qword [rsp + off] += imm`, skipped for zero.
    pub fn add_frame(&mut self, off: usize, imm: usize) -> BrgemmResult<()> {
        if imm != 0 {
            self.asm.add(frame(off), imm as i32)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum LogicOp {
    And,
    Or,
    Xor,
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions, EncodingKind, Mnemonic};

    fn decode(code: &[u8]) -> Vec<Mnemonic> {
        let mut dec = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
        let mut out = Vec::new();
        while dec.can_decode() {
            out.push(dec.decode().mnemonic());
        }
        out
    }

    #[test]
    fn test_logic_picks_encoding() {
        let mut e = Emitter::new(ComputeEngine::Avx2).unwrap();
        let a = e.v(Vmm(1));
        e.vxor(a, a, a).unwrap();
        e.asm.ret().unwrap();
        let (code, _) = e.finish().unwrap();
        assert_eq!(decode(&code)[0], Mnemonic::Vpxor);

        let mut e = Emitter::new(ComputeEngine::Avx512).unwrap();
        let a = e.v(Vmm(20));
        e.vxor(a, a, a).unwrap();
        e.asm.ret().unwrap();
        let (code, _) = e.finish().unwrap();
        assert_eq!(decode(&code)[0], Mnemonic::Vpxord);
    }

    #[test]
    fn test_bind_twice_pads_with_nop() {
        let mut e = Emitter::new(ComputeEngine::Avx512).unwrap();
        let mut l1 = e.label();
        let mut l2 = e.label();
        e.bind(&mut l1).unwrap();
        e.bind(&mut l2).unwrap();
        e.asm.ret().unwrap();
        let (code, _) = e.finish().unwrap();
        assert_eq!(decode(&code), vec![Mnemonic::Nop, Mnemonic::Ret]);
    }

    #[test]
    fn test_load_bytes_splits_exactly() {
        let mut e = Emitter::new(ComputeEngine::Avx2).unwrap();
        let d = e.x(Vmm(2));
        e.load_bytes(d, Gpr::Rax, 0, 7).unwrap();
        e.asm.ret().unwrap();
        let (code, _) = e.finish().unwrap();
        assert_eq!(
            decode(&code),
            vec![
                Mnemonic::Vpxor,
                Mnemonic::Vpinsrd,
                Mnemonic::Vpinsrw,
                Mnemonic::Vpinsrb,
                Mnemonic::Ret
            ]
        );
    }

    #[test]
    fn test_high_registers_encode_as_evex() {
        let mut e = Emitter::new(ComputeEngine::Avx512).unwrap();
        let x = e.x(Vmm(21));
        e.load_bytes(x, Gpr::R11, 12, 7).unwrap();
        let y = e.x(Vmm(30));
        e.store_bytes(y, Gpr::Rax, 0, 16).unwrap();
        e.store_bytes(y, Gpr::Rax, 32, 3).unwrap();
        let h = e.h(Vmm(27));
        e.vpmovzxbw(h.kz(K_TAIL), at(Gpr::R10, 0)).unwrap();
        e.vpsllw(h, h, 8).unwrap();
        e.asm.ret().unwrap();
        let (code, _) = e.finish().unwrap();

        let mut dec = Decoder::with_ip(64, &code, 0, DecoderOptions::NONE);
        let mut seen = Vec::new();
        while dec.can_decode() {
            let ins = dec.decode();
            assert!(!ins.is_invalid());
            if ins.mnemonic() != Mnemonic::Ret {
                assert_eq!(ins.encoding(), EncodingKind::EVEX, "{:?}", ins.mnemonic());
            }
            seen.push(ins.mnemonic());
        }
        assert_eq!(
            seen,
            vec![
                Mnemonic::Vpxord,
                Mnemonic::Vpinsrd,
                Mnemonic::Vpinsrw,
                Mnemonic::Vpinsrb,
                Mnemonic::Vmovdqu8,
                Mnemonic::Vpextrw,
                Mnemonic::Vpextrb,
                Mnemonic::Vpmovzxbw,
                Mnemonic::Vpsllw,
                Mnemonic::Ret
            ]
        );
    }

    #[test]
    fn test_narrow_engine_keeps_vex() {
        let mut e = Emitter::new(ComputeEngine::Avx2).unwrap();
        let x = e.x(Vmm(3));
        e.store_bytes(x, Gpr::Rax, 0, 16).unwrap();
        e.asm.ret().unwrap();
        let (code, _) = e.finish().unwrap();
        let mut dec = Decoder::with_ip(64, &code, 0, DecoderOptions::NONE);
        let ins = dec.decode();
        assert_eq!(ins.mnemonic(), Mnemonic::Vmovdqu);
        assert_eq!(ins.encoding(), EncodingKind::VEX);
    }

    #[test]
    fn test_constants_follow_code() {
        let mut e = Emitter::new(ComputeEngine::Avx512).unwrap();
        let c = e.constant_f32(1.0);
        let d = e.v(Vmm(0));
        e.vmovups(d, c).unwrap();
        e.asm.ret().unwrap();
        let (code, pool) = e.finish().unwrap();
        assert_eq!(pool, 64);
        let tail = &code[code.len() - 64..];
        assert_eq!(&tail[..4], &1.0f32.to_le_bytes());
    }
}
