//! Format loads: one vector of any supported element type, widened to
//! 32-bit lanes, with ld-tail handling.
//!
//! Tails use the `K_TAIL` opmask on the wide engines. The narrow engine has
//! no opmask, so 32-bit tails go through `vmaskmovps` and narrower types
//! through exact byte loads.

use iced_x86::code_asm::*;

use crate::compiler::codegen::emitter::{at, Emitter, Src, V, K_TAIL};
use crate::compiler::codegen::regs::{Gpr, Vmm};
use crate::types::{BrgemmResult, DataType};

/// `2^120` as f32: rebias from e4m3 (bias 7) to f32 (bias 127).
pub const E4M3_TO_F32_SCALE: u32 = 0x7B80_0000;

/// Zero-masked full-width view when `tail` is set on an opmask engine.
fn tail_view(e: &Emitter, v: V, tail: Option<usize>) -> V {
    if tail.is_some() && e.evex() {
        v.kz(K_TAIL)
    } else {
        v
    }
}

/// Load `dt` elements at `[base + disp]` into 32-bit lanes of `dst`.
///
/// Integer types stay integers (sign- or zero-extended), float types become
/// f32. e4m3 needs `tmp` for the exponent rebias.
pub fn load_widen(
    e: &mut Emitter,
    dst: Vmm,
    dt: DataType,
    base: Gpr,
    disp: i32,
    tail: Option<usize>,
    tmp: Vmm,
) -> BrgemmResult<()> {
    let v = e.v(dst);
    let m = at(base, disp);
    let narrow_tail = tail.filter(|_| !e.evex());

    match dt {
        DataType::F32 | DataType::S32 => match narrow_tail {
            Some(n) => {
                let mask = e.tail_mask_vec(n);
                e.vmovups(v, mask)?;
                e.vmaskmovps_ld(v, v, m)?;
            }
            None => e.vmovups(tail_view(e, v, tail), m)?,
        },
        DataType::Bf16 => {
            widen_from(e, v, m, base, disp, narrow_tail, 2, tail, Emitter::vpmovzxwd)?;
            e.vpslld(v, v, 16)?;
        }
        DataType::F16 => {
            widen_from(e, v, m, base, disp, narrow_tail, 2, tail, Emitter::vcvtph2ps)?;
        }
        DataType::S8 => {
            widen_from(e, v, m, base, disp, narrow_tail, 1, tail, Emitter::vpmovsxbd)?;
        }
        DataType::U8 => {
            widen_from(e, v, m, base, disp, narrow_tail, 1, tail, Emitter::vpmovzxbd)?;
        }
        DataType::F8E5M2 => {
            let h = e.h(dst);
            match narrow_tail {
                Some(n) => {
                    e.load_bytes(h, base, disp, n)?;
                    e.vpmovzxbw(h, h.xmm_of())?;
                }
                None => e.vpmovzxbw(tail_view(e, h, tail), m)?,
            }
            e.vpsllw(h, h, 8)?;
            e.vcvtph2ps(v, h)?;
        }
        DataType::F8E4M3 => {
            widen_from(e, v, m, base, disp, narrow_tail, 1, tail, Emitter::vpmovzxbd)?;
            decode_e4m3(e, dst, tmp)?;
        }
        DataType::S4 | DataType::U4 | DataType::Nf4 => {
            widen_from(e, v, m, base, disp, narrow_tail, 1, tail, Emitter::vpmovzxbd)?;
        }
    }
    Ok(())
}

type WidenFn = fn(&mut Emitter, V, Src) -> BrgemmResult<()>;

#[allow(clippy::too_many_arguments)]
fn widen_from(
    e: &mut Emitter,
    v: V,
    m: AsmMemoryOperand,
    base: Gpr,
    disp: i32,
    narrow_tail: Option<usize>,
    esize: usize,
    tail: Option<usize>,
    op: WidenFn,
) -> BrgemmResult<()> {
    match narrow_tail {
        Some(n) => {
            let x = v.xmm_of();
            e.load_bytes(x, base, disp, n * esize)?;
            op(e, v, Src::R(x))
        }
        None => {
            let d = tail_view(e, v, tail);
            op(e, d, Src::M(m))
        }
    }
}

/// Like [`load_widen`], then integer lanes are converted to f32.
pub fn load_as_f32(
    e: &mut Emitter,
    dst: Vmm,
    dt: DataType,
    base: Gpr,
    disp: i32,
    tail: Option<usize>,
    tmp: Vmm,
) -> BrgemmResult<()> {
    load_widen(e, dst, dt, base, disp, tail, tmp)?;
    if !dt.is_float() {
        let v = e.v(dst);
        e.vcvtdq2ps(v, v)?;
    }
    Ok(())
}

/// In-place e4m3 → f32 on dword lanes holding one code each.
///
/// The 7 magnitude bits move to f32 bits 26..20, so f32 exponent and
/// mantissa line up and a single multiply by 2^120 fixes the bias. e4m3
/// denormals become f32 denormals and scale exactly. The NaN code decodes
/// to ±480.
pub fn decode_e4m3(e: &mut Emitter, x: Vmm, tmp: Vmm) -> BrgemmResult<()> {
    let (v, t) = (e.v(x), e.v(tmp));
    let sign = e.constant(0x80);
    let mag = e.constant(0x7F);
    let scale = e.constant(E4M3_TO_F32_SCALE);
    e.vand(t, v, sign)?;
    e.vpslld(t, t, 24)?;
    e.vand(v, v, mag)?;
    e.vpslld(v, v, 20)?;
    e.vmulps(v, v, scale)?;
    e.vor(v, v, t)?;
    Ok(())
}

/// Broadcast one A element of `dt` at `[base + disp]` to every f32 lane.
pub fn broadcast_as_f32(
    e: &mut Emitter,
    dst: Vmm,
    dt: DataType,
    base: Gpr,
    disp: i32,
    tmp: Vmm,
) -> BrgemmResult<()> {
    let v = e.v(dst);
    let h = e.h(dst);
    match dt {
        DataType::F32 => e.vbroadcastss(v, dword_ptr(base.r64() + disp))?,
        DataType::Bf16 => {
            e.vpbroadcastw(v, word_ptr(base.r64() + disp))?;
            e.vpslld(v, v, 16)?;
        }
        DataType::F16 => {
            e.vpbroadcastw(h, word_ptr(base.r64() + disp))?;
            e.vcvtph2ps(v, h)?;
        }
        DataType::F8E5M2 => {
            e.vpbroadcastb(h, byte_ptr(base.r64() + disp))?;
            e.vpsllw(h, h, 8)?;
            e.vcvtph2ps(v, h)?;
        }
        DataType::F8E4M3 => {
            e.vpbroadcastb(v, byte_ptr(base.r64() + disp))?;
            let low = e.constant(0xFF);
            e.vand(v, v, low)?;
            decode_e4m3(e, dst, tmp)?;
        }
        other => {
            return Err(crate::types::BrgemmError::Unsupported(format!(
                "{other} A operand in a float microkernel"
            )))
        }
    }
    Ok(())
}

/// Broadcast a dword group of A (`valid` bytes, at most 4) to every lane.
/// Short groups read exactly `valid` bytes when `exact` is set.
pub fn broadcast_dword(
    e: &mut Emitter,
    dst: Vmm,
    base: Gpr,
    disp: i32,
    valid: usize,
    exact: bool,
) -> BrgemmResult<()> {
    let v = e.v(dst);
    if valid >= 4 || !exact {
        e.vpbroadcastd(v, dword_ptr(base.r64() + disp))?;
    } else {
        let x = e.x(dst);
        e.load_bytes(x, base, disp, valid)?;
        e.vpbroadcastd(v, x)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ComputeEngine;
    use iced_x86::{Decoder, DecoderOptions, Mnemonic};

    fn mnemonics(e: Emitter) -> Vec<Mnemonic> {
        let (code, pool) = e.finish().unwrap();
        let code = &code[..code.len() - pool];
        let mut dec = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
        let mut out = Vec::new();
        while dec.can_decode() {
            out.push(dec.decode().mnemonic());
        }
        out
    }

    #[test]
    fn test_narrow_bf16_tail_reads_exact_bytes() {
        let mut e = Emitter::new(ComputeEngine::Avx2).unwrap();
        load_widen(&mut e, Vmm(4), DataType::Bf16, Gpr::R10, 0, Some(3), Vmm(5)).unwrap();
        e.asm.ret().unwrap();
        let m = mnemonics(e);
        assert_eq!(
            m,
            vec![
                Mnemonic::Vpxor,
                Mnemonic::Vpinsrd,
                Mnemonic::Vpinsrw,
                Mnemonic::Vpmovzxwd,
                Mnemonic::Vpslld,
                Mnemonic::Ret
            ]
        );
    }

    #[test]
    fn test_wide_tail_is_masked() {
        let mut e = Emitter::new(ComputeEngine::Avx512).unwrap();
        load_widen(&mut e, Vmm(4), DataType::F32, Gpr::R10, 0, Some(5), Vmm(5)).unwrap();
        e.asm.ret().unwrap();
        let (code, _) = e.finish().unwrap();
        let mut dec = Decoder::with_ip(64, &code, 0, DecoderOptions::NONE);
        let ins = dec.decode();
        assert_eq!(ins.mnemonic(), Mnemonic::Vmovups);
        assert_eq!(ins.op_mask(), iced_x86::Register::K3);
        assert!(ins.zeroing_masking());
    }

    #[test]
    fn test_e4m3_decode_uses_rebias_constant() {
        let mut e = Emitter::new(ComputeEngine::Avx512).unwrap();
        decode_e4m3(&mut e, Vmm(4), Vmm(5)).unwrap();
        e.asm.ret().unwrap();
        let (code, pool) = e.finish().unwrap();
        let consts = &code[code.len() - pool..];
        assert!(consts
            .chunks(64)
            .any(|c| c[..4] == E4M3_TO_F32_SCALE.to_le_bytes()));
    }
}
