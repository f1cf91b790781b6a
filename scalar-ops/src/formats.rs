//! Numeric format codecs.
//!
//! The fp8 encoders use the same rebias-and-round scheme as the generated
//! kernels: scale the magnitude into the f32 exponent range of the narrow
//! format, round-to-nearest-even on the dropped mantissa bits, saturate to
//! the largest finite code. NaN inputs saturate as well.

use half::{bf16, f16};

// ---------------------------------------------------------------------------
// 16-bit floats
// ---------------------------------------------------------------------------

#[inline]
pub fn bf16_to_f32(bits: u16) -> f32 {
    bf16::from_bits(bits).to_f32()
}

/// Round-to-nearest-even f32 → bf16.
#[inline]
pub fn f32_to_bf16(v: f32) -> u16 {
    bf16::from_f32(v).to_bits()
}

#[inline]
pub fn f16_to_f32(bits: u16) -> f32 {
    f16::from_bits(bits).to_f32()
}

#[inline]
pub fn f32_to_f16(v: f32) -> u16 {
    f16::from_f32(v).to_bits()
}

// ---------------------------------------------------------------------------
// 8-bit floats
// ---------------------------------------------------------------------------

/// Largest finite e4m3 code magnitude (448.0).
pub const E4M3_MAX_CODE: u8 = 0x7E;
/// Largest finite e5m2 code magnitude (57344.0).
pub const E5M2_MAX_CODE: u8 = 0x7B;

/// Decode e4m3 (bias 7, no infinities, 0x7F/0xFF are NaN).
pub fn e4m3_to_f32(code: u8) -> f32 {
    let sign = if code & 0x80 != 0 { -1.0 } else { 1.0 };
    let exp = ((code >> 3) & 0x0F) as i32;
    let man = (code & 0x07) as f32;
    if exp == 0x0F && code & 0x07 == 0x07 {
        return f32::NAN;
    }
    if exp == 0 {
        return sign * man * (2.0f32).powi(-9);
    }
    sign * (1.0 + man / 8.0) * (2.0f32).powi(exp - 7)
}

/// Decode e5m2 (bias 15). Bit-identical to the upper byte of an f16.
pub fn e5m2_to_f32(code: u8) -> f32 {
    f16_to_f32((code as u16) << 8)
}

pub fn f32_to_e4m3(v: f32) -> u8 {
    let sign = ((v.to_bits() >> 24) & 0x80) as u8;
    let scaled = (v.abs() * f32::from_bits((127 - 120) << 23)).to_bits();
    let rounded = (scaled + 0x7FFFF + ((scaled >> 20) & 1)) >> 20;
    sign | rounded.min(E4M3_MAX_CODE as u32) as u8
}

pub fn f32_to_e5m2(v: f32) -> u8 {
    let sign = ((v.to_bits() >> 24) & 0x80) as u8;
    let scaled = (v.abs() * f32::from_bits((127 - 112) << 23)).to_bits();
    let rounded = (scaled + 0xFFFFF + ((scaled >> 21) & 1)) >> 21;
    sign | rounded.min(E5M2_MAX_CODE as u32) as u8
}

// ---------------------------------------------------------------------------
// 4-bit weights
// ---------------------------------------------------------------------------

/// Normal-float-4 codebook: quantiles of N(0, 1) scaled to [-1, 1].
pub const NF4_CODEBOOK: [f32; 16] = [
    -1.0,
    -0.696_192_8,
    -0.525_073_05,
    -0.394_917_5,
    -0.284_441_38,
    -0.184_773_43,
    -0.091_050_036,
    0.0,
    0.079_580_3,
    0.160_930_2,
    0.246_112_3,
    0.337_915_24,
    0.440_709_83,
    0.562_617,
    0.722_956_84,
    1.0,
];

#[inline]
pub fn u4_to_f32(code: u8) -> f32 {
    (code & 0x0F) as f32
}

/// Two's-complement nibble.
#[inline]
pub fn s4_to_f32(code: u8) -> f32 {
    (((code & 0x0F) << 4) as i8 >> 4) as f32
}

#[inline]
pub fn nf4_to_f32(code: u8) -> f32 {
    NF4_CODEBOOK[(code & 0x0F) as usize]
}

/// Nearest codebook entry. Ties resolve to the lower code.
pub fn f32_to_nf4(v: f32) -> u8 {
    let mut best = 0usize;
    let mut best_err = f32::INFINITY;
    for (i, &c) in NF4_CODEBOOK.iter().enumerate() {
        let err = (c - v).abs();
        if err < best_err {
            best = i;
            best_err = err;
        }
    }
    best as u8
}

pub fn f32_to_u4(v: f32) -> u8 {
    v.round().clamp(0.0, 15.0) as u8
}

pub fn f32_to_s4(v: f32) -> u8 {
    (v.round().clamp(-8.0, 7.0) as i8 as u8) & 0x0F
}

// ---------------------------------------------------------------------------
// Integer saturation
// ---------------------------------------------------------------------------

/// Round-half-even then saturate, matching `vcvtps2dq` after clamping.
pub fn saturate_f32_to_i32(v: f32, lo: f32, hi: f32) -> i32 {
    let c = v.max(lo).min(hi);
    let r = c.round();
    // round() is half-away-from-zero; fix up exact ties to even.
    let r = if (c - c.trunc()).abs() == 0.5 && (r as i64) % 2 != 0 {
        r - c.signum()
    } else {
        r
    };
    r as i32
}

pub fn saturate_to_u8(v: f32) -> u8 {
    saturate_f32_to_i32(v, 0.0, 255.0) as u8
}

pub fn saturate_to_s8(v: f32) -> i8 {
    saturate_f32_to_i32(v, -128.0, 127.0) as i8
}

/// Upper bound used for s32 destinations: the largest f32 below 2^31.
pub const S32_UPPER_F32: f32 = 2_147_483_520.0;

pub fn saturate_to_s32(v: f32) -> i32 {
    saturate_f32_to_i32(v, -2_147_483_648.0, S32_UPPER_F32)
}
