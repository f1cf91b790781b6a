//! Scalar reference implementations for the BRGEMM kernel generator.
//!
//! These serve as:
//! 1. Golden reference for correctness testing of generated kernels.
//! 2. The bit-exact definition of every narrow numeric format the generator
//!    decodes or encodes (bf16, f16, fp8 e4m3/e5m2, u4/s4/nf4).
//!
//! Everything here is plain safe Rust over slices. Nothing is vectorized on
//! purpose: the reference must stay obviously correct.

pub mod brgemm;
pub mod formats;
