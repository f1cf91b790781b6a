//! brgemm-kernels: runtime x86-64 generator for batch-reduce GEMM kernels.
//!
//! A kernel computes, for a batch of `bs` (A, B) block pairs,
//!
//! ```text
//! C[m, n] = alpha · Σ_batch Σ_k A[m, k] · B[k, n] + beta · C[m, n]
//! ```
//!
//! followed by an optional store pipeline (compensation, scales, bias,
//! post-ops, zero point, conversion) into D. Every shape, type and option is
//! fixed when the kernel is built, so the emitted code is fully unrolled
//! apart from the block loops.
//!
//! # Quick Start
//!
//! ```ignore
//! use brgemm_kernels::{BrgemmDesc, BrgemmKernel, BrgemmParams, BatchElement, DataType};
//!
//! let desc = BrgemmDesc::builder(DataType::F32, DataType::F32, 4, 16, 32).build()?;
//! let kernel = BrgemmKernel::new(desc)?;
//! let batch = [BatchElement::pointers(a.as_ptr().cast(), b.as_ptr().cast())];
//! let params = BrgemmParams {
//!     batch: batch.as_ptr(),
//!     bs: 1,
//!     ptr_c: c.as_mut_ptr().cast(),
//!     ptr_d: c.as_mut_ptr().cast(),
//!     ..BrgemmParams::default()
//! };
//! unsafe { kernel.execute(&params) };
//! ```

pub mod compiler;
pub mod config;
pub mod desc;
pub mod dispatch;
pub mod layout;
pub mod types;

pub use compiler::{
    disassemble, generate, BatchElement, BrgemmKernel, BrgemmParams, Cell, DefaultInjector,
    GeneratedCode, KernelFn, PostOpInjector, RhsMeta, SumHook,
};
pub use config::KernelConfig;
pub use desc::{
    BatchKind, BinaryOp, Blocking, BrgemmDesc, BrgemmDescBuilder, Broadcast, DynQuant, Eltwise,
    MicroKind, OperandReuse, PostOp, QuantParam, WeiDecomp, WeiZeroPoint,
};
pub use dispatch::{host_caps, host_engine, ComputeEngine, IsaCaps, IsaLevel};
pub use layout::{b_byte_index, pack_b, BLayout};
pub use types::{BrgemmError, BrgemmResult, DataType};
