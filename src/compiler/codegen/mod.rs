//! x86-64 code generation for one BRGEMM descriptor.
//!
//! `generate` walks the loop nest once, asking the selected
//! [`MicrokernelBody`](microkernel::MicrokernelBody) for the accumulation
//! code and the store pipeline for the epilogue of every block. The result
//! is position-independent: constants are appended after the last
//! instruction and addressed RIP-relative.

pub mod emitter;
pub mod fetch;
pub mod frame;
pub mod loops;
pub mod microkernel;
pub mod offsets;
pub mod padding;
pub mod post_ops;
pub mod regs;
pub mod store;
pub mod tables;

use crate::desc::BrgemmDesc;
use crate::types::BrgemmResult;

use emitter::Emitter;
use frame::FrameLayout;
use offsets::Offsets;
use post_ops::{DefaultInjector, PostOpInjector};
use regs::RegisterPlan;

/// Everything fixed for the duration of one generation.
pub struct Ctx<'a> {
    pub desc: &'a BrgemmDesc,
    pub regs: RegisterPlan,
    pub frame: FrameLayout,
    pub off: Offsets<'a>,
    pub injector: Box<dyn PostOpInjector + 'a>,
}

impl<'a> Ctx<'a> {
    pub fn new(desc: &'a BrgemmDesc) -> BrgemmResult<Self> {
        Self::with_injector(desc, Box::new(DefaultInjector::new(&desc.post_ops)))
    }

    pub fn with_injector(
        desc: &'a BrgemmDesc,
        injector: Box<dyn PostOpInjector + 'a>,
    ) -> BrgemmResult<Self> {
        Ok(Ctx {
            desc,
            regs: RegisterPlan::new(desc)?,
            frame: FrameLayout::new(desc),
            off: Offsets::new(desc),
            injector,
        })
    }
}

/// Machine code of one kernel.
#[derive(Debug, Clone)]
pub struct GeneratedCode {
    /// Instructions followed by the constant pool.
    pub bytes: Vec<u8>,
    /// Trailing bytes of `bytes` that are data, not code.
    pub pool_bytes: usize,
}

impl GeneratedCode {
    pub fn code_len(&self) -> usize {
        self.bytes.len() - self.pool_bytes
    }
}

/// Generate the kernel for `desc` with the default post-op injector.
pub fn generate(desc: &BrgemmDesc) -> BrgemmResult<GeneratedCode> {
    generate_with(Ctx::new(desc)?)
}

/// Generate with a caller-built context (custom post-op injector).
pub fn generate_with(ctx: Ctx<'_>) -> BrgemmResult<GeneratedCode> {
    let mut e = Emitter::new(ctx.desc.engine)?;
    let body = microkernel::select(&ctx)?;
    loops::emit_kernel(&mut e, &ctx, body.as_ref())?;
    let (bytes, pool_bytes) = e.finish()?;
    log::debug!(
        "brgemm generated {:?}/{:?}: {} code bytes, {} constant bytes, {} vector registers",
        ctx.desc.engine,
        ctx.desc.kind,
        bytes.len() - pool_bytes,
        pool_bytes,
        ctx.regs.registers_used()
    );
    Ok(GeneratedCode { bytes, pool_bytes })
}
