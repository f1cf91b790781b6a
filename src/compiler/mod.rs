//! Kernel construction: descriptor → instruction stream → executable code.
//!
//! ```text
//! BrgemmDesc → codegen::generate → GeneratedCode → ExecutableBuffer
//!                  ↑                    │
//!           RegisterPlan,          BRGEMM_JIT_DUMP
//!           FrameLayout,           (.bin + listing)
//!           MicrokernelBody
//! ```

pub mod codegen;
pub mod executable;
pub mod params;

pub use codegen::post_ops::{Cell, DefaultInjector, PostOpInjector, RhsMeta, SumHook};
pub use codegen::{generate, GeneratedCode};
pub use executable::ExecutableBuffer;
pub use params::{BatchElement, BrgemmParams};

use std::fmt::Write as _;
use std::path::Path;

use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter};

use crate::desc::BrgemmDesc;
use crate::dispatch::{kernel_config, request_tile_permission, ComputeEngine};
use crate::types::{BrgemmError, BrgemmResult};

/// Entry point of a generated kernel.
pub type KernelFn = unsafe extern "C" fn(*const BrgemmParams);

/// A generated, executable BRGEMM kernel.
///
/// Immutable after construction. Calls share no state, so one kernel may
/// run on any number of threads at once.
#[derive(Debug)]
pub struct BrgemmKernel {
    desc: BrgemmDesc,
    code: ExecutableBuffer,
    pool_bytes: usize,
}

impl BrgemmKernel {
    /// Generate the kernel for `desc` with the default post-op injector.
    pub fn new(desc: BrgemmDesc) -> BrgemmResult<Self> {
        Self::build(desc, None)
    }

    /// Generate with a caller-provided post-op injector.
    pub fn with_injector(desc: BrgemmDesc, injector: Box<dyn PostOpInjector>) -> BrgemmResult<Self> {
        Self::build(desc, Some(injector))
    }

    fn build(desc: BrgemmDesc, injector: Option<Box<dyn PostOpInjector>>) -> BrgemmResult<Self> {
        if desc.engine == ComputeEngine::Amx && !request_tile_permission() {
            return Err(BrgemmError::Unsupported(
                "tile data permission not granted by the OS".into(),
            ));
        }
        let generated = match injector {
            Some(inj) => codegen::generate_with(codegen::Ctx::with_injector(&desc, inj)?)?,
            None => codegen::generate(&desc)?,
        };
        if let Some(dir) = &kernel_config().dump_dir {
            if let Err(err) = dump(dir, &desc, &generated) {
                log::warn!("BRGEMM_JIT_DUMP to {}: {err}", dir.display());
            }
        }
        let code = ExecutableBuffer::new(&generated.bytes)?;
        log::debug!(
            "brgemm kernel {}x{}x{} {}·{}→{} mapped at {:p} ({} bytes)",
            desc.m,
            desc.n,
            desc.k,
            desc.dt_a,
            desc.dt_b,
            desc.dt_d,
            code.as_ptr(),
            code.mapped_len()
        );
        Ok(BrgemmKernel {
            desc,
            code,
            pool_bytes: generated.pool_bytes,
        })
    }

    pub fn desc(&self) -> &BrgemmDesc {
        &self.desc
    }

    /// The whole stream, constant pool included.
    pub fn code(&self) -> &[u8] {
        self.code.bytes()
    }

    /// Instruction bytes, without the constant pool.
    pub fn instructions(&self) -> &[u8] {
        let bytes = self.code.bytes();
        &bytes[..bytes.len() - self.pool_bytes]
    }

    /// Run the kernel once.
    ///
    /// # Safety
    /// Every pointer in `params` that the descriptor uses must be valid for
    /// the extents the descriptor implies: A, B (or the batch array), C, D
    /// and any auxiliary tensor. `params.bs` must not exceed `max_bs`. The
    /// host must support the descriptor's engine.
    #[inline]
    pub unsafe fn execute(&self, params: &BrgemmParams) {
        // SAFETY: the mapping holds a complete function with this signature.
        let f: KernelFn = std::mem::transmute(self.code.as_ptr());
        f(params);
    }
}

/// Intel-syntax listing of the instruction part of `code`.
pub fn disassemble(code: &GeneratedCode) -> String {
    let mut decoder = Decoder::with_ip(64, &code.bytes[..code.code_len()], 0, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    let mut out = String::new();
    let mut text = String::new();
    while decoder.can_decode() {
        let ins = decoder.decode();
        text.clear();
        formatter.format(&ins, &mut text);
        let _ = writeln!(out, "{:08X}  {}", ins.ip(), text);
    }
    out
}

fn dump(dir: &Path, desc: &BrgemmDesc, code: &GeneratedCode) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let stem = format!("brgemm_{:016x}", desc.fingerprint());
    std::fs::write(dir.join(format!("{stem}.bin")), &code.bytes)?;
    std::fs::write(dir.join(format!("{stem}.asm")), disassemble(code))?;
    log::debug!("brgemm stream dumped to {}/{stem}.bin", dir.display());
    Ok(())
}
