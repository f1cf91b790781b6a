//! Host ISA capability profile.
//!
//! Detects the x86 extensions the generator can target and maps them to a
//! compute engine. Kernels are built for an explicit `IsaCaps`, so tests can
//! generate code for machines other than the host.

use std::sync::atomic::{AtomicU8, Ordering};

/// ISA level for dispatch decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IsaLevel {
    Avx2,
    Avx512,
    Amx,
}

impl IsaLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "avx2" => Some(Self::Avx2),
            "avx512" | "avx512_core" => Some(Self::Avx512),
            "amx" => Some(Self::Amx),
            _ => None,
        }
    }
}

/// Target compute engine of a generated kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputeEngine {
    /// 256-bit vectors, 16 registers, no opmasks.
    Avx2,
    /// 512-bit vectors, 32 registers, opmask tails.
    Avx512,
    /// AMX tiles for accumulation, 512-bit vectors for the store path.
    Amx,
}

impl ComputeEngine {
    /// f32 lanes per vector register, which is also the leading-dim block.
    pub const fn simd_w(self) -> usize {
        match self {
            Self::Avx2 => 8,
            Self::Avx512 | Self::Amx => 16,
        }
    }

    pub const fn vector_bytes(self) -> usize {
        self.simd_w() * 4
    }

    pub const fn num_vregs(self) -> usize {
        match self {
            Self::Avx2 => 16,
            Self::Avx512 | Self::Amx => 32,
        }
    }

    pub const fn has_opmask(self) -> bool {
        !matches!(self, Self::Avx2)
    }

    pub const fn is_tile(self) -> bool {
        matches!(self, Self::Amx)
    }
}

/// Instruction-set extensions relevant to kernel generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IsaCaps {
    pub avx2: bool,
    pub fma: bool,
    pub f16c: bool,
    /// VEX-encoded `vpdpbusd` on 256-bit registers.
    pub avx_vnni: bool,
    /// AVX-512 F + BW + VL + DQ.
    pub avx512_core: bool,
    pub avx512_vnni: bool,
    pub avx512_bf16: bool,
    pub amx_tile: bool,
    pub amx_int8: bool,
    pub amx_bf16: bool,
    pub amx_fp16: bool,
}

impl IsaCaps {
    /// Haswell-class baseline.
    pub const fn avx2() -> Self {
        IsaCaps {
            avx2: true,
            fma: true,
            f16c: true,
            avx_vnni: false,
            avx512_core: false,
            avx512_vnni: false,
            avx512_bf16: false,
            amx_tile: false,
            amx_int8: false,
            amx_bf16: false,
            amx_fp16: false,
        }
    }

    /// Skylake-server-class.
    pub const fn avx512_core() -> Self {
        IsaCaps {
            avx512_core: true,
            ..Self::avx2()
        }
    }

    /// Cascade Lake: AVX-512 with VNNI.
    pub const fn avx512_core_vnni() -> Self {
        IsaCaps {
            avx512_vnni: true,
            ..Self::avx512_core()
        }
    }

    /// Cooper Lake: VNNI plus native bf16 dot products.
    pub const fn avx512_core_bf16() -> Self {
        IsaCaps {
            avx512_bf16: true,
            ..Self::avx512_core_vnni()
        }
    }

    /// Sapphire Rapids: AMX int8/bf16 on top of AVX-512.
    pub const fn amx() -> Self {
        IsaCaps {
            avx_vnni: true,
            amx_tile: true,
            amx_int8: true,
            amx_bf16: true,
            ..Self::avx512_core_bf16()
        }
    }

    /// Granite Rapids: AMX with fp16.
    pub const fn amx_fp16() -> Self {
        IsaCaps {
            amx_fp16: true,
            ..Self::amx()
        }
    }

    /// Detect the host CPU.
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            let mut caps = IsaCaps {
                avx2: is_x86_feature_detected!("avx2"),
                fma: is_x86_feature_detected!("fma"),
                f16c: is_x86_feature_detected!("f16c"),
                avx512_core: is_x86_feature_detected!("avx512f")
                    && is_x86_feature_detected!("avx512bw")
                    && is_x86_feature_detected!("avx512vl")
                    && is_x86_feature_detected!("avx512dq"),
                avx512_vnni: is_x86_feature_detected!("avx512vnni"),
                ..IsaCaps::default()
            };
            let leaf7 = cpuid_leaf7();
            caps.avx_vnni = caps.avx2 && leaf7.sub1_eax & (1 << 4) != 0;
            caps.avx512_bf16 = caps.avx512_core && leaf7.sub1_eax & (1 << 5) != 0;
            let amx_tile = caps.avx512_core && leaf7.sub0_edx & (1 << 24) != 0;
            if amx_tile && request_tile_permission() {
                caps.amx_tile = true;
                caps.amx_bf16 = leaf7.sub0_edx & (1 << 22) != 0;
                caps.amx_int8 = leaf7.sub0_edx & (1 << 25) != 0;
                caps.amx_fp16 = leaf7.sub1_eax & (1 << 21) != 0;
            }
            caps.avx512_vnni &= caps.avx512_core;
            caps
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            IsaCaps::default()
        }
    }

    /// Highest ISA level these capabilities support, if any.
    pub fn level(&self) -> Option<IsaLevel> {
        if self.amx_tile && self.avx512_core {
            Some(IsaLevel::Amx)
        } else if self.avx512_core {
            Some(IsaLevel::Avx512)
        } else if self.avx2 && self.fma {
            Some(IsaLevel::Avx2)
        } else {
            None
        }
    }

    /// Drop every capability above `level`.
    pub fn capped(self, level: IsaLevel) -> Self {
        let mut caps = self;
        if level < IsaLevel::Amx {
            caps.amx_tile = false;
            caps.amx_int8 = false;
            caps.amx_bf16 = false;
            caps.amx_fp16 = false;
        }
        if level < IsaLevel::Avx512 {
            caps.avx512_core = false;
            caps.avx512_vnni = false;
            caps.avx512_bf16 = false;
        }
        caps
    }

    /// Whether the engine can execute at all with these capabilities.
    pub fn supports_engine(&self, engine: ComputeEngine) -> bool {
        match engine {
            ComputeEngine::Avx2 => self.avx2 && self.fma,
            ComputeEngine::Avx512 => self.avx512_core,
            ComputeEngine::Amx => self.avx512_core && self.amx_tile,
        }
    }

    /// Native widening int8 multiply-accumulate on this engine.
    pub fn has_int8_vnni(&self, engine: ComputeEngine) -> bool {
        match engine {
            ComputeEngine::Avx2 => self.avx_vnni,
            ComputeEngine::Avx512 | ComputeEngine::Amx => self.avx512_vnni,
        }
    }

    /// True when every capability in `other` is also present in `self`.
    pub fn contains(&self, other: &IsaCaps) -> bool {
        let pairs = [
            (self.avx2, other.avx2),
            (self.fma, other.fma),
            (self.f16c, other.f16c),
            (self.avx_vnni, other.avx_vnni),
            (self.avx512_core, other.avx512_core),
            (self.avx512_vnni, other.avx512_vnni),
            (self.avx512_bf16, other.avx512_bf16),
            (self.amx_tile, other.amx_tile),
            (self.amx_int8, other.amx_int8),
            (self.amx_bf16, other.amx_bf16),
            (self.amx_fp16, other.amx_fp16),
        ];
        pairs.iter().all(|&(have, need)| have || !need)
    }
}

#[cfg(target_arch = "x86_64")]
struct Leaf7 {
    sub0_edx: u32,
    sub1_eax: u32,
}

#[cfg(target_arch = "x86_64")]
#[allow(unused_unsafe)]
fn cpuid_leaf7() -> Leaf7 {
    use std::arch::x86_64::{__cpuid_count, __get_cpuid_max};
    // SAFETY: cpuid is available on every x86_64 CPU; the leaf is range-checked first.
    unsafe {
        let (max_leaf, _) = __get_cpuid_max(0);
        if max_leaf < 7 {
            return Leaf7 {
                sub0_edx: 0,
                sub1_eax: 0,
            };
        }
        let sub0 = __cpuid_count(7, 0);
        let sub1 = if sub0.eax >= 1 {
            __cpuid_count(7, 1).eax
        } else {
            0
        };
        Leaf7 {
            sub0_edx: sub0.edx,
            sub1_eax: sub1,
        }
    }
}

/// Ask the Linux kernel for permission to use AMX tile data.
/// ARCH_REQ_XCOMP_PERM = 0x1023, XFEATURE_XTILEDATA = 18.
/// Result is cached in an AtomicU8 (0=unknown, 1=granted, 2=denied).
pub fn request_tile_permission() -> bool {
    static STATE: AtomicU8 = AtomicU8::new(0);
    match STATE.load(Ordering::Relaxed) {
        1 => return true,
        2 => return false,
        _ => {}
    }
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        const ARCH_REQ_XCOMP_PERM: libc::c_long = 0x1023;
        const XFEATURE_XTILEDATA: libc::c_long = 18;
        // SAFETY: arch_prctl with ARCH_REQ_XCOMP_PERM only updates the
        // permission bitmap of the calling process.
        let ret =
            unsafe { libc::syscall(libc::SYS_arch_prctl, ARCH_REQ_XCOMP_PERM, XFEATURE_XTILEDATA) };
        let ok = ret == 0;
        if !ok {
            log::warn!("AMX tile permission denied by the kernel; tile engine disabled");
        }
        STATE.store(if ok { 1 } else { 2 }, Ordering::Relaxed);
        ok
    }
    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    {
        STATE.store(2, Ordering::Relaxed);
        false
    }
}
