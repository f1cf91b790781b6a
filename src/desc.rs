//! Kernel descriptor.
//!
//! A `BrgemmDesc` is immutable once built. The builder validates type
//! combinations against the target engine, derives the blocking and checks
//! the register budget, so every descriptor that exists can be generated.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::compiler::codegen::regs::{GprPlan, RegisterPlan};
use crate::dispatch::{self, ComputeEngine, IsaCaps};
use crate::types::{BrgemmError, BrgemmResult, DataType};

/// How each batch element locates its A and B blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchKind {
    /// `BatchElement::{a, b}` are absolute pointers.
    Addr,
    /// `BatchElement::{a, b}` are byte offsets from `ptr_a`/`ptr_b`.
    Offs,
    /// Element `i` is at `ptr_a + i * stride_a`, `ptr_b + i * stride_b` (bytes).
    Strd { stride_a: i64, stride_b: i64 },
}

/// Operand reuse inside the vector microkernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandReuse {
    Auto,
    /// Broadcast every A row once, load one B block at a time.
    BroadcastOnce,
    /// Load every B block once, broadcast one A row at a time.
    LoadOnce,
}

/// Accumulation strategy, fixed per descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MicroKind {
    /// Float inputs converted to f32, `vfmadd231ps`.
    VectorFma,
    /// Native `vdpbf16ps` on VNNI-2 packed B.
    VectorBf16Dot,
    /// u8×s8 widening dot product into s32.
    VectorInt8,
    /// AMX tiles.
    Tile,
    /// Weight decompression to f32, then FMA.
    Decomp,
    /// s8 A with runtime per-row scales, u8/u4 B.
    DynQuant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Broadcast {
    PerTensor,
    PerN,
}

/// Scale or zero-point tensor indexed by (group, n).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuantParam {
    pub bcast: Broadcast,
    /// Elements between consecutive K groups.
    pub group_stride: usize,
}

impl QuantParam {
    pub fn per_n(group_stride: usize) -> Self {
        QuantParam {
            bcast: Broadcast::PerN,
            group_stride,
        }
    }

    pub fn per_tensor() -> Self {
        QuantParam {
            bcast: Broadcast::PerTensor,
            group_stride: 1,
        }
    }

    pub fn is_per_n(&self) -> bool {
        self.bcast == Broadcast::PerN
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeiZeroPoint {
    /// `U8` or `F32`.
    pub dt: DataType,
    pub param: QuantParam,
}

/// Weight decompression: `B = (decode(Bq) - zp) * scale`, f32 scales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeiDecomp {
    pub scales: Option<QuantParam>,
    pub zero_points: Option<WeiZeroPoint>,
    /// K elements per scale group; `None` means one group.
    pub group_size: Option<usize>,
}

/// Dynamic quantization: `C += src_scale[m] * wei_scale[n] * Σ A·(B - zp)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DynQuant {
    /// f32 elements between rows of the src scale tensor.
    pub src_scale_stride: usize,
    pub wei_scales: QuantParam,
    /// u8 weight zero points.
    pub wei_zero_points: Option<QuantParam>,
    pub group_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Eltwise {
    Relu { negative_slope: f32 },
    Clip { lo: f32, hi: f32 },
    /// `alpha * x + beta`
    Linear { alpha: f32, beta: f32 },
    Abs,
    Square,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PostOp {
    Eltwise(Eltwise),
    /// f32 right-hand side from `post_ops_rhs[i]` (i counts binary entries).
    Binary { op: BinaryOp, bcast: Broadcast },
    /// `x += scale * (D - zero_point)`
    Sum { scale: f32, zero_point: i32 },
}

/// Derived blocking. Counts are compile-time constants of the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Blocking {
    pub bd_block: usize,
    pub bdb: usize,
    pub bdb_tail: usize,
    /// Tile engine: bd blocks per group.
    pub bd_block2: usize,
    pub bdb2: usize,
    pub bdb2_tail: usize,
    pub ld_block: usize,
    pub ld_block2: usize,
    pub ldb2: usize,
    pub ldb2_tail: usize,
    pub ldb_tail: usize,
    pub rd_block: usize,
    pub rdb: usize,
    pub rdb_tail: usize,
    /// K values interleaved per column in B (VNNI granularity).
    pub ld_step: usize,
    /// Elements per byte along K (2 for 4-bit B).
    pub pack: usize,
}

impl Blocking {
    /// K granularity of B: a B "row" of the packed layout.
    pub fn k_unit(&self) -> usize {
        self.ld_step * self.pack
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrgemmDesc {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    /// Leading dimensions in elements.
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
    pub ldd: usize,
    pub dt_a: DataType,
    pub dt_b: DataType,
    /// Accumulator type: `F32` or `S32`.
    pub dt_c: DataType,
    pub dt_d: DataType,
    pub dt_bias: Option<DataType>,
    pub alpha: f32,
    pub beta: f32,
    pub batch: BatchKind,
    pub max_bs: usize,
    pub engine: ComputeEngine,
    pub caps: IsaCaps,
    pub kind: MicroKind,
    pub reuse: OperandReuse,
    pub blocking: Blocking,
    pub scales: Option<Broadcast>,
    pub dst_scales: bool,
    pub zp_a: bool,
    pub zp_b: bool,
    pub zp_c: Option<Broadcast>,
    pub s8s8_compensation: bool,
    pub post_ops: Vec<PostOp>,
    pub max_top_vpad: usize,
    pub max_bottom_vpad: usize,
    pub req_cal_comp_pads: bool,
    pub skip_accumulation: bool,
    pub wary_tail_read: bool,
    pub prefetch_b: bool,
    pub wei_decomp: Option<WeiDecomp>,
    pub dyn_quant: Option<DynQuant>,
}

impl BrgemmDesc {
    pub fn builder(dt_a: DataType, dt_b: DataType, m: usize, n: usize, k: usize) -> BrgemmDescBuilder {
        BrgemmDescBuilder::new(dt_a, dt_b, m, n, k)
    }

    pub fn has_vpad(&self) -> bool {
        self.max_top_vpad > 0 || self.max_bottom_vpad > 0
    }

    pub fn is_int_acc(&self) -> bool {
        self.dt_c == DataType::S32
    }

    pub fn has_compensation(&self) -> bool {
        self.zp_a || self.zp_b || self.s8s8_compensation
    }

    /// Padded rows of an int8 kernel interact with the A-side compensation
    /// (s8s8 shift or A zero-point).
    pub fn pads_touch_compensation(&self) -> bool {
        self.kind == MicroKind::VectorInt8
            && self.has_vpad()
            && (self.s8s8_compensation || self.zp_a)
    }

    /// The A-side compensation is accumulated in-kernel for valid rows
    /// only, and the `comp`/`zp_comp_a` arrays are not read.
    pub fn comp_in_kernel(&self) -> bool {
        self.pads_touch_compensation() && self.req_cal_comp_pads
    }

    /// Whether the store pipeline has anything to do beyond writing C.
    pub fn post_ops_applicable(&self) -> bool {
        self.dt_bias.is_some()
            || self.scales.is_some()
            || self.dst_scales
            || self.zp_c.is_some()
            || !self.post_ops.is_empty()
            || self.dt_d != self.dt_c
    }

    pub fn has_sum(&self) -> bool {
        self.post_ops.iter().any(|p| matches!(p, PostOp::Sum { .. }))
    }

    pub fn binary_count(&self) -> usize {
        self.post_ops
            .iter()
            .filter(|p| matches!(p, PostOp::Binary { .. }))
            .count()
    }

    pub fn needs_decode_tmp(&self) -> bool {
        match self.kind {
            MicroKind::VectorFma => {
                self.dt_a == DataType::F8E4M3 || self.dt_b == DataType::F8E4M3
            }
            MicroKind::Decomp | MicroKind::DynQuant => true,
            _ => false,
        }
    }

    /// Element size of A as seen by the tile engine (fp8 is staged as f16).
    pub fn tile_ts_a(&self) -> usize {
        if self.dt_a.is_fp8() {
            2
        } else {
            self.dt_a.size_bytes()
        }
    }

    pub fn group_size(&self) -> Option<usize> {
        match self.kind {
            MicroKind::Decomp => self.wei_decomp.and_then(|w| w.group_size),
            MicroKind::DynQuant => self.dyn_quant.and_then(|d| d.group_size),
            _ => None,
        }
    }

    /// Stable hash of every field, used to name dumped kernels.
    pub fn fingerprint(&self) -> u64 {
        let mut h = DefaultHasher::new();
        format!("{self:?}").hash(&mut h);
        h.finish()
    }
}

/// Builder for [`BrgemmDesc`].
#[derive(Debug, Clone)]
pub struct BrgemmDescBuilder {
    m: usize,
    n: usize,
    k: usize,
    lda: Option<usize>,
    ldb: Option<usize>,
    ldc: Option<usize>,
    ldd: Option<usize>,
    dt_a: DataType,
    dt_b: DataType,
    dt_d: Option<DataType>,
    dt_bias: Option<DataType>,
    alpha: f32,
    beta: f32,
    batch: BatchKind,
    max_bs: usize,
    isa: Option<(ComputeEngine, IsaCaps)>,
    caps: Option<IsaCaps>,
    reuse: OperandReuse,
    bd_block: Option<usize>,
    bd_block2: Option<usize>,
    ld_block2: Option<usize>,
    rd_block: Option<usize>,
    scales: Option<Broadcast>,
    dst_scales: bool,
    zp_a: bool,
    zp_b: bool,
    zp_c: Option<Broadcast>,
    s8s8_compensation: bool,
    post_ops: Vec<PostOp>,
    max_top_vpad: usize,
    max_bottom_vpad: usize,
    req_cal_comp_pads: bool,
    skip_accumulation: bool,
    wary_tail_read: bool,
    prefetch_b: bool,
    wei_decomp: Option<WeiDecomp>,
    dyn_quant: Option<DynQuant>,
}

impl BrgemmDescBuilder {
    fn new(dt_a: DataType, dt_b: DataType, m: usize, n: usize, k: usize) -> Self {
        BrgemmDescBuilder {
            m,
            n,
            k,
            lda: None,
            ldb: None,
            ldc: None,
            ldd: None,
            dt_a,
            dt_b,
            dt_d: None,
            dt_bias: None,
            alpha: 1.0,
            beta: 0.0,
            batch: BatchKind::Addr,
            max_bs: usize::MAX,
            isa: None,
            caps: None,
            reuse: OperandReuse::Auto,
            bd_block: None,
            bd_block2: None,
            ld_block2: None,
            rd_block: None,
            scales: None,
            dst_scales: false,
            zp_a: false,
            zp_b: false,
            zp_c: None,
            s8s8_compensation: false,
            post_ops: Vec::new(),
            max_top_vpad: 0,
            max_bottom_vpad: 0,
            req_cal_comp_pads: false,
            skip_accumulation: false,
            wary_tail_read: true,
            prefetch_b: false,
            wei_decomp: None,
            dyn_quant: None,
        }
    }

    pub fn lda(mut self, lda: usize) -> Self {
        self.lda = Some(lda);
        self
    }

    pub fn ldb(mut self, ldb: usize) -> Self {
        self.ldb = Some(ldb);
        self
    }

    pub fn ldc(mut self, ldc: usize) -> Self {
        self.ldc = Some(ldc);
        self
    }

    pub fn ldd(mut self, ldd: usize) -> Self {
        self.ldd = Some(ldd);
        self
    }

    pub fn alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn beta(mut self, beta: f32) -> Self {
        self.beta = beta;
        self
    }

    /// Destination type of the post-processed output D.
    pub fn dst(mut self, dt: DataType) -> Self {
        self.dt_d = Some(dt);
        self
    }

    pub fn bias(mut self, dt: DataType) -> Self {
        self.dt_bias = Some(dt);
        self
    }

    pub fn scales(mut self, bcast: Broadcast) -> Self {
        self.scales = Some(bcast);
        self
    }

    pub fn dst_scales(mut self) -> Self {
        self.dst_scales = true;
        self
    }

    pub fn zero_points_a(mut self) -> Self {
        self.zp_a = true;
        self
    }

    pub fn zero_points_b(mut self) -> Self {
        self.zp_b = true;
        self
    }

    pub fn zero_points_c(mut self, bcast: Broadcast) -> Self {
        self.zp_c = Some(bcast);
        self
    }

    pub fn s8s8_compensation(mut self) -> Self {
        self.s8s8_compensation = true;
        self
    }

    pub fn post_op(mut self, op: PostOp) -> Self {
        self.post_ops.push(op);
        self
    }

    pub fn batch(mut self, kind: BatchKind) -> Self {
        self.batch = kind;
        self
    }

    pub fn max_bs(mut self, max_bs: usize) -> Self {
        self.max_bs = max_bs;
        self
    }

    /// Maximum top/bottom virtual padding rows a call may request.
    pub fn vpad(mut self, max_top: usize, max_bottom: usize) -> Self {
        self.max_top_vpad = max_top;
        self.max_bottom_vpad = max_bottom;
        self
    }

    /// Compute the s8s8/zp_a compensation in-kernel over the valid rows of
    /// each batch element instead of reading the precomputed arrays. Off by
    /// default: the arrays are read and padded rows cancel their share.
    pub fn req_cal_comp_pads(mut self, on: bool) -> Self {
        self.req_cal_comp_pads = on;
        self
    }

    /// Target an explicit engine and capability set instead of the host.
    pub fn isa(mut self, engine: ComputeEngine, caps: IsaCaps) -> Self {
        self.isa = Some((engine, caps));
        self
    }

    /// Capability set; the engine is still chosen automatically.
    pub fn caps(mut self, caps: IsaCaps) -> Self {
        self.caps = Some(caps);
        self
    }

    pub fn reuse(mut self, reuse: OperandReuse) -> Self {
        self.reuse = reuse;
        self
    }

    pub fn bd_block(mut self, v: usize) -> Self {
        self.bd_block = Some(v);
        self
    }

    pub fn bd_block2(mut self, v: usize) -> Self {
        self.bd_block2 = Some(v);
        self
    }

    pub fn ld_block2(mut self, v: usize) -> Self {
        self.ld_block2 = Some(v);
        self
    }

    pub fn rd_block(mut self, v: usize) -> Self {
        self.rd_block = Some(v);
        self
    }

    pub fn skip_accumulation(mut self, on: bool) -> Self {
        self.skip_accumulation = on;
        self
    }

    pub fn wary_tail_read(mut self, on: bool) -> Self {
        self.wary_tail_read = on;
        self
    }

    pub fn prefetch_b(mut self, on: bool) -> Self {
        self.prefetch_b = on;
        self
    }

    pub fn weight_decomp(mut self, wd: WeiDecomp) -> Self {
        self.wei_decomp = Some(wd);
        self
    }

    pub fn dynamic_quant(mut self, dq: DynQuant) -> Self {
        self.dyn_quant = Some(dq);
        self
    }

    pub fn build(self) -> BrgemmResult<BrgemmDesc> {
        if self.m == 0 || self.n == 0 || self.k == 0 {
            return invalid(format!("empty problem {}x{}x{}", self.m, self.n, self.k));
        }
        if self.max_bs == 0 {
            return invalid("max_bs must be at least 1".into());
        }
        if !self.alpha.is_finite() || !self.beta.is_finite() {
            return invalid("alpha and beta must be finite".into());
        }

        let (engine, caps) = match self.isa {
            Some(isa) => isa,
            None => {
                let caps = self.caps.unwrap_or_else(dispatch::host_caps);
                (self.auto_engine(&caps)?, caps)
            }
        };
        if !caps.supports_engine(engine) {
            return Err(BrgemmError::Unsupported(format!(
                "engine {engine:?} not available with {caps:?}"
            )));
        }

        let (kind, dt_c) = self.classify(engine, &caps)?;
        self.check_quant(kind, dt_c)?;

        let dt_d = self.dt_d.unwrap_or(dt_c);
        if !matches!(
            dt_d,
            DataType::F32
                | DataType::S32
                | DataType::Bf16
                | DataType::F16
                | DataType::S8
                | DataType::U8
                | DataType::F8E5M2
                | DataType::F8E4M3
        ) {
            return Err(BrgemmError::Unsupported(format!("destination type {dt_d}")));
        }
        if let Some(dt) = self.dt_bias {
            if !matches!(
                dt,
                DataType::F32
                    | DataType::Bf16
                    | DataType::F16
                    | DataType::S32
                    | DataType::S8
                    | DataType::U8
            ) {
                return Err(BrgemmError::Unsupported(format!("bias type {dt}")));
            }
            if dt == DataType::F16 && !caps.f16c {
                return Err(BrgemmError::Unsupported("f16 bias needs F16C".into()));
            }
        }
        if (dt_d == DataType::F16 || self.post_ops_read_f16(dt_d)) && !caps.f16c {
            return Err(BrgemmError::Unsupported("f16 destination needs F16C".into()));
        }
        for op in &self.post_ops {
            if let PostOp::Eltwise(Eltwise::Clip { lo, hi }) = op {
                if lo > hi {
                    return invalid(format!("clip bounds {lo} > {hi}"));
                }
            }
        }

        let lda = self.lda.unwrap_or(self.k);
        let ldb = self.ldb.unwrap_or(self.n);
        let ldc = self.ldc.unwrap_or(self.n);
        let ldd = self.ldd.unwrap_or(self.n);
        if lda < self.k {
            return invalid(format!("lda {lda} < k {}", self.k));
        }
        if ldb < self.n || ldc < self.n || ldd < self.n {
            return invalid(format!(
                "leading dimensions ldb={ldb} ldc={ldc} ldd={ldd} smaller than n={}",
                self.n
            ));
        }

        let mut desc = BrgemmDesc {
            m: self.m,
            n: self.n,
            k: self.k,
            lda,
            ldb,
            ldc,
            ldd,
            dt_a: self.dt_a,
            dt_b: self.dt_b,
            dt_c,
            dt_d,
            dt_bias: self.dt_bias,
            alpha: self.alpha,
            beta: self.beta,
            batch: self.batch,
            max_bs: self.max_bs,
            engine,
            caps,
            kind,
            reuse: self.reuse,
            blocking: Blocking {
                bd_block: 1,
                bdb: 0,
                bdb_tail: 0,
                bd_block2: 1,
                bdb2: 0,
                bdb2_tail: 0,
                ld_block: engine.simd_w(),
                ld_block2: 1,
                ldb2: 0,
                ldb2_tail: 0,
                ldb_tail: 0,
                rd_block: 1,
                rdb: 0,
                rdb_tail: 0,
                ld_step: 1,
                pack: self.dt_b.pack_factor(),
            },
            scales: self.scales,
            dst_scales: self.dst_scales,
            zp_a: self.zp_a,
            zp_b: self.zp_b,
            zp_c: self.zp_c,
            s8s8_compensation: self.s8s8_compensation,
            post_ops: self.post_ops.clone(),
            max_top_vpad: self.max_top_vpad,
            max_bottom_vpad: self.max_bottom_vpad,
            req_cal_comp_pads: self.req_cal_comp_pads,
            skip_accumulation: self.skip_accumulation,
            wary_tail_read: self.wary_tail_read,
            prefetch_b: self.prefetch_b,
            wei_decomp: self.wei_decomp,
            dyn_quant: self.dyn_quant,
        };

        self.derive_reduction(&mut desc)?;
        self.derive_blocking(&mut desc)?;
        check_offsets(&desc)?;
        check_vpad(&desc)?;
        GprPlan::new(&desc).verify()?;
        log::debug!(
            "brgemm desc {:?} {}x{}x{} a={} b={} c={} d={} blocking={:?}",
            desc.kind,
            desc.m,
            desc.n,
            desc.k,
            desc.dt_a,
            desc.dt_b,
            desc.dt_c,
            desc.dt_d,
            desc.blocking
        );
        Ok(desc)
    }

    fn post_ops_read_f16(&self, dt_d: DataType) -> bool {
        dt_d == DataType::F16 && self.post_ops.iter().any(|p| matches!(p, PostOp::Sum { .. }))
    }

    fn auto_engine(&self, caps: &IsaCaps) -> BrgemmResult<ComputeEngine> {
        let tile_ok = caps.supports_engine(ComputeEngine::Amx)
            && self.wei_decomp.is_none()
            && self.dyn_quant.is_none()
            && self.max_top_vpad == 0
            && self.max_bottom_vpad == 0
            && tile_pair_supported(self.dt_a, self.dt_b, caps);
        if tile_ok {
            Ok(ComputeEngine::Amx)
        } else if caps.supports_engine(ComputeEngine::Avx512) {
            Ok(ComputeEngine::Avx512)
        } else if caps.supports_engine(ComputeEngine::Avx2) {
            Ok(ComputeEngine::Avx2)
        } else {
            Err(BrgemmError::Unsupported(
                "host has neither AVX2+FMA nor AVX-512".into(),
            ))
        }
    }

    fn classify(&self, engine: ComputeEngine, caps: &IsaCaps) -> BrgemmResult<(MicroKind, DataType)> {
        use DataType::*;
        let (a, b) = (self.dt_a, self.dt_b);
        let unsupported = || {
            Err(BrgemmError::Unsupported(format!(
                "{a} x {b} on {engine:?}"
            )))
        };

        if let Some(wd) = &self.wei_decomp {
            if self.dyn_quant.is_some() {
                return invalid("weight decompression and dynamic quantization are exclusive".into());
            }
            if engine == ComputeEngine::Amx || !matches!(a, F32 | Bf16) {
                return unsupported();
            }
            if !matches!(b, U8 | S8 | U4 | S4 | Nf4) {
                return unsupported();
            }
            if let Some(zp) = wd.zero_points {
                if b == Nf4 {
                    return Err(BrgemmError::Unsupported("nf4 weights with zero points".into()));
                }
                if !matches!(zp.dt, U8 | F32) {
                    return Err(BrgemmError::Unsupported(format!("weight zero-point type {}", zp.dt)));
                }
            }
            return Ok((MicroKind::Decomp, F32));
        }

        if self.dyn_quant.is_some() {
            if engine == ComputeEngine::Amx || a != S8 || !matches!(b, U8 | U4) {
                return unsupported();
            }
            if !caps.has_int8_vnni(engine) {
                return Err(BrgemmError::Unsupported(
                    "dynamic quantization needs a native int8 dot product".into(),
                ));
            }
            return Ok((MicroKind::DynQuant, F32));
        }

        if engine == ComputeEngine::Amx {
            if !tile_pair_supported(a, b, caps) {
                return unsupported();
            }
            let dt_c = if a.is_int8() { S32 } else { F32 };
            return Ok((MicroKind::Tile, dt_c));
        }

        if a.is_int8() && b.is_int8() {
            if b != S8 {
                return unsupported();
            }
            if a == S8 && !self.s8s8_compensation {
                return Err(BrgemmError::Unsupported(
                    "s8 x s8 on vector engines needs s8s8 compensation".into(),
                ));
            }
            return Ok((MicroKind::VectorInt8, S32));
        }

        let float_in = |t: DataType| matches!(t, F32 | Bf16 | F16 | F8E5M2 | F8E4M3);
        if float_in(a) && float_in(b) {
            let needs_f16c = [a, b]
                .iter()
                .any(|t| matches!(t, F16 | F8E5M2 | F8E4M3));
            if needs_f16c && !caps.f16c {
                return Err(BrgemmError::Unsupported(format!("{a} x {b} needs F16C")));
            }
            if a == Bf16 && b == Bf16 && engine == ComputeEngine::Avx512 && caps.avx512_bf16 {
                return Ok((MicroKind::VectorBf16Dot, F32));
            }
            return Ok((MicroKind::VectorFma, F32));
        }
        unsupported()
    }

    fn check_quant(&self, kind: MicroKind, dt_c: DataType) -> BrgemmResult<()> {
        let int_acc = dt_c == DataType::S32;
        if (self.zp_a || self.zp_b) && !int_acc {
            return invalid("A/B zero points need an s32 accumulator".into());
        }
        if self.s8s8_compensation && (kind != MicroKind::VectorInt8 || self.dt_a != DataType::S8) {
            return invalid("s8s8 compensation applies to s8 A on vector engines".into());
        }
        if let Some(dq) = &self.dyn_quant {
            if dq.src_scale_stride == 0 && self.m > 1 {
                return invalid("src_scale_stride must be non-zero".into());
            }
        }
        Ok(())
    }

    fn derive_reduction(&self, desc: &mut BrgemmDesc) -> BrgemmResult<()> {
        let ld_step = match desc.kind {
            MicroKind::VectorFma | MicroKind::Decomp => 1,
            MicroKind::VectorBf16Dot => 2,
            MicroKind::VectorInt8 | MicroKind::DynQuant => 4,
            MicroKind::Tile => 4 / desc.tile_ts_a(),
        };
        let pack = desc.dt_b.pack_factor();
        let k_unit = ld_step * pack;
        let group = desc.group_size();

        let rd_block = if desc.kind == MicroKind::Tile {
            if self.rd_block.is_some_and(|r| r != 64 / desc.tile_ts_a()) {
                return invalid("tile rd_block is fixed by the tile width".into());
            }
            64 / desc.tile_ts_a()
        } else {
            match (self.rd_block, group) {
                (Some(r), _) if r == 0 || r % k_unit != 0 => {
                    return invalid(format!("rd_block {r} not a multiple of {k_unit}"));
                }
                (Some(r), Some(g)) if g % r != 0 => {
                    return invalid(format!("group size {g} not a multiple of rd_block {r}"));
                }
                (Some(r), _) => r,
                (None, Some(g)) => {
                    if g == 0 || g % k_unit != 0 {
                        return invalid(format!("group size {g} not a multiple of {k_unit}"));
                    }
                    (1..=8)
                        .rev()
                        .map(|s| s * k_unit)
                        .find(|r| g % r == 0)
                        .unwrap_or(k_unit)
                }
                (None, None) => 8 * k_unit,
            }
        };
        let rdb = desc.k / rd_block;
        let rdb_tail = desc.k % rd_block;
        if group.is_some() && rdb_tail != 0 && desc.max_bs > 1 {
            return invalid(
                "grouped scales with a reduction tail need max_bs == 1".into(),
            );
        }
        let blk = &mut desc.blocking;
        blk.ld_step = ld_step;
        blk.pack = pack;
        blk.rd_block = rd_block;
        blk.rdb = rdb;
        blk.rdb_tail = rdb_tail;
        Ok(())
    }

    fn derive_blocking(&self, desc: &mut BrgemmDesc) -> BrgemmResult<()> {
        let ld_block = desc.engine.simd_w();
        let nb_ld = desc.n.div_ceil(ld_block);
        let full_ld = desc.n / ld_block;

        if desc.engine == ComputeEngine::Amx {
            let bd_block = self.bd_block.unwrap_or(16).min(16).min(desc.m);
            let bdb = desc.m / bd_block;
            let ld_block2 = self.ld_block2.unwrap_or(2).clamp(1, nb_ld.max(1));
            let bd_block2 = self.bd_block2.unwrap_or(2).clamp(1, bdb.max(1));
            if bd_block2 * ld_block2 + bd_block2 + ld_block2 > 8 {
                return invalid(format!(
                    "{bd_block2}x{ld_block2} tile grid needs more than 8 tiles"
                ));
            }
            set_blocking(desc, bd_block, bd_block2, ld_block, ld_block2, full_ld);
            RegisterPlan::new(desc)?;
            return Ok(());
        }

        let default_l = match (desc.kind, desc.engine) {
            (MicroKind::Decomp | MicroKind::DynQuant, ComputeEngine::Avx2) => 1,
            (MicroKind::Decomp | MicroKind::DynQuant, _) => 2,
            (_, ComputeEngine::Avx2) => 3,
            _ => 4,
        };
        let ld_block2 = self.ld_block2.unwrap_or(default_l).clamp(1, nb_ld.max(1));

        match self.bd_block {
            Some(bd) => {
                let bd = bd.clamp(1, desc.m);
                set_blocking(desc, bd, 1, ld_block, ld_block2, full_ld);
                RegisterPlan::new(desc)?;
            }
            None => {
                let mut bd = desc.m.min(32);
                loop {
                    set_blocking(desc, bd, 1, ld_block, ld_block2, full_ld);
                    match RegisterPlan::new(desc) {
                        Ok(_) if check_vpad(desc).is_ok() || bd == 1 => break,
                        Ok(_) => {}
                        Err(e) if bd == 1 => return Err(e),
                        Err(_) => {}
                    }
                    bd -= 1;
                }
            }
        }
        Ok(())
    }
}

fn set_blocking(
    desc: &mut BrgemmDesc,
    bd_block: usize,
    bd_block2: usize,
    ld_block: usize,
    ld_block2: usize,
    full_ld: usize,
) {
    let blk = &mut desc.blocking;
    blk.bd_block = bd_block;
    blk.bdb = desc.m / bd_block;
    blk.bdb_tail = desc.m % bd_block;
    blk.bd_block2 = bd_block2;
    blk.bdb2 = blk.bdb / bd_block2;
    blk.bdb2_tail = blk.bdb % bd_block2;
    blk.ld_block = ld_block;
    blk.ld_block2 = ld_block2;
    blk.ldb2 = full_ld / ld_block2;
    blk.ldb2_tail = full_ld % ld_block2;
    blk.ldb_tail = desc.n % ld_block;
}

fn tile_pair_supported(a: DataType, b: DataType, caps: &IsaCaps) -> bool {
    use DataType::*;
    match (a, b) {
        (Bf16, Bf16) => caps.amx_bf16,
        (F16, F16) => caps.amx_fp16,
        (U8 | S8, U8 | S8) => caps.amx_int8,
        (F8E5M2 | F8E4M3, F8E5M2 | F8E4M3) => caps.amx_fp16,
        _ => false,
    }
}

fn invalid<T>(msg: String) -> BrgemmResult<T> {
    Err(BrgemmError::InvalidDescriptor(msg))
}

/// Every address the kernel forms from compile-time offsets must fit a
/// 32-bit displacement.
fn check_offsets(desc: &BrgemmDesc) -> BrgemmResult<()> {
    let blk = &desc.blocking;
    let k_units = desc.k.div_ceil(blk.k_unit());
    let spans = [
        ("A", desc.m * desc.lda * desc.dt_a.size_bytes()),
        ("B", k_units * blk.ld_step * desc.ldb * desc.dt_b.size_bytes()),
        ("C", desc.m * desc.ldc * desc.dt_c.size_bytes()),
        ("D", desc.m * desc.ldd * desc.dt_d.size_bytes()),
    ];
    for (name, bytes) in spans {
        if bytes > i32::MAX as usize {
            return invalid(format!("{name} block spans {bytes} bytes"));
        }
    }
    if let BatchKind::Strd { stride_a, stride_b } = desc.batch {
        if i32::try_from(stride_a).is_err() || i32::try_from(stride_b).is_err() {
            return invalid("batch strides must fit in 32 bits".into());
        }
    }
    Ok(())
}

fn check_vpad(desc: &BrgemmDesc) -> BrgemmResult<()> {
    if !desc.has_vpad() {
        return Ok(());
    }
    if desc.engine == ComputeEngine::Amx {
        return Err(BrgemmError::Unsupported(
            "virtual padding on the tile engine".into(),
        ));
    }
    if matches!(desc.kind, MicroKind::Decomp | MicroKind::DynQuant) {
        return Err(BrgemmError::Unsupported(format!(
            "virtual padding with {:?}",
            desc.kind
        )));
    }
    let blk = &desc.blocking;
    let first = if blk.bdb > 0 { blk.bd_block } else { blk.bdb_tail };
    let last = if blk.bdb_tail > 0 { blk.bdb_tail } else { blk.bd_block };
    if desc.max_top_vpad > first || desc.max_bottom_vpad > last {
        return invalid(format!(
            "vpad top {} / bottom {} exceed edge blocks of {first} / {last} rows",
            desc.max_top_vpad, desc.max_bottom_vpad
        ));
    }
    if (desc.max_top_vpad + 1) * (desc.max_bottom_vpad + 1) > 256 {
        return invalid("too many virtual padding variants".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avx512() -> (ComputeEngine, IsaCaps) {
        (ComputeEngine::Avx512, IsaCaps::avx512_core())
    }

    #[test]
    fn test_f32_blocking() {
        let (e, c) = avx512();
        let d = BrgemmDesc::builder(DataType::F32, DataType::F32, 13, 70, 20)
            .isa(e, c)
            .build()
            .unwrap();
        let b = d.blocking;
        assert_eq!(b.ld_block, 16);
        assert_eq!(b.ld_block2, 4);
        assert_eq!(b.ldb2, 1);
        assert_eq!(b.ldb2_tail, 0);
        assert_eq!(b.ldb_tail, 6);
        assert_eq!(b.bd_block * b.bdb + b.bdb_tail, 13);
        assert_eq!(b.rd_block, 8);
        assert_eq!(b.rdb, 2);
        assert_eq!(b.rdb_tail, 4);
        assert_eq!(d.kind, MicroKind::VectorFma);
    }

    #[test]
    fn test_int8_needs_compensation_for_signed_a() {
        let (e, c) = avx512();
        let err = BrgemmDesc::builder(DataType::S8, DataType::S8, 8, 8, 8)
            .isa(e, c)
            .build()
            .unwrap_err();
        assert!(matches!(err, BrgemmError::Unsupported(_)));
        let d = BrgemmDesc::builder(DataType::S8, DataType::S8, 8, 8, 8)
            .isa(e, c)
            .s8s8_compensation()
            .build()
            .unwrap();
        assert_eq!(d.dt_c, DataType::S32);
        assert_eq!(d.blocking.ld_step, 4);
    }

    #[test]
    fn test_unsigned_b_rejected_on_vector() {
        let (e, c) = avx512();
        let err = BrgemmDesc::builder(DataType::U8, DataType::U8, 4, 16, 16)
            .isa(e, c)
            .build()
            .unwrap_err();
        assert!(matches!(err, BrgemmError::Unsupported(_)));
    }

    #[test]
    fn test_bf16_native_only_with_avx512_bf16() {
        let d = BrgemmDesc::builder(DataType::Bf16, DataType::Bf16, 4, 32, 32)
            .isa(ComputeEngine::Avx512, IsaCaps::avx512_core_bf16())
            .build()
            .unwrap();
        assert_eq!(d.kind, MicroKind::VectorBf16Dot);
        assert_eq!(d.blocking.ld_step, 2);
        let d = BrgemmDesc::builder(DataType::Bf16, DataType::Bf16, 4, 32, 32)
            .isa(ComputeEngine::Avx2, IsaCaps::avx2())
            .build()
            .unwrap();
        assert_eq!(d.kind, MicroKind::VectorFma);
        assert_eq!(d.blocking.ld_step, 1);
    }

    #[test]
    fn test_tile_grid_limit() {
        let err = BrgemmDesc::builder(DataType::Bf16, DataType::Bf16, 64, 64, 64)
            .isa(ComputeEngine::Amx, IsaCaps::amx())
            .bd_block2(3)
            .ld_block2(2)
            .build()
            .unwrap_err();
        assert!(matches!(err, BrgemmError::InvalidDescriptor(_)));
        let d = BrgemmDesc::builder(DataType::Bf16, DataType::Bf16, 40, 40, 70)
            .isa(ComputeEngine::Amx, IsaCaps::amx())
            .build()
            .unwrap();
        let b = d.blocking;
        assert_eq!((b.bd_block, b.bdb, b.bdb_tail), (16, 2, 8));
        assert_eq!((b.bd_block2, b.bdb2, b.bdb2_tail), (2, 1, 0));
        assert_eq!((b.rd_block, b.rdb, b.rdb_tail), (32, 2, 6));
    }

    #[test]
    fn test_tile_fp8_needs_fp16() {
        let err = BrgemmDesc::builder(DataType::F8E4M3, DataType::F8E4M3, 16, 16, 32)
            .isa(ComputeEngine::Amx, IsaCaps::amx())
            .build()
            .unwrap_err();
        assert!(matches!(err, BrgemmError::Unsupported(_)));
        BrgemmDesc::builder(DataType::F8E4M3, DataType::F8E5M2, 16, 16, 32)
            .isa(ComputeEngine::Amx, IsaCaps::amx_fp16())
            .build()
            .unwrap();
    }

    #[test]
    fn test_vpad_limits() {
        let (e, c) = avx512();
        let err = BrgemmDesc::builder(DataType::F32, DataType::F32, 8, 16, 16)
            .isa(e, c)
            .bd_block(4)
            .vpad(5, 0)
            .build()
            .unwrap_err();
        assert!(matches!(err, BrgemmError::InvalidDescriptor(_)));
        let err = BrgemmDesc::builder(DataType::Bf16, DataType::Bf16, 16, 16, 32)
            .isa(ComputeEngine::Amx, IsaCaps::amx())
            .vpad(1, 1)
            .build()
            .unwrap_err();
        assert!(matches!(err, BrgemmError::Unsupported(_)));
    }

    #[test]
    fn test_comp_in_kernel_only_with_padding() {
        let (e, c) = avx512();
        let base = BrgemmDesc::builder(DataType::S8, DataType::S8, 6, 16, 8)
            .isa(e, c)
            .s8s8_compensation()
            .bd_block(6);
        let d = base.clone().req_cal_comp_pads(true).build().unwrap();
        assert!(!d.comp_in_kernel());
        let d = base.clone().vpad(2, 2).build().unwrap();
        assert!(d.pads_touch_compensation());
        assert!(!d.comp_in_kernel());
        let d = base.vpad(2, 2).req_cal_comp_pads(true).build().unwrap();
        assert!(d.comp_in_kernel());
    }

    #[test]
    fn test_nf4_rejects_weight_zero_point() {
        let (e, c) = avx512();
        let zp = WeiZeroPoint {
            dt: DataType::U8,
            param: QuantParam::per_tensor(),
        };
        let err = BrgemmDesc::builder(DataType::F32, DataType::Nf4, 4, 16, 8)
            .isa(e, c)
            .weight_decomp(WeiDecomp {
                scales: Some(QuantParam::per_n(0)),
                zero_points: Some(zp),
                group_size: None,
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, BrgemmError::Unsupported(_)));
    }

    #[test]
    fn test_grouped_decomp_rd_block() {
        let (e, c) = avx512();
        let d = BrgemmDesc::builder(DataType::F32, DataType::U4, 4, 32, 64)
            .isa(e, c)
            .weight_decomp(WeiDecomp {
                scales: Some(QuantParam::per_n(32)),
                zero_points: None,
                group_size: Some(12),
            })
            .max_bs(1)
            .build()
            .unwrap();
        assert_eq!(d.blocking.k_unit(), 2);
        assert_eq!(12 % d.blocking.rd_block, 0);
        assert_eq!(d.kind, MicroKind::Decomp);
    }

    #[test]
    fn test_dyn_quant_requires_vnni() {
        let dq = DynQuant {
            src_scale_stride: 1,
            wei_scales: QuantParam::per_n(0),
            wei_zero_points: None,
            group_size: None,
        };
        let err = BrgemmDesc::builder(DataType::S8, DataType::U8, 4, 32, 64)
            .isa(ComputeEngine::Avx512, IsaCaps::avx512_core())
            .dynamic_quant(dq)
            .build()
            .unwrap_err();
        assert!(matches!(err, BrgemmError::Unsupported(_)));
        BrgemmDesc::builder(DataType::S8, DataType::U8, 4, 32, 64)
            .isa(ComputeEngine::Avx512, IsaCaps::avx512_core_vnni())
            .dynamic_quant(dq)
            .build()
            .unwrap();
    }

    #[test]
    fn test_fingerprint_tracks_fields() {
        let (e, c) = avx512();
        let a = BrgemmDesc::builder(DataType::F32, DataType::F32, 4, 16, 16)
            .isa(e, c)
            .build()
            .unwrap();
        let b = BrgemmDesc::builder(DataType::F32, DataType::F32, 4, 16, 16)
            .isa(e, c)
            .beta(1.0)
            .build()
            .unwrap();
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
