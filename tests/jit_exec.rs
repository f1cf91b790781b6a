//! End-to-end execution of generated kernels against the scalar reference.
//!
//! Every test runtime-detects the engine it needs and skips on hardware
//! without it. Inputs are small integers so float results are exact
//! regardless of accumulation order.

#![cfg(target_arch = "x86_64")]

use brgemm_kernels::{
    host_caps, pack_b, BatchElement, BatchKind, BinaryOp, BrgemmDesc, BrgemmDescBuilder, BrgemmError,
    BrgemmKernel, BrgemmParams, Broadcast, ComputeEngine, DataType, DynQuant, Eltwise, PostOp,
    QuantParam, WeiDecomp, WeiZeroPoint,
};
use brgemm_scalar_ops::brgemm::{brgemm_f32, brgemm_i32, column_sums_i32, relu, row_sums_i32, BatchRef};
use brgemm_scalar_ops::formats::{
    bf16_to_f32, f32_to_bf16, f32_to_e4m3, f32_to_e5m2, nf4_to_f32, s4_to_f32, saturate_to_u8, u4_to_f32,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ═══════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════

macro_rules! skip_unless {
    ($engine:expr) => {
        if !host_caps().supports_engine($engine) {
            eprintln!("{:?} not supported on this CPU, skipping", $engine);
            return;
        }
    };
}

fn builder(engine: ComputeEngine, dt_a: DataType, dt_b: DataType, m: usize, n: usize, k: usize) -> BrgemmDescBuilder {
    BrgemmDesc::builder(dt_a, dt_b, m, n, k).isa(engine, host_caps())
}

fn small_f32(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-4i32..=4) as f32).collect()
}

fn assert_close(got: &[f32], want: &[f32]) {
    assert_eq!(got.len(), want.len());
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        let tol = 1e-4 * w.abs().max(1.0);
        assert!((g - w).abs() <= tol, "index {i}: got {g}, want {w}");
    }
}

/// One batch of f32 operands in every addressing mode.
struct F32Batch {
    /// Row-major A blocks (`m × k`), contiguous.
    a: Vec<f32>,
    /// Row-major B blocks (`k × n`), for the reference.
    b: Vec<f32>,
    /// Packed B blocks, contiguous.
    b_packed: Vec<u8>,
    a_len: usize,
    b_len: usize,
    packed_len: usize,
}

impl F32Batch {
    fn new(desc: &BrgemmDesc, bs: usize, rng: &mut StdRng) -> Self {
        let (m, n, k) = (desc.m, desc.n, desc.k);
        let (a_len, b_len) = (m * k, k * n);
        let a = small_f32(rng, a_len * bs);
        let b = small_f32(rng, b_len * bs);
        let mut b_packed = Vec::new();
        for chunk in b.chunks(b_len) {
            b_packed.extend(pack_b(desc, bytemuck::cast_slice(chunk), n));
        }
        let packed_len = b_packed.len() / bs;
        F32Batch {
            a,
            b,
            b_packed,
            a_len,
            b_len,
            packed_len,
        }
    }

    fn refs(&self) -> Vec<BatchRef<'_, f32>> {
        self.a
            .chunks(self.a_len)
            .zip(self.b.chunks(self.b_len))
            .map(|(a, b)| BatchRef { a, b })
            .collect()
    }

    fn elements(&self, kind: BatchKind) -> Vec<BatchElement> {
        let bs = self.a.len() / self.a_len;
        (0..bs)
            .map(|i| {
                let (oa, ob) = (i * self.a_len * 4, i * self.packed_len);
                match kind {
                    BatchKind::Addr => BatchElement::pointers(
                        self.a.as_ptr().cast::<u8>().wrapping_add(oa),
                        self.b_packed.as_ptr().wrapping_add(ob),
                    ),
                    _ => BatchElement::offsets(oa, ob),
                }
            })
            .collect()
    }
}

/// `alpha · Σ A·B + beta · C` with the scalar reference.
fn reference_f32(desc: &BrgemmDesc, refs: &[BatchRef<'_, f32>], c0: &[f32]) -> Vec<f32> {
    let (m, n, k) = (desc.m, desc.n, desc.k);
    let mut acc = vec![0.0f32; m * n];
    brgemm_f32(refs, m, n, k, k, n, &mut acc, n);
    acc.iter()
        .zip(c0)
        .map(|(&x, &c)| desc.alpha * x + desc.beta * c)
        .collect()
}

fn run_f32(engine: ComputeEngine, kind: BatchKind, m: usize, n: usize, k: usize, bs: usize, alpha: f32, beta: f32) {
    let mut rng = StdRng::seed_from_u64((m * 1000 + n * 10 + k) as u64);
    // Strides depend only on the shape; build once to learn the packed size.
    let layout = builder(engine, DataType::F32, DataType::F32, m, n, k).build().unwrap();
    let data = F32Batch::new(&layout, bs, &mut rng);
    let kind = match kind {
        BatchKind::Strd { .. } => BatchKind::Strd {
            stride_a: (data.a_len * 4) as i64,
            stride_b: data.packed_len as i64,
        },
        other => other,
    };
    let desc = builder(engine, DataType::F32, DataType::F32, m, n, k)
        .batch(kind)
        .max_bs(bs)
        .alpha(alpha)
        .beta(beta)
        .build()
        .unwrap();
    let kernel = BrgemmKernel::new(desc.clone()).unwrap();

    let c0 = small_f32(&mut rng, m * n);
    let mut c = c0.clone();
    let elems = data.elements(kind);
    let params = BrgemmParams {
        ptr_a: data.a.as_ptr().cast(),
        ptr_b: data.b_packed.as_ptr(),
        batch: if matches!(kind, BatchKind::Strd { .. }) {
            std::ptr::null()
        } else {
            elems.as_ptr()
        },
        ptr_c: c.as_mut_ptr().cast(),
        ptr_d: c.as_mut_ptr().cast(),
        bs: bs as u64,
        ..BrgemmParams::default()
    };
    unsafe { kernel.execute(&params) };
    assert_close(&c, &reference_f32(&desc, &data.refs(), &c0));
}

fn widen<T: Copy + Into<i32>>(v: &[T]) -> Vec<i32> {
    v.iter().map(|&x| x.into()).collect()
}

// ═══════════════════════════════════════════════════════════════════════
// Float kernels
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn test_f32_4x4_identity_b() {
    skip_unless!(ComputeEngine::Avx2);
    let desc = builder(ComputeEngine::Avx2, DataType::F32, DataType::F32, 4, 4, 4)
        .max_bs(1)
        .build()
        .unwrap();
    let kernel = BrgemmKernel::new(desc.clone()).unwrap();
    let a: Vec<f32> = (1..=16).map(|x| x as f32).collect();
    let mut b = vec![0.0f32; 16];
    for i in 0..4 {
        b[i * 4 + i] = 1.0;
    }
    let b_packed = pack_b(&desc, bytemuck::cast_slice(&b), 4);
    let mut c = vec![0.0f32; 16];
    let batch = [BatchElement::pointers(a.as_ptr().cast(), b_packed.as_ptr())];
    let params = BrgemmParams {
        batch: batch.as_ptr(),
        bs: 1,
        ptr_c: c.as_mut_ptr().cast(),
        ptr_d: c.as_mut_ptr().cast(),
        ..BrgemmParams::default()
    };
    unsafe { kernel.execute(&params) };
    assert_eq!(c, a);
}

#[test]
fn test_f32_shapes_and_tails_avx2() {
    skip_unless!(ComputeEngine::Avx2);
    for &(m, n, k) in &[(1, 1, 1), (3, 8, 8), (7, 13, 19), (9, 45, 33), (16, 24, 64)] {
        run_f32(ComputeEngine::Avx2, BatchKind::Addr, m, n, k, 2, 1.0, 0.0);
    }
}

#[test]
fn test_f32_shapes_and_tails_avx512() {
    skip_unless!(ComputeEngine::Avx512);
    for &(m, n, k) in &[(1, 1, 1), (5, 16, 16), (7, 45, 19), (12, 100, 40), (31, 17, 3)] {
        run_f32(ComputeEngine::Avx512, BatchKind::Addr, m, n, k, 3, 1.0, 0.0);
    }
}

#[test]
fn test_f32_batch_kinds() {
    skip_unless!(ComputeEngine::Avx2);
    for kind in [
        BatchKind::Addr,
        BatchKind::Offs,
        BatchKind::Strd { stride_a: 0, stride_b: 0 },
    ] {
        run_f32(ComputeEngine::Avx2, kind, 6, 20, 10, 4, 1.0, 0.0);
    }
}

#[test]
fn test_f32_alpha_beta() {
    skip_unless!(ComputeEngine::Avx2);
    run_f32(ComputeEngine::Avx2, BatchKind::Addr, 5, 11, 7, 2, 0.5, 1.0);
    run_f32(ComputeEngine::Avx2, BatchKind::Addr, 5, 11, 7, 2, 2.0, -0.5);
}

#[test]
fn test_zero_batch_keeps_beta_scaled_c() {
    skip_unless!(ComputeEngine::Avx2);
    let desc = builder(ComputeEngine::Avx2, DataType::F32, DataType::F32, 3, 9, 4)
        .beta(1.0)
        .build()
        .unwrap();
    let kernel = BrgemmKernel::new(desc).unwrap();
    let c0: Vec<f32> = (0..27).map(|x| x as f32).collect();
    let mut c = c0.clone();
    let params = BrgemmParams {
        bs: 0,
        ptr_c: c.as_mut_ptr().cast(),
        ptr_d: c.as_mut_ptr().cast(),
        ..BrgemmParams::default()
    };
    unsafe { kernel.execute(&params) };
    assert_eq!(c, c0);
}

#[test]
fn test_skip_accumulation_runs_store_only() {
    skip_unless!(ComputeEngine::Avx2);
    let desc = builder(ComputeEngine::Avx2, DataType::F32, DataType::F32, 2, 8, 4)
        .beta(1.0)
        .skip_accumulation(true)
        .bias(DataType::F32)
        .build()
        .unwrap();
    let kernel = BrgemmKernel::new(desc).unwrap();
    let a = vec![1.0f32; 8];
    let b = vec![1.0f32; 32];
    let bias: Vec<f32> = (0..8).map(|x| x as f32).collect();
    let c0 = vec![10.0f32; 16];
    let mut c = c0.clone();
    let mut d = vec![0.0f32; 16];
    let batch = [BatchElement::pointers(a.as_ptr().cast(), b.as_ptr().cast())];
    let params = BrgemmParams {
        batch: batch.as_ptr(),
        bs: 1,
        ptr_c: c.as_mut_ptr().cast(),
        ptr_d: d.as_mut_ptr().cast(),
        ptr_bias: bias.as_ptr().cast(),
        skip_accm: 1,
        ..BrgemmParams::default()
    };
    unsafe { kernel.execute(&params) };
    let want: Vec<f32> = (0..16).map(|i| 10.0 + (i % 8) as f32).collect();
    assert_eq!(d, want);
}

#[test]
fn test_bf16_inputs_and_output() {
    skip_unless!(ComputeEngine::Avx512);
    let (m, n, k) = (5, 19, 10);
    let mut rng = StdRng::seed_from_u64(7);
    let a = small_f32(&mut rng, m * k);
    let b = small_f32(&mut rng, k * n);
    let a16: Vec<u16> = a.iter().map(|&x| f32_to_bf16(x)).collect();
    let b16: Vec<u16> = b.iter().map(|&x| f32_to_bf16(x)).collect();
    let desc = builder(ComputeEngine::Avx512, DataType::Bf16, DataType::Bf16, m, n, k)
        .dst(DataType::Bf16)
        .build()
        .unwrap();
    let kernel = BrgemmKernel::new(desc.clone()).unwrap();
    let b_packed = pack_b(&desc, bytemuck::cast_slice(&b16), n);
    let mut c = vec![0.0f32; m * n];
    let mut d = vec![0u16; m * n];
    let batch = [BatchElement::pointers(a16.as_ptr().cast(), b_packed.as_ptr())];
    let params = BrgemmParams {
        batch: batch.as_ptr(),
        bs: 1,
        ptr_c: c.as_mut_ptr().cast(),
        ptr_d: d.as_mut_ptr().cast(),
        ..BrgemmParams::default()
    };
    unsafe { kernel.execute(&params) };

    let mut want = vec![0.0f32; m * n];
    brgemm_f32(&[BatchRef { a: &a, b: &b }], m, n, k, k, n, &mut want, n);
    let got: Vec<f32> = d.iter().map(|&x| bf16_to_f32(x)).collect();
    let want: Vec<f32> = want.iter().map(|&x| bf16_to_f32(f32_to_bf16(x))).collect();
    assert_eq!(got, want);
}

fn encode_fp8(dt: DataType, v: &[f32]) -> Vec<u8> {
    v.iter()
        .map(|&x| match dt {
            DataType::F8E4M3 => f32_to_e4m3(x),
            _ => f32_to_e5m2(x),
        })
        .collect()
}

/// fp8 operands hold small integers, which both formats represent exactly.
fn run_fp8(engine: ComputeEngine, dt_a: DataType, dt_b: DataType, m: usize, n: usize, k: usize) {
    let desc = builder(engine, dt_a, dt_b, m, n, k).build().unwrap();
    let kernel = BrgemmKernel::new(desc.clone()).unwrap();
    let mut rng = StdRng::seed_from_u64((m * 100 + n * 10 + k) as u64);
    let a = small_f32(&mut rng, m * k);
    let b = small_f32(&mut rng, k * n);
    let a8 = encode_fp8(dt_a, &a);
    let b_packed = pack_b(&desc, &encode_fp8(dt_b, &b), n);
    let mut c = vec![0.0f32; m * n];
    let batch = [BatchElement::pointers(a8.as_ptr(), b_packed.as_ptr())];
    let params = BrgemmParams {
        batch: batch.as_ptr(),
        bs: 1,
        ptr_c: c.as_mut_ptr().cast(),
        ptr_d: c.as_mut_ptr().cast(),
        ..BrgemmParams::default()
    };
    unsafe { kernel.execute(&params) };
    let mut want = vec![0.0f32; m * n];
    brgemm_f32(&[BatchRef { a: &a, b: &b }], m, n, k, k, n, &mut want, n);
    assert_eq!(c, want, "{dt_a} x {dt_b} {m}x{n}x{k} on {engine:?}");
}

#[test]
fn test_fp8_inputs() {
    if !host_caps().f16c {
        return;
    }
    let pairs = [
        (DataType::F8E4M3, DataType::F8E4M3),
        (DataType::F8E5M2, DataType::F8E5M2),
        (DataType::F8E4M3, DataType::F8E5M2),
        (DataType::F8E5M2, DataType::F8E4M3),
    ];
    for engine in [ComputeEngine::Avx2, ComputeEngine::Avx512] {
        if !host_caps().supports_engine(engine) {
            continue;
        }
        for (dt_a, dt_b) in pairs {
            run_fp8(engine, dt_a, dt_b, 5, 19, 11);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Integer kernels
// ═══════════════════════════════════════════════════════════════════════

struct IntCase {
    a: Vec<u8>,
    b: Vec<i8>,
    b_packed: Vec<u8>,
}

impl IntCase {
    fn new(desc: &BrgemmDesc, signed_a: bool, rng: &mut StdRng) -> Self {
        let (m, n, k) = (desc.m, desc.n, desc.k);
        let a: Vec<u8> = (0..m * k)
            .map(|_| {
                if signed_a {
                    rng.gen_range(-128i32..=127) as i8 as u8
                } else {
                    rng.gen_range(0u8..=255)
                }
            })
            .collect();
        // Without a native dot product, pairs of u8·s8 products saturate
        // at 16 bits; keep B small enough that they cannot.
        let b_max: i8 = if desc.caps.has_int8_vnni(desc.engine) { 127 } else { 63 };
        let b: Vec<i8> = (0..k * n).map(|_| rng.gen_range(-b_max - 1..=b_max)).collect();
        let b_packed = pack_b(desc, bytemuck::cast_slice(&b), n);
        IntCase { a, b, b_packed }
    }

    fn reference(&self, desc: &BrgemmDesc, signed_a: bool) -> Vec<i32> {
        let (m, n, k) = (desc.m, desc.n, desc.k);
        let a: Vec<i32> = if signed_a {
            self.a.iter().map(|&x| x as i8 as i32).collect()
        } else {
            widen(&self.a)
        };
        let b = widen(&self.b);
        let mut c = vec![0i32; m * n];
        brgemm_i32(&[BatchRef { a: &a, b: &b }], m, n, k, k, n, &mut c, n);
        c
    }
}

fn int_engine() -> Option<ComputeEngine> {
    [ComputeEngine::Avx512, ComputeEngine::Avx2]
        .into_iter()
        .find(|&e| host_caps().supports_engine(e))
}

#[test]
fn test_u8s8_8x8() {
    let Some(engine) = int_engine() else {
        eprintln!("no vector engine, skipping");
        return;
    };
    let desc = builder(engine, DataType::U8, DataType::S8, 8, 8, 8).build().unwrap();
    let kernel = BrgemmKernel::new(desc.clone()).unwrap();
    let case = IntCase::new(&desc, false, &mut StdRng::seed_from_u64(88));
    let mut c = vec![0i32; 64];
    let batch = [BatchElement::pointers(case.a.as_ptr(), case.b_packed.as_ptr())];
    let params = BrgemmParams {
        batch: batch.as_ptr(),
        bs: 1,
        ptr_c: c.as_mut_ptr().cast(),
        ptr_d: c.as_mut_ptr().cast(),
        ..BrgemmParams::default()
    };
    unsafe { kernel.execute(&params) };
    assert_eq!(c, case.reference(&desc, false));
}

#[test]
fn test_u8s8_reduction_tail() {
    let Some(engine) = int_engine() else {
        return;
    };
    let desc = builder(engine, DataType::U8, DataType::S8, 5, 21, 13).build().unwrap();
    let kernel = BrgemmKernel::new(desc.clone()).unwrap();
    let case = IntCase::new(&desc, false, &mut StdRng::seed_from_u64(13));
    let mut c = vec![0i32; 5 * 21];
    let batch = [BatchElement::pointers(case.a.as_ptr(), case.b_packed.as_ptr())];
    let params = BrgemmParams {
        batch: batch.as_ptr(),
        bs: 1,
        ptr_c: c.as_mut_ptr().cast(),
        ptr_d: c.as_mut_ptr().cast(),
        ..BrgemmParams::default()
    };
    unsafe { kernel.execute(&params) };
    assert_eq!(c, case.reference(&desc, false));
}

#[test]
fn test_s8s8_with_compensation() {
    let Some(engine) = int_engine() else {
        return;
    };
    let (m, n, k) = (4, 16, 12);
    let desc = builder(engine, DataType::S8, DataType::S8, m, n, k)
        .s8s8_compensation()
        .build()
        .unwrap();
    let kernel = BrgemmKernel::new(desc.clone()).unwrap();
    let case = IntCase::new(&desc, true, &mut StdRng::seed_from_u64(5));
    let comp: Vec<i32> = (0..n)
        .map(|j| -128 * (0..k).map(|p| case.b[p * n + j] as i32).sum::<i32>())
        .collect();
    let mut c = vec![0i32; m * n];
    let batch = [BatchElement::pointers(case.a.as_ptr(), case.b_packed.as_ptr())];
    let params = BrgemmParams {
        batch: batch.as_ptr(),
        bs: 1,
        ptr_c: c.as_mut_ptr().cast(),
        ptr_d: c.as_mut_ptr().cast(),
        ptr_compensation: comp.as_ptr(),
        ..BrgemmParams::default()
    };
    unsafe { kernel.execute(&params) };
    assert_eq!(c, case.reference(&desc, true));
}

#[test]
fn test_u8_destination_with_scales_and_zero_point() {
    let Some(engine) = int_engine() else {
        return;
    };
    let (m, n, k) = (3, 20, 8);
    let desc = builder(engine, DataType::U8, DataType::S8, m, n, k)
        .scales(Broadcast::PerN)
        .zero_points_c(Broadcast::PerTensor)
        .dst(DataType::U8)
        .build()
        .unwrap();
    let kernel = BrgemmKernel::new(desc.clone()).unwrap();
    let case = IntCase::new(&desc, false, &mut StdRng::seed_from_u64(21));
    let scales: Vec<f32> = (0..n).map(|j| 1.0 / (64.0 * (1 + j % 4) as f32)).collect();
    let zp_c = [100i32];
    let mut c = vec![0i32; m * n];
    let mut d = vec![0u8; m * n];
    let batch = [BatchElement::pointers(case.a.as_ptr(), case.b_packed.as_ptr())];
    let params = BrgemmParams {
        batch: batch.as_ptr(),
        bs: 1,
        ptr_c: c.as_mut_ptr().cast(),
        ptr_d: d.as_mut_ptr(),
        ptr_scales: scales.as_ptr(),
        zp_c_values: zp_c.as_ptr(),
        ..BrgemmParams::default()
    };
    unsafe { kernel.execute(&params) };
    let acc = case.reference(&desc, false);
    let want: Vec<u8> = acc
        .iter()
        .enumerate()
        .map(|(i, &x)| saturate_to_u8(x as f32 * scales[i % n] + 100.0))
        .collect();
    assert_eq!(d, want);
}

/// Single-batch int8 kernel checked against the s32 reference.
fn run_int8(desc: &BrgemmDesc, signed_a: bool, seed: u64) {
    let kernel = BrgemmKernel::new(desc.clone()).unwrap();
    let case = IntCase::new(desc, signed_a, &mut StdRng::seed_from_u64(seed));
    let (m, n, k) = (desc.m, desc.n, desc.k);
    let comp: Vec<i32> = (0..n)
        .map(|j| -128 * (0..k).map(|p| case.b[p * n + j] as i32).sum::<i32>())
        .collect();
    let mut c = vec![0i32; m * n];
    let batch = [BatchElement::pointers(case.a.as_ptr(), case.b_packed.as_ptr())];
    let params = BrgemmParams {
        batch: batch.as_ptr(),
        bs: 1,
        ptr_c: c.as_mut_ptr().cast(),
        ptr_d: c.as_mut_ptr().cast(),
        ptr_compensation: comp.as_ptr(),
        ..BrgemmParams::default()
    };
    unsafe { kernel.execute(&params) };
    assert_eq!(c, case.reference(desc, signed_a), "{m}x{n}x{k} on {:?}", desc.engine);
}

#[test]
fn test_avx512_small_m_reduction_tails() {
    skip_unless!(ComputeEngine::Avx512);
    for &(m, n, k) in &[(1, 1, 1), (5, 21, 13), (3, 16, 2), (4, 4, 4), (2, 33, 7)] {
        let desc = builder(ComputeEngine::Avx512, DataType::U8, DataType::S8, m, n, k)
            .build()
            .unwrap();
        run_int8(&desc, false, (m * n + k) as u64);
        if host_caps().f16c {
            run_fp8(ComputeEngine::Avx512, DataType::F8E5M2, DataType::F8E5M2, m, n, k);
        }
    }
}

#[test]
fn test_b_zero_point_and_per_n_destination_zero_point() {
    let Some(engine) = int_engine() else {
        return;
    };
    let (m, n, k) = (5, 20, 9);
    let zp_b = 3i32;
    let desc = builder(engine, DataType::U8, DataType::S8, m, n, k)
        .zero_points_b()
        .scales(Broadcast::PerN)
        .zero_points_c(Broadcast::PerN)
        .dst(DataType::U8)
        .build()
        .unwrap();
    let kernel = BrgemmKernel::new(desc.clone()).unwrap();
    let case = IntCase::new(&desc, false, &mut StdRng::seed_from_u64(31));
    let zp_comp_b: Vec<i32> = row_sums_i32(&widen(&case.a), m, k, k)
        .iter()
        .map(|&s| -zp_b * s)
        .collect();
    let scales: Vec<f32> = (0..n).map(|j| 1.0 / (2048.0 * (1 + j % 3) as f32)).collect();
    let zp_c: Vec<i32> = (0..n).map(|j| 60 + 10 * (j % 4) as i32).collect();
    let mut c = vec![0i32; m * n];
    let mut d = vec![0u8; m * n];
    let batch = [BatchElement::pointers(case.a.as_ptr(), case.b_packed.as_ptr())];
    let params = BrgemmParams {
        batch: batch.as_ptr(),
        bs: 1,
        ptr_c: c.as_mut_ptr().cast(),
        ptr_d: d.as_mut_ptr(),
        ptr_scales: scales.as_ptr(),
        zp_comp_b: zp_comp_b.as_ptr(),
        zp_c_values: zp_c.as_ptr(),
        ..BrgemmParams::default()
    };
    unsafe { kernel.execute(&params) };

    // Σ A·(B - zp_b)
    let a = widen(&case.a);
    let b: Vec<i32> = case.b.iter().map(|&x| x as i32 - zp_b).collect();
    let mut acc = vec![0i32; m * n];
    brgemm_i32(&[BatchRef { a: &a, b: &b }], m, n, k, k, n, &mut acc, n);
    let want: Vec<u8> = acc
        .iter()
        .enumerate()
        .map(|(i, &x)| saturate_to_u8(x as f32 * scales[i % n] + zp_c[i % n] as f32))
        .collect();
    assert_eq!(d, want);
}

// ═══════════════════════════════════════════════════════════════════════
// Store pipeline switches
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn test_post_ops_toggle() {
    skip_unless!(ComputeEngine::Avx2);
    let (m, n, k) = (4, 12, 6);
    let rhs: Vec<f32> = (0..n).map(|j| j as f32 - 5.0).collect();
    let desc = builder(ComputeEngine::Avx2, DataType::F32, DataType::F32, m, n, k)
        .bias(DataType::F32)
        .post_op(PostOp::Binary {
            op: BinaryOp::Add,
            bcast: Broadcast::PerN,
        })
        .post_op(PostOp::Eltwise(Eltwise::Relu { negative_slope: 0.0 }))
        .build()
        .unwrap();
    let kernel = BrgemmKernel::new(desc.clone()).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let a = small_f32(&mut rng, m * k);
    let b = small_f32(&mut rng, k * n);
    let bias = small_f32(&mut rng, n);
    let rhs_ptrs = [rhs.as_ptr()];
    let mut acc = vec![0.0f32; m * n];
    brgemm_f32(&[BatchRef { a: &a, b: &b }], m, n, k, k, n, &mut acc, n);

    for do_post_ops in [1u64, 0] {
        let mut c = vec![-1.0f32; m * n];
        let mut d = vec![-1.0f32; m * n];
        let batch = [BatchElement::pointers(a.as_ptr().cast(), b.as_ptr().cast())];
        let params = BrgemmParams {
            batch: batch.as_ptr(),
            bs: 1,
            ptr_c: c.as_mut_ptr().cast(),
            ptr_d: d.as_mut_ptr().cast(),
            ptr_bias: bias.as_ptr().cast(),
            post_ops_rhs: rhs_ptrs.as_ptr(),
            do_post_ops,
            ..BrgemmParams::default()
        };
        unsafe { kernel.execute(&params) };
        if do_post_ops == 1 {
            let want: Vec<f32> = acc
                .iter()
                .enumerate()
                .map(|(i, &x)| relu(x + bias[i % n] + rhs[i % n], 0.0))
                .collect();
            assert_close(&d, &want);
            assert!(c.iter().all(|&x| x == -1.0));
        } else {
            assert_close(&c, &acc);
            assert!(d.iter().all(|&x| x == -1.0));
        }
    }
}

#[test]
fn test_sum_post_op_reads_destination() {
    skip_unless!(ComputeEngine::Avx2);
    let (m, n, k) = (2, 9, 3);
    let desc = builder(ComputeEngine::Avx2, DataType::F32, DataType::F32, m, n, k)
        .post_op(PostOp::Sum {
            scale: 0.5,
            zero_point: 2,
        })
        .dst_scales()
        .build()
        .unwrap();
    let kernel = BrgemmKernel::new(desc).unwrap();
    let a = vec![1.0f32; m * k];
    let b = vec![2.0f32; k * n];
    let d0: Vec<f32> = (0..m * n).map(|i| i as f32).collect();
    let mut d = d0.clone();
    let mut c = vec![0.0f32; m * n];
    let dst_scale = [2.0f32];
    let batch = [BatchElement::pointers(a.as_ptr().cast(), b.as_ptr().cast())];
    let params = BrgemmParams {
        batch: batch.as_ptr(),
        bs: 1,
        ptr_c: c.as_mut_ptr().cast(),
        ptr_d: d.as_mut_ptr().cast(),
        dst_scales: dst_scale.as_ptr(),
        ..BrgemmParams::default()
    };
    unsafe { kernel.execute(&params) };
    let want: Vec<f32> = d0.iter().map(|&x| (6.0 + 0.5 * (x - 2.0)) * 2.0).collect();
    assert_close(&d, &want);
}

#[test]
fn test_binary_post_op_chain() {
    let (m, n, k) = (3, 21, 5);
    let ops = [
        (BinaryOp::Mul, Broadcast::PerTensor),
        (BinaryOp::Sub, Broadcast::PerN),
        (BinaryOp::Max, Broadcast::PerN),
        (BinaryOp::Min, Broadcast::PerTensor),
    ];
    let scale = [0.5f32];
    let shift: Vec<f32> = (0..n).map(|j| (j % 5) as f32 - 2.0).collect();
    let floor: Vec<f32> = (0..n).map(|j| -((j % 3) as f32)).collect();
    let ceil = [6.0f32];
    let rhs_ptrs = [scale.as_ptr(), shift.as_ptr(), floor.as_ptr(), ceil.as_ptr()];
    for engine in [ComputeEngine::Avx2, ComputeEngine::Avx512] {
        if !host_caps().supports_engine(engine) {
            continue;
        }
        let mut b = builder(engine, DataType::F32, DataType::F32, m, n, k);
        for (op, bcast) in ops {
            b = b.post_op(PostOp::Binary { op, bcast });
        }
        let desc = b.build().unwrap();
        let kernel = BrgemmKernel::new(desc).unwrap();
        let mut rng = StdRng::seed_from_u64(41);
        let a = small_f32(&mut rng, m * k);
        let bm = small_f32(&mut rng, k * n);
        let mut c = vec![0.0f32; m * n];
        let batch = [BatchElement::pointers(a.as_ptr().cast(), bm.as_ptr().cast())];
        let params = BrgemmParams {
            batch: batch.as_ptr(),
            bs: 1,
            ptr_c: c.as_mut_ptr().cast(),
            ptr_d: c.as_mut_ptr().cast(),
            post_ops_rhs: rhs_ptrs.as_ptr(),
            ..BrgemmParams::default()
        };
        unsafe { kernel.execute(&params) };
        let mut acc = vec![0.0f32; m * n];
        brgemm_f32(&[BatchRef { a: &a, b: &bm }], m, n, k, k, n, &mut acc, n);
        let want: Vec<f32> = acc
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                let j = i % n;
                (x * 0.5 - shift[j]).max(floor[j]).min(6.0)
            })
            .collect();
        assert_close(&c, &want);
    }
}

#[test]
fn test_binary_post_op_on_int8_accumulator() {
    let Some(engine) = int_engine() else {
        return;
    };
    let (m, n, k) = (4, 18, 10);
    let desc = builder(engine, DataType::U8, DataType::S8, m, n, k)
        .post_op(PostOp::Binary {
            op: BinaryOp::Add,
            bcast: Broadcast::PerN,
        })
        .dst(DataType::F32)
        .build()
        .unwrap();
    let kernel = BrgemmKernel::new(desc.clone()).unwrap();
    let case = IntCase::new(&desc, false, &mut StdRng::seed_from_u64(52));
    let rhs: Vec<f32> = (0..n).map(|j| j as f32 * 0.25).collect();
    let rhs_ptrs = [rhs.as_ptr()];
    let mut c = vec![0i32; m * n];
    let mut d = vec![0.0f32; m * n];
    let batch = [BatchElement::pointers(case.a.as_ptr(), case.b_packed.as_ptr())];
    let params = BrgemmParams {
        batch: batch.as_ptr(),
        bs: 1,
        ptr_c: c.as_mut_ptr().cast(),
        ptr_d: d.as_mut_ptr().cast(),
        post_ops_rhs: rhs_ptrs.as_ptr(),
        ..BrgemmParams::default()
    };
    unsafe { kernel.execute(&params) };
    let want: Vec<f32> = case
        .reference(&desc, false)
        .iter()
        .enumerate()
        .map(|(i, &x)| x as f32 + rhs[i % n])
        .collect();
    assert_close(&d, &want);
}

// ═══════════════════════════════════════════════════════════════════════
// Virtual padding
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn test_vpad_matches_zeroed_rows() {
    skip_unless!(ComputeEngine::Avx2);
    let (m, n, k, bs) = (6, 8, 5, 4);
    let desc = builder(ComputeEngine::Avx2, DataType::F32, DataType::F32, m, n, k)
        .bd_block(6)
        .vpad(2, 2)
        .max_bs(bs)
        .build()
        .unwrap();
    let kernel = BrgemmKernel::new(desc.clone()).unwrap();
    let mut rng = StdRng::seed_from_u64(99);
    let data = F32Batch::new(&desc, bs, &mut rng);
    let pads = [(0, 0), (1, 0), (2, 1), (0, 2)];
    let elems: Vec<BatchElement> = data
        .elements(BatchKind::Addr)
        .into_iter()
        .zip(pads)
        .map(|(e, (t, b))| e.with_vpad(t, b))
        .collect();
    let mut c = vec![0.0f32; m * n];
    let params = BrgemmParams {
        batch: elems.as_ptr(),
        bs: bs as u64,
        ptr_c: c.as_mut_ptr().cast(),
        ptr_d: c.as_mut_ptr().cast(),
        ..BrgemmParams::default()
    };
    unsafe { kernel.execute(&params) };

    let mut padded_a = data.a.clone();
    for (i, &(top, bottom)) in pads.iter().enumerate() {
        let blk = &mut padded_a[i * m * k..(i + 1) * m * k];
        for row in (0..top).chain(m - bottom..m) {
            blk[row * k..(row + 1) * k].fill(0.0);
        }
    }
    let refs: Vec<BatchRef<'_, f32>> = padded_a
        .chunks(m * k)
        .zip(data.b.chunks(k * n))
        .map(|(a, b)| BatchRef { a, b })
        .collect();
    let mut want = vec![0.0f32; m * n];
    brgemm_f32(&refs, m, n, k, k, n, &mut want, n);
    assert_close(&c, &want);
}

#[test]
fn test_vpad_rejected_on_tile_engine() {
    let err = BrgemmDesc::builder(DataType::Bf16, DataType::Bf16, 16, 16, 32)
        .isa(ComputeEngine::Amx, brgemm_kernels::IsaCaps::amx())
        .vpad(1, 0)
        .build()
        .unwrap_err();
    assert!(matches!(err, BrgemmError::Unsupported(_)));
}

/// Batched int8 kernel with per-element padding. `zp_a` applies to u8 A;
/// s8 A goes through the s8s8 shift instead. Padded rows contribute
/// nothing in either case.
fn run_int8_vpad(engine: ComputeEngine, dt_a: DataType, zp_a: i32, comp_in_kernel: bool) {
    let (m, n, k, bs) = (6, 20, 13, 3);
    let pads = [(0usize, 1usize), (2, 0), (1, 2)];
    let mut b = builder(engine, dt_a, DataType::S8, m, n, k)
        .ld_block2(1)
        .vpad(2, 2)
        .max_bs(bs)
        .req_cal_comp_pads(comp_in_kernel);
    let signed_a = dt_a == DataType::S8;
    if signed_a {
        b = b.s8s8_compensation();
    } else {
        b = b.zero_points_a();
    }
    let desc = b.build().unwrap();
    assert_eq!(desc.comp_in_kernel(), comp_in_kernel);
    let kernel = BrgemmKernel::new(desc.clone()).unwrap();

    let mut rng = StdRng::seed_from_u64(60 + comp_in_kernel as u64);
    let b_max: i8 = if desc.caps.has_int8_vnni(engine) { 127 } else { 63 };
    let a: Vec<Vec<u8>> = (0..bs)
        .map(|_| (0..m * k).map(|_| rng.gen_range(0u8..=255)).collect())
        .collect();
    let bq: Vec<Vec<i8>> = (0..bs)
        .map(|_| (0..k * n).map(|_| rng.gen_range(-b_max - 1..=b_max)).collect())
        .collect();
    let packed: Vec<Vec<u8>> = bq
        .iter()
        .map(|blk| pack_b(&desc, bytemuck::cast_slice(blk), n))
        .collect();
    let elems: Vec<BatchElement> = (0..bs)
        .map(|i| {
            BatchElement::pointers(a[i].as_ptr(), packed[i].as_ptr()).with_vpad(pads[i].0, pads[i].1)
        })
        .collect();

    let b32: Vec<Vec<i32>> = bq.iter().map(|blk| widen(blk)).collect();
    let mut col_sums = vec![0i32; n];
    for blk in &b32 {
        for (s, x) in col_sums.iter_mut().zip(column_sums_i32(blk, k, n, n)) {
            *s += x;
        }
    }
    let comp: Vec<i32> = col_sums.iter().map(|&s| -128 * s).collect();
    let zp_comp_a: Vec<i32> = col_sums.iter().map(|&s| -s).collect();
    let bulk = |v: &Vec<i32>| if comp_in_kernel { std::ptr::null() } else { v.as_ptr() };

    let mut c = vec![0i32; m * n];
    let params = BrgemmParams {
        batch: elems.as_ptr(),
        bs: bs as u64,
        ptr_c: c.as_mut_ptr().cast(),
        ptr_d: c.as_mut_ptr().cast(),
        ptr_compensation: if signed_a { bulk(&comp) } else { std::ptr::null() },
        zp_a_val: zp_a as i64,
        zp_comp_a: if signed_a { std::ptr::null() } else { bulk(&zp_comp_a) },
        ..BrgemmParams::default()
    };
    unsafe { kernel.execute(&params) };

    let a_eff: Vec<Vec<i32>> = a
        .iter()
        .zip(pads)
        .map(|(blk, (top, bottom))| {
            (0..m * k)
                .map(|i| {
                    let row = i / k;
                    if row < top || row >= m - bottom {
                        0
                    } else if signed_a {
                        blk[i] as i8 as i32
                    } else {
                        blk[i] as i32 - zp_a
                    }
                })
                .collect()
        })
        .collect();
    let refs: Vec<BatchRef<'_, i32>> = a_eff
        .iter()
        .zip(&b32)
        .map(|(a, b)| BatchRef { a, b })
        .collect();
    let mut want = vec![0i32; m * n];
    brgemm_i32(&refs, m, n, k, k, n, &mut want, n);
    assert_eq!(c, want, "{dt_a} zp_a={zp_a} in_kernel={comp_in_kernel} on {engine:?}");
}

#[test]
fn test_int8_vpad_compensation_modes() {
    for engine in [ComputeEngine::Avx2, ComputeEngine::Avx512] {
        if !host_caps().supports_engine(engine) {
            continue;
        }
        for comp_in_kernel in [false, true] {
            run_int8_vpad(engine, DataType::S8, 0, comp_in_kernel);
            run_int8_vpad(engine, DataType::U8, 7, comp_in_kernel);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Quantized weights
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn test_u4_decompression_per_n_scales() {
    skip_unless!(ComputeEngine::Avx2);
    let (m, n, k) = (3, 10, 8);
    let desc = builder(ComputeEngine::Avx2, DataType::F32, DataType::U4, m, n, k)
        .weight_decomp(WeiDecomp {
            scales: Some(QuantParam::per_n(0)),
            zero_points: Some(WeiZeroPoint {
                dt: DataType::U8,
                param: QuantParam::per_tensor(),
            }),
            group_size: None,
        })
        .build()
        .unwrap();
    let kernel = BrgemmKernel::new(desc.clone()).unwrap();
    let mut rng = StdRng::seed_from_u64(44);
    let a = small_f32(&mut rng, m * k);
    let codes: Vec<u8> = (0..k * n).map(|_| rng.gen_range(0u8..16)).collect();
    let scales: Vec<f32> = (0..n).map(|j| 0.25 * (1 + j % 3) as f32).collect();
    let zp = [8u8];
    let b_packed = pack_b(&desc, &codes, n);
    let b: Vec<f32> = codes
        .iter()
        .enumerate()
        .map(|(i, &q)| (q as f32 - 8.0) * scales[i % n])
        .collect();
    let mut c = vec![0.0f32; m * n];
    let batch = [BatchElement::pointers(a.as_ptr().cast(), b_packed.as_ptr())];
    let params = BrgemmParams {
        batch: batch.as_ptr(),
        bs: 1,
        ptr_c: c.as_mut_ptr().cast(),
        ptr_d: c.as_mut_ptr().cast(),
        ptr_wei_scales: scales.as_ptr(),
        ptr_wei_zp: zp.as_ptr(),
        ..BrgemmParams::default()
    };
    unsafe { kernel.execute(&params) };
    let mut want = vec![0.0f32; m * n];
    brgemm_f32(&[BatchRef { a: &a, b: &b }], m, n, k, k, n, &mut want, n);
    assert_close(&c, &want);
}

#[test]
fn test_dynamic_quant_s8_u8() {
    let caps = host_caps();
    if !caps.supports_engine(ComputeEngine::Avx512) || !caps.has_int8_vnni(ComputeEngine::Avx512) {
        eprintln!("AVX-512 VNNI not supported on this CPU, skipping");
        return;
    }
    let (m, n, k) = (3, 16, 8);
    let desc = builder(ComputeEngine::Avx512, DataType::S8, DataType::U8, m, n, k)
        .dynamic_quant(DynQuant {
            src_scale_stride: 1,
            wei_scales: QuantParam::per_n(0),
            wei_zero_points: Some(QuantParam::per_tensor()),
            group_size: None,
        })
        .build()
        .unwrap();
    let kernel = BrgemmKernel::new(desc.clone()).unwrap();
    let mut rng = StdRng::seed_from_u64(17);
    let a: Vec<i8> = (0..m * k).map(|_| rng.gen_range(-127i8..=127)).collect();
    let bq: Vec<u8> = (0..k * n).map(|_| rng.gen_range(0u8..=255)).collect();
    let src_scales: Vec<f32> = (0..m).map(|i| 0.5 * (i + 1) as f32).collect();
    let wei_scales: Vec<f32> = (0..n).map(|j| 0.125 * (1 + j % 2) as f32).collect();
    let zp = [128u8];
    let b_packed = pack_b(&desc, &bq, n);
    let mut c = vec![0.0f32; m * n];
    let batch = [BatchElement::pointers(a.as_ptr().cast(), b_packed.as_ptr())];
    let params = BrgemmParams {
        batch: batch.as_ptr(),
        bs: 1,
        ptr_c: c.as_mut_ptr().cast(),
        ptr_d: c.as_mut_ptr().cast(),
        ptr_src_scales: src_scales.as_ptr(),
        ptr_wei_scales: wei_scales.as_ptr(),
        ptr_wei_zp: zp.as_ptr(),
        ..BrgemmParams::default()
    };
    unsafe { kernel.execute(&params) };
    let a32: Vec<i32> = a.iter().map(|&x| x as i32).collect();
    let b32: Vec<i32> = bq.iter().map(|&x| x as i32 - 128).collect();
    let mut acc = vec![0i32; m * n];
    brgemm_i32(&[BatchRef { a: &a32, b: &b32 }], m, n, k, k, n, &mut acc, n);
    let want: Vec<f32> = acc
        .iter()
        .enumerate()
        .map(|(i, &x)| x as f32 * src_scales[i / n] * wei_scales[i % n])
        .collect();
    assert_close(&c, &want);
}

/// Random weight codes for `dt` with their decoded values before the
/// zero-point and scale.
fn weight_codes(dt: DataType, rng: &mut StdRng, len: usize) -> (Vec<u8>, Vec<f32>) {
    (0..len)
        .map(|_| match dt {
            DataType::U8 => {
                let q = rng.gen_range(0u8..=255);
                (q, q as f32)
            }
            DataType::S8 => {
                let q = rng.gen_range(-128i32..=127) as i8;
                (q as u8, q as f32)
            }
            DataType::U4 => {
                let q = rng.gen_range(0u8..16);
                (q, u4_to_f32(q))
            }
            DataType::S4 => {
                let q = rng.gen_range(0u8..16);
                (q, s4_to_f32(q))
            }
            DataType::Nf4 => {
                let q = rng.gen_range(0u8..16);
                (q, nf4_to_f32(q))
            }
            other => panic!("{other} weights"),
        })
        .unzip()
}

#[test]
fn test_weight_decompression_types() {
    let (m, n, k) = (4, 21, 19);
    let per_n_scales: Vec<f32> = (0..n).map(|j| 0.25 * (1 + j % 3) as f32).collect();
    let tensor_scale = [0.5f32];
    let u8_zp: Vec<u8> = (0..n).map(|j| 100 + (j % 5) as u8).collect();
    let f32_zp = [0.5f32];
    for engine in [ComputeEngine::Avx2, ComputeEngine::Avx512] {
        if !host_caps().supports_engine(engine) {
            continue;
        }
        for dt_b in [DataType::U8, DataType::S8, DataType::U4, DataType::S4, DataType::Nf4] {
            // (scales, per-N scales?, zero-point, zero-point bytes)
            let (scales, per_n, zero_points, zp_ptr): (_, bool, _, *const u8) = match dt_b {
                DataType::U8 => (
                    QuantParam::per_n(0),
                    true,
                    Some(WeiZeroPoint {
                        dt: DataType::U8,
                        param: QuantParam::per_n(0),
                    }),
                    u8_zp.as_ptr(),
                ),
                DataType::S4 => (
                    QuantParam::per_n(0),
                    true,
                    Some(WeiZeroPoint {
                        dt: DataType::F32,
                        param: QuantParam::per_tensor(),
                    }),
                    f32_zp.as_ptr().cast(),
                ),
                DataType::S8 | DataType::U4 => (QuantParam::per_tensor(), false, None, std::ptr::null()),
                _ => (QuantParam::per_n(0), true, None, std::ptr::null()),
            };
            let desc = builder(engine, DataType::F32, dt_b, m, n, k)
                .weight_decomp(WeiDecomp {
                    scales: Some(scales),
                    zero_points,
                    group_size: None,
                })
                .build()
                .unwrap();
            let kernel = BrgemmKernel::new(desc.clone()).unwrap();
            let mut rng = StdRng::seed_from_u64(70);
            let a = small_f32(&mut rng, m * k);
            let (codes, values) = weight_codes(dt_b, &mut rng, k * n);
            let b_packed = pack_b(&desc, &codes, n);
            let b: Vec<f32> = values
                .iter()
                .enumerate()
                .map(|(i, &q)| {
                    let j = i % n;
                    let zp = match dt_b {
                        DataType::U8 => u8_zp[j] as f32,
                        DataType::S4 => f32_zp[0],
                        _ => 0.0,
                    };
                    let scale = if per_n { per_n_scales[j] } else { tensor_scale[0] };
                    (q - zp) * scale
                })
                .collect();
            let mut c = vec![0.0f32; m * n];
            let batch = [BatchElement::pointers(a.as_ptr().cast(), b_packed.as_ptr())];
            let params = BrgemmParams {
                batch: batch.as_ptr(),
                bs: 1,
                ptr_c: c.as_mut_ptr().cast(),
                ptr_d: c.as_mut_ptr().cast(),
                ptr_wei_scales: if per_n {
                    per_n_scales.as_ptr()
                } else {
                    tensor_scale.as_ptr()
                },
                ptr_wei_zp: zp_ptr,
                ..BrgemmParams::default()
            };
            unsafe { kernel.execute(&params) };
            let mut want = vec![0.0f32; m * n];
            brgemm_f32(&[BatchRef { a: &a, b: &b }], m, n, k, k, n, &mut want, n);
            assert_close(&c, &want);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Tile engine
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn test_amx_bf16() {
    skip_unless!(ComputeEngine::Amx);
    if !host_caps().amx_bf16 {
        return;
    }
    let (m, n, k) = (20, 40, 64);
    let desc = match builder(ComputeEngine::Amx, DataType::Bf16, DataType::Bf16, m, n, k).build() {
        Ok(d) => d,
        Err(e) => panic!("tile descriptor: {e}"),
    };
    let kernel = match BrgemmKernel::new(desc.clone()) {
        Ok(k) => k,
        Err(BrgemmError::Unsupported(msg)) => {
            eprintln!("{msg}, skipping");
            return;
        }
        Err(e) => panic!("{e}"),
    };
    let mut rng = StdRng::seed_from_u64(64);
    let a = small_f32(&mut rng, m * k);
    let b = small_f32(&mut rng, k * n);
    let a16: Vec<u16> = a.iter().map(|&x| f32_to_bf16(x)).collect();
    let b16: Vec<u16> = b.iter().map(|&x| f32_to_bf16(x)).collect();
    let b_packed = pack_b(&desc, bytemuck::cast_slice(&b16), n);
    let mut c = vec![0.0f32; m * n];
    let batch = [BatchElement::pointers(a16.as_ptr().cast(), b_packed.as_ptr())];
    let params = BrgemmParams {
        batch: batch.as_ptr(),
        bs: 1,
        ptr_c: c.as_mut_ptr().cast(),
        ptr_d: c.as_mut_ptr().cast(),
        ..BrgemmParams::default()
    };
    unsafe { kernel.execute(&params) };
    let mut want = vec![0.0f32; m * n];
    brgemm_f32(&[BatchRef { a: &a, b: &b }], m, n, k, k, n, &mut want, n);
    assert_close(&c, &want);
}

#[test]
fn test_amx_int8() {
    skip_unless!(ComputeEngine::Amx);
    if !host_caps().amx_int8 {
        return;
    }
    let (m, n, k) = (20, 40, 100);
    for (dt_a, signed_a) in [(DataType::U8, false), (DataType::S8, true)] {
        let desc = match builder(ComputeEngine::Amx, dt_a, DataType::S8, m, n, k).build() {
            Ok(d) => d,
            Err(e) => panic!("tile descriptor: {e}"),
        };
        let kernel = match BrgemmKernel::new(desc.clone()) {
            Ok(k) => k,
            Err(BrgemmError::Unsupported(msg)) => {
                eprintln!("{msg}, skipping");
                return;
            }
            Err(e) => panic!("{e}"),
        };
        let case = IntCase::new(&desc, signed_a, &mut StdRng::seed_from_u64(128));
        let mut c = vec![0i32; m * n];
        let batch = [BatchElement::pointers(case.a.as_ptr(), case.b_packed.as_ptr())];
        let params = BrgemmParams {
            batch: batch.as_ptr(),
            bs: 1,
            ptr_c: c.as_mut_ptr().cast(),
            ptr_d: c.as_mut_ptr().cast(),
            ..BrgemmParams::default()
        };
        unsafe { kernel.execute(&params) };
        assert_eq!(c, case.reference(&desc, signed_a), "{dt_a} x s8");
    }
}
