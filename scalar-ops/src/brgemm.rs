//! Reference batch-reduce GEMM.
//!
//! Operands are already decoded to `f32` (or widened to `i32`), row-major,
//! with explicit leading dimensions. Batch elements are summed in order, each
//! one in increasing `k`, which is the accumulation order of the generated
//! vector kernels.

/// One batch element: an `m × k` block of A and a `k × n` block of B.
#[derive(Debug, Clone, Copy)]
pub struct BatchRef<'a, T> {
    pub a: &'a [T],
    pub b: &'a [T],
}

/// GEMM: `C[i][j] += sum_k A[i][k] * B[k][j]` over every batch element.
#[allow(clippy::too_many_arguments)]
pub fn brgemm_f32(
    batch: &[BatchRef<'_, f32>],
    m: usize,
    n: usize,
    k: usize,
    lda: usize,
    ldb: usize,
    c: &mut [f32],
    ldc: usize,
) {
    for i in 0..m {
        for j in 0..n {
            let mut acc = c[i * ldc + j];
            for e in batch {
                for p in 0..k {
                    acc = e.a[i * lda + p].mul_add(e.b[p * ldb + j], acc);
                }
            }
            c[i * ldc + j] = acc;
        }
    }
}

/// Integer GEMM with wrapping 32-bit accumulation.
#[allow(clippy::too_many_arguments)]
pub fn brgemm_i32(
    batch: &[BatchRef<'_, i32>],
    m: usize,
    n: usize,
    k: usize,
    lda: usize,
    ldb: usize,
    c: &mut [i32],
    ldc: usize,
) {
    for i in 0..m {
        for j in 0..n {
            let mut acc = c[i * ldc + j];
            for e in batch {
                for p in 0..k {
                    acc = acc.wrapping_add(e.a[i * lda + p].wrapping_mul(e.b[p * ldb + j]));
                }
            }
            c[i * ldc + j] = acc;
        }
    }
}

/// Column sums of a `k × n` block: `out[j] = sum_k B[k][j]`.
pub fn column_sums_i32(b: &[i32], k: usize, n: usize, ldb: usize) -> Vec<i32> {
    (0..n)
        .map(|j| (0..k).map(|p| b[p * ldb + j]).sum())
        .collect()
}

/// Row sums of an `m × k` block: `out[i] = sum_k A[i][k]`.
pub fn row_sums_i32(a: &[i32], m: usize, k: usize, lda: usize) -> Vec<i32> {
    (0..m)
        .map(|i| (0..k).map(|p| a[i * lda + p]).sum())
        .collect()
}

// ---------------------------------------------------------------------------
// Elementwise post-ops
// ---------------------------------------------------------------------------

#[inline]
pub fn relu(x: f32, negative_slope: f32) -> f32 {
    if x < 0.0 {
        x * negative_slope
    } else {
        x
    }
}

#[inline]
pub fn clip(x: f32, lo: f32, hi: f32) -> f32 {
    x.max(lo).min(hi)
}

#[inline]
pub fn linear(x: f32, alpha: f32, beta: f32) -> f32 {
    alpha.mul_add(x, beta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brgemm_f32_sums_batch() {
        let a = [1.0f32, 2.0, 3.0, 4.0];
        let b = [1.0f32, 0.0, 0.0, 1.0];
        let batch = [BatchRef { a: &a, b: &b }, BatchRef { a: &a, b: &b }];
        let mut c = [0.0f32; 4];
        brgemm_f32(&batch, 2, 2, 2, 2, 2, &mut c, 2);
        assert_eq!(c, [2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_brgemm_i32_accumulates_into_c() {
        let a = [1i32, -2];
        let b = [3i32, 4];
        let mut c = [10i32];
        brgemm_i32(&[BatchRef { a: &a, b: &b }], 1, 1, 2, 2, 1, &mut c, 1);
        assert_eq!(c, [10 + 3 - 8]);
    }

    #[test]
    fn test_sums() {
        let b = [1i32, 2, 3, 4, 5, 6];
        assert_eq!(column_sums_i32(&b, 2, 3, 3), vec![5, 7, 9]);
        assert_eq!(row_sums_i32(&b, 2, 3, 3), vec![6, 15]);
    }
}
