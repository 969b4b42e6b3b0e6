//! Row-major BLAS routines used by the convolution kernels.
//!
//! Every element of `C` is accumulated in ascending `p` order, independently of how many columns
//! are computed in the same call. A GEMM over a subset of the columns of `B` therefore yields
//! exactly the same bits as the full product at those columns.

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    #[default]
    No,
    Yes,
}

impl Transpose {
    /// Element `(row, col)` of the logical matrix stored in `data` with leading dimension `ld`.
    #[inline]
    fn at(self, data: &[f32], ld: usize, row: usize, col: usize) -> f32 {
        match self {
            Transpose::No => data[row * ld + col],
            Transpose::Yes => data[col * ld + row],
        }
    }

    /// Number of stored `[rows, cols]` of a logical `rows × cols` operand.
    #[inline]
    fn stored(self, rows: usize, cols: usize) -> [usize; 2] {
        match self {
            Transpose::No => [rows, cols],
            Transpose::Yes => [cols, rows],
        }
    }
}

/// Minimum buffer length of a row-major `rows × cols` matrix with leading dimension `ld`.
#[inline]
fn required_len(rows: usize, cols: usize, ld: usize) -> usize {
    match rows == 0 || cols == 0 {
        true => 0,
        false => (rows - 1) * ld + cols,
    }
}

/// Computes `C = alpha · op(A) · op(B) + beta · C`.
///
/// ## Arguments
/// * `m`, `n`, `k` - `op(A)` is `m × k`, `op(B)` is `k × n`, `C` is `m × n`.
/// * `lda`, `ldb`, `ldc` - Leading dimensions (row strides) of the stored matrices.
///
/// When `beta` is zero, `C` is only written, never read.
///
/// # Panics
/// Panics if a leading dimension is smaller than its stored row, or a buffer is too short.
#[allow(clippy::too_many_arguments)]
#[cfg_attr(feature = "trace", tracing::instrument(level = "trace", skip_all))]
pub fn sgemm(
    trans_a: Transpose,
    trans_b: Transpose,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    beta: f32,
    c: &mut [f32],
    ldc: usize,
) {
    if m == 0 || n == 0 {
        return;
    }

    let [rows, cols] = trans_a.stored(m, k);
    assert!(lda >= cols, "lda {lda} smaller than {cols}");
    assert!(a.len() >= required_len(rows, cols, lda), "a is too short");
    let [rows, cols] = trans_b.stored(k, n);
    assert!(ldb >= cols, "ldb {ldb} smaller than {cols}");
    assert!(b.len() >= required_len(rows, cols, ldb), "b is too short");
    assert!(ldc >= n, "ldc {ldc} smaller than {n}");
    let len = required_len(m, n, ldc);
    assert!(c.len() >= len, "c is too short");

    // accumulates row `i` of `op(A) · op(B)` into `acc`, which must start zeroed
    let accumulate = |i: usize, acc: &mut [f32]| {
        for p in 0..k {
            let a = trans_a.at(a, lda, i, p);
            match trans_b {
                Transpose::No => acc
                    .iter_mut()
                    .zip(&b[p * ldb..p * ldb + n])
                    .for_each(|(acc, &b)| *acc += a * b),
                Transpose::Yes => acc
                    .iter_mut()
                    .enumerate()
                    .for_each(|(j, acc)| *acc += a * b[j * ldb + p]),
            }
        }
    };
    let kernel = |i: usize, row: &mut [f32]| {
        let row = &mut row[..n];
        match beta == 0.0 {
            true => {
                row.fill(0.0);
                accumulate(i, row);
                row.iter_mut().for_each(|c| *c *= alpha);
            }
            // same ascending-p sum per element, one column at a time
            false => row.iter_mut().enumerate().for_each(|(j, c)| {
                let acc = (0..k).fold(0.0f32, |acc, p| {
                    let b = match trans_b {
                        Transpose::No => b[p * ldb + j],
                        Transpose::Yes => b[j * ldb + p],
                    };
                    acc + trans_a.at(a, lda, i, p) * b
                });
                *c = alpha * acc + beta * *c;
            }),
        }
    };

    #[cfg(not(feature = "rayon"))]
    c[..len]
        .chunks_mut(ldc)
        .enumerate()
        .for_each(|(i, row)| kernel(i, row));
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        c[..len]
            .par_chunks_mut(ldc)
            .enumerate()
            .for_each(|(i, row)| kernel(i, row));
    }
}

/// Computes `y = alpha · op(A) · x + beta · y`, where `A` is stored as `m × n`.
///
/// # Panics
/// Panics if any buffer is too short for the given dimensions.
#[allow(clippy::too_many_arguments)]
pub fn sgemv(
    trans: Transpose,
    m: usize,
    n: usize,
    alpha: f32,
    a: &[f32],
    lda: usize,
    x: &[f32],
    beta: f32,
    y: &mut [f32],
) {
    let [rows, cols] = match trans {
        Transpose::No => [m, n],
        Transpose::Yes => [n, m],
    };
    assert!(x.len() >= cols, "x is too short");
    assert!(y.len() >= rows, "y is too short");
    sgemm(trans, Transpose::No, rows, 1, cols, alpha, a, lda, x, 1, beta, y, 1);
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::{Transpose, sgemm, sgemv};

    fn random(len: usize) -> Vec<f32> {
        (0..len).map(|_| fastrand::f32() * 2.0 - 1.0).collect()
    }

    fn reference(m: usize, n: usize, k: usize, a: &[f32], b: &[f32]) -> Vec<f32> {
        itertools::iproduct!(0..m, 0..n)
            .map(|(i, j)| (0..k).map(|p| a[i * k + p] * b[p * n + j]).sum())
            .collect()
    }

    #[test]
    fn test_sgemm() {
        fastrand::seed(42);
        let [m, n, k] = [7, 13, 5];
        let a = random(m * k);
        let b = random(k * n);
        let mut c = vec![f32::NAN; m * n];
        sgemm(Transpose::No, Transpose::No, m, n, k, 1.0, &a, k, &b, n, 0.0, &mut c, n);

        for (x, y) in c.iter().zip_eq(reference(m, n, k, &a, &b)) {
            assert!((x - y).abs() < 1e-5, "{x} != {y}");
        }
    }

    #[test]
    fn test_sgemm_transposed() {
        fastrand::seed(42);
        let [m, n, k] = [4, 6, 3];
        let a = random(m * k);
        let b = random(k * n);
        let at = itertools::iproduct!(0..k, 0..m)
            .map(|(p, i)| a[i * k + p])
            .collect_vec();
        let bt = itertools::iproduct!(0..n, 0..k)
            .map(|(j, p)| b[p * n + j])
            .collect_vec();

        let mut expected = vec![0.0; m * n];
        sgemm(Transpose::No, Transpose::No, m, n, k, 1.0, &a, k, &b, n, 0.0, &mut expected, n);
        let mut c = vec![0.0; m * n];
        sgemm(Transpose::Yes, Transpose::Yes, m, n, k, 1.0, &at, m, &bt, k, 0.0, &mut c, n);
        assert_eq!(c, expected);
    }

    #[test]
    fn test_sgemm_alpha_beta() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [1.0, 0.0, 0.0, 1.0];
        let mut c = [1.0, 1.0, 1.0, 1.0];
        sgemm(Transpose::No, Transpose::No, 2, 2, 2, 2.0, &a, 2, &b, 2, 0.5, &mut c, 2);
        assert_eq!(c, [2.5, 4.5, 6.5, 8.5]);
    }

    #[test]
    fn test_sgemm_beta_matches_overwrite() {
        fastrand::seed(7);
        let [m, n, k] = [3, 8, 19];
        let a = random(m * k);
        let b = random(k * n);
        let mut product = vec![0.0; m * n];
        sgemm(Transpose::No, Transpose::No, m, n, k, 1.0, &a, k, &b, n, 0.0, &mut product, n);

        let initial = random(m * n);
        let mut c = initial.clone();
        sgemm(Transpose::No, Transpose::No, m, n, k, 2.0, &a, k, &b, n, 0.5, &mut c, n);
        for ((c, product), initial) in c.iter().zip(&product).zip(&initial) {
            assert_eq!(c.to_bits(), (2.0 * product + 0.5 * initial).to_bits());
        }
    }

    #[test]
    fn test_sgemm_column_subset_is_exact() {
        fastrand::seed(42);
        let [m, n, k] = [5, 16, 27];
        let a = random(m * k);
        let b = random(k * n);
        let mut full = vec![0.0; m * n];
        sgemm(Transpose::No, Transpose::No, m, n, k, 1.0, &a, k, &b, n, 0.0, &mut full, n);

        let columns = [1, 4, 5, 11];
        let packed = itertools::iproduct!(0..k, columns)
            .map(|(p, j)| b[p * n + j])
            .collect_vec();
        let mut c = vec![0.0; m * columns.len()];
        let len = columns.len();
        sgemm(Transpose::No, Transpose::No, m, len, k, 1.0, &a, k, &packed, len, 0.0, &mut c, len);

        for (i, (index, &j)) in itertools::iproduct!(0..m, columns.iter().enumerate()) {
            assert_eq!(c[i * len + index].to_bits(), full[i * n + j].to_bits());
        }
    }

    #[test]
    fn test_sgemv() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut y = [0.0; 2];
        sgemv(Transpose::No, 2, 3, 1.0, &a, 3, &[1.0, 1.0, 1.0], 0.0, &mut y);
        assert_eq!(y, [6.0, 15.0]);

        let mut y = [1.0; 3];
        sgemv(Transpose::Yes, 2, 3, 1.0, &a, 3, &[1.0, 2.0], 1.0, &mut y);
        assert_eq!(y, [10.0, 13.0, 16.0]);
    }
}
