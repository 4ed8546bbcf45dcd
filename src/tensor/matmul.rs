//! Matrix multiplication
//!
//! Supported rank combinations:
//!
//! ```text
//! [m, k]       @ [k, n]       -> [m, n]         row-parallel (Rayon)
//! [b, s, k]    @ [k, n]       -> [b, s, n]      folded into the 2D path
//! [b, m, k]    @ [b, k, n]    -> [b, m, n]      batched
//! [b, h, m, k] @ [b, h, k, n] -> [b, h, m, n]   batched (attention)
//! ```
//!
//! Batch and head dimensions must match exactly; there is no broadcasting
//! across batches. Anything else is [`Error::Unsupported`].
//!
//! ## Parallelism
//!
//! The 2D product is the only parallel path in the engine. Output rows are
//! split into one contiguous range per worker thread, the last range
//! absorbing the remainder, and each worker writes only its own rows, so no
//! locking is needed.

use super::Tensor;
use crate::error::{Error, Result};
use rayon::prelude::*;

/// Below this many multiply-adds the sequential loop wins over thread dispatch.
const PARALLEL_THRESHOLD: usize = 1_000;

/// Computes `result[j] += a_val * b[j]` for all j.
///
/// Kept as a plain zip so LLVM can auto-vectorize it.
#[inline(always)]
fn matmul_inner(a_val: f32, b: &[f32], result: &mut [f32]) {
    for (r, &b_val) in result.iter_mut().zip(b.iter()) {
        *r += a_val * b_val;
    }
}

/// Fill `out` (rows `row_start..row_start + out.len() / n`) of `a @ b`
fn matmul_rows(a: &[f32], b: &[f32], out: &mut [f32], row_start: usize, k: usize, n: usize) {
    if n == 0 {
        return;
    }
    for (local, out_row) in out.chunks_mut(n).enumerate() {
        let i = row_start + local;
        for l in 0..k {
            matmul_inner(a[i * k + l], &b[l * n..(l + 1) * n], out_row);
        }
    }
}

/// Plain `[m, k] @ [k, n]` on flat slices
fn matmul_2d(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut result = vec![0.0; m * n];

    if m * n * k < PARALLEL_THRESHOLD || m < 2 {
        matmul_rows(a, b, &mut result, 0, k, n);
        return result;
    }

    let threads = rayon::current_num_threads().clamp(1, m);
    let rows_per = m / threads;

    // Carve the output into one disjoint row range per worker
    let mut ranges: Vec<(usize, &mut [f32])> = Vec::with_capacity(threads);
    let mut rest: &mut [f32] = &mut result;
    let mut row = 0;
    for t in 0..threads {
        let rows = if t == threads - 1 { m - row } else { rows_per };
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(rows * n);
        ranges.push((row, head));
        rest = tail;
        row += rows;
    }

    ranges
        .into_par_iter()
        .for_each(|(start, out)| matmul_rows(a, b, out, start, k, n));

    result
}

/// Sequential `[batch, m, k] @ [batch, k, n]` over contiguous batches
fn matmul_batched(a: &[f32], b: &[f32], batch: usize, m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut result = vec![0.0; batch * m * n];
    for bi in 0..batch {
        matmul_rows(
            &a[bi * m * k..(bi + 1) * m * k],
            &b[bi * k * n..(bi + 1) * k * n],
            &mut result[bi * m * n..(bi + 1) * m * n],
            0,
            k,
            n,
        );
    }
    result
}

impl Tensor {
    /// Matrix multiplication for the rank combinations listed in the module docs
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        let a = &self.shape;
        let b = &other.shape;

        match (a.len(), b.len()) {
            // === 2D MATRIX MULTIPLICATION ===
            (2, 2) => {
                if a[1] != b[0] {
                    return Err(Error::shape("matmul", a, b));
                }
                let (m, k, n) = (a[0], a[1], b[1]);
                let data = matmul_2d(&self.data, &other.data, m, k, n);
                Ok(Tensor::from_raw(data, vec![m, n]))
            }

            // === 3D x 2D: shared right operand across the batch ===
            (3, 2) => {
                if a[2] != b[0] {
                    return Err(Error::shape("matmul", a, b));
                }
                let (batch, s, k, n) = (a[0], a[1], a[2], b[1]);
                let data = matmul_2d(&self.data, &other.data, batch * s, k, n);
                Ok(Tensor::from_raw(data, vec![batch, s, n]))
            }

            // === 3D BATCHED ===
            (3, 3) => {
                if a[0] != b[0] || a[2] != b[1] {
                    return Err(Error::shape("batched matmul", a, b));
                }
                let (batch, m, k, n) = (a[0], a[1], a[2], b[2]);
                let data = matmul_batched(&self.data, &other.data, batch, m, k, n);
                Ok(Tensor::from_raw(data, vec![batch, m, n]))
            }

            // === 4D BATCHED (for attention) ===
            // [batch, n_heads, seq, head_dim] @ [batch, n_heads, head_dim, seq]
            (4, 4) => {
                if a[0] != b[0] || a[1] != b[1] || a[3] != b[2] {
                    return Err(Error::shape("batched matmul", a, b));
                }
                let (batch, heads, m, k, n) = (a[0], a[1], a[2], a[3], b[3]);
                let data = matmul_batched(&self.data, &other.data, batch * heads, m, k, n);
                Ok(Tensor::from_raw(data, vec![batch, heads, m, n]))
            }

            _ => Err(Error::Unsupported(format!(
                "matmul of shapes {:?} @ {:?}",
                a, b
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::seeded;

    fn naive(a: &Tensor, b: &Tensor) -> Vec<f32> {
        let (m, k, n) = (a.shape()[0], a.shape()[1], b.shape()[1]);
        let mut out = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                for l in 0..k {
                    out[i * n + j] += a.data()[i * k + l] * b.data()[l * n + j];
                }
            }
        }
        out
    }

    #[test]
    fn test_matmul_2d_small() {
        let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
        let b = Tensor::new(vec![5.0, 6.0, 7.0, 8.0], vec![2, 2]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.data(), &[19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_2d_parallel_matches_naive() {
        let mut rng = seeded(11);
        // odd row count so the last worker picks up a remainder
        let a = Tensor::random(&[37, 23], &mut rng);
        let b = Tensor::random(&[23, 19], &mut rng);
        let c = a.matmul(&b).unwrap();
        let expected = naive(&a, &b);
        for (x, y) in c.data().iter().zip(&expected) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_matmul_3d_by_2d() {
        let mut rng = seeded(2);
        let a = Tensor::random(&[2, 3, 4], &mut rng);
        let w = Tensor::random(&[4, 5], &mut rng);
        let c = a.matmul(&w).unwrap();
        assert_eq!(c.shape(), &[2, 3, 5]);
        let flat = a.reshape(&[6, 4]).unwrap().matmul(&w).unwrap();
        assert_eq!(c.data(), flat.data());
    }

    #[test]
    fn test_matmul_4d_batched() {
        let mut rng = seeded(5);
        let a = Tensor::random(&[2, 3, 4, 5], &mut rng);
        let b = Tensor::random(&[2, 3, 5, 6], &mut rng);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[2, 3, 4, 6]);
        // check one (batch, head) slice against 2D matmul
        let a11 = a.narrow(0, 1, 1).unwrap().narrow(1, 2, 1).unwrap().reshape(&[4, 5]).unwrap();
        let b11 = b.narrow(0, 1, 1).unwrap().narrow(1, 2, 1).unwrap().reshape(&[5, 6]).unwrap();
        let c11 = c.narrow(0, 1, 1).unwrap().narrow(1, 2, 1).unwrap().reshape(&[4, 6]).unwrap();
        assert!(c11.all_close(&a11.matmul(&b11).unwrap(), 1e-5));
    }

    #[test]
    fn test_matmul_shape_errors() {
        let a = Tensor::zeros(&[2, 3]);
        let b = Tensor::zeros(&[4, 2]);
        assert!(matches!(a.matmul(&b), Err(Error::ShapeMismatch { .. })));
        let c = Tensor::zeros(&[2, 2, 3, 4]);
        let d = Tensor::zeros(&[2, 3, 4, 2]);
        assert!(matches!(c.matmul(&d), Err(Error::ShapeMismatch { .. })));
        let e = Tensor::zeros(&[3]);
        assert!(matches!(a.matmul(&e), Err(Error::Unsupported(_))));
    }
}
