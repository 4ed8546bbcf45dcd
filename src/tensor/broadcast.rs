//! Element-wise arithmetic with broadcasting
//!
//! Two shapes are compatible when, aligning trailing dimensions, each pair
//! is equal or one of them is 1. Missing leading dimensions count as 1.
//! The output dimension is the larger of the pair.
//!
//! ```text
//! [2, 4, 3, 5] + [3, 5]       -> [2, 4, 3, 5]   (additive attention mask)
//! [6, 16]      + [16]         -> [6, 16]        (bias)
//! [2, 5, 16]   - [2, 5, 1]    -> [2, 5, 16]     (mean subtraction)
//! ```

use super::Tensor;
use crate::error::{Error, Result};

/// Output shape of broadcasting `a` against `b`, or `None` if incompatible
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = if da == db || db == 1 {
            da
        } else if da == 1 {
            db
        } else {
            return None;
        };
    }
    Some(out)
}

/// Strides of `t` aligned to an output of rank `rank`, with 0 on broadcast axes
fn aligned_strides(t: &Tensor, out_shape: &[usize]) -> Vec<usize> {
    let rank = out_shape.len();
    let offset = rank - t.shape.len();
    (0..rank)
        .map(|i| {
            if i < offset || t.shape[i - offset] == 1 {
                0
            } else {
                t.strides[i - offset]
            }
        })
        .collect()
}

impl Tensor {
    /// Combine two tensors element by element under broadcasting
    pub fn zip_with(
        &self,
        other: &Tensor,
        op: &'static str,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<Tensor> {
        // === EXACT MATCH: Same shape ===
        if self.shape == other.shape {
            let result = self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect();
            return Ok(Tensor::from_raw(result, self.shape.clone()));
        }

        let out_shape = broadcast_shape(&self.shape, &other.shape)
            .ok_or_else(|| Error::shape(op, &self.shape, &other.shape))?;
        let total: usize = out_shape.iter().product();
        let a_strides = aligned_strides(self, &out_shape);
        let b_strides = aligned_strides(other, &out_shape);

        // Odometer over the output index, tracking both source offsets
        let rank = out_shape.len();
        let mut index = vec![0usize; rank];
        let mut a_off = 0usize;
        let mut b_off = 0usize;
        let mut result = Vec::with_capacity(total);

        for _ in 0..total {
            result.push(f(self.data[a_off], other.data[b_off]));
            for d in (0..rank).rev() {
                index[d] += 1;
                a_off += a_strides[d];
                b_off += b_strides[d];
                if index[d] < out_shape[d] {
                    break;
                }
                a_off -= a_strides[d] * out_shape[d];
                b_off -= b_strides[d] * out_shape[d];
                index[d] = 0;
            }
        }

        Ok(Tensor::from_raw(result, out_shape))
    }

    /// Element-wise addition with broadcasting
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, "add", |a, b| a + b)
    }

    /// Element-wise subtraction with broadcasting
    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, "sub", |a, b| a - b)
    }

    /// Element-wise multiplication with broadcasting
    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, "mul", |a, b| a * b)
    }

    /// Element-wise division with broadcasting
    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, "div", |a, b| a / b)
    }

    /// In-place accumulation; `other` must have exactly this shape
    pub fn add_assign(&mut self, other: &Tensor) -> Result<()> {
        if self.shape != other.shape {
            return Err(Error::shape("add_assign", &self.shape, &other.shape));
        }
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
        Ok(())
    }

    /// Reduce a broadcast result back to `shape` by summing broadcast axes
    ///
    /// This is the backward of broadcasting: if `y = x ⊕ z` broadcast `x`
    /// up to `y.shape`, then `grad_x = grad_y.sum_to_shape(x.shape)`.
    pub fn sum_to_shape(&self, shape: &[usize]) -> Result<Tensor> {
        if self.shape.as_slice() == shape {
            return Ok(self.clone());
        }
        match broadcast_shape(shape, &self.shape) {
            Some(ref s) if s == &self.shape => {}
            _ => return Err(Error::shape("sum_to_shape", &self.shape, shape)),
        }

        let target = Tensor::zeros(shape);
        let t_strides = aligned_strides(&target, &self.shape);
        let mut out = target.data;

        let rank = self.shape.len();
        let mut index = vec![0usize; rank];
        let mut t_off = 0usize;
        for &value in &self.data {
            out[t_off] += value;
            for d in (0..rank).rev() {
                index[d] += 1;
                t_off += t_strides[d];
                if index[d] < self.shape[d] {
                    break;
                }
                t_off -= t_strides[d] * self.shape[d];
                index[d] = 0;
            }
        }

        Ok(Tensor::from_raw(out, shape.to_vec()))
    }
}
