//! Tensor Operations for Neural Networks
//!
//! A minimal dense tensor library for the transformer layers in this crate.
//! Tensors store a flat row-major `Vec<f32>` plus shape and stride
//! information for multi-dimensional indexing.
//!
//! ## Core Concepts
//!
//! - **Data**: Flat `Vec<f32>` storing all elements in row-major order
//! - **Shape**: Dimensions of the tensor (e.g., `[batch, seq, dim]`)
//! - **Strides**: Step sizes for each dimension to compute flat indices
//!
//! The element count always equals the product of the shape. Every
//! operation returns a new tensor; there are no aliasing views, so
//! `transpose`, `concatenate` and `reshape` all copy.
//!
//! ## Example
//!
//! ```rust
//! use tisslm::Tensor;
//!
//! let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3])?;
//! let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2])?;
//! let c = a.matmul(&b)?;
//! assert_eq!(c.shape(), &[2, 2]);
//! # Ok::<(), tisslm::Error>(())
//! ```
//!
//! ## Submodules
//!
//! - `broadcast`: element-wise arithmetic with NumPy-style broadcasting
//! - `reduce`: sum / mean / variance / max along an axis or over everything
//! - `matmul`: 2D (row-parallel via Rayon) and batched matrix products

mod broadcast;
mod matmul;
mod reduce;

pub use broadcast::broadcast_shape;
pub use reduce::Axis;

use crate::error::{Error, Result};
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// A multi-dimensional array for neural network computations
///
/// # Memory Layout
///
/// For shape `[2, 3]`, data is stored as:
/// `[row0_col0, row0_col1, row0_col2, row1_col0, row1_col1, row1_col2]`
/// and strides are `[3, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Vec<usize>,
    strides: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with given data and shape
    ///
    /// Fails with [`Error::InvalidShape`] if the product of the shape does not
    /// equal the data length.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(Error::InvalidShape(format!(
                "data length {} doesn't match shape {:?} (expected {})",
                data.len(),
                shape,
                expected
            )));
        }
        Ok(Self::from_raw(data, shape))
    }

    /// Construct without validation; callers guarantee the length invariant.
    pub(crate) fn from_raw(data: Vec<f32>, shape: Vec<usize>) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        let strides = Self::compute_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    /// Create a tensor filled with ones
    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0)
    }

    /// Create a tensor where every element is `value`
    pub fn full(shape: &[usize], value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self::from_raw(vec![value; size], shape.to_vec())
    }

    /// Standard normal samples, N(0, 1)
    pub fn random<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> Self {
        Self::random_normal(shape, 1.0, rng)
    }

    /// Normal samples with zero mean and the given standard deviation
    pub fn random_normal<R: Rng + ?Sized>(shape: &[usize], std: f32, rng: &mut R) -> Self {
        let size: usize = shape.iter().product();
        // std is finite and non-negative for every caller; fall back to zeros otherwise
        let data = match Normal::new(0.0f32, std) {
            Ok(normal) => (0..size).map(|_| normal.sample(rng)).collect(),
            Err(_) => vec![0.0; size],
        };
        Self::from_raw(data, shape.to_vec())
    }

    /// Compute strides from shape (row-major layout)
    ///
    /// For shape `[d0, d1, d2]`, strides are `[d1*d2, d2, 1]`
    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable access to the values. The length cannot change through a slice,
    /// so the shape invariant holds.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Resolve a possibly negative axis against this tensor's rank.
    pub fn normalize_axis(&self, axis: isize) -> Result<usize> {
        let rank = self.shape.len() as isize;
        let pos = if axis < 0 { rank + axis } else { axis };
        if pos < 0 || pos >= rank {
            return Err(Error::AxisOutOfRange {
                axis,
                rank: self.shape.len(),
            });
        }
        Ok(pos as usize)
    }

    fn flat_index(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.shape.len() {
            return Err(Error::InvalidShape(format!(
                "index of rank {} for tensor of shape {:?}",
                index.len(),
                self.shape
            )));
        }
        let mut flat = 0;
        for ((&i, &dim), &stride) in index.iter().zip(&self.shape).zip(&self.strides) {
            if i >= dim {
                return Err(Error::IndexOutOfRange {
                    index: i,
                    size: dim,
                });
            }
            flat += i * stride;
        }
        Ok(flat)
    }

    /// Read one element by multi-index
    pub fn get(&self, index: &[usize]) -> Result<f32> {
        Ok(self.data[self.flat_index(index)?])
    }

    /// Write one element by multi-index
    pub fn set(&mut self, index: &[usize], value: f32) -> Result<()> {
        let flat = self.flat_index(index)?;
        self.data[flat] = value;
        Ok(())
    }

    /// Reshape tensor to new shape
    ///
    /// Total number of elements must remain the same. The flat values are
    /// reused in order.
    pub fn reshape(&self, new_shape: &[usize]) -> Result<Tensor> {
        let new_size: usize = new_shape.iter().product();
        if new_size != self.data.len() {
            return Err(Error::shape("reshape", &self.shape, new_shape));
        }
        Ok(Self::from_raw(self.data.clone(), new_shape.to_vec()))
    }

    /// Fold every leading axis into rows: `[a, b, ..., n]` -> `[a*b*..., n]`
    pub fn flatten_rows(&self) -> Result<Tensor> {
        let cols = *self
            .shape
            .last()
            .ok_or_else(|| Error::InvalidShape("cannot flatten a rank-0 tensor".into()))?;
        let rows = if cols == 0 { 0 } else { self.data.len() / cols };
        self.reshape(&[rows, cols])
    }

    /// Transpose two dimensions
    ///
    /// Both axes support negative indexing. The result is a fully reordered
    /// copy computed by stride remapping.
    pub fn transpose(&self, dim1: isize, dim2: isize) -> Result<Tensor> {
        let d1 = self.normalize_axis(dim1)?;
        let d2 = self.normalize_axis(dim2)?;

        let mut new_shape = self.shape.clone();
        new_shape.swap(d1, d2);

        if d1 == d2 {
            return Ok(self.clone());
        }

        // For 2D matrices, we can use a simple transpose
        if self.shape.len() == 2 {
            let rows = self.shape[0];
            let cols = self.shape[1];
            let mut result = vec![0.0; rows * cols];
            for i in 0..rows {
                for j in 0..cols {
                    result[j * rows + i] = self.data[i * cols + j];
                }
            }
            return Ok(Self::from_raw(result, new_shape));
        }

        // Walk the output in order; map each output coordinate back through the
        // swapped source strides.
        let out_strides = Self::compute_strides(&new_shape);
        let mut src_strides = self.strides.clone();
        src_strides.swap(d1, d2);

        let mut result = vec![0.0; self.data.len()];
        for (i, item) in result.iter_mut().enumerate() {
            let mut remaining = i;
            let mut src = 0;
            for (&out_stride, &src_stride) in out_strides.iter().zip(&src_strides) {
                let coord = remaining / out_stride;
                remaining %= out_stride;
                src += coord * src_stride;
            }
            *item = self.data[src];
        }

        Ok(Self::from_raw(result, new_shape))
    }

    /// Concatenate two tensors along `axis`
    ///
    /// Both operands must have the same rank. On every other axis the sizes
    /// must be equal or one of them must be 1; a size-1 operand is broadcast
    /// to the other's size. This lets a single shared key/value head
    /// `[b, 1, s, d]` be appended to a full multi-head cache `[b, h, t, d]`.
    pub fn concatenate(a: &Tensor, b: &Tensor, axis: isize) -> Result<Tensor> {
        if a.ndim() != b.ndim() {
            return Err(Error::shape("concatenate", &a.shape, &b.shape));
        }
        let axis = a.normalize_axis(axis)?;

        let mut out_shape = Vec::with_capacity(a.ndim());
        for (i, (&da, &db)) in a.shape.iter().zip(&b.shape).enumerate() {
            if i == axis {
                out_shape.push(da + db);
            } else if da == db || db == 1 || da == 1 {
                out_shape.push(da.max(db));
            } else {
                return Err(Error::shape("concatenate", &a.shape, &b.shape));
            }
        }

        let out_strides = Self::compute_strides(&out_shape);
        let total: usize = out_shape.iter().product();
        let split = a.shape[axis];
        let mut result = Vec::with_capacity(total);

        for flat in 0..total {
            let mut remaining = flat;
            let from_a = (remaining / out_strides[axis]) % out_shape[axis] < split;
            let src = if from_a { a } else { b };
            let mut offset = 0;
            for (dim, &stride) in out_strides.iter().enumerate() {
                let mut coord = remaining / stride;
                remaining %= stride;
                if dim == axis && !from_a {
                    coord -= split;
                }
                if src.shape[dim] == 1 {
                    coord = 0;
                }
                offset += coord * src.strides[dim];
            }
            result.push(src.data[offset]);
        }

        Ok(Self::from_raw(result, out_shape))
    }

    /// Tile the tensor `n` times along `axis`
    pub fn repeat(&self, n: usize, axis: isize) -> Result<Tensor> {
        let axis = self.normalize_axis(axis)?;
        let outer: usize = self.shape[..axis].iter().product();
        let block: usize = self.shape[axis..].iter().product();

        let mut result = Vec::with_capacity(self.data.len() * n);
        for o in 0..outer {
            let chunk = &self.data[o * block..(o + 1) * block];
            for _ in 0..n {
                result.extend_from_slice(chunk);
            }
        }

        let mut new_shape = self.shape.clone();
        new_shape[axis] *= n;
        Ok(Self::from_raw(result, new_shape))
    }

    /// Slice `len` entries starting at `start` along `axis`
    pub fn narrow(&self, axis: isize, start: usize, len: usize) -> Result<Tensor> {
        let axis = self.normalize_axis(axis)?;
        let dim = self.shape[axis];
        if start + len > dim {
            return Err(Error::IndexOutOfRange {
                index: start + len,
                size: dim,
            });
        }
        let outer: usize = self.shape[..axis].iter().product();
        let inner: usize = self.shape[axis + 1..].iter().product();

        let mut result = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = o * dim * inner;
            result.extend_from_slice(&self.data[base + start * inner..base + (start + len) * inner]);
        }

        let mut new_shape = self.shape.clone();
        new_shape[axis] = len;
        Ok(Self::from_raw(result, new_shape))
    }

    /// Apply a function to every element
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Self::from_raw(self.data.iter().map(|&x| f(x)).collect(), self.shape.clone())
    }

    /// Add scalar to all elements
    pub fn add_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x + scalar)
    }

    /// Subtract scalar from all elements
    pub fn sub_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x - scalar)
    }

    /// Multiply all elements by scalar
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x * scalar)
    }

    /// Divide all elements by scalar
    pub fn div_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x / scalar)
    }

    /// Element-wise square root
    pub fn sqrt(&self) -> Tensor {
        self.map(f32::sqrt)
    }

    /// Element-wise exponential
    pub fn exp(&self) -> Tensor {
        self.map(f32::exp)
    }

    /// Element-wise max(0, x)
    pub fn relu(&self) -> Tensor {
        self.map(|x| x.max(0.0))
    }

    /// Softmax along the last axis
    ///
    /// Uses the numerically stable form `exp(x - max) / sum(exp(x - max))`.
    /// Rows whose entries are all `-inf` produce zeros rather than NaN.
    pub fn softmax_last(&self) -> Result<Tensor> {
        let cols = *self
            .shape
            .last()
            .ok_or_else(|| Error::InvalidShape("softmax of a rank-0 tensor".into()))?;
        let mut result = self.data.clone();
        if cols == 0 {
            return Ok(Self::from_raw(result, self.shape.clone()));
        }
        for row in result.chunks_mut(cols) {
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            if max == f32::NEG_INFINITY {
                row.iter_mut().for_each(|v| *v = 0.0);
                continue;
            }
            let mut sum = 0.0;
            for v in row.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            for v in row.iter_mut() {
                *v /= sum;
            }
        }
        Ok(Self::from_raw(result, self.shape.clone()))
    }

    /// True when shapes match and every pair of elements is within `tol`
    pub fn all_close(&self, other: &Tensor, tol: f32) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| (a - b).abs() <= tol || (a.is_infinite() && a == b))
    }
}
