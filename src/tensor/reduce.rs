//! Reductions
//!
//! All reductions keep the reduced axis with size 1, so the result
//! broadcasts straight back against the input:
//!
//! ```text
//! x: [2, 5, 16]   x.mean(Axis::Index(-1)) -> [2, 5, 1]
//! x: [2, 5, 16]   x.sum(Axis::All)        -> [1, 1, 1]
//! ```

use super::Tensor;
use crate::error::Result;

/// Which elements a reduction runs over
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    /// Every element of the tensor
    All,
    /// A single axis; negative values count from the end
    Index(isize),
}

impl Axis {
    /// The last axis, the usual normalization axis
    pub const LAST: Axis = Axis::Index(-1);
}

impl From<isize> for Axis {
    fn from(axis: isize) -> Self {
        Axis::Index(axis)
    }
}

// Unsuffixed integer literals default to i32.
impl From<i32> for Axis {
    fn from(axis: i32) -> Self {
        Axis::Index(axis as isize)
    }
}

impl Tensor {
    /// Shape with every axis collapsed to 1
    fn all_reduced_shape(&self) -> Vec<usize> {
        vec![1; self.shape.len()]
    }

    /// Fold along one axis: view data as `[outer, dim, inner]` and reduce the middle
    fn fold_axis(&self, axis: usize, init: f32, f: impl Fn(f32, f32) -> f32) -> Tensor {
        let dim = self.shape[axis];
        let outer: usize = self.shape[..axis].iter().product();
        let inner: usize = self.shape[axis + 1..].iter().product();

        let mut result = vec![init; outer * inner];
        for o in 0..outer {
            for d in 0..dim {
                let base = (o * dim + d) * inner;
                for i in 0..inner {
                    let slot = &mut result[o * inner + i];
                    *slot = f(*slot, self.data[base + i]);
                }
            }
        }

        let mut new_shape = self.shape.clone();
        new_shape[axis] = 1;
        Tensor::from_raw(result, new_shape)
    }

    /// Sum along an axis, or over everything
    pub fn sum(&self, axis: impl Into<Axis>) -> Result<Tensor> {
        match axis.into() {
            Axis::All => {
                let total: f32 = self.data.iter().sum();
                Ok(Tensor::from_raw(vec![total], self.all_reduced_shape()))
            }
            Axis::Index(a) => {
                let axis = self.normalize_axis(a)?;
                Ok(self.fold_axis(axis, 0.0, |acc, x| acc + x))
            }
        }
    }

    /// Arithmetic mean along an axis, or over everything
    pub fn mean(&self, axis: impl Into<Axis>) -> Result<Tensor> {
        match axis.into() {
            Axis::All => {
                let n = self.data.len().max(1) as f32;
                let total: f32 = self.data.iter().sum();
                Ok(Tensor::from_raw(vec![total / n], self.all_reduced_shape()))
            }
            Axis::Index(a) => {
                let axis = self.normalize_axis(a)?;
                let n = self.shape[axis].max(1) as f32;
                Ok(self.fold_axis(axis, 0.0, |acc, x| acc + x).div_scalar(n))
            }
        }
    }

    /// Maximum along an axis, or over everything
    pub fn max(&self, axis: impl Into<Axis>) -> Result<Tensor> {
        match axis.into() {
            Axis::All => {
                let max = self.data.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                Ok(Tensor::from_raw(vec![max], self.all_reduced_shape()))
            }
            Axis::Index(a) => {
                let axis = self.normalize_axis(a)?;
                Ok(self.fold_axis(axis, f32::NEG_INFINITY, f32::max))
            }
        }
    }

    /// Population variance along an axis, or over everything
    ///
    /// Over `Axis::All` this uses Welford's streaming update:
    ///
    /// ```text
    /// n += 1; delta = x - mean; mean += delta / n; m2 += delta * (x - mean)
    /// variance = m2 / n
    /// ```
    ///
    /// Along an axis it is two-pass: mean, centered difference, square, mean.
    pub fn variance(&self, axis: impl Into<Axis>) -> Result<Tensor> {
        match axis.into() {
            Axis::All => {
                let mut mean = 0.0f32;
                let mut m2 = 0.0f32;
                for (n, &x) in self.data.iter().enumerate() {
                    let delta = x - mean;
                    mean += delta / (n + 1) as f32;
                    m2 += delta * (x - mean);
                }
                let var = if self.data.is_empty() {
                    0.0
                } else {
                    m2 / self.data.len() as f32
                };
                Ok(Tensor::from_raw(vec![var], self.all_reduced_shape()))
            }
            axis @ Axis::Index(_) => {
                let mean = self.mean(axis)?;
                let diff = self.sub(&mean)?;
                diff.mul(&diff)?.mean(axis)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn sample() -> Tensor {
        Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]).unwrap()
    }

    #[test]
    fn test_sum_keeps_reduced_axis() {
        let t = sample();
        let rows = t.sum(1).unwrap();
        assert_eq!(rows.shape(), &[2, 1]);
        assert_eq!(rows.data(), &[6.0, 15.0]);
        let cols = t.sum(0).unwrap();
        assert_eq!(cols.shape(), &[1, 3]);
        assert_eq!(cols.data(), &[5.0, 7.0, 9.0]);
        let all = t.sum(Axis::All).unwrap();
        assert_eq!(all.shape(), &[1, 1]);
        assert_eq!(all.data(), &[21.0]);
    }

    #[test]
    fn test_mean_and_max() {
        let t = sample();
        assert_eq!(t.mean(Axis::LAST).unwrap().data(), &[2.0, 5.0]);
        assert_eq!(t.max(0).unwrap().data(), &[4.0, 5.0, 6.0]);
        assert_eq!(t.max(Axis::All).unwrap().data(), &[6.0]);
    }

    #[test]
    fn test_variance_axis_matches_two_pass() {
        let t = sample();
        let v = t.variance(-1).unwrap();
        let expected = 2.0 / 3.0;
        assert!((v.data()[0] - expected).abs() < 1e-6);
        assert!((v.data()[1] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_variance_all_welford() {
        let t = sample();
        let v = t.variance(Axis::All).unwrap();
        // population variance of 1..=6
        assert!((v.data()[0] - 35.0 / 12.0).abs() < 1e-5);
    }

    #[test]
    fn test_reduction_bad_axis() {
        let t = sample();
        assert!(matches!(t.sum(2), Err(Error::AxisOutOfRange { .. })));
    }

    #[test]
    fn test_reduce_middle_axis_3d() {
        let t = Tensor::new((0..24).map(|i| i as f32).collect(), vec![2, 3, 4]).unwrap();
        let s = t.sum(1).unwrap();
        assert_eq!(s.shape(), &[2, 1, 4]);
        assert_eq!(s.get(&[0, 0, 0]).unwrap(), 0.0 + 4.0 + 8.0);
        assert_eq!(s.get(&[1, 0, 3]).unwrap(), 15.0 + 19.0 + 23.0);
    }
}
