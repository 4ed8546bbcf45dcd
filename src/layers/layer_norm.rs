//! Layer Normalization
//!
//! Normalizes the last (feature) axis to zero mean and unit variance, then
//! applies a learnable scale (gamma) and an optional shift (beta).
//!
//! ## Forward Pass
//!
//! ```text
//! 1. mean = E[x]
//! 2. var = E[(x - mean)²]
//! 3. x_norm = (x - mean) / √(var + ε)
//! 4. y = γ * x_norm + β
//! ```
//!
//! A 2D input `[rows, d]` is normalized per row; a 3D input `[batch, seq, d]`
//! is normalized per (batch, position). Both fold into rows of length `d`,
//! so they share one backward formula.
//!
//! ## Backward Pass
//!
//! ```text
//! grad_γ = sum(grad_y * x_norm)
//! grad_β = sum(grad_y)
//! grad_x_norm = grad_y * γ
//! grad_x = (1/σ) * (grad_x_norm - E[grad_x_norm] - x_norm * E[grad_x_norm * x_norm])
//! ```
//!
//! The first expectation carries the gradient through the mean, the second
//! through the variance, and the leading term is the direct path.

use crate::error::{Error, Result};
use crate::parameter::Parameter;
use crate::tensor::Tensor;

/// Layer normalization layer
pub struct LayerNorm {
    /// Scale `[d]`, initialized to 1
    pub gamma: Parameter,
    /// Shift `[d]`, initialized to 0; absent for scale-only normalization
    pub beta: Option<Parameter>,
    pub eps: f32,
    cache: Option<LayerNormCache>,
}

/// Cache for layer norm backward pass
struct LayerNormCache {
    x_norm: Tensor,
    /// Per-row `√(var + ε)`, shape `[..., 1]`
    std: Tensor,
}

impl LayerNorm {
    /// Create a new layer normalization layer over `dim` features
    pub fn new(name: &str, dim: usize, eps: f32, with_beta: bool) -> Self {
        Self {
            gamma: Parameter::new(format!("{name}.gamma"), Tensor::ones(&[dim])),
            beta: with_beta.then(|| Parameter::new(format!("{name}.beta"), Tensor::zeros(&[dim]))),
            eps,
            cache: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.gamma.numel()
    }

    fn normalize(&self, x: &Tensor) -> Result<(Tensor, LayerNormCache)> {
        if !matches!(x.ndim(), 2 | 3) {
            return Err(Error::Unsupported(format!(
                "layer norm of rank-{} input",
                x.ndim()
            )));
        }
        if x.shape()[x.ndim() - 1] != self.dim() {
            return Err(Error::shape("layer_norm", x.shape(), self.gamma.shape()));
        }

        let mean = x.mean(-1)?;
        let std = x.variance(-1)?.add_scalar(self.eps).sqrt();
        let x_norm = x.sub(&mean)?.div(&std)?;

        let mut y = x_norm.mul(&self.gamma.value)?;
        if let Some(beta) = &self.beta {
            y = y.add(&beta.value)?;
        }
        Ok((y, LayerNormCache { x_norm, std }))
    }

    /// Normalize without caching (inference)
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        self.normalize(x).map(|(y, _)| y)
    }

    /// Forward pass; caches the normalized input and per-row std
    pub fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        let (y, cache) = self.normalize(x)?;
        self.cache = Some(cache);
        Ok(y)
    }

    /// Backward pass
    ///
    /// Accumulates gamma/beta gradients and returns the input gradient.
    pub fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let cache = self
            .cache
            .as_ref()
            .ok_or(Error::MissingForwardCache("LayerNorm"))?;
        if grad_out.shape() != cache.x_norm.shape() {
            return Err(Error::shape(
                "layer_norm backward",
                grad_out.shape(),
                cache.x_norm.shape(),
            ));
        }

        let d = self.dim();
        let rows = grad_out.numel() / d.max(1);
        let g = grad_out.data();
        let x_norm = cache.x_norm.data();
        let gamma = self.gamma.value.data();

        let mut grad_gamma = vec![0.0; d];
        let mut grad_beta = vec![0.0; d];
        let mut grad_x = vec![0.0; rows * d];

        for r in 0..rows {
            let row = r * d..(r + 1) * d;
            let g_row = &g[row.clone()];
            let xn_row = &x_norm[row.clone()];

            for j in 0..d {
                grad_gamma[j] += g_row[j] * xn_row[j];
                grad_beta[j] += g_row[j];
            }

            // Backprop through scale: grad_x_norm = grad_out * gamma
            let grad_xn: Vec<f32> = g_row.iter().zip(gamma).map(|(g, gm)| g * gm).collect();
            let mean_grad = grad_xn.iter().sum::<f32>() / d as f32;
            let mean_grad_x = grad_xn
                .iter()
                .zip(xn_row)
                .map(|(g, x)| g * x)
                .sum::<f32>()
                / d as f32;

            let std = cache.std.data()[r];
            for (j, out) in grad_x[row].iter_mut().enumerate() {
                *out = (grad_xn[j] - mean_grad - xn_row[j] * mean_grad_x) / std;
            }
        }

        self.gamma
            .accumulate_grad(&Tensor::new(grad_gamma, vec![d])?)?;
        if let Some(beta) = &mut self.beta {
            beta.accumulate_grad(&Tensor::new(grad_beta, vec![d])?)?;
        }
        Tensor::new(grad_x, grad_out.shape().to_vec())
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        let mut params = vec![&self.gamma];
        params.extend(self.beta.as_ref());
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = vec![&mut self.gamma];
        params.extend(self.beta.as_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::seeded;
    use crate::tensor::Axis;

    #[test]
    fn test_rows_are_normalized() {
        let mut rng = seeded(3);
        let ln = LayerNorm::new("ln", 8, 1e-5, true);
        let x = Tensor::random(&[2, 3, 8], &mut rng).mul_scalar(5.0).add_scalar(2.0);
        let y = ln.apply(&x).unwrap();
        let mean = y.mean(Axis::LAST).unwrap();
        let var = y.variance(Axis::LAST).unwrap();
        assert!(mean.data().iter().all(|m| m.abs() < 1e-4));
        assert!(var.data().iter().all(|v| (v - 1.0).abs() < 1e-2));
    }

    #[test]
    fn test_backward_3d_supported() {
        let mut rng = seeded(4);
        let mut ln = LayerNorm::new("ln", 4, 1e-5, true);
        let x = Tensor::random(&[2, 3, 4], &mut rng);
        ln.forward(&x).unwrap();
        let gx = ln.backward(&Tensor::ones(&[2, 3, 4])).unwrap();
        assert_eq!(gx.shape(), &[2, 3, 4]);
        // a constant upstream gradient only shifts the mean, which normalization removes
        assert!(gx.data().iter().all(|g| g.abs() < 1e-4));
        let beta = ln.beta.as_ref().unwrap();
        assert!(beta.grad.data().iter().all(|&g| (g - 6.0).abs() < 1e-5));
    }

    #[test]
    fn test_scale_only_has_single_parameter() {
        let ln = LayerNorm::new("ln", 4, 1e-5, false);
        assert_eq!(ln.parameters().len(), 1);
    }

    #[test]
    fn test_rejects_wrong_feature_size_and_rank() {
        let ln = LayerNorm::new("ln", 4, 1e-5, true);
        assert!(ln.apply(&Tensor::zeros(&[2, 5])).is_err());
        assert!(matches!(
            ln.apply(&Tensor::zeros(&[4])),
            Err(Error::Unsupported(_))
        ));
    }
}
