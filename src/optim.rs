//! AdamW Optimizer and Gradient Utilities
//!
//! ## Algorithm
//!
//! For each parameter θ with gradient g:
//!
//! ```text
//! θ = θ * (1 - α * λ)              # Weight decay (matrices only)
//! m = β₁ * m + (1 - β₁) * g        # First moment (momentum)
//! v = β₂ * v + (1 - β₂) * g²       # Second moment (variance)
//! m_hat = m / (1 - β₁^t)           # Bias correction
//! v_hat = v / (1 - β₂^t)           # Bias correction
//! θ = θ - α * m_hat / (√v_hat + ε) # Parameter update
//! ```
//!
//! Weight decay is applied only to parameters of rank ≥ 2. Biases and
//! LayerNorm scale/shift are left undecayed.
//!
//! Moment tensors are kept per parameter position, so the same parameter
//! list (same order, same shapes) must be passed on every step.
//!
//! ## Gradient Clipping
//!
//! ```text
//! norm = √(Σ g²)                    over every parameter
//! if norm > max_norm: g *= max_norm / norm
//! ```

use crate::error::{Error, Result};
use crate::parameter::Parameter;
use crate::tensor::Tensor;

/// AdamW optimizer state
pub struct AdamW {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    pub step: usize,
    m: Vec<Tensor>,
    v: Vec<Tensor>,
}

impl AdamW {
    /// Create an optimizer with β₁ = 0.9, β₂ = 0.95, ε = 1e-8
    pub fn new(lr: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.95,
            epsilon: 1e-8,
            weight_decay,
            step: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// Apply one update to `params` using their accumulated gradients
    ///
    /// Moments are created on the first call. Later calls must pass the
    /// same number of parameters with the same shapes.
    pub fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()> {
        if self.m.is_empty() {
            self.m = params.iter().map(|p| Tensor::zeros(p.shape())).collect();
            self.v = params.iter().map(|p| Tensor::zeros(p.shape())).collect();
        }
        if self.m.len() != params.len() {
            return Err(Error::InvalidShape(format!(
                "optimizer tracks {} parameters, got {}",
                self.m.len(),
                params.len()
            )));
        }
        if let Some((p, m)) = params.iter().zip(&self.m).find(|(p, m)| p.shape() != m.shape()) {
            return Err(Error::shape("adamw step", p.shape(), m.shape()));
        }

        self.step += 1;
        let t = self.step as i32;
        let bias_correction1 = 1.0 - self.beta1.powi(t);
        let bias_correction2 = 1.0 - self.beta2.powi(t);

        for ((param, m), v) in params.iter_mut().zip(&mut self.m).zip(&mut self.v) {
            let decay = if param.value.ndim() >= 2 {
                self.weight_decay
            } else {
                0.0
            };
            let grad = param.grad.data().to_vec();
            let values = param.value.data_mut();

            for (((theta, &g), m_i), v_i) in values
                .iter_mut()
                .zip(&grad)
                .zip(m.data_mut())
                .zip(v.data_mut())
            {
                *theta *= 1.0 - self.lr * decay;
                *m_i = self.beta1 * *m_i + (1.0 - self.beta1) * g;
                *v_i = self.beta2 * *v_i + (1.0 - self.beta2) * g * g;
                let m_hat = *m_i / bias_correction1;
                let v_hat = *v_i / bias_correction2;
                *theta -= self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
            }
        }
        Ok(())
    }

    /// Reset every gradient in `params`
    pub fn zero_grad(&self, params: &mut [&mut Parameter]) {
        for p in params.iter_mut() {
            p.zero_grad();
        }
    }
}

/// L2 norm of all gradients taken together
pub fn grad_norm(params: &[&Parameter]) -> f32 {
    params
        .iter()
        .flat_map(|p| p.grad.data())
        .map(|g| g * g)
        .sum::<f32>()
        .sqrt()
}

/// Scale all gradients so their joint norm is at most `max_norm`
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(params: &mut [&mut Parameter], max_norm: f32) -> f32 {
    let norm = params
        .iter()
        .flat_map(|p| p.grad.data())
        .map(|g| g * g)
        .sum::<f32>()
        .sqrt();

    // Only clip if norm exceeds threshold
    if norm > max_norm {
        let scale = max_norm / norm;
        for p in params.iter_mut() {
            p.grad.data_mut().iter_mut().for_each(|g| *g *= scale);
        }
    }
    norm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_step_moves_by_lr_against_gradient() {
        let mut w = Parameter::new("w", Tensor::ones(&[2, 2]));
        let mut b = Parameter::new("b", Tensor::ones(&[2]));
        w.grad = Tensor::full(&[2, 2], 0.5);
        b.grad = Tensor::full(&[2], -0.5);

        let mut opt = AdamW::new(0.1, 0.0);
        opt.step(&mut [&mut w, &mut b]).unwrap();
        // bias-corrected first step is lr * sign(g)
        assert!(w.value.data().iter().all(|&x| (x - 0.9).abs() < 1e-4));
        assert!(b.value.data().iter().all(|&x| (x - 1.1).abs() < 1e-4));
    }

    #[test]
    fn test_weight_decay_skips_vectors() {
        let mut w = Parameter::new("w", Tensor::ones(&[1, 2]));
        let mut b = Parameter::new("b", Tensor::ones(&[2]));
        let mut opt = AdamW::new(0.1, 0.5);
        opt.step(&mut [&mut w, &mut b]).unwrap();
        assert!(w.value.data().iter().all(|&x| (x - 0.95).abs() < 1e-6));
        assert!(b.value.data().iter().all(|&x| x == 1.0));
    }

    #[test]
    fn test_step_rejects_different_parameter_list() {
        let mut a = Parameter::new("a", Tensor::ones(&[2]));
        let mut c = Parameter::new("c", Tensor::ones(&[3]));
        let mut opt = AdamW::new(0.1, 0.0);
        opt.step(&mut [&mut a]).unwrap();
        assert!(opt.step(&mut [&mut a, &mut c]).is_err());
        assert!(opt.step(&mut [&mut c]).is_err());
    }

    #[test]
    fn test_clip_grad_norm() {
        let mut a = Parameter::new("a", Tensor::zeros(&[2]));
        let mut b = Parameter::new("b", Tensor::zeros(&[1]));
        a.grad = Tensor::new(vec![3.0, 0.0], vec![2]).unwrap();
        b.grad = Tensor::new(vec![4.0], vec![1]).unwrap();
        assert!((grad_norm(&[&a, &b]) - 5.0).abs() < 1e-6);

        let before = clip_grad_norm(&mut [&mut a, &mut b], 1.0);
        assert!((before - 5.0).abs() < 1e-6);
        assert!((grad_norm(&[&a, &b]) - 1.0).abs() < 1e-5);

        // under the threshold nothing changes
        clip_grad_norm(&mut [&mut a, &mut b], 10.0);
        assert!((grad_norm(&[&a, &b]) - 1.0).abs() < 1e-5);
    }
}
