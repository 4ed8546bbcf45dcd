//! Linear Layer (Fully Connected)
//!
//! Performs an affine transformation: y = x @ W + b
//!
//! ## Forward Pass
//!
//! ```text
//! Input:  x [batch, seq, in_features]  (or [rows, in_features])
//! Weight: W [in_features, out_features]
//! Bias:   b [out_features]
//! Output: y = x @ W + b
//! ```
//!
//! ## Backward Pass
//!
//! Leading axes are folded into rows, so a 3D input contributes one row per
//! (batch, position):
//!
//! ```text
//! grad_W = x_rows^T @ grad_y_rows
//! grad_b = sum(grad_y) over every axis but the last
//! grad_x = grad_y @ W^T
//! ```

use crate::error::{Error, Result};
use crate::parameter::Parameter;
use crate::tensor::Tensor;
use rand::Rng;

/// Normal initialization with standard deviation `√(gain / fan_in)`
///
/// `gain = 2.0` is He initialization (for ReLU layers), `gain = 1.0` keeps
/// the variance of a projection roughly constant.
pub fn init_weight<R: Rng + ?Sized>(
    in_features: usize,
    out_features: usize,
    gain: f32,
    rng: &mut R,
) -> Tensor {
    let std = (gain / in_features.max(1) as f32).sqrt();
    Tensor::random_normal(&[in_features, out_features], std, rng)
}

/// Gradient of `x @ W` with respect to `W`, summed over all leading axes
pub fn weight_grad(x: &Tensor, grad_out: &Tensor) -> Result<Tensor> {
    x.flatten_rows()?
        .transpose(0, 1)?
        .matmul(&grad_out.flatten_rows()?)
}

/// Gradient of `x @ W` with respect to `x`
pub fn input_grad(grad_out: &Tensor, weight: &Tensor) -> Result<Tensor> {
    grad_out.matmul(&weight.transpose(0, 1)?)
}

/// Linear layer (fully connected)
pub struct Linear {
    pub weight: Parameter,
    pub bias: Option<Parameter>,
    cache: Option<LinearCache>,
}

/// Cache for linear layer backward pass
struct LinearCache {
    x: Tensor,
}

impl Linear {
    /// Create a new linear layer with He initialization and zero bias
    ///
    /// # Arguments
    ///
    /// * `name` - Parameter name prefix
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `rng` - Random source for the weights
    pub fn new<R: Rng + ?Sized>(
        name: &str,
        in_features: usize,
        out_features: usize,
        rng: &mut R,
    ) -> Self {
        Self {
            weight: Parameter::new(
                format!("{name}.weight"),
                init_weight(in_features, out_features, 2.0, rng),
            ),
            bias: Some(Parameter::new(
                format!("{name}.bias"),
                Tensor::zeros(&[out_features]),
            )),
            cache: None,
        }
    }

    /// Compute `x @ W + b` without touching the backward cache
    pub fn project(&self, x: &Tensor) -> Result<Tensor> {
        let y = x.matmul(&self.weight.value)?;
        match &self.bias {
            Some(b) => y.add(&b.value),
            None => Ok(y),
        }
    }

    /// Forward pass; caches `x` for the backward pass
    pub fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        let y = self.project(x)?;
        self.cache = Some(LinearCache { x: x.clone() });
        Ok(y)
    }

    /// Backward pass
    ///
    /// Accumulates into the weight and bias gradients and returns the
    /// gradient with respect to the input.
    pub fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let cache = self
            .cache
            .as_ref()
            .ok_or(Error::MissingForwardCache("Linear"))?;

        // grad_W = x^T @ grad_out
        self.weight.accumulate_grad(&weight_grad(&cache.x, grad_out)?)?;

        // grad_b = sum(grad_out) along all dims except last
        if let Some(bias) = &mut self.bias {
            let grad_bias = grad_out.sum_to_shape(bias.shape())?;
            bias.accumulate_grad(&grad_bias)?;
        }

        // grad_x = grad_out @ W^T
        input_grad(grad_out, &self.weight.value)
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        let mut params = vec![&self.weight];
        params.extend(self.bias.as_ref());
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = vec![&mut self.weight];
        params.extend(self.bias.as_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::seeded;

    #[test]
    fn test_linear_backward_shapes_and_bias() {
        let mut rng = seeded(0);
        let mut layer = Linear::new("fc", 4, 3, &mut rng);
        let x = Tensor::random(&[2, 5, 4], &mut rng);
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.shape(), &[2, 5, 3]);

        let grad_x = layer.backward(&Tensor::ones(&[2, 5, 3])).unwrap();
        assert_eq!(grad_x.shape(), &[2, 5, 4]);
        // each bias entry sees 10 rows of ones
        let bias = layer.bias.as_ref().unwrap();
        assert!(bias.grad.data().iter().all(|&g| (g - 10.0).abs() < 1e-6));
    }

    #[test]
    fn test_linear_backward_without_forward() {
        let mut rng = seeded(0);
        let mut layer = Linear::new("fc", 2, 2, &mut rng);
        assert!(matches!(
            layer.backward(&Tensor::zeros(&[1, 2])),
            Err(Error::MissingForwardCache("Linear"))
        ));
    }
}
