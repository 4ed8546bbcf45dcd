//! Position-wise Feed-Forward Network
//!
//! Two linear layers with a ReLU between them, applied independently at
//! every position:
//!
//! ```text
//! x [.., d_model] → fc1 → h [.., d_ff] → ReLU → fc2 → y [.., d_model]
//! ```
//!
//! `fc1` caches its input, this layer caches the pre-activation `h` for the
//! ReLU derivative, and `fc2` caches the activated hidden state.

use super::activation::{relu_backward, relu_forward};
use super::linear::Linear;
use crate::error::{Error, Result};
use crate::parameter::Parameter;
use crate::tensor::Tensor;
use rand::Rng;

/// Feed-forward network with ReLU activation
pub struct FeedForward {
    pub fc1: Linear,
    pub fc2: Linear,
    /// Pre-activation from the last forward call
    cache: Option<Tensor>,
}

impl FeedForward {
    pub fn new<R: Rng + ?Sized>(name: &str, d_model: usize, d_ff: usize, rng: &mut R) -> Self {
        Self {
            fc1: Linear::new(&format!("{name}.fc1"), d_model, d_ff, rng),
            fc2: Linear::new(&format!("{name}.fc2"), d_ff, d_model, rng),
            cache: None,
        }
    }

    /// Forward without caching (inference)
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.fc1.project(x)?;
        self.fc2.project(&relu_forward(&h))
    }

    /// Forward pass: x → fc1 → ReLU → fc2
    pub fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        let h = self.fc1.forward(x)?;
        let y = self.fc2.forward(&relu_forward(&h))?;
        self.cache = Some(h);
        Ok(y)
    }

    /// Backward pass in reverse: fc2 → ReLU → fc1
    pub fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let h = self
            .cache
            .as_ref()
            .ok_or(Error::MissingForwardCache("FeedForward"))?;
        let grad_hidden = self.fc2.backward(grad_out)?;
        let grad_h = relu_backward(&grad_hidden, h)?;
        self.fc1.backward(&grad_h)
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        let mut params = self.fc1.parameters();
        params.extend(self.fc2.parameters());
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = self.fc1.parameters_mut();
        params.extend(self.fc2.parameters_mut());
        params
    }
}
