//! Activation Functions
//!
//! ReLU and its derivative for the feed-forward block.
//!
//! ```text
//! ReLU(x)  = max(0, x)
//! ReLU'(x) = 1 if x > 0 else 0
//! ```
//!
//! The backward needs the *pre-activation* input, which the feed-forward
//! layer caches during its forward pass.

use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// ReLU activation (forward pass)
pub fn relu_forward(x: &Tensor) -> Tensor {
    x.relu()
}

/// ReLU derivative (backward pass)
///
/// # Arguments
///
/// * `grad_out` - Gradient from next layer
/// * `x` - Original input to ReLU (from forward pass)
pub fn relu_backward(grad_out: &Tensor, x: &Tensor) -> Result<Tensor> {
    if grad_out.shape() != x.shape() {
        return Err(Error::shape("relu_backward", grad_out.shape(), x.shape()));
    }
    grad_out.zip_with(x, "relu_backward", |g, v| if v > 0.0 { g } else { 0.0 })
}
