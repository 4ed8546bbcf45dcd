//! Trainable parameters
//!
//! A [`Parameter`] pairs a value tensor with a same-shape gradient tensor.
//! Every backward pass **adds** into `grad`; nothing in the layers ever
//! clears it. Callers zero gradients before each backward/update cycle,
//! either with [`Parameter::zero_grad`] or `Model::zero_grad`.

use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// A named value tensor with its accumulated gradient
#[derive(Clone, Debug)]
pub struct Parameter {
    /// Hierarchical name, e.g. `blocks.0.attn.w_q`
    pub name: String,
    pub value: Tensor,
    pub grad: Tensor,
}

impl Parameter {
    /// Wrap a value; the gradient starts at zero
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        let grad = Tensor::zeros(value.shape());
        Self {
            name: name.into(),
            value,
            grad,
        }
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    pub fn numel(&self) -> usize {
        self.value.numel()
    }

    /// Add `delta` into the gradient; shapes must match exactly
    pub fn accumulate_grad(&mut self, delta: &Tensor) -> Result<()> {
        if delta.shape() != self.value.shape() {
            return Err(Error::shape("accumulate_grad", self.value.shape(), delta.shape()));
        }
        self.grad.add_assign(delta)
    }

    /// Reset the gradient to zero
    pub fn zero_grad(&mut self) {
        self.grad.data_mut().iter_mut().for_each(|g| *g = 0.0);
    }
}
