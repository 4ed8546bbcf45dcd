//! Dropout Layer
//!
//! Dropout randomly zeros activations during training and scales the
//! survivors by `1 / (1 - rate)` so the expected value is unchanged. During
//! inference it passes values through unchanged.
//!
//! Each layer owns a generator forked from the caller's random context at
//! construction, so a model built from a fixed seed draws the same masks.

use crate::error::{Error, Result};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;

/// Trainable dropout layer
pub struct Dropout {
    pub rate: f32,
    pub training: bool,
    rng: StdRng,
    cache: Option<DropoutCache>,
}

/// Cache for dropout backward pass
struct DropoutCache {
    /// Dropout mask (true = kept, false = dropped); None if dropout was disabled
    mask: Option<Vec<bool>>,
    /// Scaling factor applied to kept values
    scale: f32,
}

impl Dropout {
    /// Create a new dropout layer
    ///
    /// # Arguments
    ///
    /// * `rate` - Dropout probability in `[0, 1)`
    /// * `rng` - Parent random context; the layer forks its own generator
    pub fn new<R: Rng + ?Sized>(rate: f32, rng: &mut R) -> Result<Self> {
        if !(0.0..1.0).contains(&rate) {
            return Err(Error::InvalidConfig(format!(
                "dropout rate must be in [0, 1), got {rate}"
            )));
        }
        Ok(Self {
            rate,
            training: true,
            rng: crate::random::fork(rng),
            cache: None,
        })
    }

    /// Forward pass with caching for backward
    ///
    /// Draws a fresh Bernoulli mask on every call in training mode.
    pub fn forward(&mut self, x: &Tensor) -> Tensor {
        if !self.training || self.rate == 0.0 {
            // No dropout - just pass through
            self.cache = Some(DropoutCache {
                mask: None,
                scale: 1.0,
            });
            return x.clone();
        }

        let scale = 1.0 / (1.0 - self.rate);
        let mut mask = Vec::with_capacity(x.numel());
        let mut output = x.clone();

        for value in output.data_mut() {
            let keep = self.rng.gen::<f32>() >= self.rate;
            mask.push(keep);
            *value = if keep { *value * scale } else { 0.0 };
        }

        self.cache = Some(DropoutCache {
            mask: Some(mask),
            scale,
        });
        output
    }

    /// Backward pass through dropout
    ///
    /// Applies the cached mask and scale to the incoming gradient.
    pub fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let cache = self
            .cache
            .as_ref()
            .ok_or(Error::MissingForwardCache("Dropout"))?;

        match &cache.mask {
            Some(mask) => {
                if mask.len() != grad_output.numel() {
                    return Err(Error::InvalidShape(format!(
                        "dropout gradient has {} elements, mask has {}",
                        grad_output.numel(),
                        mask.len()
                    )));
                }
                let mut grad_input = grad_output.clone();
                for (g, &keep) in grad_input.data_mut().iter_mut().zip(mask) {
                    *g = if keep { *g * cache.scale } else { 0.0 };
                }
                Ok(grad_input)
            }
            // No dropout was applied, just pass gradient through
            None => Ok(grad_output.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::seeded;

    #[test]
    fn test_inference_mode_is_identity() {
        let mut rng = seeded(0);
        let mut d = Dropout::new(0.5, &mut rng).unwrap();
        d.training = false;
        let x = Tensor::random(&[4, 4], &mut rng);
        assert_eq!(d.forward(&x), x);
        assert_eq!(d.backward(&x).unwrap(), x);
    }

    #[test]
    fn test_training_mask_matches_backward() {
        let mut rng = seeded(1);
        let mut d = Dropout::new(0.5, &mut rng).unwrap();
        let x = Tensor::ones(&[64]);
        let y = d.forward(&x);
        let g = d.backward(&Tensor::ones(&[64])).unwrap();
        // forward and backward apply the same mask and scale
        assert_eq!(y, g);
        assert!(y.data().iter().all(|&v| v == 0.0 || v == 2.0));
        assert!(y.data().iter().any(|&v| v == 0.0));
    }

    #[test]
    fn test_rejects_invalid_rate() {
        let mut rng = seeded(0);
        assert!(Dropout::new(1.0, &mut rng).is_err());
        assert!(Dropout::new(-0.1, &mut rng).is_err());
    }
}
