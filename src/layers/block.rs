//! Transformer Block
//!
//! Pre-norm attention and feed-forward sublayers, each wrapped in dropout
//! and a residual connection.
//!
//! ## Architecture
//!
//! ```text
//! x → LN1 → Attention → Dropout → (+) → LN2 → FeedForward → Dropout → (+) → y
//! │                                ↑  │                                ↑
//! └────────────────────────────────┘  └────────────────────────────────┘
//! ```
//!
//! ## Backward Pass
//!
//! At each residual connection the gradient splits into the skip path and
//! the sublayer path, and the two are summed:
//!
//! ```text
//! grad_h = grad_y + LN2'(FF'(Drop2'(grad_y)))
//! grad_x = grad_h + LN1'(Attn'(Drop1'(grad_h)))
//! ```

use super::attention::{KvCache, MultiHeadAttention};
use super::dropout::Dropout;
use super::feed_forward::FeedForward;
use super::layer_norm::LayerNorm;
use crate::config::ModelConfig;
use crate::error::Result;
use crate::parameter::Parameter;
use crate::tensor::Tensor;
use rand::Rng;

/// Transformer block combining attention and feed-forward with residuals
pub struct TransformerBlock {
    pub ln1: LayerNorm,
    pub attn: MultiHeadAttention,
    pub attn_dropout: Dropout,
    pub ln2: LayerNorm,
    pub ff: FeedForward,
    pub ff_dropout: Dropout,
}

impl TransformerBlock {
    /// Create a new transformer block
    ///
    /// # Arguments
    ///
    /// * `name` - Parameter name prefix, e.g. `blocks.0`
    /// * `config` - Model hyperparameters
    /// * `rng` - Random source for weights and dropout generators
    pub fn new<R: Rng + ?Sized>(name: &str, config: &ModelConfig, rng: &mut R) -> Result<Self> {
        let d = config.d_model;
        Ok(Self {
            ln1: LayerNorm::new(&format!("{name}.ln1"), d, config.layer_norm_eps, true),
            attn: MultiHeadAttention::new(
                &format!("{name}.attn"),
                d,
                config.n_heads,
                config.attention,
                config.lora_rank,
                rng,
            )?,
            attn_dropout: Dropout::new(config.dropout_rate, rng)?,
            ln2: LayerNorm::new(&format!("{name}.ln2"), d, config.layer_norm_eps, true),
            ff: FeedForward::new(&format!("{name}.ff"), d, config.d_ff, rng),
            ff_dropout: Dropout::new(config.dropout_rate, rng)?,
        })
    }

    pub fn set_training(&mut self, training: bool) {
        self.attn_dropout.training = training;
        self.ff_dropout.training = training;
    }

    /// Training forward; every sublayer caches what its backward needs
    pub fn forward(&mut self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        // Attention sublayer with residual
        let a = self.attn.forward(&self.ln1.forward(x)?, mask)?;
        let h = x.add(&self.attn_dropout.forward(&a))?;

        // Feed-forward sublayer with residual
        let f = self.ff.forward(&self.ln2.forward(&h)?)?;
        h.add(&self.ff_dropout.forward(&f))
    }

    /// Inference forward over new positions with a key/value cache
    ///
    /// Dropout is skipped and nothing is cached for backward.
    pub fn forward_incremental(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        past: Option<&KvCache>,
    ) -> Result<(Tensor, KvCache)> {
        let (a, present) = self.attn.forward_incremental(&self.ln1.apply(x)?, mask, past)?;
        let h = x.add(&a)?;
        let y = h.add(&self.ff.apply(&self.ln2.apply(&h)?)?)?;
        Ok((y, present))
    }

    /// Backward pass; returns the gradient with respect to the block input
    pub fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        // Feed-forward branch, then add the skip path
        let grad_f = self.ff_dropout.backward(grad_out)?;
        let mut grad_h = self.ln2.backward(&self.ff.backward(&grad_f)?)?;
        grad_h.add_assign(grad_out)?;

        // Attention branch, then add the skip path
        let grad_a = self.attn_dropout.backward(&grad_h)?;
        let mut grad_x = self.ln1.backward(&self.attn.backward(&grad_a)?)?;
        grad_x.add_assign(&grad_h)?;
        Ok(grad_x)
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        let mut params = self.ln1.parameters();
        params.extend(self.attn.parameters());
        params.extend(self.ln2.parameters());
        params.extend(self.ff.parameters());
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = self.ln1.parameters_mut();
        params.extend(self.attn.parameters_mut());
        params.extend(self.ln2.parameters_mut());
        params.extend(self.ff.parameters_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::attention::causal_mask;
    use crate::random::seeded;

    #[test]
    fn test_block_preserves_shape() {
        let mut rng = seeded(0);
        let config = ModelConfig::tiny(10);
        let mut block = TransformerBlock::new("blocks.0", &config, &mut rng).unwrap();
        let x = Tensor::random(&[2, 5, 16], &mut rng);
        let mask = causal_mask(5, 5).unwrap();
        let y = block.forward(&x, Some(&mask)).unwrap();
        assert_eq!(y.shape(), x.shape());
        let gx = block.backward(&Tensor::ones(&[2, 5, 16])).unwrap();
        assert_eq!(gx.shape(), x.shape());
    }

    #[test]
    fn test_training_and_incremental_agree_without_dropout() {
        let mut rng = seeded(1);
        let config = ModelConfig::tiny(10);
        let mut block = TransformerBlock::new("blocks.0", &config, &mut rng).unwrap();
        let x = Tensor::random(&[1, 4, 16], &mut rng);
        let mask = causal_mask(4, 4).unwrap();
        let y_train = block.forward(&x, Some(&mask)).unwrap();
        let (y_inf, cache) = block.forward_incremental(&x, Some(&mask), None).unwrap();
        assert!(y_train.all_close(&y_inf, 1e-5));
        assert_eq!(cache.seq_len(), 4);
    }

    #[test]
    fn test_parameter_names_are_hierarchical() {
        let mut rng = seeded(2);
        let block = TransformerBlock::new("blocks.3", &ModelConfig::tiny(10), &mut rng).unwrap();
        let names: Vec<&str> = block.parameters().iter().map(|p| p.name.as_str()).collect();
        assert!(names.contains(&"blocks.3.attn.w_q"));
        assert!(names.contains(&"blocks.3.ln2.gamma"));
        assert!(names.contains(&"blocks.3.ff.fc1.weight"));
    }
}
