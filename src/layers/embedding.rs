//! Token Embedding
//!
//! A `[vocab_size, d_model]` lookup table. Forward copies one row per token
//! id; backward scatters the upstream gradient back into those rows.
//!
//! ## Repeated tokens
//!
//! When a token id appears several times in a batch, every occurrence
//! contributes to the same row, so the backward **adds** rows:
//!
//! ```text
//! grad_W[id] += grad_out[b, s]   for every (b, s) with tokens[b][s] == id
//! ```

use crate::error::{Error, Result};
use crate::parameter::Parameter;
use crate::tensor::Tensor;
use rand::Rng;

/// Trainable token embedding table
pub struct Embedding {
    pub weight: Parameter,
    cache: Option<Vec<Vec<usize>>>,
}

impl Embedding {
    /// Create a table with entries drawn from `N(0, 1/d_model)`
    pub fn new<R: Rng + ?Sized>(name: &str, vocab_size: usize, d_model: usize, rng: &mut R) -> Self {
        let std = (1.0 / d_model.max(1) as f32).sqrt();
        Self {
            weight: Parameter::new(
                format!("{name}.weight"),
                Tensor::random_normal(&[vocab_size, d_model], std, rng),
            ),
            cache: None,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn d_model(&self) -> usize {
        self.weight.shape()[1]
    }

    /// Look up rows for a rectangular batch of token sequences
    ///
    /// Returns `[batch, seq, d_model]`. Fails with `TokenOutOfRange` for any
    /// id ≥ vocabulary size, and with `InvalidShape` for an empty or ragged batch.
    pub fn lookup(&self, tokens: &[Vec<usize>]) -> Result<Tensor> {
        let batch = tokens.len();
        let seq = tokens.first().map_or(0, Vec::len);
        if batch == 0 || seq == 0 {
            return Err(Error::InvalidShape("embedding of an empty batch".into()));
        }
        if tokens.iter().any(|t| t.len() != seq) {
            return Err(Error::InvalidShape(
                "token sequences in a batch must have equal length".into(),
            ));
        }

        let (vocab, d) = (self.vocab_size(), self.d_model());
        let table = self.weight.value.data();
        let mut out = Vec::with_capacity(batch * seq * d);
        for &token in tokens.iter().flatten() {
            if token >= vocab {
                return Err(Error::TokenOutOfRange {
                    token,
                    vocab_size: vocab,
                });
            }
            out.extend_from_slice(&table[token * d..(token + 1) * d]);
        }
        Tensor::new(out, vec![batch, seq, d])
    }

    /// Forward pass; remembers the token ids for backward
    pub fn forward(&mut self, tokens: &[Vec<usize>]) -> Result<Tensor> {
        let out = self.lookup(tokens)?;
        self.cache = Some(tokens.to_vec());
        Ok(out)
    }

    /// Backward pass: accumulate `grad_out [batch, seq, d]` into the table
    pub fn backward(&mut self, grad_out: &Tensor) -> Result<()> {
        let tokens = self
            .cache
            .as_ref()
            .ok_or(Error::MissingForwardCache("Embedding"))?;
        let d = self.d_model();
        let expected = [tokens.len(), tokens.first().map_or(0, Vec::len), d];
        if grad_out.shape() != expected {
            return Err(Error::shape("embedding backward", grad_out.shape(), &expected));
        }

        let mut grad = Tensor::zeros(self.weight.shape());
        let table = grad.data_mut();
        for (&token, row) in tokens.iter().flatten().zip(grad_out.data().chunks(d)) {
            for (acc, &g) in table[token * d..(token + 1) * d].iter_mut().zip(row) {
                *acc += g;
            }
        }
        self.weight.accumulate_grad(&grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::seeded;

    #[test]
    fn test_lookup_copies_rows() {
        let mut rng = seeded(0);
        let emb = Embedding::new("emb", 5, 3, &mut rng);
        let out = emb.lookup(&[vec![4, 0]]).unwrap();
        assert_eq!(out.shape(), &[1, 2, 3]);
        assert_eq!(&out.data()[..3], &emb.weight.value.data()[12..15]);
        assert_eq!(&out.data()[3..], &emb.weight.value.data()[..3]);
    }

    #[test]
    fn test_repeated_tokens_accumulate() {
        let mut rng = seeded(0);
        let mut emb = Embedding::new("emb", 4, 2, &mut rng);
        emb.forward(&[vec![1, 1, 3], vec![1, 0, 0]]).unwrap();
        emb.backward(&Tensor::ones(&[2, 3, 2])).unwrap();
        let g = emb.weight.grad.data();
        assert_eq!(&g[0..2], &[2.0, 2.0]);
        assert_eq!(&g[2..4], &[3.0, 3.0]);
        assert_eq!(&g[4..6], &[0.0, 0.0]);
        assert_eq!(&g[6..8], &[1.0, 1.0]);
    }

    #[test]
    fn test_out_of_range_token() {
        let mut rng = seeded(0);
        let emb = Embedding::new("emb", 4, 2, &mut rng);
        assert!(matches!(
            emb.lookup(&[vec![0, 4]]),
            Err(Error::TokenOutOfRange { token: 4, vocab_size: 4 })
        ));
    }

    #[test]
    fn test_ragged_batch_rejected() {
        let mut rng = seeded(0);
        let emb = Embedding::new("emb", 4, 2, &mut rng);
        assert!(emb.lookup(&[vec![0, 1], vec![2]]).is_err());
        assert!(emb.lookup(&[]).is_err());
    }
}
