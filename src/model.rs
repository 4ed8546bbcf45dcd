//! Transformer Language Model
//!
//! A decoder-only transformer with hand-derived backward passes.
//!
//! ## Architecture
//!
//! ```text
//! tokens [batch, seq]
//!   → Embedding                 [batch, seq, d_model]
//!   → + PositionalEncoding
//!   → TransformerBlock × n_layers (causal mask)
//!   → LayerNorm
//!   → Linear (d_model → vocab)  [batch, seq, vocab]
//! ```
//!
//! ## Two Execution Modes
//!
//! - **Training** ([`Model::forward`] then [`Model::backward`]): a full
//!   sequence runs through every layer, each layer caching the activations
//!   its backward needs. One forward may be in flight at a time.
//! - **Inference** ([`TransformerModel::forward_inference`]): new tokens run
//!   against a per-layer [`KvCache`] owned by the caller. Dropout is off,
//!   nothing is cached for backward, and `&self` is enough.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tisslm::{Model, ModelConfig, TransformerModel};
//!
//! let mut model = TransformerModel::new(ModelConfig::tiny(32))?;
//! let logits = model.forward(&[vec![1, 2, 3]])?;
//!
//! // Prompt in one call, then one token at a time
//! let (_, cache) = model.forward_inference(&[1, 2, 3], None)?;
//! let (next, cache) = model.forward_inference(&[4], Some(cache.as_slice()))?;
//! # Ok::<(), tisslm::Error>(())
//! ```

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::layers::{causal_mask, Embedding, KvCache, LayerNorm, Linear, PositionalEncoding, TransformerBlock};
use crate::parameter::Parameter;
use crate::random::seeded;
use crate::tensor::Tensor;
use log::{debug, trace};

/// Capabilities shared by trainable language models
///
/// Training drivers, evaluators and generators are written against this
/// trait rather than a concrete model.
pub trait Model {
    /// Logits `[batch, seq, vocab]` for a rectangular token batch
    fn forward(&mut self, tokens: &[Vec<usize>]) -> Result<Tensor>;

    /// Backpropagate `dL/dlogits` from the latest `forward`, accumulating
    /// into every parameter gradient
    fn backward(&mut self, grad_logits: &Tensor) -> Result<()>;

    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    fn vocab_size(&self) -> usize;

    /// Reset every parameter gradient; call before each backward/update cycle
    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }

    /// Total number of scalar parameters
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.numel()).sum()
    }
}

/// Decoder-only transformer
pub struct TransformerModel {
    pub config: ModelConfig,
    pub embedding: Embedding,
    pub positional: PositionalEncoding,
    pub blocks: Vec<TransformerBlock>,
    pub ln_final: LayerNorm,
    pub output: Linear,
}

impl TransformerModel {
    /// Build a model; weights are drawn from `config.seed`
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = seeded(config.seed);

        let embedding = Embedding::new("embedding", config.vocab_size, config.d_model, &mut rng);
        let positional = PositionalEncoding::new(config.max_seq_len, config.d_model);
        let blocks = (0..config.n_layers)
            .map(|i| TransformerBlock::new(&format!("blocks.{i}"), &config, &mut rng))
            .collect::<Result<Vec<_>>>()?;
        let ln_final = LayerNorm::new("ln_final", config.d_model, config.layer_norm_eps, true);
        let output = Linear::new("output", config.d_model, config.vocab_size, &mut rng);

        let model = Self {
            config,
            embedding,
            positional,
            blocks,
            ln_final,
            output,
        };
        debug!(
            "built transformer: {} layers, {:?} attention, lora {:?}, {} parameters",
            model.config.n_layers,
            model.config.attention,
            model.config.lora_rank,
            model.num_parameters()
        );
        Ok(model)
    }

    /// Switch every dropout layer between training and inference behavior
    pub fn set_training(&mut self, training: bool) {
        for block in &mut self.blocks {
            block.set_training(training);
        }
    }

    /// Validate caller-supplied caches and return the shared cached length
    fn check_caches(&self, past: &[KvCache]) -> Result<usize> {
        if past.len() != self.blocks.len() {
            return Err(Error::InvalidShape(format!(
                "expected {} layer caches, got {}",
                self.blocks.len(),
                past.len()
            )));
        }
        let offset = past.first().map_or(0, KvCache::seq_len);
        for (i, (block, cache)) in self.blocks.iter().zip(past).enumerate() {
            cache.validate(block.attn.n_heads, block.attn.head_dim)?;
            if cache.k.shape()[0] != 1 {
                return Err(Error::InvalidShape(format!(
                    "layer {i} cache holds a batch of {}, inference runs one sequence",
                    cache.k.shape()[0]
                )));
            }
            if cache.seq_len() != offset {
                return Err(Error::InvalidShape(format!(
                    "layer {i} cache holds {} positions, layer 0 holds {}",
                    cache.seq_len(),
                    offset
                )));
            }
        }
        Ok(offset)
    }

    /// Run new tokens against the key/value cache from a previous call
    ///
    /// # Arguments
    ///
    /// * `tokens` - New token ids for a single sequence
    /// * `past` - One cache per layer from the previous call, or `None` to start
    ///
    /// # Returns
    ///
    /// Logits `[1, tokens.len(), vocab]` and the extended per-layer caches.
    /// A causal mask is only built when more than one token is new; a single
    /// token may attend every cached position.
    pub fn forward_inference(
        &self,
        tokens: &[usize],
        past: Option<&[KvCache]>,
    ) -> Result<(Tensor, Vec<KvCache>)> {
        let offset = match past {
            Some(past) => self.check_caches(past)?,
            None => 0,
        };
        let new_len = tokens.len();

        let x = self.embedding.lookup(&[tokens.to_vec()])?;
        let mut x = self.positional.forward(&x, offset)?;

        let mask = if new_len > 1 {
            Some(causal_mask(new_len, offset + new_len)?)
        } else {
            None
        };

        let mut present = Vec::with_capacity(self.blocks.len());
        for (i, block) in self.blocks.iter().enumerate() {
            let layer_past = past.map(|p| &p[i]);
            let (y, cache) = block.forward_incremental(&x, mask.as_ref(), layer_past)?;
            present.push(cache);
            x = y;
        }
        trace!("inference step: {} new tokens at offset {}", new_len, offset);

        let logits = self.output.project(&self.ln_final.apply(&x)?)?;
        Ok((logits, present))
    }
}

impl Model for TransformerModel {
    fn forward(&mut self, tokens: &[Vec<usize>]) -> Result<Tensor> {
        let x = self.embedding.forward(tokens)?;
        let mut x = self.positional.forward(&x, 0)?;

        let seq = x.shape()[1];
        let mask = causal_mask(seq, seq)?;
        for block in &mut self.blocks {
            x = block.forward(&x, Some(&mask))?;
        }

        let x = self.ln_final.forward(&x)?;
        self.output.forward(&x)
    }

    fn backward(&mut self, grad_logits: &Tensor) -> Result<()> {
        let grad = self.output.backward(grad_logits)?;
        let mut grad = self.ln_final.backward(&grad)?;
        for block in self.blocks.iter_mut().rev() {
            grad = block.backward(&grad)?;
        }
        // Positional encoding is a fixed addition; its gradient passes through
        self.embedding.backward(&grad)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = vec![&self.embedding.weight];
        for block in &self.blocks {
            params.extend(block.parameters());
        }
        params.extend(self.ln_final.parameters());
        params.extend(self.output.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = vec![&mut self.embedding.weight];
        for block in &mut self.blocks {
            params.extend(block.parameters_mut());
        }
        params.extend(self.ln_final.parameters_mut());
        params.extend(self.output.parameters_mut());
        params
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }
}
