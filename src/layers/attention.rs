//! Multi-Head Self-Attention
//!
//! ## Scaled Dot-Product Attention
//!
//! ```text
//! Q, K, V = x @ W_q, x @ W_k, x @ W_v
//! scores  = (Q @ K^T) / √head_dim + mask
//! attn    = softmax(scores)
//! out     = merge_heads(attn @ V) @ W_o
//! ```
//!
//! `mask` is additive: 0 where a position may be attended, `-inf` where it
//! may not. It broadcasts over batch and head.
//!
//! ## Variants
//!
//! - **Multi-head**: K and V have `n_heads` heads like Q.
//! - **Multi-query**: `W_k` and `W_v` produce a single `head_dim` head that is
//!   shared by every query head. The key/value cache stays single-headed and
//!   the head is tiled across query heads right before the score product.
//! - **LoRA**: an optional low-rank adapter adds `(x @ A) @ B` to the query
//!   and value projections. `B` starts at zero, so a fresh adapter leaves the
//!   layer's output unchanged.
//!
//! ## Shapes
//!
//! ```text
//! x          [batch, seq, d_model]
//! Q          [batch, n_heads, seq, head_dim]
//! K, V       [batch, n_heads, total, head_dim]     (after tiling)
//! KvCache.k  [batch, n_heads or 1, total, head_dim]
//! scores     [batch, n_heads, seq, total]
//! ```
//!
//! ## Backward Pass
//!
//! Every forward step is undone in reverse:
//! 1. Output projection, then split the merged gradient into heads
//! 2. `attn @ V`: `grad_attn = grad_ctx @ V^T`, `grad_V = attn^T @ grad_ctx`
//! 3. Softmax, through the full per-row Jacobian
//! 4. Scaled `Q @ K^T`: `grad_Q = grad_s @ K`, `grad_K = grad_s^T @ Q`
//! 5. Multi-query only: sum key/value gradients over the tiled head axis
//! 6. Merge heads and back through the projections (and adapters) into `x`

use super::linear::{init_weight, input_grad, weight_grad};
use crate::error::{Error, Result};
use crate::parameter::Parameter;
use crate::tensor::Tensor;
use log::trace;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// How keys and values are laid out across heads
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionKind {
    /// One key/value head per query head
    #[default]
    MultiHead,
    /// A single key/value head shared by all query heads
    MultiQuery,
}

/// Low-rank adapter on the query and value projections
pub struct LoraAdapter {
    pub a_q: Parameter,
    pub b_q: Parameter,
    pub a_v: Parameter,
    pub b_v: Parameter,
}

impl LoraAdapter {
    fn new<R: Rng + ?Sized>(name: &str, d_model: usize, v_dim: usize, rank: usize, rng: &mut R) -> Self {
        Self {
            a_q: Parameter::new(format!("{name}.lora.a_q"), init_weight(d_model, rank, 1.0, rng)),
            b_q: Parameter::new(format!("{name}.lora.b_q"), Tensor::zeros(&[rank, d_model])),
            a_v: Parameter::new(format!("{name}.lora.a_v"), init_weight(d_model, rank, 1.0, rng)),
            b_v: Parameter::new(format!("{name}.lora.b_v"), Tensor::zeros(&[rank, v_dim])),
        }
    }

    pub fn rank(&self) -> usize {
        self.a_q.shape()[1]
    }
}

/// Keys and values seen so far by one attention layer
///
/// Owned by the caller between decode steps. Grows along axis 2 on every
/// call to [`MultiHeadAttention::forward_incremental`].
#[derive(Clone, Debug)]
pub struct KvCache {
    pub k: Tensor,
    pub v: Tensor,
}

impl KvCache {
    /// Number of positions held, 0 for a cache that is not rank 4
    pub fn seq_len(&self) -> usize {
        self.k.shape().get(2).copied().unwrap_or(0)
    }

    /// Check the layout against a layer with `n_heads` query heads of width `head_dim`
    ///
    /// `k` and `v` must be equal-shaped `[batch, heads, seq, head_dim]` tensors
    /// where `heads` is 1 (shared head) or `n_heads`.
    pub fn validate(&self, n_heads: usize, head_dim: usize) -> Result<()> {
        let shape = self.k.shape();
        if shape.len() != 4 || self.v.shape() != shape {
            return Err(Error::InvalidShape(format!(
                "key/value cache must hold two equal rank-4 tensors, got {:?} and {:?}",
                shape,
                self.v.shape()
            )));
        }
        if (shape[1] != 1 && shape[1] != n_heads) || shape[3] != head_dim {
            return Err(Error::shape(
                "key/value cache",
                shape,
                &[shape[0], n_heads, shape[2], head_dim],
            ));
        }
        Ok(())
    }
}

/// Additive causal mask `[new_len, total_len]` for the newest `new_len`
/// queries of a `total_len`-position sequence
///
/// Query `i` sits at absolute position `total_len - new_len + i` and may see
/// every key at or before it.
pub fn causal_mask(new_len: usize, total_len: usize) -> Result<Tensor> {
    if new_len > total_len {
        return Err(Error::InvalidShape(format!(
            "causal mask for {new_len} queries over {total_len} positions"
        )));
    }
    let offset = total_len - new_len;
    let mut data = vec![0.0; new_len * total_len];
    for i in 0..new_len {
        for j in (offset + i + 1)..total_len {
            data[i * total_len + j] = f32::NEG_INFINITY;
        }
    }
    Tensor::new(data, vec![new_len, total_len])
}

/// `[b, s, heads * hd]` -> `[b, heads, s, hd]`
fn split_heads(x: &Tensor, heads: usize, head_dim: usize) -> Result<Tensor> {
    let (b, s) = (x.shape()[0], x.shape()[1]);
    x.reshape(&[b, s, heads, head_dim])?.transpose(1, 2)
}

/// `[b, heads, s, hd]` -> `[b, s, heads * hd]`
fn merge_heads(x: &Tensor) -> Result<Tensor> {
    let &[b, h, s, hd] = x.shape() else {
        return Err(Error::InvalidShape(format!("merge_heads of {:?}", x.shape())));
    };
    x.transpose(1, 2)?.reshape(&[b, s, h * hd])
}

/// Softmax backward along the last axis
///
/// For each row `a = softmax(s)` the Jacobian is `J[i][j] = a_i (δ_ij - a_j)`
/// and `grad_s = J^T @ grad_a`.
fn softmax_backward(probs: &Tensor, grad: &Tensor) -> Result<Tensor> {
    if probs.shape() != grad.shape() {
        return Err(Error::shape("softmax backward", probs.shape(), grad.shape()));
    }
    let n = probs.shape()[probs.ndim() - 1];
    let mut out = vec![0.0; probs.numel()];
    let mut jacobian = vec![0.0; n * n];

    for ((a, g), o) in probs
        .data()
        .chunks(n)
        .zip(grad.data().chunks(n))
        .zip(out.chunks_mut(n))
    {
        for i in 0..n {
            for j in 0..n {
                let delta = if i == j { 1.0 } else { 0.0 };
                jacobian[i * n + j] = a[i] * (delta - a[j]);
            }
        }
        for (j, o_j) in o.iter_mut().enumerate() {
            *o_j = (0..n).map(|i| jacobian[i * n + j] * g[i]).sum();
        }
    }
    Tensor::new(out, probs.shape().to_vec())
}

/// Cache for attention backward pass
struct AttentionCache {
    x: Tensor,
    /// Query heads `[b, h, s, hd]`
    q: Tensor,
    /// Key/value heads after tiling `[b, h, s, hd]`
    k: Tensor,
    v: Tensor,
    attn: Tensor,
    /// Merged context before the output projection `[b, s, d]`
    merged: Tensor,
    /// Adapter hidden states `x @ A_q`, `x @ A_v`
    lora_q: Option<Tensor>,
    lora_v: Option<Tensor>,
}

/// Projections of one input before head splitting
struct Projected {
    q: Tensor,
    k: Tensor,
    v: Tensor,
    lora_q: Option<Tensor>,
    lora_v: Option<Tensor>,
}

/// Multi-head (or multi-query) self-attention with an optional LoRA adapter
pub struct MultiHeadAttention {
    pub w_q: Parameter,
    pub w_k: Parameter,
    pub w_v: Parameter,
    pub w_o: Parameter,
    pub lora: Option<LoraAdapter>,
    pub kind: AttentionKind,
    pub n_heads: usize,
    pub head_dim: usize,
    cache: Option<AttentionCache>,
}

impl MultiHeadAttention {
    /// Create an attention layer
    ///
    /// # Arguments
    ///
    /// * `name` - Parameter name prefix
    /// * `d_model` - Model dimension, must be divisible by `n_heads`
    /// * `n_heads` - Number of query heads
    /// * `kind` - Multi-head or multi-query key/value layout
    /// * `lora_rank` - Adapter rank, or `None` for no adapter
    /// * `rng` - Random source for the weights
    pub fn new<R: Rng + ?Sized>(
        name: &str,
        d_model: usize,
        n_heads: usize,
        kind: AttentionKind,
        lora_rank: Option<usize>,
        rng: &mut R,
    ) -> Result<Self> {
        if n_heads == 0 || d_model % n_heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "d_model {d_model} is not divisible by n_heads {n_heads}"
            )));
        }
        let head_dim = d_model / n_heads;
        let kv_dim = match kind {
            AttentionKind::MultiHead => d_model,
            AttentionKind::MultiQuery => head_dim,
        };

        if lora_rank == Some(0) {
            return Err(Error::InvalidConfig("LoRA rank must be positive".into()));
        }

        let w_q = Parameter::new(format!("{name}.w_q"), init_weight(d_model, d_model, 1.0, rng));
        let w_k = Parameter::new(format!("{name}.w_k"), init_weight(d_model, kv_dim, 1.0, rng));
        let w_v = Parameter::new(format!("{name}.w_v"), init_weight(d_model, kv_dim, 1.0, rng));
        let w_o = Parameter::new(format!("{name}.w_o"), init_weight(d_model, d_model, 1.0, rng));
        let lora = lora_rank.map(|rank| LoraAdapter::new(name, d_model, kv_dim, rank, rng));

        Ok(Self {
            w_q,
            w_k,
            w_v,
            w_o,
            lora,
            kind,
            n_heads,
            head_dim,
            cache: None,
        })
    }

    pub fn d_model(&self) -> usize {
        self.n_heads * self.head_dim
    }

    /// Heads produced by the key/value projections
    pub fn kv_heads(&self) -> usize {
        match self.kind {
            AttentionKind::MultiHead => self.n_heads,
            AttentionKind::MultiQuery => 1,
        }
    }

    fn project(&self, x: &Tensor) -> Result<Projected> {
        if x.ndim() != 3 || x.shape()[2] != self.d_model() {
            return Err(Error::shape("attention input", x.shape(), &[self.d_model()]));
        }
        let mut q = x.matmul(&self.w_q.value)?;
        let k = x.matmul(&self.w_k.value)?;
        let mut v = x.matmul(&self.w_v.value)?;

        let (mut lora_q, mut lora_v) = (None, None);
        if let Some(lora) = &self.lora {
            let xa_q = x.matmul(&lora.a_q.value)?;
            let xa_v = x.matmul(&lora.a_v.value)?;
            q = q.add(&xa_q.matmul(&lora.b_q.value)?)?;
            v = v.add(&xa_v.matmul(&lora.b_v.value)?)?;
            lora_q = Some(xa_q);
            lora_v = Some(xa_v);
        }
        Ok(Projected { q, k, v, lora_q, lora_v })
    }

    /// Tile a single shared key/value head across all query heads
    fn expand_kv(&self, t: Tensor) -> Result<Tensor> {
        if t.shape()[1] == 1 && self.n_heads > 1 {
            t.repeat(self.n_heads, 1)
        } else {
            Ok(t)
        }
    }

    /// `softmax(q @ k^T / √hd + mask) @ v`, returning (context, weights)
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let scale = 1.0 / (self.head_dim as f32).sqrt();
        let mut scores = q.matmul(&k.transpose(2, 3)?)?.mul_scalar(scale);
        if let Some(mask) = mask {
            scores = scores.add(mask)?;
        }
        let attn = scores.softmax_last()?;
        let ctx = attn.matmul(v)?;
        Ok((ctx, attn))
    }

    /// Training forward over a full sequence; caches activations for backward
    ///
    /// # Arguments
    ///
    /// * `x` - Input `[batch, seq, d_model]`
    /// * `mask` - Optional additive mask broadcastable to `[batch, heads, seq, seq]`
    pub fn forward(&mut self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let p = self.project(x)?;
        let q = split_heads(&p.q, self.n_heads, self.head_dim)?;
        let k = self.expand_kv(split_heads(&p.k, self.kv_heads(), self.head_dim)?)?;
        let v = self.expand_kv(split_heads(&p.v, self.kv_heads(), self.head_dim)?)?;

        let (ctx, attn) = self.attend(&q, &k, &v, mask)?;
        let merged = merge_heads(&ctx)?;
        let out = merged.matmul(&self.w_o.value)?;

        self.cache = Some(AttentionCache {
            x: x.clone(),
            q,
            k,
            v,
            attn,
            merged,
            lora_q: p.lora_q,
            lora_v: p.lora_v,
        });
        Ok(out)
    }

    /// Inference forward for new positions, extending a key/value cache
    ///
    /// New keys/values are appended to `past` along the sequence axis. The
    /// returned cache holds every position seen so far; in multi-query mode
    /// it stays single-headed. Nothing is cached for backward.
    pub fn forward_incremental(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        past: Option<&KvCache>,
    ) -> Result<(Tensor, KvCache)> {
        let p = self.project(x)?;
        let q = split_heads(&p.q, self.n_heads, self.head_dim)?;
        let mut k = split_heads(&p.k, self.kv_heads(), self.head_dim)?;
        let mut v = split_heads(&p.v, self.kv_heads(), self.head_dim)?;

        if let Some(past) = past {
            past.validate(self.n_heads, self.head_dim)?;
            k = Tensor::concatenate(&past.k, &k, 2)?;
            v = Tensor::concatenate(&past.v, &v, 2)?;
        }
        let present = KvCache { k, v };
        trace!(
            "attention cache grew to {} positions ({} new)",
            present.seq_len(),
            x.shape()[1]
        );

        let k = self.expand_kv(present.k.clone())?;
        let v = self.expand_kv(present.v.clone())?;
        let (ctx, _) = self.attend(&q, &k, &v, mask)?;
        let out = merge_heads(&ctx)?.matmul(&self.w_o.value)?;
        Ok((out, present))
    }

    /// Backward pass through attention
    ///
    /// Accumulates gradients for every projection (and adapter) weight and
    /// returns the gradient with respect to the input.
    pub fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let c = self
            .cache
            .as_ref()
            .ok_or(Error::MissingForwardCache("MultiHeadAttention"))?;
        if grad_out.shape() != c.x.shape() {
            return Err(Error::shape("attention backward", grad_out.shape(), c.x.shape()));
        }
        let scale = 1.0 / (self.head_dim as f32).sqrt();

        // Output projection
        self.w_o.accumulate_grad(&weight_grad(&c.merged, grad_out)?)?;
        let grad_merged = input_grad(grad_out, &self.w_o.value)?;
        let grad_ctx = split_heads(&grad_merged, self.n_heads, self.head_dim)?;

        // ctx = attn @ v
        let grad_attn = grad_ctx.matmul(&c.v.transpose(2, 3)?)?;
        let mut grad_v = c.attn.transpose(2, 3)?.matmul(&grad_ctx)?;

        // attn = softmax(scores), scores = q @ k^T * scale
        let grad_scores = softmax_backward(&c.attn, &grad_attn)?.mul_scalar(scale);
        let grad_q = grad_scores.matmul(&c.k)?;
        let mut grad_k = grad_scores.transpose(2, 3)?.matmul(&c.q)?;

        // The shared head was tiled across query heads
        if self.kind == AttentionKind::MultiQuery {
            grad_k = grad_k.sum(1)?;
            grad_v = grad_v.sum(1)?;
        }

        let grad_q = merge_heads(&grad_q)?;
        let grad_k = merge_heads(&grad_k)?;
        let grad_v = merge_heads(&grad_v)?;

        self.w_q.accumulate_grad(&weight_grad(&c.x, &grad_q)?)?;
        self.w_k.accumulate_grad(&weight_grad(&c.x, &grad_k)?)?;
        self.w_v.accumulate_grad(&weight_grad(&c.x, &grad_v)?)?;

        let mut grad_x = input_grad(&grad_q, &self.w_q.value)?;
        grad_x.add_assign(&input_grad(&grad_k, &self.w_k.value)?)?;
        grad_x.add_assign(&input_grad(&grad_v, &self.w_v.value)?)?;

        if let (Some(lora), Some(xa_q), Some(xa_v)) = (&mut self.lora, &c.lora_q, &c.lora_v) {
            for (a, b, xa, grad) in [
                (&mut lora.a_q, &mut lora.b_q, xa_q, &grad_q),
                (&mut lora.a_v, &mut lora.b_v, xa_v, &grad_v),
            ] {
                // proj += (x @ A) @ B
                b.accumulate_grad(&weight_grad(xa, grad)?)?;
                let grad_xa = input_grad(grad, &b.value)?;
                a.accumulate_grad(&weight_grad(&c.x, &grad_xa)?)?;
                grad_x.add_assign(&input_grad(&grad_xa, &a.value)?)?;
            }
        }

        Ok(grad_x)
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        let mut params = vec![&self.w_q, &self.w_k, &self.w_v, &self.w_o];
        if let Some(lora) = &self.lora {
            params.extend([&lora.a_q, &lora.b_q, &lora.a_v, &lora.b_v]);
        }
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = vec![&mut self.w_q, &mut self.w_k, &mut self.w_v, &mut self.w_o];
        if let Some(lora) = &mut self.lora {
            params.extend([&mut lora.a_q, &mut lora.b_q, &mut lora.a_v, &mut lora.b_v]);
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::seeded;

    #[test]
    fn test_causal_mask_full_and_offset() {
        let m = causal_mask(3, 3).unwrap();
        assert_eq!(m.get(&[0, 0]).unwrap(), 0.0);
        assert_eq!(m.get(&[0, 1]).unwrap(), f32::NEG_INFINITY);
        assert_eq!(m.get(&[2, 2]).unwrap(), 0.0);

        // two new queries at positions 3 and 4 of a 5-position sequence
        let m = causal_mask(2, 5).unwrap();
        assert_eq!(m.get(&[0, 3]).unwrap(), 0.0);
        assert_eq!(m.get(&[0, 4]).unwrap(), f32::NEG_INFINITY);
        assert!((0..5).all(|j| m.get(&[1, j]).unwrap() == 0.0));
        assert!(causal_mask(3, 2).is_err());
    }

    #[test]
    fn test_split_merge_heads_roundtrip() {
        let mut rng = seeded(1);
        let x = Tensor::random(&[2, 3, 8], &mut rng);
        let heads = split_heads(&x, 4, 2).unwrap();
        assert_eq!(heads.shape(), &[2, 4, 3, 2]);
        assert_eq!(heads.get(&[1, 2, 0, 1]).unwrap(), x.get(&[1, 0, 5]).unwrap());
        assert_eq!(merge_heads(&heads).unwrap(), x);
    }

    #[test]
    fn test_softmax_backward_matches_closed_form() {
        let mut rng = seeded(2);
        let a = Tensor::random(&[2, 5], &mut rng).softmax_last().unwrap();
        let g = Tensor::random(&[2, 5], &mut rng);
        let got = softmax_backward(&a, &g).unwrap();
        // a * (g - sum(g * a))
        let dot = g.mul(&a).unwrap().sum(-1).unwrap();
        let expected = a.mul(&g.sub(&dot).unwrap()).unwrap();
        assert!(got.all_close(&expected, 1e-6));
    }

    #[test]
    fn test_multi_query_shares_single_kv_head() {
        let mut rng = seeded(3);
        let attn = MultiHeadAttention::new("attn", 8, 4, AttentionKind::MultiQuery, None, &mut rng).unwrap();
        assert_eq!(attn.w_k.shape(), &[8, 2]);
        assert_eq!(attn.w_v.shape(), &[8, 2]);

        let x = Tensor::random(&[1, 3, 8], &mut rng);
        let (out, cache) = attn.forward_incremental(&x, None, None).unwrap();
        assert_eq!(out.shape(), &[1, 3, 8]);
        assert_eq!(cache.k.shape(), &[1, 1, 3, 2]);
    }

    #[test]
    fn test_fresh_lora_adapter_is_a_no_op() {
        let mut rng = seeded(4);
        // base weights are drawn before the adapter, so both layers share them
        let mut plain = MultiHeadAttention::new("attn", 8, 2, AttentionKind::MultiHead, None, &mut seeded(9)).unwrap();
        let mut lora = MultiHeadAttention::new("attn", 8, 2, AttentionKind::MultiHead, Some(2), &mut seeded(9)).unwrap();
        assert_eq!(plain.w_o.value, lora.w_o.value);

        let x = Tensor::random(&[1, 4, 8], &mut rng);
        let y_plain = plain.forward(&x, None).unwrap();
        let y_lora = lora.forward(&x, None).unwrap();
        assert!(y_plain.all_close(&y_lora, 1e-6));
        assert_eq!(lora.parameters().len(), 8);
    }

    #[test]
    fn test_malformed_cache_is_an_error() {
        let mut rng = seeded(6);
        let attn =
            MultiHeadAttention::new("attn", 8, 2, AttentionKind::MultiQuery, None, &mut rng).unwrap();
        let x = Tensor::random(&[1, 1, 8], &mut rng);

        let flat = KvCache {
            k: Tensor::zeros(&[2]),
            v: Tensor::zeros(&[2]),
        };
        assert_eq!(flat.seq_len(), 0);
        assert!(matches!(
            attn.forward_incremental(&x, None, Some(&flat)),
            Err(Error::InvalidShape(_))
        ));

        let uneven = KvCache {
            k: Tensor::zeros(&[1, 1, 3, 4]),
            v: Tensor::zeros(&[1, 1, 2, 4]),
        };
        assert!(uneven.validate(2, 4).is_err());

        let wrong_width = KvCache {
            k: Tensor::zeros(&[1, 1, 3, 5]),
            v: Tensor::zeros(&[1, 1, 3, 5]),
        };
        assert!(matches!(
            wrong_width.validate(2, 4),
            Err(Error::ShapeMismatch { .. })
        ));

        // shared and full-headed caches are both accepted
        let (_, shared) = attn.forward_incremental(&x, None, None).unwrap();
        assert!(shared.validate(2, 4).is_ok());
        let full = KvCache {
            k: shared.k.repeat(2, 1).unwrap(),
            v: shared.v.repeat(2, 1).unwrap(),
        };
        assert!(full.validate(2, 4).is_ok());
    }

    #[test]
    fn test_rejects_indivisible_heads() {
        let mut rng = seeded(0);
        assert!(MultiHeadAttention::new("attn", 10, 4, AttentionKind::MultiHead, None, &mut rng).is_err());
        assert!(MultiHeadAttention::new("attn", 8, 4, AttentionKind::MultiHead, Some(0), &mut rng).is_err());
    }

    #[test]
    fn test_masked_attention_ignores_future() {
        let mut rng = seeded(5);
        let mut attn = MultiHeadAttention::new("attn", 8, 2, AttentionKind::MultiHead, None, &mut rng).unwrap();
        let x = Tensor::random(&[1, 4, 8], &mut rng);
        let mask = causal_mask(4, 4).unwrap();
        let full = attn.forward(&x, Some(&mask)).unwrap();

        // changing the last position must not affect earlier outputs
        let mut x2 = x.clone();
        for j in 0..8 {
            x2.set(&[0, 3, j], 10.0).unwrap();
        }
        let changed = attn.forward(&x2, Some(&mask)).unwrap();
        let head = |t: &Tensor| t.narrow(1, 0, 3).unwrap();
        assert!(head(&full).all_close(&head(&changed), 1e-6));
    }
}
