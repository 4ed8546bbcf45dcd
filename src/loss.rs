//! Cross-entropy loss for next-token prediction
//!
//! ```text
//! p = softmax(logits_row)
//! loss = -mean(log p[target])
//! dL/dlogits = (p - onehot(target)) / rows
//! ```
//!
//! `log p` is computed as `(x - max) - ln Σ exp(x - max)` so large logits
//! never overflow.

use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// Mean cross-entropy over every (batch, position) row and its gradient
///
/// # Arguments
///
/// * `logits` - `[batch, seq, vocab]` or `[rows, vocab]`
/// * `targets` - Target ids, one sequence per batch entry
///
/// # Returns
///
/// `(loss, dL/dlogits)`, the gradient shaped like `logits`
pub fn cross_entropy(logits: &Tensor, targets: &[Vec<usize>]) -> Result<(f32, Tensor)> {
    let vocab = *logits
        .shape()
        .last()
        .ok_or_else(|| Error::InvalidShape("cross entropy of a rank-0 tensor".into()))?;
    let rows = logits.numel() / vocab.max(1);
    let n_targets: usize = targets.iter().map(Vec::len).sum();
    if n_targets != rows || rows == 0 {
        return Err(Error::shape("cross_entropy", &[rows, vocab], &[n_targets]));
    }

    let mut loss = 0.0;
    let mut grad = Vec::with_capacity(logits.numel());
    for (row, &target) in logits.data().chunks(vocab).zip(targets.iter().flatten()) {
        if target >= vocab {
            return Err(Error::TokenOutOfRange {
                token: target,
                vocab_size: vocab,
            });
        }
        let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let exp_sum: f32 = row.iter().map(|&x| (x - max).exp()).sum();
        loss -= (row[target] - max) - exp_sum.ln();

        for (j, &x) in row.iter().enumerate() {
            let p = (x - max).exp() / exp_sum;
            let onehot = if j == target { 1.0 } else { 0.0 };
            grad.push((p - onehot) / rows as f32);
        }
    }

    Ok((loss / rows as f32, Tensor::new(grad, logits.shape().to_vec())?))
}
