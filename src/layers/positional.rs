//! Sinusoidal positional encoding
//!
//! ```text
//! PE[pos, 2i]   = sin(pos / 10000^(2i / d))
//! PE[pos, 2i+1] = cos(pos / 10000^(2i / d))
//! ```
//!
//! The table is fixed, so the backward is the identity and there are no
//! parameters. `offset` lets incremental decoding continue from the number
//! of positions already held in the key/value cache.

use crate::error::{Error, Result};
use crate::tensor::Tensor;

pub struct PositionalEncoding {
    table: Tensor,
}

impl PositionalEncoding {
    pub fn new(max_len: usize, d_model: usize) -> Self {
        let mut data = vec![0.0; max_len * d_model];
        for pos in 0..max_len {
            for i in (0..d_model).step_by(2) {
                let angle = pos as f32 / 10000f32.powf(i as f32 / d_model as f32);
                data[pos * d_model + i] = angle.sin();
                if i + 1 < d_model {
                    data[pos * d_model + i + 1] = angle.cos();
                }
            }
        }
        Self {
            table: Tensor::from_raw(data, vec![max_len, d_model]),
        }
    }

    pub fn max_len(&self) -> usize {
        self.table.shape()[0]
    }

    /// Add rows `offset..offset + seq` to `x` (`[seq, d]` or `[batch, seq, d]`)
    pub fn forward(&self, x: &Tensor, offset: usize) -> Result<Tensor> {
        if !matches!(x.ndim(), 2 | 3) {
            return Err(Error::InvalidShape(format!(
                "positional encoding expects [seq, d] or [batch, seq, d], got {:?}",
                x.shape()
            )));
        }
        let seq = x.shape()[x.ndim() - 2];
        if offset + seq > self.max_len() {
            return Err(Error::SequenceTooLong {
                requested: offset + seq,
                max_len: self.max_len(),
            });
        }
        x.add(&self.table.narrow(0, offset, seq)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_row_is_sin_zero_cos_zero() {
        let pe = PositionalEncoding::new(4, 6);
        let y = pe.forward(&Tensor::zeros(&[1, 1, 6]), 0).unwrap();
        assert_eq!(y.data(), &[0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_offset_selects_later_rows() {
        let pe = PositionalEncoding::new(8, 4);
        let full = pe.forward(&Tensor::zeros(&[5, 4]), 0).unwrap();
        let tail = pe.forward(&Tensor::zeros(&[2, 4]), 3).unwrap();
        assert_eq!(tail.data(), &full.data()[12..20]);
    }

    #[test]
    fn test_span_past_table_fails() {
        let pe = PositionalEncoding::new(4, 2);
        assert!(matches!(
            pe.forward(&Tensor::zeros(&[1, 2, 2]), 3),
            Err(Error::SequenceTooLong { requested: 5, max_len: 4 })
        ));
    }
}
