//! Model hyperparameters
//!
//! [`ModelConfig`] is plain serde data so a configuration can sit next to a
//! parameter checkpoint as JSON.

use crate::error::{Error, Result};
pub use crate::layers::attention::AttentionKind;
use serde::{Deserialize, Serialize};

/// Transformer shape and training hyperparameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    /// Length of the positional table; also the longest sequence a cache can reach
    pub max_seq_len: usize,
    pub d_model: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    /// Hidden width of the feed-forward block
    pub d_ff: usize,
    pub dropout_rate: f32,
    #[serde(default)]
    pub attention: AttentionKind,
    #[serde(default)]
    pub lora_rank: Option<usize>,
    #[serde(default = "default_eps")]
    pub layer_norm_eps: f32,
    #[serde(default)]
    pub seed: u64,
}

fn default_eps() -> f32 {
    1e-5
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::small(256)
    }
}

impl ModelConfig {
    /// Tiny config for tests and quick experiments
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            max_seq_len: 64,
            d_model: 16,
            n_heads: 4,
            n_layers: 2,
            d_ff: 64,
            dropout_rate: 0.0,
            attention: AttentionKind::MultiHead,
            lora_rank: None,
            layer_norm_eps: default_eps(),
            seed: 0,
        }
    }

    /// Small config (~1M parameters at a byte-level vocabulary)
    pub fn small(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            max_seq_len: 256,
            d_model: 128,
            n_heads: 4,
            n_layers: 4,
            d_ff: 512,
            dropout_rate: 0.1,
            attention: AttentionKind::MultiHead,
            lora_rank: None,
            layer_norm_eps: default_eps(),
            seed: 0,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads.max(1)
    }

    /// Check that the sizes are usable together
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("max_seq_len", self.max_seq_len),
            ("d_model", self.d_model),
            ("n_heads", self.n_heads),
            ("n_layers", self.n_layers),
            ("d_ff", self.d_ff),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(Error::InvalidConfig(format!("{name} must be positive")));
        }
        if self.d_model % self.n_heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "d_model {} is not divisible by n_heads {}",
                self.d_model, self.n_heads
            )));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(Error::InvalidConfig(format!(
                "dropout_rate must be in [0, 1), got {}",
                self.dropout_rate
            )));
        }
        if self.lora_rank == Some(0) {
            return Err(Error::InvalidConfig("lora_rank must be positive".into()));
        }
        if self.layer_norm_eps <= 0.0 {
            return Err(Error::InvalidConfig("layer_norm_eps must be positive".into()));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        ModelConfig::tiny(32).validate().unwrap();
        ModelConfig::small(256).validate().unwrap();
        ModelConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        let mut c = ModelConfig::tiny(32);
        c.n_heads = 3;
        assert!(matches!(c.validate(), Err(Error::InvalidConfig(_))));

        let mut c = ModelConfig::tiny(32);
        c.dropout_rate = 1.0;
        assert!(c.validate().is_err());

        let mut c = ModelConfig::tiny(32);
        c.lora_rank = Some(0);
        assert!(c.validate().is_err());

        let mut c = ModelConfig::tiny(32);
        c.n_layers = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_json_defaults_optional_fields() {
        let json = r#"{
            "vocab_size": 10, "max_seq_len": 8, "d_model": 8,
            "n_heads": 2, "n_layers": 1, "d_ff": 16, "dropout_rate": 0.0
        }"#;
        let c = ModelConfig::from_json(json).unwrap();
        assert_eq!(c.attention, AttentionKind::MultiHead);
        assert_eq!(c.lora_rank, None);
        assert_eq!(c.layer_norm_eps, 1e-5);

        let mut mq = c.clone();
        mq.attention = AttentionKind::MultiQuery;
        mq.lora_rank = Some(2);
        let text = mq.to_json().unwrap();
        assert!(text.contains("\"multi_query\""));
        assert_eq!(ModelConfig::from_json(&text).unwrap(), mq);
    }
}
