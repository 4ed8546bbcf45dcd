//! Tisslm: a trainable transformer language model core
//!
//! A decoder-only transformer on top of a small dense tensor engine, with a
//! hand-derived backward pass for every layer and key/value-cached
//! incremental inference.
//!
//! # Modules
//!
//! - [`tensor`] - N-dimensional `f32` tensors: broadcasting, reductions, matmul
//! - [`parameter`] - Value/gradient pairs
//! - [`layers`] - Embedding, positional encoding, layer norm, dropout,
//!   feed-forward, attention (multi-head, multi-query, LoRA) and blocks
//! - [`model`] - The [`Model`] trait and [`TransformerModel`]
//! - [`loss`] - Cross-entropy over logits
//! - [`optim`] - AdamW and gradient clipping
//! - [`checkpoint`] - Binary parameter serialization
//! - [`config`] - Model hyperparameters
//!
//! # Example
//!
//! ```rust,no_run
//! use tisslm::{cross_entropy, AdamW, Model, ModelConfig, TransformerModel};
//!
//! let mut model = TransformerModel::new(ModelConfig::tiny(64))?;
//! let mut optimizer = AdamW::new(3e-3, 0.01);
//!
//! let inputs = vec![vec![1, 2, 3, 4]];
//! let targets = vec![vec![2, 3, 4, 5]];
//! for _ in 0..10 {
//!     model.zero_grad();
//!     let logits = model.forward(&inputs)?;
//!     let (loss, grad) = cross_entropy(&logits, &targets)?;
//!     model.backward(&grad)?;
//!     optimizer.step(&mut model.parameters_mut())?;
//!     println!("loss {loss:.4}");
//! }
//! # Ok::<(), tisslm::Error>(())
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod layers;
pub mod loss;
pub mod model;
pub mod optim;
pub mod parameter;
pub mod random;
pub mod tensor;

// Re-export main types for convenience
pub use config::{AttentionKind, ModelConfig};
pub use error::{Error, Result};
pub use layers::KvCache;
pub use loss::cross_entropy;
pub use model::{Model, TransformerModel};
pub use optim::{clip_grad_norm, grad_norm, AdamW};
pub use parameter::Parameter;
pub use tensor::{Axis, Tensor};
