//! Neural Network Layers
//!
//! Each trainable layer owns its [`Parameter`](crate::parameter::Parameter)s
//! and the activations its backward pass needs:
//!
//! ```rust,ignore
//! pub struct Layer {
//!     pub weight: Parameter,   // value + accumulated gradient
//!     cache: Option<Cache>,    // written by forward, read by backward
//! }
//!
//! impl Layer {
//!     pub fn forward(&mut self, x: &Tensor) -> Result<Tensor> { }
//!     pub fn backward(&mut self, grad: &Tensor) -> Result<Tensor> { }
//! }
//! ```
//!
//! A second `forward` overwrites the cache, so exactly one forward may be in
//! flight per layer. Backward adds into parameter gradients and returns the
//! gradient for the layer's input. Inference paths (`apply`,
//! `forward_incremental`) take `&self` and never touch the cache.
//!
//! ## Layers
//!
//! - **activation**: ReLU forward and backward
//! - **linear**: Fully connected layer and projection gradient helpers
//! - **layer_norm**: Layer normalization over 2D or 3D input
//! - **dropout**: Dropout regularization
//! - **embedding**: Token lookup table
//! - **positional**: Sinusoidal positional encoding
//! - **feed_forward**: Position-wise two-layer network
//! - **attention**: Multi-head / multi-query attention with LoRA and KV cache
//! - **block**: Complete transformer block

pub mod activation;
pub mod attention;
pub mod block;
pub mod dropout;
pub mod embedding;
pub mod feed_forward;
pub mod layer_norm;
pub mod linear;
pub mod positional;

// Re-export main types for convenience
pub use attention::{causal_mask, AttentionKind, KvCache, LoraAdapter, MultiHeadAttention};
pub use block::TransformerBlock;
pub use dropout::Dropout;
pub use embedding::Embedding;
pub use feed_forward::FeedForward;
pub use layer_norm::LayerNorm;
pub use linear::Linear;
pub use positional::PositionalEncoding;
