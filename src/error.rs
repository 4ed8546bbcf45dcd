//! Error types for the tensor engine and transformer layers.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by tensor operations, layers and checkpoints.
#[derive(Error, Debug)]
pub enum Error {
    /// Two operands cannot be combined (broadcast, matmul, concatenate...).
    #[error("shape mismatch in {op}: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },

    /// A shape is malformed on its own (wrong rank, wrong element count).
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// Axis index outside the tensor rank.
    #[error("axis {axis} out of range for tensor of rank {rank}")]
    AxisOutOfRange { axis: isize, rank: usize },

    /// Element index outside a dimension.
    #[error("index {index} out of range for dimension of size {size}")]
    IndexOutOfRange { index: usize, size: usize },

    /// Token id not covered by the embedding table.
    #[error("token id {token} out of range for vocabulary of size {vocab_size}")]
    TokenOutOfRange { token: usize, vocab_size: usize },

    /// Requested positions exceed the precomputed positional table.
    #[error("sequence span {requested} exceeds maximum length {max_len}")]
    SequenceTooLong { requested: usize, max_len: usize },

    /// Operation exists but this configuration of it does not.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Model hyperparameters are inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Backward was called without a matching forward.
    #[error("{0}: backward called without a preceding forward")]
    MissingForwardCache(&'static str),

    /// Serialized parameters do not line up with the live model.
    #[error("checkpoint mismatch: {0}")]
    CheckpointMismatch(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn shape(op: &'static str, lhs: &[usize], rhs: &[usize]) -> Self {
        Error::ShapeMismatch {
            op,
            lhs: lhs.to_vec(),
            rhs: rhs.to_vec(),
        }
    }
}
