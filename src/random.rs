//! Explicit random context
//!
//! Every stochastic operation in the crate (weight initialization, random
//! tensors, dropout masks) draws from a generator supplied by the caller.
//! Two models built from the same seed are bit-identical, and so are the
//! dropout masks they draw.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Create a deterministic generator from a seed.
pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Derive an independent child generator from a parent.
///
/// Used when a module needs to own a generator (dropout) while still being
/// reproducible from the caller's seed.
pub fn fork<R: Rng + ?Sized>(rng: &mut R) -> StdRng {
    StdRng::seed_from_u64(rng.gen())
}
