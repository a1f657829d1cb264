//! Match-seeded random numbers.
//!
//! Every peer of a match receives the same seed. Generators are handed out
//! from a root stream, so the n-th generator created on one peer produces
//! the same sequence as the n-th generator created on any other peer.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Generator handed to simulation code.
pub type LockstepRng = ChaCha8Rng;

#[derive(Debug, Clone)]
pub struct RandomRoot {
    seed: u64,
    root: ChaCha8Rng,
    created: u64,
}

impl RandomRoot {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            root: ChaCha8Rng::seed_from_u64(seed),
            created: 0,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Generators created so far.
    pub fn created(&self) -> u64 {
        self.created
    }

    /// Next generator in creation order, seeded from the root stream.
    pub fn create_generator(&mut self) -> LockstepRng {
        self.created += 1;
        ChaCha8Rng::seed_from_u64(self.root.next_u64())
    }
}
