//! Per-access seed generation.
//!
//! Every dataset access draws one seed; transforms derive all of their
//! randomness from it. Drawing is lock-free: an atomic counter is advanced
//! and mixed with a base seed through SplitMix64, which is a bijection on
//! `u64`, so two draws from one sequence never return the same seed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Source of per-access seeds. Implementations must be safe to call from
/// many threads at once.
pub trait SeedSource: Send + Sync + std::fmt::Debug {
    /// Draw the next seed, advancing the source.
    fn next_seed(&self) -> u64;
}

/// Counter-based seed sequence.
#[derive(Debug)]
pub struct SeedSequence {
    base: u64,
    counter: AtomicU64,
}

impl SeedSequence {
    /// Deterministic sequence for `base`.
    pub fn new(base: u64) -> Self {
        Self {
            base,
            counter: AtomicU64::new(0),
        }
    }

    /// Sequence seeded from the OS entropy source.
    pub fn from_entropy() -> Self {
        Self::new(rand::random())
    }

    /// Base seed of this sequence.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Number of seeds drawn so far.
    pub fn draws(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Seed at position `n`, without advancing.
    pub fn seed_at(&self, n: u64) -> u64 {
        splitmix64(self.base.wrapping_add(n.wrapping_mul(GOLDEN_GAMMA)))
    }
}

impl SeedSource for SeedSequence {
    fn next_seed(&self) -> u64 {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.seed_at(n)
    }
}

/// Replays a fixed list of seeds, cycling when exhausted. Meant for tests and
/// for reproducing a recorded run.
#[derive(Debug)]
pub struct ScriptedSeeds {
    seeds: Vec<u64>,
    position: Mutex<usize>,
}

impl ScriptedSeeds {
    /// Replay `seeds` in order. An empty list always yields 0.
    pub fn new(seeds: Vec<u64>) -> Self {
        Self {
            seeds,
            position: Mutex::new(0),
        }
    }
}

impl SeedSource for ScriptedSeeds {
    fn next_seed(&self) -> u64 {
        if self.seeds.is_empty() {
            return 0;
        }
        let mut pos = self
            .position
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let seed = self.seeds[*pos % self.seeds.len()];
        *pos += 1;
        seed
    }
}

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// SplitMix64 finalizer.
pub fn splitmix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Derive an independent sub-seed, e.g. one per transform stage.
pub fn derive_seed(seed: u64, stream: u64) -> u64 {
    splitmix64(seed ^ splitmix64(stream.wrapping_add(GOLDEN_GAMMA)))
}
