//! Deterministic RNG owned by a trace.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use siphasher::sip::SipHasher13;
use std::hash::Hasher;

/// Random number generator owned by a single trace.
///
/// Each trace carries exactly one `TraceRng`; every stochastic operation of
/// the trace draws from it, so replaying the same directives against the same
/// master seed reproduces the same graph. Independent traces (particles,
/// parallel chains) derive their seeds with [`substream_seed`] so their
/// streams never overlap.
#[derive(Debug, Clone)]
pub struct TraceRng {
    rng: StdRng,
    seed: u64,
}

impl TraceRng {
    /// Creates a generator from a master seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            seed,
        }
    }

    /// Returns the master seed the generator was last seeded with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Reseeds the generator, discarding its current stream position.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
        self.seed = seed;
    }

    /// Returns a mutable reference to the underlying generator.
    pub fn inner_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

impl RngCore for TraceRng {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.rng.try_fill_bytes(dest)
    }
}

/// Derives the deterministic seed for an independent trace substream.
///
/// SipHash-1-3 with fixed zero keys over `(master_seed, substream)`; stable
/// across platforms.
pub fn substream_seed(master_seed: u64, substream: u64) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write_u64(master_seed);
    hasher.write_u64(substream);
    hasher.finish()
}
