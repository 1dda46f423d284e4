//! Uniform user sampling for consistency audits.
//!
//! Algorithm R keeps at most `k` users from a stream of eligible users, each
//! with equal probability `k/n`. The generator is SplitMix64 so a fixed seed
//! reproduces the same sample, which lets an audit be rerun on the exact same
//! users.

use crate::model::UserId;

/// Reservoir of sampled users.
#[derive(Debug, Clone)]
pub struct UserSampler {
    reservoir: Vec<UserId>,
    capacity: usize,
    seen: u64,
    state: u64,
}

impl UserSampler {
    /// Sampler seeded from the thread RNG.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_seed(capacity, rand::random::<u64>())
    }

    /// Deterministic sampler. A zero capacity yields empty samples.
    #[must_use]
    pub fn with_seed(capacity: usize, seed: u64) -> Self {
        Self {
            reservoir: Vec::with_capacity(capacity.min(1_024)),
            capacity,
            seen: 0,
            state: seed,
        }
    }

    pub fn observe(&mut self, user: UserId) {
        self.seen += 1;
        if self.reservoir.len() < self.capacity {
            self.reservoir.push(user);
            return;
        }
        if self.capacity == 0 {
            return;
        }
        let slot = self.next_u64() % self.seen;
        if slot < self.capacity as u64 {
            self.reservoir[slot as usize] = user;
        }
    }

    #[must_use]
    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// Sampled users in ascending id order.
    #[must_use]
    pub fn into_sorted(mut self) -> Vec<UserId> {
        self.reservoir.sort_unstable();
        self.reservoir
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

/// Sample up to `size` users from `candidates`.
#[must_use]
pub fn sample_users(candidates: &[UserId], size: usize, seed: Option<u64>) -> Vec<UserId> {
    let mut sampler = match seed {
        Some(seed) => UserSampler::with_seed(size, seed),
        None => UserSampler::new(size),
    };
    for user in candidates {
        sampler.observe(*user);
    }
    sampler.into_sorted()
}
