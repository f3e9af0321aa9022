//! Production implementation of GridContext using Tokio.

use crate::GridContext;
use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Production context backed by the Tokio clock and a seeded RNG.
///
/// Time comes from `tokio::time::Instant`, so a runtime started with a paused
/// clock (tests) sees virtual time.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,

    /// Master seed for every derived RNG stream
    seed: u64,
}

impl TokioContext {
    /// Creates a new TokioContext.
    ///
    /// A seed of 0 picks a random master seed.
    pub fn new(seed: u64) -> Self {
        let seed = if seed == 0 { rand::random::<u64>() | 1 } else { seed };
        Self {
            start: Instant::now(),
            seed,
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }
}

#[async_trait]
impl GridContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn derive_rng(&self, stream: u64) -> ChaCha8Rng {
        let combined = self.seed.wrapping_mul(0x517cc1b727220a95) ^ stream;
        ChaCha8Rng::seed_from_u64(combined)
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}
