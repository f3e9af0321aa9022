//! Core environment context trait for DroneGrid participants.

use async_trait::async_trait;
use rand_chacha::ChaCha8Rng;
use std::time::Duration;

/// The central interface for environment interaction.
///
/// Every component reads time and randomness through this trait so that the
/// supervisor's timing policy and the coordinator's placement logic can be
/// driven from tests with a paused clock and a fixed seed.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and a seeded ChaCha8 stream
#[async_trait]
pub trait GridContext: Send + Sync + 'static {
    /// Returns the monotonic time since context creation.
    ///
    /// Used for heartbeat bookkeeping and the coordinator's periodic timer.
    fn now(&self) -> Duration;

    /// Suspends execution for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Derives an independent, reproducible RNG stream.
    ///
    /// The implementation combines the master seed with `stream` so that
    /// each component gets its own sequence from a single run seed.
    fn derive_rng(&self, stream: u64) -> ChaCha8Rng;

    /// Returns the master seed (for logging/replay).
    fn seed(&self) -> u64;
}
