//! Environment abstraction for deterministic testing.
//!
//! Decouples core logic from system resources (time, randomness). Timeouts
//! and the rate limiter take time as method parameters, so tests drive a
//! manual clock and production uses the real one.

use std::time::Duration;

/// Abstract environment providing time and randomness.
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards within one execution context
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Production environments use `std::time::Instant`; tests use a
    /// virtual clock.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current monotonic time, for timeouts and the purge cycle.
    fn now(&self) -> Self::Instant;

    /// Current wall-clock time as Unix milliseconds.
    ///
    /// Packet timestamps and ban expiries are wall-clock values; everything
    /// duration-shaped uses [`Environment::now`] instead.
    fn unix_millis(&self) -> i64;

    /// Sleeps for the specified duration.
    ///
    /// The only async method in the trait; used by runtime glue, never by
    /// core logic.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`, e.g. for connection ids.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_le_bytes(bytes)
    }
}
