//! Production Environment implementation using system time and RNG.
//!
//! `SystemEnv` backs the core's environment seam with real clocks and OS
//! cryptographic randomness. Production behavior is therefore
//! non-deterministic; deterministic tests provide their own environment.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use packline_core::Environment;

/// Production environment: real monotonic time, wall clock, and getrandom.
///
/// The RNG uses OS-level entropy (`/dev/urandom` on Linux). If the OS
/// entropy source fails — effectively never outside broken containers — id
/// generation degrades to a clock-derived value rather than taking the
/// server down; connection ids are identifiers, not secrets.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0)
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        if getrandom::fill(buffer).is_err() {
            // Entropy source unavailable: degrade to clock-derived bytes.
            let fallback = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_nanos())
                .unwrap_or(0)
                .to_le_bytes();
            for (i, byte) in buffer.iter_mut().enumerate() {
                *byte = fallback[i % fallback.len()].wrapping_add(i as u8);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_time_advances() {
        let env = SystemEnv::new();
        let t0 = env.now();
        let t1 = env.now();
        assert!(t1 >= t0);
    }

    #[test]
    fn unix_millis_is_plausible() {
        let env = SystemEnv::new();
        // After 2020, before 2100.
        let ms = env.unix_millis();
        assert!(ms > 1_577_836_800_000);
        assert!(ms < 4_102_444_800_000);
    }

    #[test]
    fn random_u64_varies() {
        let env = SystemEnv::new();
        let a = env.random_u64();
        let b = env.random_u64();
        assert_ne!(a, b);
    }
}
