//! IP admission control.
//!
//! The admission store decides, before any bytes are read, whether a peer
//! address may connect: whitelist short-circuit, then an ordered chain of
//! pluggable criteria, then the active ban map. The one concrete criterion
//! shipped here is the sliding-window rate limiter.

mod ratelimit;
mod store;

use std::net::IpAddr;

use async_trait::async_trait;

pub use ratelimit::{RateLimitConfig, SlidingWindowLimiter};
pub use store::{AdmissionStore, BanRecord, DEFAULT_BAN_MINUTES};

/// A pluggable policy that judges whether an address violates a rule.
///
/// Criteria are evaluated in registration order on every
/// [`AdmissionStore::check`]; the first violation bans the address and
/// stops the chain. The behavior set is closed: validate, clear, purge.
#[async_trait]
pub trait AdmissionCriterion: Send + Sync {
    /// Judge one request from `addr`. Returns `true` when the address
    /// violates the rule and must be banned.
    ///
    /// Awaitable so criteria may consult external state; the rate limiter
    /// is synchronous in practice.
    async fn validate(&self, addr: IpAddr, now_ms: i64) -> bool;

    /// Forget all state held for `addr` (called on unban).
    fn clear(&self, addr: IpAddr);

    /// Drop per-address state that can no longer influence a decision.
    fn purge_stale(&self, now_ms: i64);
}
