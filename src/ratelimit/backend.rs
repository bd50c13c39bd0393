//! Rate limiter trait for abstracting the decision engine from the HTTP gate.

use async_trait::async_trait;

use super::limiter::{Decision, RateLimiter};

/// Trait for rate limiter implementations.
///
/// The HTTP gate only needs a decision per resolved identity, so it is
/// generic over this trait rather than tied to [`RateLimiter`].
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Decide whether `identity` at `tier` may make a request now.
    async fn decide(&self, identity: &str, tier: u8) -> Decision;
}

#[async_trait]
impl RateLimiterBackend for RateLimiter {
    async fn decide(&self, identity: &str, tier: u8) -> Decision {
        RateLimiter::decide(self, identity, tier).await
    }
}
