use std::num::NonZeroU32;
use std::time::Duration;

use anyhow::Error;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use tokio_util::sync::CancellationToken;

/// The caller's cancellation token fired before a token was admitted.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("cancelled while waiting for rate limiter")]
pub struct Cancelled;

/// Token bucket admitting one request per `period`, burst of one.
pub struct RateLimiter {
    limiter: GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Result<Self, Error> {
        let quota = Quota::with_period(period)
            .ok_or_else(|| Error::msg("rate limit period must be non-zero"))?
            .allow_burst(NonZeroU32::MIN);

        Ok(RateLimiter {
            limiter: GovernorRateLimiter::direct(quota),
        })
    }

    /// Waits for an admission token, or returns `Cancelled` without consuming one.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("rate limiter wait cancelled");
                Err(Cancelled)
            }
            _ = self.limiter.until_ready() => Ok(()),
        }
    }
}
