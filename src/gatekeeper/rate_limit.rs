use crate::config::ConfigError;
use governor::clock::{Clock, DefaultClock};
use governor::middleware::StateInformationMiddleware;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use serde::Serialize;
use std::num::NonZeroU32;
use std::time::Duration;

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock, StateInformationMiddleware>;

/// Outcome of [`ClientRateLimiter::protect`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub remaining_points: u32,
    /// Time until the next point becomes available; zero when allowed.
    pub ms_before_next: u64,
    /// Points consumed in the current window.
    pub total_hits: u32,
}

/// Token bucket per client key: a budget of `points` that refills
/// continuously over `duration`.
pub struct ClientRateLimiter {
    limiter: KeyedLimiter,
    points: u32,
    duration: Duration,
}

impl ClientRateLimiter {
    pub fn new(points: u32, duration: Duration) -> Result<Self, ConfigError> {
        let burst = NonZeroU32::new(points).ok_or(ConfigError::InvalidRateLimit)?;
        let quota = Quota::with_period(duration / points)
            .ok_or(ConfigError::InvalidRateLimit)?
            .allow_burst(burst);
        let limiter = RateLimiter::keyed(quota).with_middleware::<StateInformationMiddleware>();
        Ok(Self { limiter, points, duration })
    }

    pub fn points(&self) -> u32 {
        self.points
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Consumes `cost` points (at least one) from `key`'s bucket.
    pub fn protect(&self, key: &str, cost: u32) -> Decision {
        let key = key.to_string();
        let n = NonZeroU32::new(cost).unwrap_or(NonZeroU32::MIN);

        match self.limiter.check_key_n(&key, n) {
            Ok(Ok(snapshot)) => {
                let remaining = snapshot.remaining_burst_capacity();
                Decision {
                    allowed: true,
                    remaining_points: remaining,
                    ms_before_next: 0,
                    total_hits: self.points.saturating_sub(remaining),
                }
            }
            Ok(Err(not_until)) => Decision {
                allowed: false,
                remaining_points: 0,
                ms_before_next: not_until.wait_time_from(DefaultClock::default().now()).as_millis() as u64,
                total_hits: self.points,
            },
            // Cost larger than the whole budget can never pass
            Err(_) => Decision {
                allowed: false,
                remaining_points: 0,
                ms_before_next: self.duration.as_millis() as u64,
                total_hits: self.points,
            },
        }
    }

    /// Forgets buckets that have fully refilled.
    pub fn shrink(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }
}
