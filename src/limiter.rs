//! Adaptive rate limiter.
//!
//! Derives two numbers from the service tier and the circuit breaker's
//! current state: the minimum spacing between quota-consuming requests and
//! the recommended number of concurrent uploads.
//!
//! | Breaker state | Interval | Concurrency |
//! |---------------|----------|-------------|
//! | `Closed` | base | ramps +1 per `ramp_successes` successes, up to max |
//! | `HalfOpen` | base × 1.5 | min |
//! | `Open` | base × 3 | min (orchestrator dispatches nothing new) |
//!
//! Concurrency drops to the minimum the moment the breaker leaves `Closed`
//! and climbs back gradually afterwards.

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::breaker::{CallOutcome, CircuitBreaker, CircuitState};

/// Published request quota of the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceTier {
    Free,
    Tier1,
    Tier2,
    Tier3,
}

impl ServiceTier {
    pub fn requests_per_minute(&self) -> u32 {
        match self {
            ServiceTier::Free => 15,
            ServiceTier::Tier1 => 300,
            ServiceTier::Tier2 => 1000,
            ServiceTier::Tier3 => 2000,
        }
    }

    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(60_000 / self.requests_per_minute() as u64)
    }
}

impl FromStr for ServiceTier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(ServiceTier::Free),
            "tier1" => Ok(ServiceTier::Tier1),
            "tier2" => Ok(ServiceTier::Tier2),
            "tier3" => Ok(ServiceTier::Tier3),
            other => anyhow::bail!(
                "Unknown service tier: '{}'. Must be free, tier1, tier2, or tier3.",
                other
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub base_interval: Duration,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub ramp_successes: u32,
}

#[derive(Debug)]
struct Ramp {
    concurrency: usize,
    successes: u32,
}

pub struct RateLimiter {
    config: LimiterConfig,
    breaker: Arc<CircuitBreaker>,
    ramp: Mutex<Ramp>,
    next_slot: tokio::sync::Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig, breaker: Arc<CircuitBreaker>) -> Self {
        let ramp = Ramp {
            concurrency: config.max_concurrency.max(config.min_concurrency),
            successes: 0,
        };
        Self {
            config,
            breaker,
            ramp: Mutex::new(ramp),
            next_slot: tokio::sync::Mutex::new(Instant::now()),
        }
    }

    fn ramp(&self) -> std::sync::MutexGuard<'_, Ramp> {
        self.ramp.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Minimum spacing between quota-consuming requests right now.
    pub fn interval(&self) -> Duration {
        let base = self.config.base_interval;
        match self.breaker.state() {
            CircuitState::Closed => base,
            CircuitState::HalfOpen => base.mul_f64(1.5),
            CircuitState::Open => base * 3,
        }
    }

    /// Recommended number of concurrent uploads right now.
    pub fn concurrency(&self) -> usize {
        match self.breaker.state() {
            CircuitState::Closed => self.ramp().concurrency,
            CircuitState::HalfOpen | CircuitState::Open => self.config.min_concurrency,
        }
    }

    /// Wait for the next request slot.
    pub async fn pace(&self) {
        let interval = self.interval();
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + interval;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }

    /// Feed one call outcome into the concurrency ramp. The breaker has
    /// already seen it.
    pub fn observe(&self, outcome: CallOutcome) {
        let closed = self.breaker.state() == CircuitState::Closed;
        let mut ramp = self.ramp();
        if !closed || outcome == CallOutcome::RateLimited {
            if ramp.concurrency != self.config.min_concurrency {
                debug!(from = ramp.concurrency, "upload concurrency dropped to minimum");
            }
            ramp.concurrency = self.config.min_concurrency;
            ramp.successes = 0;
            return;
        }
        if outcome == CallOutcome::Success && ramp.concurrency < self.config.max_concurrency {
            ramp.successes += 1;
            if ramp.successes >= self.config.ramp_successes {
                ramp.concurrency += 1;
                ramp.successes = 0;
                debug!(to = ramp.concurrency, "upload concurrency ramped up");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;

    fn limiter(base: Duration) -> RateLimiter {
        let breaker = Arc::new(CircuitBreaker::new(
            "test",
            BreakerConfig {
                cooldown: Duration::from_secs(60),
                ..BreakerConfig::default()
            },
        ));
        RateLimiter::new(
            LimiterConfig {
                base_interval: base,
                min_concurrency: 1,
                max_concurrency: 4,
                ramp_successes: 2,
            },
            breaker,
        )
    }

    #[test]
    fn tiers_parse_and_order() {
        let free: ServiceTier = "free".parse().unwrap();
        let tier3: ServiceTier = "TIER3".parse().unwrap();
        assert!(free.base_interval() > tier3.base_interval());
        assert_eq!(free.base_interval(), Duration::from_secs(4));
        assert!("gold".parse::<ServiceTier>().is_err());
    }

    #[test]
    fn open_breaker_slows_and_narrows() {
        let l = limiter(Duration::from_millis(100));
        assert_eq!(l.interval(), Duration::from_millis(100));
        assert_eq!(l.concurrency(), 4);

        for _ in 0..3 {
            l.breaker().record(CallOutcome::RateLimited);
            l.observe(CallOutcome::RateLimited);
        }
        assert_eq!(l.breaker().state(), CircuitState::Open);
        assert_eq!(l.interval(), Duration::from_millis(300));
        assert_eq!(l.concurrency(), 1);
    }

    #[test]
    fn concurrency_ramps_back_gradually() {
        let l = limiter(Duration::ZERO);
        l.observe(CallOutcome::RateLimited);
        assert_eq!(l.concurrency(), 1);
        for _ in 0..2 {
            l.observe(CallOutcome::Success);
        }
        assert_eq!(l.concurrency(), 2);
        for _ in 0..10 {
            l.observe(CallOutcome::Success);
        }
        assert_eq!(l.concurrency(), 4);
    }

    #[tokio::test]
    async fn pace_spaces_requests() {
        let l = limiter(Duration::from_millis(20));
        let start = Instant::now();
        for _ in 0..4 {
            l.pace().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(60));
    }
}
