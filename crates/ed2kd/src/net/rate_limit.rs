//! Connection and message throttling.
//!
//! Two independent limits, each disabled by a zero rate:
//! - new connections per source IP, checked by the accept loop;
//! - frames per connection, checked by the server loop before dispatch.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// New connections per IP per second (0 = disabled).
    pub conn_per_ip_per_sec: u32,
    /// Frames per connection per second (0 = disabled).
    pub msg_per_conn_per_sec: u32,
    /// Burst allowance as a multiple of the per-second rate.
    pub burst_multiplier: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            conn_per_ip_per_sec: 10,
            msg_per_conn_per_sec: 100,
            burst_multiplier: 3,
        }
    }
}

impl RateLimitConfig {
    /// Both limits off.
    pub fn disabled() -> Self {
        Self {
            conn_per_ip_per_sec: 0,
            msg_per_conn_per_sec: 0,
            burst_multiplier: 1,
        }
    }

    /// Quota for `per_sec`, or `None` when that limit is disabled.
    fn quota(&self, per_sec: u32) -> Option<Quota> {
        let rate = NonZeroU32::new(per_sec)?;
        let burst = NonZeroU32::new(per_sec.saturating_mul(self.burst_multiplier.max(1)))?;
        Some(Quota::per_second(rate).allow_burst(burst))
    }
}

/// Per source IP connection limiter, shared by the accept loop.
pub struct IpRateLimiter {
    limiters: DashMap<IpAddr, DefaultDirectRateLimiter>,
    quota: Option<Quota>,
}

impl IpRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            limiters: DashMap::new(),
            quota: config.quota(config.conn_per_ip_per_sec),
        }
    }

    /// `true` if a new connection from `ip` may proceed.
    pub fn check(&self, ip: IpAddr) -> bool {
        let Some(quota) = self.quota else {
            return true;
        };
        self.limiters
            .entry(ip)
            .or_insert_with(|| RateLimiter::direct(quota))
            .check()
            .is_ok()
    }

    /// Forget arbitrary entries once more than `max_entries` IPs are tracked.
    pub fn cleanup_stale(&self, max_entries: usize) {
        let excess = self.limiters.len().saturating_sub(max_entries);
        if excess == 0 {
            return;
        }
        let victims: Vec<IpAddr> = self.limiters.iter().take(excess).map(|e| *e.key()).collect();
        for ip in victims {
            self.limiters.remove(&ip);
        }
    }

    pub fn tracked(&self) -> usize {
        self.limiters.len()
    }
}

/// Frame limiter owned by a single session.
#[derive(Clone)]
pub struct ConnRateLimiter {
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl ConnRateLimiter {
    /// `None` when per-connection limiting is disabled.
    pub fn new(config: &RateLimitConfig) -> Option<Self> {
        let quota = config.quota(config.msg_per_conn_per_sec)?;
        Some(Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    pub fn check(&self) -> bool {
        self.limiter.check().is_ok()
    }
}
