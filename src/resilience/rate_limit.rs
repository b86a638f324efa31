//! Per-client token bucket usable as a security gate.
//!
//! Buckets that have refilled to capacity are indistinguishable from new
//! ones, so they are swept every [`SWEEP_EVERY`] checks to keep the table
//! bounded by the set of recently active clients.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;

use crate::http::RequestContext;
use crate::resilience::strategy::Gate;

/// Checks between sweeps of refilled buckets.
pub const SWEEP_EVERY: u64 = 1024;

/// A simple token bucket.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn try_acquire(&mut self, capacity: f64, refill_rate: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn is_full(&self, now: Instant, capacity: f64, refill_rate: f64) -> bool {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens + elapsed * refill_rate >= capacity
    }
}

/// Limits each client IP to `rate` requests per second with bursts of `burst`.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
    rate: f64,
    burst: f64,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            rate,
            burst: burst.max(1.0),
            checks: AtomicU64::new(0),
        }
    }

    /// Take a token for `key`; `false` when the bucket is empty.
    pub fn check(&self, key: &str) -> bool {
        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep();
        }
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.burst))
            .try_acquire(self.burst, self.rate)
    }

    /// Drop buckets that have refilled to capacity. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| !bucket.is_full(now, self.burst, self.rate));
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            tracing::debug!(removed, remaining = self.buckets.len(), "Swept idle rate-limit buckets");
        }
        removed
    }

    /// Number of clients currently tracked.
    pub fn clients(&self) -> usize {
        self.buckets.len()
    }
}

impl Gate for RateLimiter {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    /// Charges the request once, on its first evaluation.
    fn deny(&self, ctx: &RequestContext, first_check: bool) -> bool {
        if !first_check {
            return false;
        }
        let key = ctx
            .client_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let allowed = self.check(&key);
        if !allowed {
            tracing::warn!(client = %key, "Rate limit exceeded");
        }
        !allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_reject() {
        let limiter = RateLimiter::new(0.0, 2.0);
        assert!(limiter.check("10.0.0.1"));
        assert!(limiter.check("10.0.0.1"));
        assert!(!limiter.check("10.0.0.1"));
        assert!(limiter.check("10.0.0.2"), "buckets are per client");
        assert_eq!(limiter.clients(), 2);
    }

    #[test]
    fn sweep_drops_only_refilled_buckets() {
        let limiter = RateLimiter::new(0.0, 1.0);
        assert!(limiter.check("drained"));
        assert_eq!(limiter.sweep(), 0);
        assert!(!limiter.check("drained"), "an empty bucket keeps its debt");

        let fast = RateLimiter::new(1000.0, 2.0);
        assert!(fast.check("10.0.0.1"));
        assert!(fast.check("10.0.0.2"));
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(fast.sweep(), 2);
        assert_eq!(fast.clients(), 0);
    }

    #[test]
    fn table_is_swept_periodically() {
        let limiter = RateLimiter::new(1_000_000.0, 1.0);
        for i in 0..SWEEP_EVERY - 1 {
            assert!(limiter.check(&format!("client-{i}")));
        }
        assert_eq!(limiter.clients(), (SWEEP_EVERY - 1) as usize);

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(limiter.check("last"));
        assert_eq!(limiter.clients(), 1);
    }

    #[test]
    fn request_is_charged_once() {
        let limiter = RateLimiter::new(0.0, 1.0);
        let ctx = RequestContext::new();
        assert!(!limiter.deny(&ctx, true));
        assert!(!limiter.deny(&ctx, false));
        assert!(limiter.deny(&ctx, true));
    }
}
