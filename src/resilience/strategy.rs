//! Per-request execution strategies.
//!
//! # Responsibilities
//! - Describe the policy a handler attaches to its request: hop budget (TTL),
//!   deadline, async offload, fusing and security gates
//! - Clamp requested values to the server's configured ceilings
//! - Track the runtime state of the policy (remaining hops, deadline)
//!
//! # Design Decisions
//! - Defaults (TTL -1, no timeout, sync, no gates) behave exactly like plain
//!   dispatch
//! - A strategy is armed the first time the dispatcher observes it; the
//!   deadline starts then, not when the handler built it
//! - Gates are evaluated before every hop; `first_check` lets a gate charge a
//!   request once
//! - The admitting gates are recorded on the request, not the strategy, so a
//!   handler replacing the strategy cannot orphan an admission
//! - Only gates that admitted a request hear about its outcome, once

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::StrategyConfig;
use crate::http::RequestContext;

/// A pre-dispatch check that can short-circuit a request.
pub trait Gate: Send + Sync {
    /// Label used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Return `true` to reject the request before its next hop.
    ///
    /// `first_check` is `false` once this gate has admitted the request,
    /// even under an earlier strategy.
    fn deny(&self, ctx: &RequestContext, first_check: bool) -> bool;

    /// Outcome of a request this gate admitted.
    fn record(&self, _status: u16) {}
}

/// Server-wide ceilings applied when a strategy is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyLimits {
    /// Highest hop budget; negative means no ceiling.
    pub max_ttl: i32,
    pub max_timeout: Option<Duration>,
}

impl Default for StrategyLimits {
    fn default() -> Self {
        Self {
            max_ttl: -1,
            max_timeout: None,
        }
    }
}

impl From<&StrategyConfig> for StrategyLimits {
    fn from(config: &StrategyConfig) -> Self {
        Self {
            max_ttl: config.max_ttl,
            max_timeout: (config.max_timeout_ms > 0)
                .then(|| Duration::from_millis(config.max_timeout_ms)),
        }
    }
}

/// Execution policy for one request.
#[derive(Clone)]
pub struct Strategy {
    ttl: i32,
    timeout: Option<Duration>,
    is_async: bool,
    fusing: Option<Arc<dyn Gate>>,
    security: Option<Arc<dyn Gate>>,

    armed: bool,
    deadline: Option<Instant>,
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            ttl: -1,
            timeout: None,
            is_async: false,
            fusing: None,
            security: None,
            armed: false,
            deadline: None,
        }
    }
}

impl Strategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hop budget counting the handler that attaches the strategy; -1 is unbounded.
    pub fn with_ttl(mut self, ttl: i32) -> Self {
        self.ttl = ttl;
        self
    }

    /// Deadline for the rest of the stack, measured from arming.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run the rest of the stack on a background task.
    pub fn with_async(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }

    pub fn with_fusing(mut self, gate: Arc<dyn Gate>) -> Self {
        self.fusing = Some(gate);
        self
    }

    pub fn with_security(mut self, gate: Arc<dyn Gate>) -> Self {
        self.security = Some(gate);
        self
    }

    pub fn ttl(&self) -> i32 {
        self.ttl
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Apply ceilings and start the deadline clock. Idempotent.
    pub(crate) fn arm(&mut self, limits: &StrategyLimits) {
        if self.armed {
            return;
        }
        self.armed = true;

        if limits.max_ttl >= 0 {
            self.ttl = if self.ttl < 0 {
                limits.max_ttl
            } else {
                self.ttl.min(limits.max_ttl)
            };
        }
        if let (Some(timeout), Some(max)) = (self.timeout, limits.max_timeout) {
            self.timeout = Some(timeout.min(max));
        }
        self.deadline = self.timeout.map(|t| Instant::now() + t);
    }

    /// Charge one hop. Returns `true` once the budget is spent.
    pub(crate) fn consume_hop(&mut self) -> bool {
        if self.ttl < 0 {
            return false;
        }
        if self.ttl > 0 {
            self.ttl -= 1;
        }
        self.ttl == 0
    }

    /// Evaluate both gates in order; returns the rejecting gate, if any.
    /// Admitting gates are recorded on `ctx`.
    pub(crate) fn check_gates(&self, ctx: &mut RequestContext) -> Option<GateKind> {
        let slots = [
            (GateKind::Fusing, &self.fusing),
            (GateKind::Security, &self.security),
        ];
        for (kind, slot) in slots {
            let Some(gate) = slot else { continue };
            let first = !ctx.has_admitted(gate);
            if gate.deny(ctx, first) {
                return Some(kind);
            }
            if first {
                ctx.admit_gate(Arc::clone(gate));
            }
        }
        None
    }

    pub(crate) fn gate_name(&self, kind: GateKind) -> &'static str {
        let gate = match kind {
            GateKind::Fusing => &self.fusing,
            GateKind::Security => &self.security,
        };
        gate.as_ref().map_or("unknown", |g| g.name())
    }
}

/// Which gate slot rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    Fusing,
    Security,
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strategy")
            .field("ttl", &self.ttl)
            .field("timeout", &self.timeout)
            .field("is_async", &self.is_async)
            .field("fusing", &self.fusing.as_ref().map(|g| g.name()))
            .field("security", &self.security.as_ref().map(|g| g.name()))
            .field("armed", &self.armed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting {
        deny: bool,
        checks: AtomicU32,
        recorded: AtomicU32,
    }

    impl Counting {
        fn new(deny: bool) -> Arc<Self> {
            Arc::new(Self {
                deny,
                checks: AtomicU32::new(0),
                recorded: AtomicU32::new(0),
            })
        }
    }

    impl Gate for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn deny(&self, _ctx: &RequestContext, _first_check: bool) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.deny
        }

        fn record(&self, _status: u16) {
            self.recorded.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn defaults_are_plain_dispatch() {
        let strategy = Strategy::new();
        assert_eq!(strategy.ttl(), -1);
        assert!(strategy.timeout().is_none());
        assert!(!strategy.is_async());
    }

    #[test]
    fn arming_clamps_to_limits() {
        let limits = StrategyLimits {
            max_ttl: 3,
            max_timeout: Some(Duration::from_millis(100)),
        };

        let mut unbounded = Strategy::new();
        unbounded.arm(&limits);
        assert_eq!(unbounded.ttl(), 3);
        assert!(unbounded.deadline().is_none());

        let mut strict = Strategy::new()
            .with_ttl(10)
            .with_timeout(Duration::from_secs(5));
        strict.arm(&limits);
        assert_eq!(strict.ttl(), 3);
        assert_eq!(strict.timeout(), Some(Duration::from_millis(100)));
        assert!(strict.deadline().is_some());
    }

    #[test]
    fn hop_budget_runs_out() {
        let mut strategy = Strategy::new().with_ttl(2);
        assert!(!strategy.consume_hop());
        assert!(strategy.consume_hop());
        assert!(strategy.consume_hop(), "stays spent");

        let mut unbounded = Strategy::new();
        for _ in 0..100 {
            assert!(!unbounded.consume_hop());
        }
    }

    #[test]
    fn only_admitting_gates_hear_outcomes() {
        let fusing = Counting::new(false);
        let security = Counting::new(true);
        let strategy = Strategy::new()
            .with_fusing(fusing.clone())
            .with_security(security.clone());

        let mut ctx = RequestContext::new();
        assert_eq!(strategy.check_gates(&mut ctx), Some(GateKind::Security));
        assert_eq!(strategy.gate_name(GateKind::Security), "counting");

        assert_eq!(fusing.checks.load(Ordering::SeqCst), 1);
        assert_eq!(security.checks.load(Ordering::SeqCst), 1);

        ctx.record_gate_outcomes(403);
        assert_eq!(fusing.recorded.load(Ordering::SeqCst), 1);
        assert_eq!(security.recorded.load(Ordering::SeqCst), 0);
    }

    struct FirstOnly {
        firsts: AtomicU32,
        recorded: AtomicU32,
    }

    impl Gate for FirstOnly {
        fn name(&self) -> &'static str {
            "first-only"
        }

        fn deny(&self, _ctx: &RequestContext, first_check: bool) -> bool {
            if first_check {
                self.firsts.fetch_add(1, Ordering::SeqCst);
            }
            false
        }

        fn record(&self, _status: u16) {
            self.recorded.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn admission_survives_strategy_replacement() {
        let gate = Arc::new(FirstOnly {
            firsts: AtomicU32::new(0),
            recorded: AtomicU32::new(0),
        });
        let mut ctx = RequestContext::new();

        let outer = Strategy::new().with_fusing(gate.clone());
        assert_eq!(outer.check_gates(&mut ctx), None);

        // A later handler swaps in a strategy with the same gate and another TTL.
        ctx.register_strategy(Strategy::new().with_ttl(10).with_fusing(gate.clone()));
        let inner = ctx.take_strategy().unwrap();
        assert_eq!(inner.check_gates(&mut ctx), None);
        assert_eq!(inner.check_gates(&mut ctx), None);

        // A strategy without gates still leaves the earlier admission in place.
        let bare = Strategy::new().with_async(true);
        assert_eq!(bare.check_gates(&mut ctx), None);

        ctx.record_gate_outcomes(200);
        assert_eq!(gate.firsts.load(Ordering::SeqCst), 1, "charged once per request");
        assert_eq!(gate.recorded.load(Ordering::SeqCst), 1, "outcome reported once");
    }

    #[test]
    fn limits_from_config() {
        let limits = StrategyLimits::from(&StrategyConfig {
            max_ttl: 5,
            max_timeout_ms: 0,
            ..StrategyConfig::default()
        });
        assert_eq!(limits.max_ttl, 5);
        assert!(limits.max_timeout.is_none());
    }
}
