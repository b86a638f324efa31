//! Resilience subsystem: execution strategies and the gates they consult.
//!
//! # Data Flow
//! ```text
//! Handler calls ctx.register_strategy(Strategy::new().with_ttl(..)...)
//!     → dispatcher arms it (ceilings from config, deadline starts)
//!     → before every hop: fusing gate → security gate
//!     → timeout: task.rs runs the rest of the stack, caller races the deadline
//!     → async: task.rs runs the rest of the stack, caller returns at once
//!     → otherwise: one hop, one unit of TTL
//! ```
//!
//! # Design Decisions
//! - Cancellation is cooperative and only between handler invocations
//! - Every background task is tracked until it finishes
//! - Circuit breaker and rate limiter are ordinary `Gate` implementations

pub mod circuit_breaker;
pub mod rate_limit;
pub mod strategy;
pub mod task;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use rate_limit::RateLimiter;
pub use strategy::{Gate, GateKind, Strategy, StrategyLimits};
pub use task::{handoff, AsyncTask, CancelFlag, Handoff, HandoffWaiter, TaskTracker};
