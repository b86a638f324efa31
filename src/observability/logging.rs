//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber
//! - Emit one access event per finished request
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured level when set
//! - Access events use their own target (`stackserve::access`) so they can be
//!   filtered independently

use std::time::Instant;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::http::RequestContext;

pub const ACCESS_TARGET: &str = "stackserve::access";

/// Install the global subscriber. Later calls are ignored.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Emit the access event for a finished request.
pub fn log_access(ctx: &RequestContext, status: u16, received_at: Instant) {
    let client = ctx
        .client_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "-".to_string());
    tracing::info!(
        target: ACCESS_TARGET,
        request_id = %ctx.request_id(),
        method = %ctx.method(),
        path = %ctx.path(),
        status,
        client = %client,
        latency_us = received_at.elapsed().as_micros() as u64,
        "Request completed"
    );
}
