//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     RouterBuilder::register / group(prefix, handlers).register(...)
//!     → key = METHOD + normalized path
//!     → value = [ancestor group handlers..., route handlers...]
//!     → build() freezes an immutable Router
//!
//! Per request:
//!     Router::lookup(method, path) → &[Handler]
//!     → HandlerStack::load (pushed in reverse, pops in registration order)
//!     → miss → default 404 handler
//! ```
//!
//! # Design Decisions
//! - Routes compiled at startup, immutable at runtime (shared via `Arc`)
//! - Exact-match keys only: no wildcards, no regex
//! - Paths are case-folded and lose their trailing slash before lookup

pub mod handler;
pub mod router;
pub mod stack;

pub use handler::{handler, DefaultHandlers, Handler};
pub use router::{route_key, Group, Router, RouterBuilder};
pub use stack::HandlerStack;
