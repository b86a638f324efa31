//! Request pipeline shared by both server models.
//!
//! # Data Flow
//! ```text
//! framed bytes → Dispatcher::prepare (pooled ctx, staged parse, 403 on failure)
//!     → Dispatcher::dispatch
//!         → seed stack (route handlers | default handler for abort / 404)
//!         → drive: gates → timeout race / async offload / one hop + TTL
//!         → complete (abort → response, gate outcomes, metrics, access log)
//!     → Ready(ctx) | Deferred (completion callback receives ctx later)
//!     → Dispatcher::encode → output bytes
//! ```

pub mod dispatcher;

pub use dispatcher::{Completion, Dispatched, Dispatcher};
