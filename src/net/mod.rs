//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Event loop (event_loop.rs, shard.rs):
//!     shard 0 accepts → hash(peer) → owning shard
//!     → connection.rs (state machine: Connecting → Opened → Reading ⇄ Writing → Action)
//!     → engine::Dispatcher → response bytes queued on the connection
//!
//! Worker pool (worker_pool.rs):
//!     listener.rs (accept, connection limit) → bounded queue → worker
//!     → read until quiet → engine::Dispatcher → write → close
//! ```
//!
//! # Design Decisions
//! - Both models share the dispatcher, so handlers behave identically
//! - Every connection is counted for the active-connections gauge

pub mod connection;
pub mod event_loop;
pub mod listener;
pub mod shard;
pub mod worker_pool;

pub use connection::{ConnectionId, ConnectionTracker, Signal};
pub use event_loop::EventLoopServer;
pub use worker_pool::WorkerPoolServer;
