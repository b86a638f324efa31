//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Ctrl-C / test harness
//!     → Shutdown::trigger()
//!         → flag set          (shard loops check it every iteration)
//!         → wakers triggered  (blocked poller waits return at once)
//!         → broadcast sent    (async accept loops and workers stop)
//! ```
//!
//! # Design Decisions
//! - One coordinator serves both execution models
//! - Triggering is idempotent; late subscribers still observe it

pub mod shutdown;

pub use shutdown::Shutdown;
