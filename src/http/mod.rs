//! HTTP layer: request and response contexts, abort records, wire codec.
//!
//! # Data Flow
//! ```text
//! raw bytes → codec::frame → codec::parse_into → RequestContext
//!     → dispatcher (handlers mutate ResponseContext / Abort)
//!     → ResponseContext::encode → output buffer
//! ```

pub mod abort;
pub mod codec;
pub mod request;
pub mod response;

pub use abort::{Abort, AbortMessage};
pub use request::{RequestContext, RequestSummary};
pub use response::ResponseContext;
