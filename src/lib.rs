//! stackserve: readiness-driven HTTP engine with a stack-based handler
//! dispatcher and per-request execution strategies.

// Core subsystems
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod net;
pub mod poller;
pub mod pool;
pub mod routing;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::ServerConfig;
pub use engine::Dispatcher;
pub use error::ServerError;
pub use http::RequestContext;
pub use lifecycle::Shutdown;
pub use net::{EventLoopServer, WorkerPoolServer};
pub use routing::{handler, Handler, Router};
