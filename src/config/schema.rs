//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the engine.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, execution model).
    pub listener: ListenerConfig,

    /// Event-loop model tuning.
    pub event_loop: EventLoopConfig,

    /// Worker-pool model tuning.
    pub worker_pool: WorkerPoolConfig,

    /// Ceilings applied to per-request execution strategies.
    pub strategy: StrategyConfig,

    /// Response framing.
    pub response: ResponseConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Which execution model serves connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServerMode {
    /// Readiness-driven shards, one thread each.
    #[default]
    EventLoop,
    /// Fixed worker tasks fed from a bounded queue.
    WorkerPool,
}

impl std::str::FromStr for ServerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event_loop" | "epoll" => Ok(Self::EventLoop),
            "worker_pool" | "std" => Ok(Self::WorkerPool),
            other => Err(format!("unsupported mode '{}'", other)),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:9999").
    pub bind_address: String,

    /// Execution model.
    pub mode: ServerMode,

    /// Maximum concurrent connections (worker-pool backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:9999".to_string(),
            mode: ServerMode::EventLoop,
            max_connections: 10_000,
        }
    }
}

/// Event-loop configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventLoopConfig {
    /// Number of independent loop shards.
    pub shards: usize,

    /// Size of each pooled read buffer in bytes.
    pub read_buffer_size: usize,

    /// Largest request (head + body) accepted before the connection is dropped.
    pub max_request_bytes: usize,

    /// Upper bound on a single poller wait, so shutdown is observed promptly.
    pub poll_timeout_ms: u64,

    /// Readiness events collected per wait.
    pub max_events: usize,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            shards: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            read_buffer_size: 4096,
            max_request_bytes: 1024 * 1024,
            poll_timeout_ms: 100,
            max_events: 256,
        }
    }
}

impl EventLoopConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Worker-pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks.
    pub workers: usize,

    /// Capacity of the accepted-connection queue.
    pub queue_depth: usize,

    /// A read that stays idle this long ends the read loop.
    pub quiet_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            queue_depth: 1 << 16,
            quiet_ms: 50,
        }
    }
}

impl WorkerPoolConfig {
    pub fn quiet(&self) -> Duration {
        Duration::from_millis(self.quiet_ms)
    }
}

/// Ceilings for handler-registered strategies.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Highest hop budget a strategy may request; -1 means no ceiling.
    pub max_ttl: i32,

    /// Longest timeout a strategy may request in milliseconds; 0 means no ceiling.
    pub max_timeout_ms: u64,

    /// Background threads allowed at once for async and timeout strategies;
    /// beyond it requests run inline on the caller. 0 means no ceiling.
    pub max_background_tasks: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            max_ttl: -1,
            max_timeout_ms: 0,
            max_background_tasks: 1024,
        }
    }
}

/// Response framing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResponseConfig {
    /// Version token written on every status line.
    pub version: String,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            version: "HTTP/1.1".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit one access event per finished request.
    pub access_log: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            access_log: true,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
