//! stackserve binary.
//!
//! # Architecture Overview
//!
//! ```text
//!   client ──▶ net (event loop shards | worker pool)
//!                 │  framed bytes
//!                 ▼
//!              http::codec ──▶ RequestContext (pooled)
//!                 │
//!                 ▼
//!              engine::Dispatcher ── routing::Router (stack seed)
//!                 │   hop by hop, under resilience::Strategy
//!                 │   (ttl, timeout, async, fusing/security gates)
//!                 ▼
//!              ResponseContext ──▶ codec::write_response ──▶ client
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use serde_json::json;

use stackserve::config::loader::{load_config, ConfigError};
use stackserve::config::validation::validate_config;
use stackserve::config::{ServerConfig, ServerMode};
use stackserve::observability::{logging, metrics};
use stackserve::resilience::{CircuitBreaker, RateLimiter, Strategy};
use stackserve::routing::{handler, Router};
use stackserve::{EventLoopServer, Shutdown, WorkerPoolServer};

#[derive(Debug, Parser)]
#[command(name = "stackserve", version, about = "Stack-dispatch HTTP engine")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Execution model: event_loop or worker_pool.
    #[arg(long)]
    mode: Option<ServerMode>,

    /// Bind address, e.g. 0.0.0.0:9999.
    #[arg(long)]
    bind: Option<String>,

    /// Event-loop shard count.
    #[arg(long)]
    shards: Option<usize>,

    /// Worker-pool worker count.
    #[arg(long)]
    workers: Option<usize>,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(mode) = self.mode {
            config.listener.mode = mode;
        }
        if let Some(bind) = &self.bind {
            config.listener.bind_address = bind.clone();
        }
        if let Some(shards) = self.shards {
            config.event_loop.shards = shards;
        }
        if let Some(workers) = self.workers {
            config.worker_pool.workers = workers;
        }
    }
}

#[derive(Debug, Deserialize)]
struct EchoRequest {
    message: String,
}

/// Demo routes: a health check plus a guarded `/v1` group.
fn build_router() -> Router {
    let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(10)));
    let limiter = Arc::new(RateLimiter::new(100.0, 200.0));

    let mut builder = Router::builder();
    builder.register(
        "GET",
        "/ping",
        [handler(|ctx| ctx.json(200, &json!({ "message": "pong" })))],
    );

    let guard = handler(move |ctx| {
        ctx.register_strategy(
            Strategy::new()
                .with_timeout(Duration::from_secs(2))
                .with_fusing(breaker.clone())
                .with_security(limiter.clone()),
        );
    });
    let mut v1 = builder.group("/v1", [guard]);
    v1.register(
        "GET",
        "/echo",
        [handler(|ctx| {
            let message = ctx.get_query("message", "hello").to_string();
            ctx.json(200, &json!({ "message": message }));
        })],
    );
    v1.register(
        "POST",
        "/echo",
        [handler(|ctx| match ctx.parse_body::<EchoRequest>() {
            Ok(body) => ctx.json(200, &json!({ "message": body.message })),
            Err(err) => ctx.abort(400, json!({ "error": err.to_string() })),
        })],
    );
    v1.register(
        "GET",
        "/slow",
        [
            handler(|ctx| ctx.register_strategy(Strategy::new().with_async(true))),
            handler(|ctx| {
                std::thread::sleep(Duration::from_millis(100));
                ctx.text(200, "done");
            }),
        ],
    );

    builder.build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    cli.apply(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init_logging(&config.observability.log_level);
    tracing::info!("stackserve v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        mode = ?config.listener.mode,
        shards = config.event_loop.shards,
        workers = config.worker_pool.workers,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(err) = metrics::init_metrics(addr) {
                    tracing::error!(error = %err, "Failed to start metrics endpoint");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let router = Arc::new(build_router());
    router.log_routes();

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.trigger();
        }
    });

    match config.listener.mode {
        ServerMode::EventLoop => {
            let server = EventLoopServer::bind(config, router, shutdown)?.on_detach(|_stream, peer| {
                tracing::info!(peer = %peer, "Connection detached; closing");
            });
            tokio::task::spawn_blocking(move || server.run()).await??;
        }
        ServerMode::WorkerPool => {
            let server = WorkerPoolServer::bind(config, router, shutdown).await?;
            server.run().await?;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
