//! Readiness-driven server: N shards, each a thread with its own poller.
//!
//! Shard 0 also owns the listening socket and routes every accepted
//! connection to a shard chosen by hashing the peer address.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use crate::config::ServerConfig;
use crate::engine::Dispatcher;
use crate::error::ServerError;
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::bind_std;
use crate::net::shard::{self, DetachHandler, Shard, ShardContext};
use crate::poller::Poll;
use crate::routing::Router;

/// Event-loop server bound to its address but not yet running.
pub struct EventLoopServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    config: ServerConfig,
    tracker: ConnectionTracker,
    shutdown: Shutdown,
    on_detach: Option<DetachHandler>,
}

impl EventLoopServer {
    /// Bind the configured address. Nothing is served until [`run`](Self::run).
    pub fn bind(config: ServerConfig, router: Arc<Router>, shutdown: Shutdown) -> Result<Self, ServerError> {
        let listener = bind_std(&config.listener.bind_address)?;
        let dispatcher = Arc::new(Dispatcher::new(router, &config));
        Ok(Self {
            listener,
            dispatcher,
            config,
            tracker: ConnectionTracker::new(),
            shutdown,
            on_detach: None,
        })
    }

    /// Receive connections whose handler set `Signal::Detach`.
    pub fn on_detach<F>(mut self, handler: F) -> Self
    where
        F: Fn(TcpStream, SocketAddr) + Send + Sync + 'static,
    {
        self.on_detach = Some(Arc::new(handler));
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared live-connection counter.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Serve until shutdown. Shard 0 runs on the calling thread.
    pub fn run(self) -> Result<(), ServerError> {
        let shards = self.config.event_loop.shards.max(1);
        let shared = ShardContext {
            dispatcher: Arc::clone(&self.dispatcher),
            config: self.config.event_loop.clone(),
            tracker: self.tracker.clone(),
            shutdown: self.shutdown.clone(),
            on_detach: self.on_detach.clone(),
        };

        let mut handles = Vec::with_capacity(shards);
        let mut parts = Vec::with_capacity(shards);
        for index in 0..shards {
            let (handle, poller, inbox) = shard::channel(index, self.config.event_loop.max_events)?;
            self.shutdown.register_waker(poller.waker());
            handles.push(handle.clone());
            parts.push(Shard::new(handle, poller, inbox, shared.clone()));
        }

        let mut parts = parts.into_iter();
        let Some(mut acceptor) = parts.next() else {
            return Ok(());
        };
        acceptor.accept_from(self.listener, handles)?;

        tracing::info!(
            address = %self.config.listener.bind_address,
            shards,
            "Event loop server started"
        );

        let mut threads = Vec::with_capacity(shards - 1);
        for shard in parts {
            let name = format!("stackserve-shard-{}", shard.index());
            match thread::Builder::new().name(name).spawn(move || shard.run()) {
                Ok(thread) => threads.push(thread),
                Err(err) => {
                    self.shutdown.trigger();
                    join_all(threads);
                    return Err(ServerError::Io(err));
                }
            }
        }

        let result = acceptor.run();
        self.shutdown.trigger();
        let joined = join_all(threads);
        result.and(joined)
    }
}

fn join_all(threads: Vec<thread::JoinHandle<Result<(), ServerError>>>) -> Result<(), ServerError> {
    let mut first_error = Ok(());
    for thread in threads {
        match thread.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if first_error.is_ok() {
                    first_error = Err(err);
                }
            }
            Err(_) => tracing::error!("Shard thread panicked"),
        }
    }
    first_error
}
