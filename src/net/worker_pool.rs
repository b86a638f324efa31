//! Worker-pool server: one async accept loop feeding a fixed set of workers.
//!
//! # Data Flow
//! ```text
//! Listener::accept (permit) ──▶ bounded queue ──▶ worker N
//!                                                  ├─ read until framed or quiet
//!                                                  ├─ dispatch on the blocking pool
//!                                                  ├─ await async completion if deferred
//!                                                  └─ write response, close
//! ```
//!
//! # Design Decisions
//! - One request per connection; the connection closes after the response
//! - Handlers are synchronous, so dispatch runs under `spawn_blocking` and
//!   never stalls the runtime
//! - A full queue applies backpressure to the accept loop

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::engine::{Completion, Dispatched, Dispatcher};
use crate::error::ServerError;
use crate::http::codec::{self, Frame};
use crate::http::RequestContext;
use crate::lifecycle::Shutdown;
use crate::net::connection::{ConnectionTracker, Signal};
use crate::net::listener::{ConnectionPermit, Listener, ListenerError};
use crate::pool::Pooled;
use crate::routing::Router;

/// Pause after a failed accept so fd exhaustion does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

struct Job {
    stream: TcpStream,
    peer: SocketAddr,
    permit: ConnectionPermit,
}

type Queue = Arc<Mutex<mpsc::Receiver<Job>>>;

/// Worker-pool server bound to its address but not yet running.
pub struct WorkerPoolServer {
    listener: Listener,
    dispatcher: Arc<Dispatcher>,
    config: ServerConfig,
    tracker: ConnectionTracker,
    shutdown: Shutdown,
}

impl WorkerPoolServer {
    pub async fn bind(config: ServerConfig, router: Arc<Router>, shutdown: Shutdown) -> Result<Self, ServerError> {
        let listener = Listener::bind(&config.listener).await?;
        let dispatcher = Arc::new(Dispatcher::new(router, &config));
        Ok(Self {
            listener,
            dispatcher,
            config,
            tracker: ConnectionTracker::new(),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Serve until shutdown, then let workers finish queued connections.
    pub async fn run(self) -> Result<(), ServerError> {
        let pool = &self.config.worker_pool;
        let (tx, rx) = mpsc::channel(pool.queue_depth.max(1));
        let queue: Queue = Arc::new(Mutex::new(rx));

        let workers: Vec<JoinHandle<()>> = (0..pool.workers.max(1))
            .map(|id| {
                let worker = Worker {
                    id,
                    queue: Arc::clone(&queue),
                    dispatcher: Arc::clone(&self.dispatcher),
                    tracker: self.tracker.clone(),
                    quiet: pool.quiet(),
                    max_request_bytes: self.config.event_loop.max_request_bytes,
                    read_buffer_size: self.config.event_loop.read_buffer_size,
                };
                tokio::spawn(worker.run())
            })
            .collect();

        tracing::info!(
            address = %self.local_addr()?,
            workers = workers.len(),
            queue_depth = pool.queue_depth,
            "Worker pool server started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        if tx.send(Job { stream, peer, permit }).await.is_err() {
                            break;
                        }
                    }
                    Err(ListenerError::Closed) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(tx);
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "Worker task failed");
            }
        }
        tracing::info!("Worker pool server stopped");
        Ok(())
    }
}

struct Worker {
    id: usize,
    queue: Queue,
    dispatcher: Arc<Dispatcher>,
    tracker: ConnectionTracker,
    quiet: Duration,
    max_request_bytes: usize,
    read_buffer_size: usize,
}

impl Worker {
    async fn run(self) {
        loop {
            let job = {
                let mut queue = self.queue.lock().await;
                queue.recv().await
            };
            let Some(job) = job else { break };
            let peer = job.peer;
            if let Err(err) = self.serve(job).await {
                tracing::debug!(worker = self.id, peer = %peer, error = %err, "Connection failed");
            }
        }
        tracing::debug!(worker = self.id, "Worker stopped");
    }

    async fn serve(&self, job: Job) -> io::Result<()> {
        let Job { mut stream, peer, permit } = job;
        let guard = self.tracker.track();

        let mut input = Vec::new();
        let mut chunk = vec![0u8; self.read_buffer_size.max(1)];
        let framed = loop {
            match tokio::time::timeout(self.quiet, stream.read(&mut chunk)).await {
                // Quiet period elapsed: take what arrived.
                Err(_) | Ok(Ok(0)) => break None,
                Ok(Ok(n)) => {
                    input.extend_from_slice(&chunk[..n]);
                    match codec::frame(&input, self.max_request_bytes) {
                        Ok(Frame::Incomplete) => continue,
                        Ok(Frame::Complete(len)) => break Some(Ok(len)),
                        Err(err) => break Some(Err(err)),
                    }
                }
                Ok(Err(err)) => return Err(err),
            }
        };
        if input.is_empty() {
            return Ok(());
        }

        let ctx = match framed {
            Some(Ok(len)) => self.dispatcher.prepare(&input[..len], Some(peer)),
            Some(Err(err)) => self.dispatcher.reject(&err, Some(peer)),
            None => self.dispatcher.prepare(&input, Some(peer)),
        };

        let mut ctx = dispatch_blocking(&self.dispatcher, ctx).await?;
        if ctx.signal() == Signal::Detach {
            tracing::debug!(connection_id = %guard.id(), "Detach is not supported by the worker pool; closing");
        }
        let bytes = self.dispatcher.encode(&mut ctx);
        stream.write_all(bytes).await?;
        stream.shutdown().await?;
        drop(permit);
        Ok(())
    }
}

/// Run a request on the blocking pool, following it into a background task
/// when the dispatcher defers it.
async fn dispatch_blocking(
    dispatcher: &Arc<Dispatcher>,
    ctx: Pooled<RequestContext>,
) -> io::Result<Pooled<RequestContext>> {
    let (tx, rx) = oneshot::channel();
    let dispatcher = Arc::clone(dispatcher);
    let outcome = tokio::task::spawn_blocking(move || {
        let completion: Completion = Box::new(move |ctx| {
            let _ = tx.send(ctx);
        });
        match dispatcher.dispatch(ctx, completion) {
            Dispatched::Ready(ctx) => Some(ctx),
            Dispatched::Deferred => None,
        }
    })
    .await
    .map_err(io::Error::other)?;

    match outcome {
        Some(ctx) => Ok(ctx),
        None => rx
            .await
            .map_err(|_| io::Error::other("async handler dropped its response")),
    }
}
