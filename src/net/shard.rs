//! One event-loop shard: a poller, the connections it owns, and an inbox.
//!
//! # Data Flow
//! ```text
//! poller.wait ──▶ [fd...] ──▶ execute(fd)
//!                               ├─ listener fd  → accept → hash(peer) → own table or peer inbox
//!                               ├─ Connecting   → open
//!                               ├─ Writing      → flush
//!                               ├─ ActionPending→ Close | Detach | Shutdown
//!                               └─ Opened/Reading → read → frame → dispatch → queue
//! inbox (Adopt | Reply) ◀── other shards, background tasks (+ waker)
//! ```
//!
//! # Design Decisions
//! - A connection never leaves its shard; cross-thread traffic goes through
//!   the inbox, so the connection table needs no lock
//! - Pipelined requests are answered in order: while an async reply is
//!   outstanding, further buffered frames wait
//! - Replies carry the connection ID; a reply for a recycled descriptor is
//!   dropped
//! - Per-connection I/O failures close that connection only

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::config::EventLoopConfig;
use crate::engine::{Completion, Dispatched, Dispatcher};
use crate::error::ServerError;
use crate::http::codec::{self, Frame};
use crate::http::RequestContext;
use crate::lifecycle::Shutdown;
use crate::net::connection::{Connection, ConnectionId, ConnectionState, ConnectionTracker, Signal};
use crate::poller::{is_transient, Poll, Poller, Waker};
use crate::pool::{Pool, Pooled, ReadBuffer};

/// Receives detached sockets, already back in blocking mode.
pub type DetachHandler = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;

/// Idle read buffers kept per shard.
const MAX_IDLE_BUFFERS: usize = 64;

/// Cross-thread work for a shard.
pub enum ShardMessage {
    /// A connection accepted elsewhere that hashes to this shard.
    Adopt { stream: TcpStream, peer: SocketAddr },
    /// A finished async response.
    Reply {
        fd: RawFd,
        id: ConnectionId,
        bytes: Vec<u8>,
        signal: Signal,
    },
}

/// Sending side of a shard's inbox.
#[derive(Clone)]
pub struct ShardHandle {
    index: usize,
    tx: Sender<ShardMessage>,
    waker: Waker,
}

impl ShardHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Queue a message and wake the shard. Returns `false` once the shard
    /// has stopped.
    pub fn send(&self, message: ShardMessage) -> bool {
        if self.tx.send(message).is_err() {
            return false;
        }
        if let Err(err) = self.waker.trigger() {
            tracing::warn!(shard = self.index, error = %err, "Failed to wake shard");
        }
        true
    }
}

/// Create a shard's poller and inbox.
pub fn channel(index: usize, max_events: usize) -> Result<(ShardHandle, Poller, Receiver<ShardMessage>), ServerError> {
    let poller = Poller::with_capacity(max_events).map_err(ServerError::Poller)?;
    let (tx, rx) = crossbeam_channel::unbounded();
    let handle = ShardHandle {
        index,
        tx,
        waker: poller.waker(),
    };
    Ok((handle, poller, rx))
}

/// Pick the shard that owns a peer.
pub fn shard_for(peer: &SocketAddr, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    peer.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// Everything a shard shares with its siblings.
#[derive(Clone)]
pub struct ShardContext {
    pub dispatcher: Arc<Dispatcher>,
    pub config: EventLoopConfig,
    pub tracker: ConnectionTracker,
    pub shutdown: Shutdown,
    pub on_detach: Option<DetachHandler>,
}

pub struct Shard {
    handle: ShardHandle,
    poller: Poller,
    inbox: Receiver<ShardMessage>,
    listener: Option<(TcpListener, Vec<ShardHandle>)>,
    connections: HashMap<RawFd, Connection>,
    buffers: Pool<ReadBuffer>,
    shared: ShardContext,
}

impl Shard {
    pub fn new(handle: ShardHandle, poller: Poller, inbox: Receiver<ShardMessage>, shared: ShardContext) -> Self {
        let buffer_size = shared.config.read_buffer_size;
        Self {
            handle,
            poller,
            inbox,
            listener: None,
            connections: HashMap::new(),
            buffers: Pool::new(MAX_IDLE_BUFFERS, move || ReadBuffer::with_capacity(buffer_size)),
            shared,
        }
    }

    /// Make this shard the acceptor. `peers` is indexed by shard number and
    /// includes this shard's own handle.
    pub fn accept_from(&mut self, listener: TcpListener, peers: Vec<ShardHandle>) -> Result<(), ServerError> {
        listener.set_nonblocking(true)?;
        self.poller.register_read(listener.as_raw_fd())?;
        self.listener = Some((listener, peers));
        Ok(())
    }

    pub fn index(&self) -> usize {
        self.handle.index
    }

    /// Run until shutdown. Only a failing `wait` ends the loop early.
    pub fn run(mut self) -> Result<(), ServerError> {
        tracing::info!(shard = self.index(), "Shard started");
        let timeout = Some(self.shared.config.poll_timeout());
        let mut ready = Vec::with_capacity(self.shared.config.max_events);

        let result = loop {
            if self.shared.shutdown.is_triggered() {
                break Ok(());
            }
            if let Err(err) = self.poller.wait(&mut ready, timeout) {
                tracing::error!(shard = self.index(), error = %err, "Poller wait failed");
                // One dead shard takes the whole server down.
                self.shared.shutdown.trigger();
                break Err(ServerError::Poller(err));
            }
            self.drain_inbox();
            for &fd in &ready {
                self.execute(fd);
            }
        };

        let open = self.connections.len();
        for (fd, _) in self.connections.drain() {
            let _ = self.poller.deregister(fd);
        }
        tracing::info!(shard = self.index(), closed = open, "Shard stopped");
        result
    }

    fn drain_inbox(&mut self) {
        while let Ok(message) = self.inbox.try_recv() {
            match message {
                ShardMessage::Adopt { stream, peer } => self.adopt(stream, peer),
                ShardMessage::Reply { fd, id, bytes, signal } => self.on_reply(fd, id, &bytes, signal),
            }
        }
    }

    /// Act on one ready descriptor according to its connection state.
    fn execute(&mut self, fd: RawFd) {
        if self.is_listener(fd) {
            self.accept();
            return;
        }
        let Some(conn) = self.connections.get(&fd) else {
            tracing::trace!(shard = self.index(), fd, "Event for unknown descriptor");
            return;
        };

        let result = match conn.state() {
            ConnectionState::Connecting => self.open(fd),
            ConnectionState::Writing => self.flush(fd),
            ConnectionState::ActionPending => self.act(fd),
            ConnectionState::Opened | ConnectionState::Reading => self.read(fd),
        };
        if let Err(err) = result {
            tracing::debug!(shard = self.index(), fd, error = %err, "Connection failed");
            self.close(fd);
        }
    }

    fn is_listener(&self, fd: RawFd) -> bool {
        matches!(&self.listener, Some((listener, _)) if listener.as_raw_fd() == fd)
    }

    fn accept(&mut self) {
        loop {
            let accepted = match &self.listener {
                Some((listener, _)) => listener.accept(),
                None => return,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(err) if is_transient(&err) => return,
                Err(err) => {
                    // Typically EMFILE; the listener stays registered and
                    // the next wait retries.
                    tracing::warn!(shard = self.index(), error = %err, "Accept failed");
                    return;
                }
            };

            let Some((_, peers)) = &self.listener else { return };
            let target = shard_for(&peer, peers.len());
            if target == self.index() {
                self.adopt(stream, peer);
            } else if !peers[target].send(ShardMessage::Adopt { stream, peer }) {
                tracing::warn!(shard = target, peer = %peer, "Target shard stopped, dropping connection");
            }
        }
    }

    fn adopt(&mut self, stream: TcpStream, peer: SocketAddr) {
        let conn = match Connection::new(stream, peer, self.shared.tracker.track()) {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(peer = %peer, error = %err, "Failed to configure accepted socket");
                return;
            }
        };
        let fd = conn.fd();
        if let Err(err) = self.poller.register_read_write(fd) {
            tracing::warn!(peer = %peer, error = %err, "Failed to register connection");
            return;
        }
        tracing::debug!(shard = self.index(), connection_id = %conn.id(), peer = %peer, "Connection adopted");
        self.connections.insert(fd, conn);
    }

    fn open(&mut self, fd: RawFd) -> io::Result<()> {
        if let Some(conn) = self.connections.get_mut(&fd) {
            conn.mark_opened();
        }
        self.sync_interest(fd)
    }

    fn flush(&mut self, fd: RawFd) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(&fd) else {
            return Ok(());
        };
        if conn.write_pending()? {
            self.sync_interest(fd)?;
        }
        Ok(())
    }

    fn act(&mut self, fd: RawFd) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(&fd) else {
            return Ok(());
        };
        match conn.signal() {
            Signal::Close => {
                self.close(fd);
                Ok(())
            }
            Signal::Detach => self.detach(fd),
            Signal::Shutdown | Signal::None => {
                conn.clear_signal();
                self.sync_interest(fd)
            }
        }
    }

    fn read(&mut self, fd: RawFd) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(&fd) else {
            return Ok(());
        };
        let mut buffer = self.buffers.get();
        let outcome = conn.read_available(&mut buffer)?;
        drop(buffer);

        if outcome.bytes > 0 {
            self.process(fd);
        }

        if outcome.eof {
            let Some(conn) = self.connections.get_mut(&fd) else {
                return Ok(());
            };
            if conn.is_awaiting_reply() {
                // Level-triggered EOF would fire on every wait; stay out of
                // the poller until the reply arrives.
                conn.set_signal(Signal::Close);
                conn.set_parked(true);
                self.poller.deregister(fd)?;
                return Ok(());
            } else if conn.has_output() {
                conn.set_signal(Signal::Close);
            } else {
                self.close(fd);
                return Ok(());
            }
        }
        self.sync_interest(fd)
    }

    /// Dispatch every complete request buffered on `fd`, in order.
    fn process(&mut self, fd: RawFd) {
        let max_request_bytes = self.shared.config.max_request_bytes;
        let shard = self.index();
        loop {
            let Some(conn) = self.connections.get_mut(&fd) else {
                return;
            };
            if conn.is_awaiting_reply() || conn.signal() != Signal::None {
                // Input cannot be framed until the pending response goes out.
                if conn.input.len() > max_request_bytes {
                    tracing::warn!(
                        shard,
                        peer = %conn.peer(),
                        buffered = conn.input.len(),
                        limit = max_request_bytes,
                        "Blocked input over limit, closing after pending response"
                    );
                    conn.input.clear();
                    if conn.signal() == Signal::None {
                        conn.set_signal(Signal::Close);
                    }
                }
                return;
            }
            let peer = Some(conn.peer());
            let ctx = match codec::frame(&conn.input, max_request_bytes) {
                Ok(Frame::Incomplete) => return,
                Ok(Frame::Complete(n)) => {
                    let ctx = self.shared.dispatcher.prepare(&conn.input[..n], peer);
                    conn.input.drain(..n);
                    ctx
                }
                Err(err) => {
                    conn.input.clear();
                    self.shared.dispatcher.reject(&err, peer)
                }
            };
            self.run_request(fd, ctx);
        }
    }

    fn run_request(&mut self, fd: RawFd, ctx: Pooled<RequestContext>) {
        let Some(id) = self.connections.get(&fd).map(Connection::id) else {
            return;
        };
        let completion = self.completion(fd, id);
        match self.shared.dispatcher.dispatch(ctx, completion) {
            Dispatched::Ready(mut ctx) => {
                let signal = ctx.signal();
                let bytes = self.shared.dispatcher.encode(&mut ctx);
                if let Some(conn) = self.connections.get_mut(&fd) {
                    conn.queue(bytes);
                    conn.set_signal(signal);
                }
            }
            Dispatched::Deferred => {
                if let Some(conn) = self.connections.get_mut(&fd) {
                    conn.set_awaiting_reply(true);
                }
            }
        }
    }

    fn completion(&self, fd: RawFd, id: ConnectionId) -> Completion {
        let handle = self.handle.clone();
        let dispatcher = Arc::clone(&self.shared.dispatcher);
        Box::new(move |mut ctx: Pooled<RequestContext>| {
            let signal = ctx.signal();
            let bytes = dispatcher.encode(&mut ctx).to_vec();
            if !handle.send(ShardMessage::Reply { fd, id, bytes, signal }) {
                tracing::debug!(connection_id = %id, "Shard gone, dropping async response");
            }
        })
    }

    fn on_reply(&mut self, fd: RawFd, id: ConnectionId, bytes: &[u8], signal: Signal) {
        let Some(conn) = self.connections.get_mut(&fd).filter(|conn| conn.id() == id) else {
            tracing::debug!(connection_id = %id, "Dropping response for closed connection");
            return;
        };
        conn.queue(bytes);
        conn.set_signal(signal);
        conn.set_awaiting_reply(false);
        if conn.is_parked() {
            conn.set_parked(false);
            conn.set_write_interest(true);
            if let Err(err) = self.poller.register_read_write(fd) {
                tracing::debug!(fd, error = %err, "Failed to re-register connection");
                self.close(fd);
                return;
            }
        }
        self.process(fd);
        if let Err(err) = self.sync_interest(fd) {
            tracing::debug!(fd, error = %err, "Failed to update interest");
            self.close(fd);
        }
    }

    /// Keep write interest exactly while there is something to write or act on.
    fn sync_interest(&mut self, fd: RawFd) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(&fd) else {
            return Ok(());
        };
        let wanted = conn.wants_write();
        if wanted == conn.write_interest() {
            return Ok(());
        }
        if wanted {
            self.poller.upgrade_to_read_write(fd)?;
        } else {
            self.poller.downgrade_to_read(fd)?;
        }
        conn.set_write_interest(wanted);
        Ok(())
    }

    fn close(&mut self, fd: RawFd) {
        if let Some(conn) = self.connections.remove(&fd) {
            if conn.is_parked() {
                return;
            }
            if let Err(err) = self.poller.deregister(fd) {
                tracing::trace!(fd, error = %err, "Deregister failed");
            }
            tracing::debug!(shard = self.index(), connection_id = %conn.id(), "Connection closed");
        }
    }

    fn detach(&mut self, fd: RawFd) -> io::Result<()> {
        let Some(conn) = self.connections.remove(&fd) else {
            return Ok(());
        };
        self.poller.deregister(fd)?;
        let id = conn.id();
        let (stream, peer) = conn.into_blocking_stream()?;
        match &self.shared.on_detach {
            Some(on_detach) => {
                tracing::debug!(connection_id = %id, peer = %peer, "Connection detached");
                on_detach(stream, peer);
            }
            None => tracing::warn!(connection_id = %id, "Detach requested without a handler; closing"),
        }
        Ok(())
    }
}
