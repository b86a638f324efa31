//! Per-descriptor connection state and lifecycle tracking.
//!
//! # Responsibilities
//! - Own one accepted socket plus its pending input and output bytes
//! - Derive the state the event loop acts on from those buffers
//! - Generate unique connection IDs for tracing and reply routing
//! - Count live connections for the whole server
//!
//! # States
//! ```text
//! Connecting ──first event──▶ Opened ──read──▶ Reading
//!                               │                │
//!                  response queued ▼              ▼
//!                            Writing ──drained──▶ Reading
//!                               │
//!                 signal set ───▼
//!                          ActionPending ──▶ Close | Detach | (Shutdown: back to Reading)
//! ```
//!
//! # Design Decisions
//! - State is computed, never stored, so it cannot drift from the buffers
//! - A connection is owned by exactly one shard; nothing here is shared
//! - The `ConnectionGuard` rides inside the connection, so dropping the
//!   connection is the only way to release its slot

use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::observability::metrics;
use crate::pool::ReadBuffer;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
///
/// Descriptors are recycled by the kernel; the ID tells a late reply for a
/// closed connection apart from one for a new connection on the same fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Control signal attached to a connection by a handler or the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Signal {
    #[default]
    None,
    /// Deregister and hand the socket, in blocking mode, to the detach callback.
    Detach,
    /// Tear the connection down once pending output is written.
    Close,
    /// Reserved; cleared without effect.
    Shutdown,
}

/// What the event loop should do with a connection on its next event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, waiting for the first readiness event.
    Connecting,
    /// First event seen, nothing read yet.
    Opened,
    /// Output is pending.
    Writing,
    /// A signal is pending and output is drained.
    ActionPending,
    /// Default: read more input.
    Reading,
}

/// Bytes moved by one read pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub bytes: usize,
    /// The peer closed its write side.
    pub eof: bool,
}

/// One accepted client socket.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    pub(crate) input: Vec<u8>,
    output: Vec<u8>,
    opened: bool,
    served: u64,
    signal: Signal,
    awaiting_reply: bool,
    write_interest: bool,
    parked: bool,
    _guard: ConnectionGuard,
}

impl Connection {
    /// Wrap an accepted stream, switching it to non-blocking mode.
    pub fn new(stream: TcpStream, peer: SocketAddr, guard: ConnectionGuard) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            id: guard.id(),
            stream,
            peer,
            input: Vec::new(),
            output: Vec::new(),
            opened: false,
            served: 0,
            signal: Signal::None,
            awaiting_reply: false,
            write_interest: true,
            parked: false,
            _guard: guard,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        if !self.opened {
            ConnectionState::Connecting
        } else if !self.output.is_empty() {
            ConnectionState::Writing
        } else if self.signal != Signal::None && !self.awaiting_reply {
            ConnectionState::ActionPending
        } else if self.served == 0 && self.input.is_empty() {
            ConnectionState::Opened
        } else {
            ConnectionState::Reading
        }
    }

    pub fn mark_opened(&mut self) {
        self.opened = true;
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Record a signal; `Signal::None` never overrides a pending one.
    pub fn set_signal(&mut self, signal: Signal) {
        if signal != Signal::None {
            self.signal = signal;
        }
    }

    pub fn clear_signal(&mut self) {
        self.signal = Signal::None;
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Queue a serialised response.
    pub fn queue(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
        self.served += 1;
    }

    pub fn is_awaiting_reply(&self) -> bool {
        self.awaiting_reply
    }

    pub fn set_awaiting_reply(&mut self, awaiting: bool) {
        self.awaiting_reply = awaiting;
    }

    /// Write interest is needed for pending output, or for a pending
    /// signal once no async reply is outstanding.
    pub fn wants_write(&self) -> bool {
        self.has_output() || (self.signal != Signal::None && !self.awaiting_reply)
    }

    /// Removed from the poller while the peer is gone but a reply is due.
    pub fn is_parked(&self) -> bool {
        self.parked
    }

    pub fn set_parked(&mut self, parked: bool) {
        self.parked = parked;
    }

    pub fn write_interest(&self) -> bool {
        self.write_interest
    }

    pub fn set_write_interest(&mut self, enabled: bool) {
        self.write_interest = enabled;
    }

    /// Read until the socket would block, appending to the input buffer.
    ///
    /// A read that fills `buffer` exactly may have left data behind, so it
    /// is followed by another read.
    pub fn read_available(&mut self, buffer: &mut ReadBuffer) -> io::Result<ReadOutcome> {
        let mut outcome = ReadOutcome {
            bytes: 0,
            eof: false,
        };
        loop {
            match buffer.read_from(&mut self.stream) {
                Ok(0) => {
                    outcome.eof = true;
                    return Ok(outcome);
                }
                Ok(n) => {
                    self.input.extend_from_slice(buffer.filled());
                    outcome.bytes += n;
                    if !buffer.is_full() {
                        return Ok(outcome);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(outcome),
                Err(err) => return Err(err),
            }
        }
    }

    /// Write as much pending output as the socket accepts.
    /// Returns `true` once everything is written.
    pub fn write_pending(&mut self) -> io::Result<bool> {
        let mut written = 0;
        let result = loop {
            if written == self.output.len() {
                break Ok(true);
            }
            match self.stream.write(&self.output[written..]) {
                Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break Ok(false),
                Err(err) => break Err(err),
            }
        };
        self.output.drain(..written);
        result
    }

    /// Give up the socket, restoring blocking mode.
    pub fn into_blocking_stream(self) -> io::Result<(TcpStream, SocketAddr)> {
        self.stream.set_nonblocking(false)?;
        Ok((self.stream, self.peer))
    }
}

/// Tracks live connections across all shards.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        let count = self.active_count.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_active_connections(count);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id: ConnectionId::new(),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let count = self.active_count.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::set_active_connections(count);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    fn pair(tracker: &ConnectionTracker) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (Connection::new(server, peer, tracker.track()).unwrap(), client)
    }

    #[test]
    fn connection_id_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn tracker_counts_live_connections() {
        let tracker = ConnectionTracker::new();
        let (conn, _client) = pair(&tracker);
        assert_eq!(tracker.active_count(), 1);
        drop(conn);
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn state_follows_buffers_and_signal() {
        let tracker = ConnectionTracker::new();
        let (mut conn, _client) = pair(&tracker);

        assert_eq!(conn.state(), ConnectionState::Connecting);
        conn.mark_opened();
        assert_eq!(conn.state(), ConnectionState::Opened);

        conn.queue(b"HTTP/1.1 200\r\n\r\n");
        assert_eq!(conn.state(), ConnectionState::Writing);

        assert!(conn.write_pending().unwrap());
        assert_eq!(conn.state(), ConnectionState::Reading);

        conn.set_signal(Signal::Close);
        conn.set_signal(Signal::None);
        assert_eq!(conn.state(), ConnectionState::ActionPending);
        assert!(conn.wants_write());

        conn.set_awaiting_reply(true);
        assert_eq!(conn.state(), ConnectionState::Reading);
        assert!(!conn.wants_write(), "the signal waits for the async reply");
    }

    #[test]
    fn reads_everything_available_and_sees_eof() {
        let tracker = ConnectionTracker::new();
        let (mut conn, mut client) = pair(&tracker);

        client.write_all(&[b'x'; 100]).unwrap();
        drop(client);
        std::thread::sleep(std::time::Duration::from_millis(50));

        let mut buffer = ReadBuffer::with_capacity(64);
        let outcome = conn.read_available(&mut buffer).unwrap();
        assert_eq!(outcome.bytes, 100, "a full buffer triggers another read");
        assert!(outcome.eof);
        assert_eq!(conn.input.len(), 100);
    }

    #[test]
    fn detached_stream_is_blocking_again() {
        let tracker = ConnectionTracker::new();
        let (conn, _client) = pair(&tracker);
        let (stream, _) = conn.into_blocking_stream().unwrap();
        stream
            .set_read_timeout(Some(std::time::Duration::from_millis(10)))
            .unwrap();
        let mut byte = [0u8; 1];
        let err = (&stream).read(&mut byte).unwrap_err();
        // Blocking mode times out instead of returning WouldBlock immediately.
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));
    }
}
