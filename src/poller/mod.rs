//! Readiness multiplexer abstraction.
//!
//! # Data Flow
//! ```text
//! shard thread                         any thread
//!     register_* / downgrade / deregister
//!     wait(&mut ready, timeout) ◀──────── Waker::trigger()
//!         → [fd, fd, ...]  (wake events are consumed internally)
//! ```
//!
//! # Design Decisions
//! - One trait, two backends picked at compile time (epoll, kqueue)
//! - Both backends are level-triggered; kqueue batches interest changes and
//!   commits them on the next `wait`, epoll applies them immediately
//! - `EINTR` from `wait` is reported as "nothing ready", never as an error
//! - Each readiness report carries a descriptor once, even when kqueue
//!   reports read and write filters separately
//! - Closing is `Drop`: the multiplexer and wake descriptors are `OwnedFd`s

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
mod kqueue;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use epoll::EpollPoller as Poller;
#[cfg(any(target_os = "linux", target_os = "android"))]
use epoll::WakeHandle;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
pub use kqueue::KqueuePoller as Poller;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
use kqueue::WakeHandle;

/// Uniform interface over the platform multiplexers.
pub trait Poll: Sized + Send {
    /// Create the multiplexer and its wake channel.
    ///
    /// Failure here is fatal for the server that asked for it.
    fn with_capacity(max_events: usize) -> io::Result<Self>;

    /// Start watching `fd` for readability.
    fn register_read(&mut self, fd: RawFd) -> io::Result<()>;

    /// Start watching `fd` for readability and writability.
    fn register_read_write(&mut self, fd: RawFd) -> io::Result<()>;

    /// Add write interest to an already registered `fd`.
    fn upgrade_to_read_write(&mut self, fd: RawFd) -> io::Result<()>;

    /// Drop write interest, keeping read interest.
    fn downgrade_to_read(&mut self, fd: RawFd) -> io::Result<()>;

    /// Stop watching `fd` entirely.
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Block until descriptors are ready, a wake is triggered, or `timeout`
    /// elapses. `ready` is cleared and refilled; returns how many were added.
    fn wait(&mut self, ready: &mut Vec<RawFd>, timeout: Option<Duration>) -> io::Result<usize>;

    /// A handle other threads use to interrupt `wait`.
    fn waker(&self) -> Waker;
}

/// Cross-thread wake handle for one poller.
#[derive(Clone)]
pub struct Waker {
    inner: Arc<WakeHandle>,
}

impl Waker {
    pub(crate) fn new(inner: Arc<WakeHandle>) -> Self {
        Self { inner }
    }

    /// Interrupt the owning poller's current or next `wait`.
    pub fn trigger(&self) -> io::Result<()> {
        self.inner.trigger()
    }
}

impl std::fmt::Debug for Waker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waker").finish_non_exhaustive()
    }
}

/// True for errors a non-blocking caller should simply retry later.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Convert a libc return value into an `io::Result`.
pub(crate) fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Instant;

    const SHORT: Option<Duration> = Some(Duration::from_millis(50));

    #[test]
    fn readable_descriptor_is_reported() {
        let mut poller = Poller::with_capacity(16).unwrap();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();

        poller.register_read(rx.as_raw_fd()).unwrap();
        let mut ready = Vec::new();
        assert_eq!(poller.wait(&mut ready, SHORT).unwrap(), 0);

        tx.write_all(b"ping").unwrap();
        poller.wait(&mut ready, SHORT).unwrap();
        assert_eq!(ready, vec![rx.as_raw_fd()]);
    }

    #[test]
    fn write_interest_follows_upgrade_and_downgrade() {
        let mut poller = Poller::with_capacity(16).unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = a.as_raw_fd();

        poller.register_read_write(fd).unwrap();
        let mut ready = Vec::new();
        poller.wait(&mut ready, SHORT).unwrap();
        assert_eq!(ready, vec![fd], "fresh socket is writable once");

        poller.downgrade_to_read(fd).unwrap();
        poller.wait(&mut ready, SHORT).unwrap();
        assert!(ready.is_empty());

        poller.upgrade_to_read_write(fd).unwrap();
        poller.wait(&mut ready, SHORT).unwrap();
        assert_eq!(ready, vec![fd]);
    }

    #[test]
    fn deregistered_descriptor_is_silent() {
        let mut poller = Poller::with_capacity(16).unwrap();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        poller.register_read(rx.as_raw_fd()).unwrap();
        poller.deregister(rx.as_raw_fd()).unwrap();

        tx.write_all(b"ignored").unwrap();
        let mut ready = Vec::new();
        assert_eq!(poller.wait(&mut ready, SHORT).unwrap(), 0);
    }

    #[test]
    fn trigger_interrupts_an_unbounded_wait() {
        let mut poller = Poller::with_capacity(16).unwrap();
        let waker = poller.waker();

        let started = Instant::now();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            waker.trigger().unwrap();
        });

        let mut ready = Vec::new();
        assert_eq!(poller.wait(&mut ready, None).unwrap(), 0);
        assert!(started.elapsed() < Duration::from_secs(5));
        trigger.join().unwrap();
    }

    #[test]
    fn transient_errors_are_classified() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::BrokenPipe)));
    }
}
