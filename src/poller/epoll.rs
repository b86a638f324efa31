//! epoll backend with an eventfd wake channel.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use super::{cvt, Poll, Waker};

const READ: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
const READ_WRITE: u32 = READ | libc::EPOLLOUT as u32;

/// Level-triggered epoll instance.
pub struct EpollPoller {
    epfd: OwnedFd,
    wake: Arc<WakeHandle>,
    events: Vec<libc::epoll_event>,
}

/// Non-blocking eventfd registered for reads on the owning epoll instance.
pub(crate) struct WakeHandle {
    fd: OwnedFd,
}

impl WakeHandle {
    pub(crate) fn trigger(&self) -> io::Result<()> {
        let value: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: a wake is already pending.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    fn drain(&self) {
        let mut value: u64 = 0;
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl EpollPoller {
    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        cvt(unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) })?;
        Ok(())
    }
}

impl Poll for EpollPoller {
    fn with_capacity(max_events: usize) -> io::Result<Self> {
        let raw = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let epfd = unsafe { OwnedFd::from_raw_fd(raw) };

        let raw = cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        let wake = Arc::new(WakeHandle {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        });

        let poller = Self {
            epfd,
            wake,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        };
        poller.ctl(libc::EPOLL_CTL_ADD, poller.wake.fd.as_raw_fd(), READ)?;
        Ok(poller)
    }

    fn register_read(&mut self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, READ)
    }

    fn register_read_write(&mut self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, READ_WRITE)
    }

    fn upgrade_to_read_write(&mut self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, READ_WRITE)
    }

    fn downgrade_to_read(&mut self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, READ)
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    fn wait(&mut self, ready: &mut Vec<RawFd>, timeout: Option<Duration>) -> io::Result<usize> {
        ready.clear();

        // Round up so sub-millisecond timeouts do not turn into a busy loop.
        let timeout_ms = timeout
            .map(|d| {
                let ms = (d.as_nanos() + 999_999) / 1_000_000;
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            })
            .unwrap_or(-1);

        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let wake_fd = self.wake.fd.as_raw_fd();
        for event in &self.events[..n as usize] {
            let fd = event.u64 as RawFd;
            if fd == wake_fd {
                self.wake.drain();
            } else {
                ready.push(fd);
            }
        }
        Ok(ready.len())
    }

    fn waker(&self) -> Waker {
        Waker::new(Arc::clone(&self.wake))
    }
}
