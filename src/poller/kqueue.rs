//! kqueue backend with an `EVFILT_USER` wake channel.
//!
//! Interest changes are queued and submitted together with the next wait.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use super::{cvt, Poll, Waker};

const WAKE_IDENT: usize = 0;

fn change(ident: usize, filter: i16, flags: u16, fflags: u32) -> libc::kevent {
    // Field layout differs between the BSDs; zeroing covers the extras.
    let mut event: libc::kevent = unsafe { std::mem::zeroed() };
    event.ident = ident as _;
    event.filter = filter as _;
    event.flags = flags as _;
    event.fflags = fflags as _;
    event
}

/// kqueue instance plus its pending change list.
pub struct KqueuePoller {
    kq: Arc<OwnedFd>,
    changes: Vec<libc::kevent>,
    events: Vec<libc::kevent>,
}

// SAFETY: the only raw pointer in `kevent` is `udata`, which is never set
// or dereferenced by this backend.
unsafe impl Send for KqueuePoller {}

pub(crate) struct WakeHandle {
    kq: Arc<OwnedFd>,
}

impl WakeHandle {
    pub(crate) fn trigger(&self) -> io::Result<()> {
        let event = change(WAKE_IDENT, libc::EVFILT_USER, 0, libc::NOTE_TRIGGER);
        cvt(unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                &event,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        })?;
        Ok(())
    }
}

impl KqueuePoller {
    fn queue(&mut self, fd: RawFd, filter: i16, flags: u16) {
        self.changes.push(change(fd as usize, filter, flags, 0));
    }
}

impl Poll for KqueuePoller {
    fn with_capacity(max_events: usize) -> io::Result<Self> {
        let raw = cvt(unsafe { libc::kqueue() })?;
        let kq = Arc::new(unsafe { OwnedFd::from_raw_fd(raw) });
        cvt(unsafe { libc::fcntl(kq.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) })?;

        let wake = change(
            WAKE_IDENT,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_CLEAR,
            0,
        );
        cvt(unsafe {
            libc::kevent(
                kq.as_raw_fd(),
                &wake,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        })?;

        let empty = change(0, 0, 0, 0);
        Ok(Self {
            kq,
            changes: Vec::new(),
            events: vec![empty; max_events.max(1)],
        })
    }

    fn register_read(&mut self, fd: RawFd) -> io::Result<()> {
        self.queue(fd, libc::EVFILT_READ, libc::EV_ADD);
        Ok(())
    }

    fn register_read_write(&mut self, fd: RawFd) -> io::Result<()> {
        self.queue(fd, libc::EVFILT_READ, libc::EV_ADD);
        self.queue(fd, libc::EVFILT_WRITE, libc::EV_ADD);
        Ok(())
    }

    fn upgrade_to_read_write(&mut self, fd: RawFd) -> io::Result<()> {
        self.queue(fd, libc::EVFILT_WRITE, libc::EV_ADD);
        Ok(())
    }

    fn downgrade_to_read(&mut self, fd: RawFd) -> io::Result<()> {
        self.queue(fd, libc::EVFILT_WRITE, libc::EV_DELETE);
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.queue(fd, libc::EVFILT_READ, libc::EV_DELETE);
        self.queue(fd, libc::EVFILT_WRITE, libc::EV_DELETE);
        Ok(())
    }

    fn wait(&mut self, ready: &mut Vec<RawFd>, timeout: Option<Duration>) -> io::Result<usize> {
        ready.clear();

        let timespec = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let timespec_ptr = timespec
            .as_ref()
            .map_or(ptr::null(), |t| t as *const libc::timespec);

        let n = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                self.changes.as_ptr(),
                self.changes.len() as libc::c_int,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timespec_ptr,
            )
        };
        // The change list is applied before events are collected, even when
        // the wait itself is interrupted.
        self.changes.clear();

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for event in &self.events[..n as usize] {
            if event.flags & libc::EV_ERROR != 0 {
                // Deleting a filter that was never added lands here.
                tracing::trace!(
                    ident = event.ident as usize,
                    errno = event.data as i64,
                    "Skipping kqueue change error"
                );
                continue;
            }
            if event.filter == libc::EVFILT_USER {
                continue;
            }
            let fd = event.ident as RawFd;
            if !ready.contains(&fd) {
                ready.push(fd);
            }
        }
        Ok(ready.len())
    }

    fn waker(&self) -> Waker {
        Waker::new(Arc::new(WakeHandle {
            kq: Arc::clone(&self.kq),
        }))
    }
}
