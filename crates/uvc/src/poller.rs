//! Level-triggered fd readiness over epoll.

use smallvec::SmallVec;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Readiness classes a caller can register interest in.
pub struct Interest;

impl Interest {
    pub const READABLE: u32 = libc::EPOLLIN as u32;
    pub const PRIORITY: u32 = libc::EPOLLPRI as u32;
    pub const WRITABLE: u32 = libc::EPOLLOUT as u32;
}

/// One ready fd with the readiness classes that fired.
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub fd: RawFd,
    pub events: u32,
}

const MAX_EVENTS: usize = 8;

/// Upper bound on one wait, chosen so a 15 fps stream can still pump a
/// dequeue even when no event arrives.
const WAIT_MS: libc::c_int = 66;

/// Thin epoll wrapper with a bounded wait.
pub struct Poller {
    epoll: OwnedFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    /// Change the interest set for an fd.
    ///
    /// Implemented as remove + add: the UVC gadget event fd rejects
    /// in-place EPOLL_CTL_MOD on some kernels.
    pub fn modify(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.remove(fd)?;
        self.add(fd, events)
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait for readiness, at most 66 ms. An interrupted wait returns an
    /// empty set.
    pub fn wait(&self) -> io::Result<SmallVec<[PollEvent; MAX_EVENTS]>> {
        let mut raw: [libc::epoll_event; MAX_EVENTS] =
            unsafe { std::mem::zeroed() };
        let count = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                raw.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                WAIT_MS,
            )
        };
        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(SmallVec::new());
            }
            return Err(err);
        }
        Ok(raw[..count as usize]
            .iter()
            .map(|event| PollEvent {
                fd: event.u64 as RawFd,
                events: event.events,
            })
            .collect())
    }
}
