//! Filesystem watch on the gadget node.
//!
//! The kernel does not always deliver UVC_EVENT_DISCONNECT when the UVC
//! function is torn down; watching the node for attribute changes catches
//! the unlink. IN_DELETE_SELF is not delivered for V4L2 node removal, so
//! IN_ATTRIB is the signal and the caller re-checks that the path exists.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct NodeWatch {
    fd: OwnedFd,
    path: PathBuf,
}

impl NodeWatch {
    pub fn watch(path: &Path) -> io::Result<Self> {
        let raw = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let wd = unsafe { libc::inotify_add_watch(fd.as_raw_fd(), cpath.as_ptr(), libc::IN_ATTRIB) };
        if wd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd,
            path: path.to_path_buf(),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and discard pending inotify events; returns whether any were
    /// delivered.
    pub fn drain(&self) -> bool {
        let mut buf = [0u8; 4096];
        let mut seen = false;
        loop {
            let read = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            if read <= 0 {
                break;
            }
            debug!("drained {read} bytes of inotify events for {}", self.path.display());
            seen = true;
        }
        seen
    }

    /// Whether the watched node has disappeared from the filesystem.
    pub fn node_gone(&self) -> bool {
        !self.path.exists()
    }
}
