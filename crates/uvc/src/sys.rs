//! Raw kernel interface: the V4L2/UVC structs and ioctls the `v4l` crate
//! does not model, plus a mmap wrapper for gadget buffers.
//!
//! Struct layouts mirror `linux/videodev2.h` and `linux/usb/g_uvc.h` for
//! 64-bit targets; the ioctl numbers encode the struct sizes, so layout
//! mismatches fail loudly with ENOTTY instead of corrupting memory.

#![allow(non_camel_case_types)]

use std::io;
use std::os::fd::RawFd;

pub const V4L2_BUF_TYPE_VIDEO_OUTPUT: u32 = 2;
pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_EVENT_ALL: u32 = 0;

/// UVC gadget events are private V4L2 events.
pub const V4L2_EVENT_PRIVATE_START: u32 = 0x0800_0000;
pub const UVC_EVENT_CONNECT: u32 = V4L2_EVENT_PRIVATE_START;
pub const UVC_EVENT_DISCONNECT: u32 = V4L2_EVENT_PRIVATE_START + 1;
pub const UVC_EVENT_STREAMON: u32 = V4L2_EVENT_PRIVATE_START + 2;
pub const UVC_EVENT_STREAMOFF: u32 = V4L2_EVENT_PRIVATE_START + 3;
pub const UVC_EVENT_SETUP: u32 = V4L2_EVENT_PRIVATE_START + 4;
pub const UVC_EVENT_DATA: u32 = V4L2_EVENT_PRIVATE_START + 5;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_requestbuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_buffer_m {
    pub offset: u32,
    pub userptr: libc::c_ulong,
    pub fd: i32,
}

#[repr(C)]
pub struct v4l2_buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: v4l2_timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: v4l2_buffer_m,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_event_subscription {
    pub type_: u32,
    pub id: u32,
    pub flags: u32,
    pub reserved: [u32; 5],
}

/// Event payload union; `align` forces the kernel's 8-byte alignment.
#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_event_u {
    pub data: [u8; 64],
    pub align: u64,
}

#[repr(C)]
pub struct v4l2_event {
    pub type_: u32,
    pub u: v4l2_event_u,
    pub pending: u32,
    pub sequence: u32,
    pub timestamp: libc::timespec,
    pub id: u32,
    pub reserved: [u32; 8],
}

/// Reply payload for `UVCIOC_SEND_RESPONSE`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct uvc_request_data {
    pub length: i32,
    pub data: [u8; 60],
}

impl Default for uvc_request_data {
    fn default() -> Self {
        Self {
            length: 0,
            data: [0; 60],
        }
    }
}

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;

const fn ioc(dir: libc::c_ulong, ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    (dir << IOC_DIRSHIFT)
        | ((ty as libc::c_ulong) << IOC_TYPESHIFT)
        | ((nr as libc::c_ulong) << IOC_NRSHIFT)
        | ((size as libc::c_ulong) << IOC_SIZESHIFT)
}

const fn iow<T>(ty: u8, nr: u8) -> libc::c_ulong {
    ioc(IOC_WRITE, ty, nr, size_of::<T>())
}

const fn ior<T>(ty: u8, nr: u8) -> libc::c_ulong {
    ioc(IOC_READ, ty, nr, size_of::<T>())
}

const fn iowr<T>(ty: u8, nr: u8) -> libc::c_ulong {
    ioc(IOC_READ | IOC_WRITE, ty, nr, size_of::<T>())
}

pub const VIDIOC_REQBUFS: libc::c_ulong = iowr::<v4l2_requestbuffers>(b'V', 8);
pub const VIDIOC_QUERYBUF: libc::c_ulong = iowr::<v4l2_buffer>(b'V', 9);
pub const VIDIOC_QBUF: libc::c_ulong = iowr::<v4l2_buffer>(b'V', 15);
pub const VIDIOC_DQBUF: libc::c_ulong = iowr::<v4l2_buffer>(b'V', 17);
pub const VIDIOC_STREAMON: libc::c_ulong = iow::<libc::c_int>(b'V', 18);
pub const VIDIOC_STREAMOFF: libc::c_ulong = iow::<libc::c_int>(b'V', 19);
pub const VIDIOC_DQEVENT: libc::c_ulong = ior::<v4l2_event>(b'V', 89);
pub const VIDIOC_SUBSCRIBE_EVENT: libc::c_ulong = iow::<v4l2_event_subscription>(b'V', 90);
pub const VIDIOC_UNSUBSCRIBE_EVENT: libc::c_ulong = iow::<v4l2_event_subscription>(b'V', 91);
pub const UVCIOC_SEND_RESPONSE: libc::c_ulong = iow::<uvc_request_data>(b'U', 1);

/// Issue an ioctl, mapping the errno convention to `io::Result`.
pub fn xioctl<T>(fd: RawFd, request: libc::c_ulong, arg: *mut T) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd, request, arg) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Shared mapping of one gadget driver buffer.
pub struct MappedRegion {
    ptr: *mut u8,
    len: usize,
}

// Safety: the mapping is plain shared memory owned by this process; all
// access is serialized through the slot-pool state machine.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    pub fn map(fd: RawFd, offset: u32, len: u32) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: ptr.cast(),
            len: len as usize,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Exclusive write view of the mapping.
    ///
    /// # Safety
    /// The caller must guarantee no concurrent reader or writer; the slot
    /// pool's `InUse` state provides that guarantee in the data plane.
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.ptr.cast(), self.len) };
        if ret < 0 {
            tracing::error!(
                "munmap of {} byte gadget buffer failed: {}",
                self.len,
                io::Error::last_os_error()
            );
        }
    }
}
