//! The V4L2 video-output node exposed by the kernel UVC gadget driver.

use crate::protocol::{SetupRequest, UvcEvent, UvcResponse};
use crate::sys;
use crate::UvcError;
use gadgetcam_core::prelude::*;
use smallvec::SmallVec;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, error, info, warn};
use v4l::capability::Flags;
use v4l::video::Output;

/// Buffers requested from the gadget driver: one consumer slot plus three
/// producer slots.
pub const NUM_BUFFERS: u32 = 4;

/// Stream format as accepted (and possibly adjusted) by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedFormat {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCc,
    pub size_image: u32,
}

/// One mmap'd gadget driver buffer.
///
/// The mapping lives as long as the buffer; the pool's slot states decide
/// who may write it at any moment.
pub struct GadgetBuffer {
    index: u32,
    offset: u32,
    length: u32,
    bytes_used: AtomicU32,
    region: sys::MappedRegion,
}

impl GadgetBuffer {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl FrameMemory for GadgetBuffer {
    fn len(&self) -> usize {
        self.region.len()
    }

    unsafe fn as_write_slice(&self) -> &mut [u8] {
        unsafe { self.region.as_mut_slice() }
    }

    fn set_bytes_used(&self, bytes: u32) {
        self.bytes_used.store(bytes, Ordering::Release);
    }

    fn bytes_used(&self) -> u32 {
        self.bytes_used.load(Ordering::Acquire)
    }
}

/// An open UVC gadget node with its enumerated format catalogue.
pub struct UvcDevice {
    dev: v4l::Device,
    path: PathBuf,
    catalogue: FormatCatalogue,
}

impl UvcDevice {
    /// Open the node, verify it is a video-output device, subscribe to the
    /// UVC event set, and enumerate the advertised formats.
    pub fn open(path: &Path) -> Result<Self, UvcError> {
        let dev = v4l::Device::with_path(path).map_err(|source| UvcError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let caps = dev.query_caps().map_err(|source| UvcError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        if !caps.capabilities.contains(Flags::VIDEO_OUTPUT) {
            return Err(UvcError::NotOutputCapable {
                path: path.to_path_buf(),
            });
        }
        info!("opened uvc gadget node {} ({})", path.display(), caps.card);

        let mut device = Self {
            dev,
            path: path.to_path_buf(),
            catalogue: FormatCatalogue::default(),
        };
        device.subscribe_events()?;
        device.catalogue = device.enumerate_formats();
        if device.catalogue.is_empty() {
            warn!("gadget node {} advertises no formats", path.display());
        }
        Ok(device)
    }

    pub fn fd(&self) -> RawFd {
        self.dev.as_raw_fd()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn catalogue(&self) -> &FormatCatalogue {
        &self.catalogue
    }

    fn subscribe_events(&self) -> Result<(), UvcError> {
        let events = [
            sys::UVC_EVENT_SETUP,
            sys::UVC_EVENT_DATA,
            sys::UVC_EVENT_STREAMON,
            sys::UVC_EVENT_STREAMOFF,
            sys::UVC_EVENT_DISCONNECT,
        ];
        for event in events {
            let mut subscription = sys::v4l2_event_subscription {
                type_: event,
                id: 0,
                flags: 0,
                reserved: [0; 5],
            };
            sys::xioctl(self.fd(), sys::VIDIOC_SUBSCRIBE_EVENT, &mut subscription)
                .map_err(UvcError::Subscribe)?;
        }
        Ok(())
    }

    /// Drop every event subscription; used while closing.
    pub fn unsubscribe_all(&self) {
        let mut subscription = sys::v4l2_event_subscription {
            type_: sys::V4L2_EVENT_ALL,
            id: 0,
            flags: 0,
            reserved: [0; 5],
        };
        if let Err(err) = sys::xioctl(
            self.fd(),
            sys::VIDIOC_UNSUBSCRIBE_EVENT,
            &mut subscription,
        ) {
            error!("unsubscribe from uvc events failed: {err}");
        }
    }

    /// Enumerate formats, frame sizes, and frame intervals from the
    /// driver. Stepwise ranges report their minimum; intervals are
    /// converted to 100 ns units.
    fn enumerate_formats(&self) -> FormatCatalogue {
        let mut formats = Vec::new();
        for (expected, desc) in self.dev.enum_formats().unwrap_or_default().into_iter().enumerate() {
            if desc.index as usize != expected {
                error!(
                    "driver returned format index {} where {expected} was expected",
                    desc.index
                );
            }
            let fourcc = FourCc::new(desc.fourcc.repr);
            debug!("enumerating frames for format {expected} ({fourcc})");
            let mut frames = Vec::new();
            for size in self.dev.enum_framesizes(desc.fourcc).unwrap_or_default() {
                if size.index as usize != frames.len() {
                    error!(
                        "driver returned frame index {} where {} was expected",
                        size.index,
                        frames.len()
                    );
                }
                let (width, height) = match size.size {
                    v4l::framesize::FrameSizeEnum::Discrete(discrete) => {
                        (discrete.width, discrete.height)
                    }
                    v4l::framesize::FrameSizeEnum::Stepwise(stepwise) => {
                        (stepwise.min_width, stepwise.min_height)
                    }
                };
                let mut intervals: SmallVec<[u32; 8]> = SmallVec::new();
                for interval in self
                    .dev
                    .enum_frameintervals(desc.fourcc, width, height)
                    .unwrap_or_default()
                {
                    match interval.interval {
                        v4l::frameinterval::FrameIntervalEnum::Discrete(fraction) => {
                            intervals.push(interval_units(fraction.numerator, fraction.denominator));
                        }
                        v4l::frameinterval::FrameIntervalEnum::Stepwise(stepwise) => {
                            intervals.push(interval_units(
                                stepwise.min.numerator,
                                stepwise.min.denominator,
                            ));
                        }
                    }
                }
                frames.push(FrameDesc {
                    index: frames.len() as u32 + 1,
                    width,
                    height,
                    intervals,
                });
            }
            formats.push(FormatDesc {
                index: formats.len() as u32 + 1,
                fourcc,
                frames,
            });
        }
        FormatCatalogue::new(formats)
    }

    /// Apply the committed stream format. The driver may adjust fields;
    /// the result is what it actually accepted.
    pub fn apply_format(
        &self,
        width: u32,
        height: u32,
        fourcc: FourCc,
        size_image: u32,
    ) -> Result<AppliedFormat, UvcError> {
        let mut format = v4l::Format::new(width, height, v4l::FourCC::new(&fourcc.bytes()));
        format.size = size_image;
        let applied = Output::set_format(&self.dev, &format).map_err(|source| UvcError::Ioctl {
            op: "VIDIOC_S_FMT",
            source,
        })?;
        info!(
            "committed {}x{} {} sizeimage {}",
            applied.width,
            applied.height,
            FourCc::new(applied.fourcc.repr),
            applied.size
        );
        Ok(AppliedFormat {
            width: applied.width,
            height: applied.height,
            fourcc: FourCc::new(applied.fourcc.repr),
            size_image: applied.size,
        })
    }

    /// Ask the driver for the fixed buffer set. Anything other than the
    /// requested count is an error.
    pub fn request_buffers(&self) -> Result<(), UvcError> {
        let mut request = sys::v4l2_requestbuffers {
            count: NUM_BUFFERS,
            type_: sys::V4L2_BUF_TYPE_VIDEO_OUTPUT,
            memory: sys::V4L2_MEMORY_MMAP,
            capabilities: 0,
            flags: 0,
            reserved: [0; 3],
        };
        sys::xioctl(self.fd(), sys::VIDIOC_REQBUFS, &mut request).map_err(|source| {
            UvcError::Ioctl {
                op: "VIDIOC_REQBUFS",
                source,
            }
        })?;
        if request.count != NUM_BUFFERS {
            return Err(UvcError::BufferCount {
                want: NUM_BUFFERS,
                got: request.count,
            });
        }
        Ok(())
    }

    /// Query and mmap one driver buffer.
    pub fn map_buffer(&self, index: u32) -> Result<GadgetBuffer, UvcError> {
        let mut buffer: sys::v4l2_buffer = unsafe { std::mem::zeroed() };
        buffer.index = index;
        buffer.type_ = sys::V4L2_BUF_TYPE_VIDEO_OUTPUT;
        buffer.memory = sys::V4L2_MEMORY_MMAP;
        sys::xioctl(self.fd(), sys::VIDIOC_QUERYBUF, &mut buffer).map_err(|source| {
            UvcError::Ioctl {
                op: "VIDIOC_QUERYBUF",
                source,
            }
        })?;
        let offset = unsafe { buffer.m.offset };
        let region = sys::MappedRegion::map(self.fd(), offset, buffer.length)?;
        debug!(
            "mapped gadget buffer {index}: {} bytes at offset {offset:#x}",
            buffer.length
        );
        Ok(GadgetBuffer {
            index,
            offset,
            length: buffer.length,
            bytes_used: AtomicU32::new(0),
            region,
        })
    }

    /// Free the driver buffer set with a zero-count request.
    pub fn release_buffers(&self) {
        let mut request = sys::v4l2_requestbuffers {
            count: 0,
            type_: sys::V4L2_BUF_TYPE_VIDEO_OUTPUT,
            memory: sys::V4L2_MEMORY_MMAP,
            capabilities: 0,
            flags: 0,
            reserved: [0; 3],
        };
        if let Err(err) = sys::xioctl(self.fd(), sys::VIDIOC_REQBUFS, &mut request) {
            error!("freeing gadget buffers failed: {err}");
        }
    }

    pub fn stream_on(&self) -> io::Result<()> {
        let mut kind: libc::c_int = sys::V4L2_BUF_TYPE_VIDEO_OUTPUT as libc::c_int;
        sys::xioctl(self.fd(), sys::VIDIOC_STREAMON, &mut kind)
    }

    pub fn stream_off(&self) -> io::Result<()> {
        let mut kind: libc::c_int = sys::V4L2_BUF_TYPE_VIDEO_OUTPUT as libc::c_int;
        sys::xioctl(self.fd(), sys::VIDIOC_STREAMOFF, &mut kind)
    }

    /// Submit an encoded frame to the driver.
    pub fn queue_buffer(&self, buffer: &GadgetBuffer) -> io::Result<()> {
        let mut raw: sys::v4l2_buffer = unsafe { std::mem::zeroed() };
        raw.index = buffer.index;
        raw.type_ = sys::V4L2_BUF_TYPE_VIDEO_OUTPUT;
        raw.memory = sys::V4L2_MEMORY_MMAP;
        raw.bytesused = buffer.bytes_used();
        raw.length = buffer.length;
        raw.m = sys::v4l2_buffer_m {
            offset: buffer.offset,
        };
        sys::xioctl(self.fd(), sys::VIDIOC_QBUF, &mut raw)
    }

    /// Reclaim a buffer the driver has finished transmitting.
    pub fn dequeue_buffer(&self) -> io::Result<u32> {
        let mut raw: sys::v4l2_buffer = unsafe { std::mem::zeroed() };
        raw.type_ = sys::V4L2_BUF_TYPE_VIDEO_OUTPUT;
        raw.memory = sys::V4L2_MEMORY_MMAP;
        sys::xioctl(self.fd(), sys::VIDIOC_DQBUF, &mut raw)?;
        Ok(raw.index)
    }

    /// Dequeue and decode one pending UVC event.
    pub fn dequeue_event(&self) -> io::Result<UvcEvent> {
        let mut raw: sys::v4l2_event = unsafe { std::mem::zeroed() };
        sys::xioctl(self.fd(), sys::VIDIOC_DQEVENT, &mut raw)?;
        let payload = unsafe { raw.u.data };
        Ok(match raw.type_ {
            sys::UVC_EVENT_CONNECT => UvcEvent::Connect,
            sys::UVC_EVENT_DISCONNECT => UvcEvent::Disconnect,
            sys::UVC_EVENT_STREAMON => UvcEvent::StreamOn,
            sys::UVC_EVENT_STREAMOFF => UvcEvent::StreamOff,
            sys::UVC_EVENT_SETUP => {
                let mut setup = [0u8; 8];
                setup.copy_from_slice(&payload[..8]);
                UvcEvent::Setup(SetupRequest::from_bytes(&setup))
            }
            sys::UVC_EVENT_DATA => {
                let length = i32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]])
                    .clamp(0, 60) as usize;
                UvcEvent::Data(payload[4..4 + length].to_vec())
            }
            other => UvcEvent::Unknown(other),
        })
    }

    /// Reply to a SETUP exchange.
    pub fn send_response(&self, response: &UvcResponse) -> io::Result<()> {
        let mut raw = response.to_sys();
        sys::xioctl(self.fd(), sys::UVCIOC_SEND_RESPONSE, &mut raw)
    }
}

impl Drop for UvcDevice {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

fn interval_units(numerator: u32, denominator: u32) -> u32 {
    let denominator = denominator.max(1) as u64;
    ((numerator as u64 * FRAME_INTERVAL_UNITS as u64) / denominator) as u32
}
