use smallvec::SmallVec;
use std::fmt;
use tracing::warn;

/// Number of 100 ns frame-interval units in one second.
///
/// UVC expresses frame intervals in 100 ns ticks, so a 30 fps stream
/// advertises an interval of `10_000_000 / 30 = 333_333`.
pub const FRAME_INTERVAL_UNITS: u32 = 10_000_000;

/// Packed YUV 4:2:2 as carried over UVC.
pub const FOURCC_YUYV: FourCc = FourCc::new(*b"YUYV");
/// Motion JPEG as carried over UVC.
pub const FOURCC_MJPEG: FourCc = FourCc::new(*b"MJPG");

/// Four-character code describing a pixel/stream format.
///
/// # Example
/// ```rust
/// use gadgetcam_core::prelude::FourCc;
///
/// let fcc = FourCc::new(*b"MJPG");
/// assert_eq!(fcc.to_string(), "MJPG");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc([u8; 4]);

impl FourCc {
    /// Construct from raw bytes.
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Little-endian u32 encoding, as used by V4L2.
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Raw fourcc bytes.
    pub fn bytes(&self) -> [u8; 4] {
        self.0
    }

    /// Try to convert to a printable string.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl From<u32> for FourCc {
    fn from(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            write!(f, "{s}")
        } else {
            write!(f, "0x{:08x}", self.to_u32())
        }
    }
}

/// One frame size advertised by the gadget driver, with its supported
/// intervals in 100 ns units, ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDesc {
    /// 1-based index within the owning format.
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub intervals: SmallVec<[u32; 8]>,
}

impl FrameDesc {
    /// Smallest advertised interval (highest frame rate), if any.
    pub fn min_interval(&self) -> Option<u32> {
        self.intervals.first().copied()
    }

    /// Largest advertised interval (lowest frame rate), if any.
    pub fn max_interval(&self) -> Option<u32> {
        self.intervals.last().copied()
    }
}

/// One stream format advertised by the gadget driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDesc {
    /// 1-based index within the catalogue.
    pub index: u32,
    pub fourcc: FourCc,
    pub frames: Vec<FrameDesc>,
}

/// Ordered list of formats enumerated from the gadget node at open time.
///
/// Indices are 1-based and contiguous; intervals within a frame are kept
/// sorted ascending.
///
/// # Example
/// ```rust
/// use gadgetcam_core::prelude::*;
/// use smallvec::smallvec;
///
/// let catalogue = FormatCatalogue::new(vec![FormatDesc {
///     index: 1,
///     fourcc: FOURCC_MJPEG,
///     frames: vec![FrameDesc { index: 1, width: 640, height: 480, intervals: smallvec![333_333] }],
/// }]);
/// assert!(catalogue.format(1).is_some());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatCatalogue {
    formats: Vec<FormatDesc>,
}

impl FormatCatalogue {
    /// Build a catalogue, normalizing per-frame intervals to ascending order.
    pub fn new(mut formats: Vec<FormatDesc>) -> Self {
        for format in &mut formats {
            for frame in &mut format.frames {
                frame.intervals.sort_unstable();
                frame.intervals.dedup();
            }
        }
        Self { formats }
    }

    pub fn formats(&self) -> &[FormatDesc] {
        &self.formats
    }

    /// Number of advertised formats.
    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    /// Look up a format by its 1-based UVC index.
    pub fn format(&self, index: u8) -> Option<&FormatDesc> {
        if index == 0 {
            return None;
        }
        self.formats.get(index as usize - 1)
    }

    /// Look up a frame by 1-based format and frame indices.
    pub fn frame(&self, format_index: u8, frame_index: u8) -> Option<&FrameDesc> {
        if frame_index == 0 {
            return None;
        }
        self.format(format_index)?.frames.get(frame_index as usize - 1)
    }
}

/// The negotiation currency used over UVC: a chosen format, frame size,
/// and frame interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatTriplet {
    /// 1-based format index.
    pub format_index: u8,
    /// 1-based frame index within the format.
    pub frame_index: u8,
    /// Frame interval in 100 ns units; 0 requests the smallest advertised.
    pub interval: u32,
}

impl FormatTriplet {
    pub const fn new(format_index: u8, frame_index: u8, interval: u32) -> Self {
        Self {
            format_index,
            frame_index,
            interval,
        }
    }
}

/// Committed stream configuration handed to the frame producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCc,
    pub fps: u32,
}

/// Rotation applied while converting camera frames.
///
/// Only 0 and 180 degrees are supported by the conversion path; anything
/// else is clamped to 0 with a warning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg180,
}

impl Rotation {
    pub fn from_degrees(degrees: i32) -> Self {
        match degrees {
            0 => Rotation::Deg0,
            180 => Rotation::Deg180,
            other => {
                warn!("unsupported rotation {other} degrees, using 0");
                Rotation::Deg0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn fourcc_display_and_u32_round_trip() {
        let fcc = FourCc::new(*b"YUYV");
        assert_eq!(fcc.to_string(), "YUYV");
        assert_eq!(FourCc::from(fcc.to_u32()), fcc);
    }

    #[test]
    fn catalogue_lookup_is_one_based() {
        let catalogue = FormatCatalogue::new(vec![FormatDesc {
            index: 1,
            fourcc: FOURCC_YUYV,
            frames: vec![FrameDesc {
                index: 1,
                width: 1280,
                height: 720,
                intervals: smallvec![333_333, 666_666],
            }],
        }]);
        assert!(catalogue.format(0).is_none());
        assert_eq!(catalogue.format(1).unwrap().fourcc, FOURCC_YUYV);
        assert_eq!(catalogue.frame(1, 1).unwrap().width, 1280);
        assert!(catalogue.frame(1, 2).is_none());
    }

    #[test]
    fn catalogue_sorts_intervals_ascending() {
        let catalogue = FormatCatalogue::new(vec![FormatDesc {
            index: 1,
            fourcc: FOURCC_MJPEG,
            frames: vec![FrameDesc {
                index: 1,
                width: 640,
                height: 480,
                intervals: smallvec![666_666, 333_333, 333_333],
            }],
        }]);
        let frame = catalogue.frame(1, 1).unwrap();
        assert_eq!(frame.intervals.as_slice(), &[333_333, 666_666]);
        assert_eq!(frame.min_interval(), Some(333_333));
        assert_eq!(frame.max_interval(), Some(666_666));
    }

    #[test]
    fn rotation_clamps_unsupported_angles() {
        assert_eq!(Rotation::from_degrees(180), Rotation::Deg180);
        assert_eq!(Rotation::from_degrees(90), Rotation::Deg0);
        assert_eq!(Rotation::from_degrees(-180), Rotation::Deg0);
    }
}
