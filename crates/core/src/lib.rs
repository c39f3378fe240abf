#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod format;
pub mod metrics;
pub mod queue;

pub mod prelude {
    pub use crate::{
        buffer::{FrameMemory, SlotLease, SlotPool, SlotState},
        format::{
            CameraConfig, FOURCC_MJPEG, FOURCC_YUYV, FRAME_INTERVAL_UNITS, FormatCatalogue,
            FormatDesc, FormatTriplet, FourCc, FrameDesc, Rotation,
        },
        metrics::StreamMetrics,
        queue::{BoundedRx, BoundedTx, RecvOutcome, SendOutcome, bounded},
    };
}
