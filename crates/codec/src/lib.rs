#![doc = include_str!("../README.md")]

use gadgetcam_core::prelude::FourCc;

pub mod convert;
pub mod encoder;

/// Errors from pixel-format conversion.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("invalid frame geometry {width}x{height}")]
    InvalidGeometry { width: u32, height: u32 },
    #[error("source frame is {got_width}x{got_height}, committed stream is {want_width}x{want_height}")]
    SizeMismatch {
        got_width: u32,
        got_height: u32,
        want_width: u32,
        want_height: u32,
    },
    #[error("{plane} plane is too short for the frame geometry")]
    PlaneTooShort { plane: &'static str },
    #[error("destination needs {need} bytes, got {have}")]
    DestinationTooShort { need: usize, have: usize },
    #[error("chroma pixel stride {0} is invalid")]
    InvalidPixelStride(usize),
}

/// Errors from the encode worker.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error("jpeg compression failed: {0}")]
    Jpeg(#[from] turbojpeg::Error),
    #[error("fourcc {0} is not supported for encoding")]
    UnsupportedFourcc(FourCc),
    #[error("failed to spawn encode worker: {0}")]
    Spawn(#[source] std::io::Error),
}

pub mod prelude {
    pub use crate::convert::{
        I420Planes, LockedFrame, PlanarYuvFrame, RgbaFrame, SourcePlanes,
    };
    pub use crate::encoder::{EncodeRequest, Encoder, EncoderCallback, SourceFrame};
    pub use crate::{ConvertError, EncodeError};
    pub use gadgetcam_core::prelude::*;
}
