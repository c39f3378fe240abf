#![doc = include_str!("../README.md")]

use std::io;

pub mod frames;
pub mod host;
pub mod provider;
pub mod service;
pub mod sink;
pub mod tunables;

/// Errors surfaced to the host through the service entry points.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("no uvc gadget node available")]
    NoDevice,
    #[error("service is not running")]
    NotRunning,
    #[error("service is already running")]
    AlreadyRunning,
    #[error("streaming session is not active")]
    NotStreaming,
    #[error("no free producer buffer")]
    Backpressure,
    #[error("no committed stream format")]
    NotNegotiated,
    #[error(transparent)]
    Uvc(#[from] gadgetcam_uvc::UvcError),
    #[error(transparent)]
    Encode(#[from] gadgetcam_codec::EncodeError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub mod prelude {
    pub use crate::frames::FrameLedger;
    pub use crate::host::HostCallbacks;
    pub use crate::provider::UvcProvider;
    pub use crate::service::ServiceManager;
    pub use crate::sink::FrameSink;
    pub use crate::tunables::{
        DEFAULT_ENCODE_QUEUE_DEPTH, DEFAULT_JPEG_QUALITY, EncoderTunables, GadgetcamConfig,
        set_encoder_tunables,
    };
    pub use crate::ServiceError;
    pub use gadgetcam_codec::prelude::*;
    pub use gadgetcam_uvc::prelude::*;
}
