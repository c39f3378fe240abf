#![doc = include_str!("../README.md")]

use std::io;
use std::path::PathBuf;

pub mod control;
pub mod device;
pub mod discover;
pub mod poller;
pub mod protocol;
pub mod sys;
pub mod watch;

/// Errors from the gadget device layer.
#[derive(Debug, thiserror::Error)]
pub enum UvcError {
    #[error("failed to open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("{path} does not advertise video output")]
    NotOutputCapable { path: PathBuf },
    #[error("event subscription failed: {0}")]
    Subscribe(#[source] io::Error),
    #[error("gadget driver allocated {got} buffers instead of {want}")]
    BufferCount { want: u32, got: u32 },
    #[error("{op} failed: {source}")]
    Ioctl { op: &'static str, source: io::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub mod prelude {
    pub use crate::control::{CommitAction, ControlMachine, negotiate};
    pub use crate::device::{AppliedFormat, GadgetBuffer, NUM_BUFFERS, UvcDevice};
    pub use crate::discover::find_output_node;
    pub use crate::poller::{Interest, PollEvent, Poller};
    pub use crate::protocol::{SetupRequest, StreamingControl, UvcEvent, UvcResponse};
    pub use crate::watch::NodeWatch;
    pub use crate::UvcError;
    pub use gadgetcam_core::prelude::*;
}
